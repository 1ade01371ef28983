use std::collections::BTreeMap;

use dbvisor_instance::{EngineKind, Instance, PortRole};

use crate::engine::{InstanceLayout, StorageRole};

/// Substitutes `{name}` placeholders. `{{` and `}}` render literal braces.
/// A placeholder without a value is an error so a half-rendered config never
/// reaches an engine.
pub fn render(template: &str, params: &BTreeMap<&str, String>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find(['{', '}']) {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];

        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
            continue;
        }
        if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
            continue;
        }
        if tail.starts_with('}') {
            anyhow::bail!("unmatched '}}' in template");
        }

        let end = tail
            .find('}')
            .ok_or_else(|| anyhow::anyhow!("unterminated placeholder in template"))?;
        let key = &tail[1..end];
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("invalid placeholder {{{key}}} in template");
        }
        let value = params
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("no value for template placeholder {{{key}}}"))?;
        out.push_str(value);
        rest = &tail[(end + 1)..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Paths inside TOML strings: backslashes would be read as escapes.
pub fn toml_safe_path(p: &std::path::Path) -> String {
    p.display().to_string().replace('\\', "/")
}

fn port(instance: &Instance, role: PortRole) -> anyhow::Result<String> {
    instance
        .ports
        .get(role)
        .map(|p| p.to_string())
        .ok_or_else(|| anyhow::anyhow!("{} has no {role} port assigned", instance.name))
}

/// Values for the engine's config template.
pub fn engine_params(
    kind: EngineKind,
    instance: &Instance,
    layout: &InstanceLayout,
) -> anyhow::Result<BTreeMap<&'static str, String>> {
    let mut params = BTreeMap::new();
    match kind {
        EngineKind::Graph => {
            params.insert("http_port", port(instance, PortRole::GraphHttp)?);
            params.insert("https_port", port(instance, PortRole::GraphHttps)?);
            params.insert("bolt_port", port(instance, PortRole::GraphBolt)?);
            params.insert("admin_port", port(instance, PortRole::GraphAdmin)?);
            params.insert(
                "data_directory",
                toml_safe_path(&layout.storage_dir(kind, StorageRole::Data)),
            );
        }
        EngineKind::Timeseries => {
            params.insert("http_port", port(instance, PortRole::TimeseriesHttp)?);
            params.insert("meta_port", port(instance, PortRole::TimeseriesMeta)?);
            params.insert("udp_port", port(instance, PortRole::TimeseriesUdp)?);
            params.insert("admin_port", port(instance, PortRole::TimeseriesAdmin)?);
            params.insert("auth_enabled", "false".to_string());
            params.insert(
                "data_directory",
                toml_safe_path(&layout.storage_dir(kind, StorageRole::Data)),
            );
            params.insert(
                "wal_directory",
                toml_safe_path(&layout.storage_dir(kind, StorageRole::Wal)),
            );
            params.insert(
                "meta_directory",
                toml_safe_path(&layout.storage_dir(kind, StorageRole::Meta)),
            );
        }
    }
    Ok(params)
}
