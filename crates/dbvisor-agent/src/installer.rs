//! Unpacks engine distributions into an instance directory and renders their
//! configuration.

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use anyhow::Context;
use dbvisor_instance::{EngineKind, Instance};

use crate::{
    config::AgentConfig,
    download,
    engine::{InstanceLayout, StorageRole, descriptor},
    templates,
};

/// Downloads (or reuses) both archives, unpacks them and writes configs.
/// Anything already in the instance directory is discarded first.
pub async fn install(
    config: &AgentConfig,
    instance: &Instance,
    layout: &InstanceLayout,
) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(layout.dir()).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("clear {}", layout.dir().display()));
        }
    }
    tokio::fs::create_dir_all(layout.dir()).await?;

    let cache_root = config.cache_root();
    for kind in EngineKind::ALL {
        let desc = descriptor(kind);
        if !desc.installs_archive {
            tracing::info!(%kind, "engine is provided by the host; archive not installed");
            continue;
        }
        let archive = download::ensure_archive(&cache_root, kind, config.distribution(kind)).await?;
        let dest = layout.engine_dir(kind);
        tokio::task::spawn_blocking(move || unpack(&archive, &dest))
            .await
            .context("join unpack task")??;
        tracing::info!(instance = %instance.name, %kind, "engine unpacked");
    }

    configure(instance, layout).await?;

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    tokio::fs::write(layout.install_marker(), format!("{now_ms}\n")).await?;
    Ok(())
}

/// Writes both engine configs from the bundled templates and creates the
/// storage directories they point at.
pub async fn configure(instance: &Instance, layout: &InstanceLayout) -> anyhow::Result<()> {
    for kind in EngineKind::ALL {
        let params = templates::engine_params(kind, instance, layout)?;
        let rendered = templates::render(descriptor(kind).template, &params)
            .with_context(|| format!("render {kind} config"))?;

        let path = layout.config_path(kind);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, rendered.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
    }

    for role in StorageRole::ALL {
        tokio::fs::create_dir_all(layout.storage_dir(EngineKind::Timeseries, role)).await?;
    }
    tokio::fs::create_dir_all(layout.storage_dir(EngineKind::Graph, StorageRole::Data)).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
}

fn archive_format(path: &Path) -> anyhow::Result<ArchiveFormat> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if name.ends_with(".zip") {
        Ok(ArchiveFormat::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArchiveFormat::TarGz)
    } else {
        anyhow::bail!("unsupported archive format: {}", path.display())
    }
}

/// Unpacks `archive` so that its contents end up directly under `dest`.
/// A single top-level directory in the archive is stripped.
pub fn unpack(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let Some(parent) = dest.parent() else {
        anyhow::bail!("destination has no parent: {}", dest.display());
    };
    let staging = parent.join(format!(
        ".unpack-{}",
        dest.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("engine")
    ));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let res = match archive_format(archive)? {
        ArchiveFormat::Zip => extract_zip(archive, &staging),
        ArchiveFormat::TarGz => extract_tar_gz(archive, &staging),
    }
    .and_then(|()| promote(&staging, dest));

    let _ = fs::remove_dir_all(&staging);
    res
}

fn promote(staging: &Path, dest: &Path) -> anyhow::Result<()> {
    let entries: Vec<PathBuf> = fs::read_dir(staging)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    let root = match entries.as_slice() {
        [only] if only.is_dir() => only.clone(),
        [] => anyhow::bail!("archive is empty"),
        _ => staging.to_path_buf(),
    };

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    if root == staging {
        // Multiple top-level entries: the staging dir itself becomes dest.
        fs::create_dir_all(dest)?;
        for entry in entries {
            let Some(name) = entry.file_name() else {
                continue;
            };
            fs::rename(&entry, dest.join(name))?;
        }
    } else {
        fs::rename(&root, dest)
            .with_context(|| format!("move {} to {}", root.display(), dest.display()))?;
    }
    Ok(())
}

/// Relative path of a zip entry, rejecting anything that would land outside
/// the extraction root.
fn safe_entry_path(name: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in Path::new(name).components() {
        match comp {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() { None } else { Some(out) }
}

fn extract_zip(archive: &Path, out_dir: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(f).context("open zip archive")?;

    for i in 0..zip.len() {
        let mut file = zip.by_index(i).context("read zip entry")?;
        let name = file.name().to_string();
        let Some(rel) = safe_entry_path(&name) else {
            if name.trim_matches('/').is_empty() {
                continue;
            }
            anyhow::bail!("zip entry escapes extraction root: {name}");
        };

        let out_path = out_dir.join(rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("create {}", out_path.display()))?;
        std::io::copy(&mut file, &mut out).context("extract file")?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

fn extract_tar_gz(archive: &Path, out_dir: &Path) -> anyhow::Result<()> {
    let status = std::process::Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(out_dir)
        .status()
        .context("extract archive (tar)")?;
    if !status.success() {
        anyhow::bail!("extract failed (tar exit {status}): {}", archive.display());
    }
    Ok(())
}
