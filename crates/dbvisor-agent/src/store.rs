//! Instance records persisted as one JSON file each under the registry dir.

use std::path::{Path, PathBuf};

use dbvisor_instance::Instance;
use tokio::io::AsyncWriteExt;

use crate::error::{LifecycleError, Result};

/// Keeps names safe for filesystem paths.
pub fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty()
        || name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(LifecycleError::InvalidName(name.to_string()));
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.record_path(name))
            .await
            .unwrap_or(false)
    }

    pub async fn load(&self, name: &str) -> Result<Instance> {
        let path = self.record_path(name);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LifecycleError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let inst = serde_json::from_slice::<Instance>(&raw).map_err(|e| {
            anyhow::anyhow!("failed to parse instance record {}: {e}", path.display())
        })?;
        Ok(inst)
    }

    /// Atomic replace: readers never observe a half-written record.
    pub async fn save(&self, inst: &Instance) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(&inst.name);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(inst)
            .map_err(|e| anyhow::anyhow!("failed to serialize instance record: {e}"))?;

        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        f.sync_all().await?;
        drop(f);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record, sorted by name. Unparseable files are skipped.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "instance record unreadable");
                    continue;
                }
            };
            match serde_json::from_slice::<Instance>(&raw) {
                Ok(inst) => out.push(inst),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "instance record unparseable");
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
