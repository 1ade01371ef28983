use std::{fs::File, path::Path};

use anyhow::Context;
use fs4::fs_std::FileExt;

/// Cross-process exclusive lock on a file. Released when dropped.
#[derive(Debug)]
pub struct HostLock {
    _file: File,
}

impl HostLock {
    /// Blocks (off the async runtime) until the lock is held.
    pub async fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("open lock file {}", path.display()))?;
            FileExt::lock_exclusive(&file)
                .with_context(|| format!("lock {}", path.display()))?;
            Ok(HostLock { _file: file })
        })
        .await
        .context("join lock task")?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn second_holder_waits_for_the_first() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("locks").join("registry.lock");

        let first = HostLock::acquire(&path).await.unwrap();
        let p = path.clone();
        let waiter = tokio::spawn(async move { HostLock::acquire(&p).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("lock released")
            .unwrap();
        assert!(second.is_ok());
    }
}
