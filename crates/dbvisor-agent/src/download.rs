use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use dbvisor_instance::EngineKind;
use futures_util::StreamExt;
use reqwest::Url;
use sha1::Digest;
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::config::DistributionConfig;

const ATTEMPTS: u32 = 3;

fn download_locks() -> &'static std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
}

fn lock_for(key: &str) -> Arc<Mutex<()>> {
    let mut map = download_locks().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn http_client() -> anyhow::Result<&'static reqwest::Client> {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    if let Some(c) = CLIENT.get() {
        return Ok(c);
    }
    let client = reqwest::Client::builder()
        .user_agent(concat!("dbvisor/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(15 * 60))
        .build()
        .context("build http client")?;
    Ok(CLIENT.get_or_init(|| client))
}

fn mark_last_used(entry_dir: &Path) {
    let path = entry_dir.join(".last_used");
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    // Best-effort.
    let _ = std::fs::write(path, format!("{now_ms}\n"));
}

/// `<cache_root>/<engine>/<file_name>`.
pub fn cached_archive_path(cache_root: &Path, kind: EngineKind, dist: &DistributionConfig) -> PathBuf {
    cache_root.join(kind.as_str()).join(&dist.file_name)
}

/// Returns the cached distribution archive, downloading it first if needed.
pub async fn ensure_archive(
    cache_root: &Path,
    kind: EngineKind,
    dist: &DistributionConfig,
) -> anyhow::Result<PathBuf> {
    if dist.file_name.is_empty() || dist.file_name.contains(['/', '\\']) {
        anyhow::bail!("invalid archive file name for {kind}: {:?}", dist.file_name);
    }

    let archive = cached_archive_path(cache_root, kind, dist);
    let Some(entry_dir) = archive.parent().map(Path::to_path_buf) else {
        anyhow::bail!("archive path has no parent: {}", archive.display());
    };
    if archive.exists() {
        mark_last_used(&entry_dir);
        return Ok(archive);
    }

    let lock = lock_for(&format!("{kind}:{}", dist.file_name));
    let _guard = lock.lock().await;
    if archive.exists() {
        mark_last_used(&entry_dir);
        return Ok(archive);
    }

    tokio::fs::create_dir_all(&entry_dir).await?;
    let url = Url::parse(&dist.url).with_context(|| format!("parse {kind} url {}", dist.url))?;
    let tmp = archive.with_extension("part");

    let mut last_err: Option<anyhow::Error> = None;
    let mut digest: Option<String> = None;
    for attempt in 1..=ATTEMPTS {
        match download_to(url.clone(), &tmp).await {
            Ok(d) => {
                digest = Some(d);
                break;
            }
            Err(e) => {
                tracing::warn!(%kind, attempt, error = %e, "archive download failed");
                last_err = Some(e);
                if attempt < ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(
                        200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                    ))
                    .await;
                }
            }
        }
    }

    let got_hex = match digest {
        Some(d) => d,
        None => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed")));
        }
    };

    if let Some(expected) = dist.sha1.as_deref()
        && !expected.eq_ignore_ascii_case(&got_hex)
    {
        let _ = tokio::fs::remove_file(&tmp).await;
        anyhow::bail!(
            "{kind} archive sha1 mismatch: expected {expected}, got {got_hex} (url={url})"
        );
    }

    tokio::fs::rename(&tmp, &archive).await?;
    mark_last_used(&entry_dir);
    tracing::info!(%kind, path = %archive.display(), sha1 = %got_hex, "archive cached");
    Ok(archive)
}

/// Streams `url` into `dest` and returns the hex sha1 of the body.
async fn download_to(url: Url, dest: &Path) -> anyhow::Result<String> {
    let resp = http_client()?
        .get(url)
        .send()
        .await
        .context("download archive")?
        .error_for_status()
        .context("download archive (status)")?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let mut hasher = sha1::Sha1::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read archive body chunk")?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(hex::encode(hasher.finalize()))
}
