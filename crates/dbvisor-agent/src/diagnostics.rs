use std::path::Path;

use tokio::io::AsyncWriteExt;

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

fn now_unix_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Appends one timestamped line to an instance's `error.log`. Failures are
/// logged and swallowed: the caller is already reporting an error.
pub async fn append_error_log(path: &Path, message: &str) {
    let line = format!("[{}] {}\n", now_unix_ms(), message.trim_end());
    let res = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await
    }
    .await;

    if let Err(e) = res {
        tracing::warn!(path = %path.display(), error = %e, "failed to append error log");
    }
}
