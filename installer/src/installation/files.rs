//! File helpers for environment materialization.
//!
//! Goals:
//! - Async I/O only (tokio)
//! - Retry transient file lock errors (editors, AV scanners, etc.)
//! - Timeout every write
//! - Never fail silently (log with context)

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};

const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_ATTEMPTS: u32 = 3;

/// Recursively collect regular files under `root` whose name ends with `suffix`.
///
/// Returns paths sorted so materialization order is stable between passes.
pub async fn collect_files_recursive(root: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: files] collect_files_recursive entered (root={:?}, suffix={})",
        root, suffix
    );

    let mut out: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", dir))?;
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            let meta = ent.metadata().await?;
            if meta.is_dir() {
                stack.push(p);
            } else if meta.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(suffix))
            {
                out.push(p);
            }
        }
    }
    out.sort();

    debug!(
        "[PHASE: installation] [STEP: files] collect_files_recursive exit (files={}, duration_ms={})",
        out.len(),
        started.elapsed().as_millis()
    );
    Ok(out)
}

/// Names of the visible subdirectories of `root`, sorted. A missing root yields none.
pub async fn list_subdirectories(root: &Path) -> Result<Vec<String>> {
    if !tokio::fs::try_exists(root).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    let mut rd = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("read_dir failed: {:?}", root))?;
    while let Some(ent) = rd.next_entry().await? {
        if !ent.metadata().await?.is_dir() {
            continue;
        }
        if let Some(name) = ent.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn is_transient_fs_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("used by another process")
        || msg.contains("in use")
        || msg.contains("resource busy")
        || msg.contains("temporarily")
        || msg.contains("timed out")
}

async fn write_file_once(dst: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create_dir_all failed: {:?}", parent))?;
    }
    let mut f = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("create dst failed: {:?}", dst))?;
    f.write_all(contents).await?;
    f.flush().await?;
    Ok(())
}

/// Write `contents` to `dst`, creating parent directories, with retries + timeout.
///
/// Succeeds only if `dst` is a regular file afterwards.
pub async fn write_file_with_retries(dst: &Path, contents: &[u8], label: &str) -> Result<u64> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: files] write_file_with_retries entered (label={}, dst={:?}, bytes={})",
        label,
        dst,
        contents.len()
    );

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=WRITE_ATTEMPTS {
        match timeout(WRITE_TIMEOUT, write_file_once(dst, contents)).await {
            Ok(Ok(())) => {
                if !tokio::fs::metadata(dst)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    return Err(anyhow::anyhow!(
                        "write reported success but {:?} is not a file",
                        dst
                    ));
                }
                debug!(
                    "[PHASE: installation] [STEP: files] write_file_with_retries exit ok (label={}, attempt={}, duration_ms={})",
                    label,
                    attempt,
                    started.elapsed().as_millis()
                );
                return Ok(contents.len() as u64);
            }
            Ok(Err(e)) => {
                let transient = is_transient_fs_error(&e);
                warn!(
                    "[PHASE: installation] [STEP: files] write failed (label={}, attempt={}, transient={}, dst={:?}, err={:#})",
                    label, attempt, transient, dst, e
                );
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "[PHASE: installation] [STEP: files] write timeout (label={}, attempt={}, dst={:?})",
                    label, attempt, dst
                );
                last_err = Some(anyhow::anyhow!(
                    "write timed out after {}s",
                    WRITE_TIMEOUT.as_secs()
                ));
            }
        }

        let backoff_ms = 200_u64.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("write failed")))
}
