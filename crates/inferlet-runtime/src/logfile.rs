//! Server log rotation and following

use chrono::Utc;
use inferlet_core::InferletResult;
use inferlet_store::write_atomic;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Trim `path` to its last `keep_bytes` when it exceeds `max_bytes`.
///
/// Returns the number of discarded bytes, or `None` when no rotation was
/// needed. The kept tail is prefixed with a note recording the discard.
pub fn rotate_if_needed(path: &Path, max_bytes: u64, keep_bytes: u64) -> InferletResult<Option<u64>> {
    let len = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len <= max_bytes {
        return Ok(None);
    }

    let keep = keep_bytes.min(len);
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(len - keep))?;
    let mut tail = Vec::with_capacity(keep as usize);
    file.read_to_end(&mut tail)?;

    // start at a line boundary
    if let Some(newline) = tail.iter().position(|b| *b == b'\n') {
        if newline + 1 < tail.len() {
            tail.drain(..=newline);
        }
    }

    let discarded = len - tail.len() as u64;
    let mut contents = format!(
        "[inferlet] {} log rotated, discarded {} bytes\n",
        Utc::now().to_rfc3339(),
        discarded
    )
    .into_bytes();
    contents.extend_from_slice(&tail);
    write_atomic(path, &contents)?;

    info!(path = %path.display(), discarded, kept = tail.len(), "Rotated server log");
    Ok(Some(discarded))
}

/// Last `count` lines of `path`
pub fn tail_lines(path: &Path, count: usize) -> InferletResult<Vec<String>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let text = String::from_utf8_lossy(&contents);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

/// Copy data appended to `path` into `out` until the future is dropped.
///
/// Starts at the current end of file. A file that shrinks (rotated) or
/// disappears is reopened from the start.
pub async fn follow<W>(path: &Path, out: &mut W, interval: Duration) -> InferletResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut position = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(_) => 0,
    };
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let len = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                position = 0;
                tokio::time::sleep(interval).await;
                continue;
            }
        };
        if len < position {
            position = 0;
        }

        if len > position {
            let mut file = tokio::fs::File::open(path).await?;
            file.seek(SeekFrom::Start(position)).await?;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                position += n as u64;
            }
            out.flush().await?;
        }

        tokio::time::sleep(interval).await;
    }
}
