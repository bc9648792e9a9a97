use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const DEFAULT_TAIL_BYTES: u64 = 10_000;
pub const MAX_TAIL_BYTES: u64 = 10 * 1024 * 1024;

/// Result of tailing a run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTail {
    Content(String),
    Missing,
}

/// Parse the `bytes` query parameter. Anything unparseable falls back to the
/// default; valid values are clamped to `1..=MAX_TAIL_BYTES`.
pub fn tail_bytes(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .map(|n| n.clamp(1, MAX_TAIL_BYTES))
        .unwrap_or(DEFAULT_TAIL_BYTES)
}

/// Read the last `max_bytes` of a log file.
///
/// The file length is sampled once and exactly `[len - n, len)` is read, so
/// a writer appending concurrently cannot make the result longer than asked.
/// A multi-byte character cut at the start of the window decodes lossily.
pub async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<LogTail> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogTail::Missing),
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.take(len - start).read_to_end(&mut buf).await?;
    Ok(LogTail::Content(String::from_utf8_lossy(&buf).into_owned()))
}
