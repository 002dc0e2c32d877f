use crate::monitor::Monitor;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One complete log line with the trailing `\n` (and any `\r`) stripped.
pub type RawLine = Vec<u8>;

// Cap on bytes pulled per poll so one giant append cannot stall the loop.
const MAX_READ_CHUNK_BYTES: usize = 1024 * 1024;

/// Produces complete lines, oldest first, until cancelled.
///
/// Implementations return `Err` only for failures the pipeline cannot
/// recover from; the orchestrator treats that as fatal.
#[async_trait]
pub trait LineSource: Send + Sync {
    async fn follow(
        &self,
        lines: mpsc::Sender<RawLine>,
        cancel_token: CancellationToken,
    ) -> Result<()>;
}

/// Tails a single growing file, starting from its current end.
///
/// Lines already present when the tailer starts are never emitted, and no
/// line is emitted twice: the read offset only moves forward past bytes that
/// were handed downstream (or buffered as a partial line).
pub struct FileSource {
    path: PathBuf,
    poll_interval: Duration,
    monitor: Monitor,
}

impl FileSource {
    pub fn new(path: PathBuf, poll_interval: Duration, monitor: Monitor) -> Self {
        Self {
            path,
            poll_interval,
            monitor,
        }
    }
}

#[async_trait]
impl LineSource for FileSource {
    async fn follow(
        &self,
        lines: mpsc::Sender<RawLine>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let file = fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let mut read_offset = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", self.path.display()))?
            .len();
        drop(file);

        info!(
            path = %self.path.display(),
            offset = read_offset,
            "starting tailer at end of file"
        );

        // Bytes after the last newline seen so far.
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let file_size = fs::metadata(&self.path)
                .await
                .with_context(|| format!("failed to stat {}", self.path.display()))?
                .len();

            if file_size < read_offset {
                // Truncated underneath us; follow from the new end, never replay.
                warn!(
                    path = %self.path.display(),
                    previous_offset = read_offset,
                    current_size = file_size,
                    "file shrank; resuming from its new end"
                );
                read_offset = file_size;
                pending.clear();
            }

            if file_size > read_offset {
                let bytes_available = file_size - read_offset;
                let bytes_to_read = bytes_available.min(MAX_READ_CHUNK_BYTES as u64) as usize;
                let buffer = read_new_bytes(&self.path, read_offset, bytes_to_read).await?;

                if !buffer.is_empty() {
                    read_offset += buffer.len() as u64;
                    pending.extend_from_slice(&buffer);

                    for line in drain_complete_lines(&mut pending) {
                        self.monitor.line_handled();
                        if lines.send(trim_line_ending(line)).await.is_err() {
                            debug!("line channel closed; stopping tailer");
                            return Ok(());
                        }
                    }

                    // More appended data is already waiting; drain it before sleeping.
                    if read_offset < file_size {
                        continue;
                    }
                }
            }

            if sleep_or_cancel(self.poll_interval, &cancel_token).await {
                debug!(path = %self.path.display(), "tailer cancelled");
                return Ok(());
            }
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

async fn read_new_bytes(path: &PathBuf, offset: u64, max_bytes: usize) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(tokio::io::SeekFrom::Start(offset))
        .await
        .with_context(|| format!("failed to seek {} to offset {}", path.display(), offset))?;

    let mut buffer = vec![0u8; max_bytes];
    let mut total_read = 0usize;
    while total_read < max_bytes {
        let bytes_read = file
            .read(&mut buffer[total_read..])
            .await
            .with_context(|| format!("failed to read from {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    buffer.truncate(total_read);
    Ok(buffer)
}

/// Splits every complete line out of `buffer`, leaving any partial tail in
/// place for the next read.
fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for (idx, byte) in buffer.iter().enumerate() {
        if *byte == b'\n' {
            lines.push(buffer[start..idx].to_vec());
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(0..start);
    }

    lines
}

fn trim_line_ending(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}
