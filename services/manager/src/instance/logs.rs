//! Guest log streaming and rotation.
//!
//! Streaming hands back a channel of lines: the tail of the file first,
//! then (with `follow`) new lines as the file grows. The reader task exits
//! when the consumer drops the stream. Rotation is rename-based:
//! `app.log` → `app.log.1` → … → `app.log.N`, oldest discarded.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

const FOLLOW_POLL: Duration = Duration::from_millis(250);
const CHANNEL_DEPTH: usize = 256;
/// Block size for the backwards tail scan.
const TAIL_CHUNK: usize = 8 * 1024;

/// A stream of log lines. Dropping it cancels the reader task.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<String>,
    task: tokio::task::JoinHandle<()>,
}

impl LogStream {
    /// Next line, or `None` when the stream is finished.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drains everything currently buffered (non-follow streams only
    /// terminate, so this collects the full tail).
    pub async fn collect(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next().await {
            lines.push(line);
        }
        lines
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reads the last `tail` lines of `path`; with `follow`, keeps emitting
/// new lines until the stream is dropped.
pub fn stream_log(path: PathBuf, tail: usize, follow: bool) -> std::io::Result<LogStream> {
    // Surface a missing file synchronously; the caller maps this to its
    // not-found taxonomy.
    let file = std::fs::File::open(&path)?;

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let task = tokio::task::spawn_blocking(move || {
        if let Err(e) = pump_lines(file, &path, tail, follow, &tx) {
            debug!(path = %path.display(), error = %e, "log stream ended");
        }
    });

    Ok(LogStream { rx, task })
}

fn pump_lines(
    mut file: std::fs::File,
    path: &Path,
    tail: usize,
    follow: bool,
    tx: &mpsc::Sender<String>,
) -> std::io::Result<()> {
    let end = file.seek(SeekFrom::End(0))?;
    let (lines, mut offset) = tail_lines_at(&mut file, end, tail)?;

    for line in lines {
        if tx.blocking_send(line).is_err() {
            return Ok(());
        }
    }
    if !follow {
        return Ok(());
    }

    let mut partial = String::new();
    loop {
        let len = file.seek(SeekFrom::End(0))?;
        if len < offset {
            // Rotated or truncated underneath us; restart from the top of
            // the new file.
            offset = 0;
            partial.clear();
        }
        if len > offset {
            file.seek(SeekFrom::Start(offset))?;
            let mut chunk = String::new();
            let read = (&mut file).take(len - offset).read_to_string(&mut chunk)?;
            offset += read as u64;

            partial.push_str(&chunk);
            while let Some(newline) = partial.find('\n') {
                let line = partial[..newline].to_string();
                partial.drain(..=newline);
                if tx.blocking_send(line).is_err() {
                    return Ok(());
                }
            }
        }
        if tx.is_closed() {
            return Ok(());
        }
        std::thread::sleep(FOLLOW_POLL);
        if !path.exists() {
            warn!(path = %path.display(), "log file disappeared, closing stream");
            return Ok(());
        }
    }
}

/// Returns the last `n` lines before `end` and the offset streaming should
/// resume from (i.e. `end`). Scans backwards in fixed chunks so huge logs
/// never load fully.
fn tail_lines_at(
    file: &mut std::fs::File,
    end: u64,
    n: usize,
) -> std::io::Result<(Vec<String>, u64)> {
    if n == 0 || end == 0 {
        return Ok((Vec::new(), end));
    }

    let mut buffer: Vec<u8> = Vec::new();
    let mut pos = end;
    let mut newlines = 0usize;

    'scan: while pos > 0 {
        let chunk_len = TAIL_CHUNK.min(pos as usize);
        pos -= chunk_len as u64;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; chunk_len];
        file.read_exact(&mut chunk)?;
        // Prepend.
        chunk.extend_from_slice(&buffer);
        buffer = chunk;

        // Scan only the newly read region so each byte is counted once. A
        // newline terminates a previous line unless it is the file's final
        // byte, which merely closes the last line.
        for i in (0..chunk_len).rev() {
            if buffer[i] == b'\n' && (pos + i as u64) != end - 1 {
                newlines += 1;
                if newlines >= n {
                    buffer.drain(..=i);
                    break 'scan;
                }
            }
        }
    }

    let text = String::from_utf8_lossy(&buffer);
    let lines = text
        .lines()
        .rev()
        .take(n)
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Ok((lines, end))
}

/// Rotates `path` if it exceeds `max_bytes`: shift `.1..` up, discard the
/// oldest, move the live file to `.1`. Writers holding the old fd keep
/// appending to `.1` until they reopen, which is the usual rename-rotation
/// trade-off.
pub fn rotate_file(path: &Path, max_bytes: u64, max_files: usize) -> std::io::Result<bool> {
    let Ok(metadata) = std::fs::metadata(path) else {
        return Ok(false);
    };
    if metadata.len() <= max_bytes || max_files == 0 {
        return Ok(false);
    }

    let suffixed = |i: usize| PathBuf::from(format!("{}.{i}", path.display()));

    let oldest = suffixed(max_files);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for i in (1..max_files).rev() {
        let from = suffixed(i);
        if from.exists() {
            std::fs::rename(&from, suffixed(i + 1))?;
        }
    }
    std::fs::rename(path, suffixed(1))?;
    Ok(true)
}
