//! Line transport over the worker's standard streams
//!
//! The reading half runs a pump task that forwards every received line into
//! a bounded queue, so a deadline on [`LineReader::next_frame`] never leaves
//! a partial read behind and stale lines can be drained before a new
//! exchange.

use std::time::Duration;

use imaged_core::{ImagedError, ImagedResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::framing::{decode_line, encode_line};

pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const LINE_QUEUE_DEPTH: usize = 64;

/// Reads base64 lines from the worker, skipping anything that is not one.
pub struct LineReader {
    lines: mpsc::Receiver<String>,
    pump: JoinHandle<()>,
}

impl LineReader {
    pub fn spawn(mut reader: BoxedReader) -> Self {
        let (tx, lines) = mpsc::channel(LINE_QUEUE_DEPTH);
        let pump = tokio::spawn(async move {
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("worker output read failed: {e}");
                        break;
                    }
                }
            }
        });
        Self { lines, pump }
    }

    /// Wait up to `timeout` for the next valid base64 line and decode it.
    ///
    /// Noise lines do not extend the deadline.
    pub async fn next_frame(&mut self, timeout: Duration) -> ImagedResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Err(_) => return Err(ImagedError::TransportTimeout(timeout.as_millis() as u64)),
                Ok(None) => {
                    return Err(ImagedError::ProcessDied(
                        "worker output stream closed".into(),
                    ))
                }
                Ok(Some(line)) => match decode_line(&line) {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => {
                        tracing::debug!(line = line.trim_end(), "skipping non-frame line: {e}");
                    }
                },
            }
        }
    }

    /// Drop every line already queued. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.lines.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Writes base64 lines to the worker.
pub struct LineWriter {
    writer: BoxedWriter,
}

impl LineWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self { writer }
    }

    pub async fn send_frame(&mut self, bytes: &[u8]) -> ImagedResult<()> {
        write_frame_line(&mut self.writer, bytes)
            .await
            .map_err(|e| match e {
                ImagedError::Io(io) => ImagedError::ProcessDied(format!("worker input closed: {io}")),
                other => other,
            })
    }
}

/// Read the next base64 line on the worker side. `Ok(None)` on end of input.
pub async fn read_frame_line<R>(reader: &mut R) -> ImagedResult<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        let Ok(line) = std::str::from_utf8(&buf) else {
            tracing::warn!(len = buf.len(), "ignoring non-UTF-8 input line");
            continue;
        };
        match decode_line(line) {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(e) => tracing::warn!("ignoring malformed input line: {e}"),
        }
    }
}

/// Write `bytes` as one base64 line and flush.
pub async fn write_frame_line<W>(writer: &mut W, bytes: &[u8]) -> ImagedResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = encode_line(bytes);
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader_over(input: &'static [u8]) -> LineReader {
        LineReader::spawn(Box::new(BufReader::new(input)))
    }

    #[tokio::test]
    async fn test_next_frame_skips_noise() {
        let mut reader = reader_over(b"Loading modules...\n\naGVsbG8=\n");
        let frame = reader.next_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn test_eof_is_process_death() {
        let mut reader = reader_over(b"not base64 at all\n");
        let err = reader.next_frame(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ImagedError::ProcessDied(_)));
    }

    #[tokio::test]
    async fn test_silence_times_out() {
        let (_keep_open, rx) = tokio::io::duplex(64);
        let mut reader = LineReader::spawn(Box::new(BufReader::new(rx)));
        let err = reader
            .next_frame(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ImagedError::TransportTimeout(50)));
    }

    #[tokio::test]
    async fn test_discard_pending() {
        let mut reader = reader_over(b"c3RhbGU=\nc3RhbGU=\n");
        // Give the pump a chance to queue both lines
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reader.discard_pending(), 2);
    }

    #[tokio::test]
    async fn test_worker_side_line_roundtrip() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        write_frame_line(&mut tx, b"frame one").await.unwrap();
        tx.write_all(b"garbage!\n").await.unwrap();
        write_frame_line(&mut tx, b"frame two").await.unwrap();
        drop(tx);

        let mut rx = BufReader::new(rx);
        assert_eq!(read_frame_line(&mut rx).await.unwrap().unwrap(), b"frame one");
        assert_eq!(read_frame_line(&mut rx).await.unwrap().unwrap(), b"frame two");
        assert!(read_frame_line(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_side_skips_binary_noise() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        write_frame_line(&mut tx, b"before").await.unwrap();
        tx.write_all(b"\xff\xfe\n").await.unwrap();
        tx.write_all(b"\xff\xfe garbage\n").await.unwrap();
        write_frame_line(&mut tx, b"after").await.unwrap();
        drop(tx);

        let mut rx = BufReader::new(rx);
        assert_eq!(read_frame_line(&mut rx).await.unwrap().unwrap(), b"before");
        assert_eq!(read_frame_line(&mut rx).await.unwrap().unwrap(), b"after");
        assert!(read_frame_line(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_front_end_skips_binary_noise() {
        let mut reader = reader_over(b"\xff\xfe\naGVsbG8=\n");
        let frame = reader.next_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, b"hello");
    }
}
