//! SSE line splitting and frame encoding.
//!
//! The upstream emits single-line `data:` records; the splitter re-assembles
//! lines across arbitrary chunk boundaries and feeds non-empty lines into a
//! bounded channel that the supervisor drains.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use memchr::memchr;
use tokio::sync::mpsc;

/// Capacity of the per-connection line channel. Decouples upstream read
/// pacing from downstream flush pacing while preserving order.
pub const LINE_CHANNEL_CAPACITY: usize = 100;

/// Spawn a reader task that splits a byte stream into SSE lines.
///
/// Lines are separated by `\n` (a trailing `\r` is stripped) and blank lines
/// are skipped; each record line is delivered in arrival order. The channel
/// closes on end-of-stream, on a transport error, or when the receiver is
/// dropped. A non-empty tail without a final newline is flushed as a line.
pub fn spawn_line_reader<S, E>(byte_stream: S) -> mpsc::Receiver<String>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut stream = Box::pin(byte_stream);
        let mut buffer: Vec<u8> = Vec::with_capacity(4096);

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::debug!(error = %err, "upstream byte stream failed; ending line feed");
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            let mut line_start = 0;
            while let Some(rel_pos) = memchr(b'\n', &buffer[line_start..]) {
                let line_end = line_start + rel_pos;
                let mut line = &buffer[line_start..line_end];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                if !line.is_empty() {
                    let line = String::from_utf8_lossy(line).into_owned();
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
                line_start = line_end + 1;
            }
            buffer.drain(..line_start);
        }

        if !buffer.is_empty() {
            let mut tail = buffer.as_slice();
            if tail.last() == Some(&b'\r') {
                tail = &tail[..tail.len() - 1];
            }
            if !tail.is_empty() {
                let _ = tx.send(String::from_utf8_lossy(tail).into_owned()).await;
            }
        }
    });

    rx
}

/// Encode a forwarded record line as an SSE frame (`{line}\n\n`).
#[must_use]
pub fn data_frame(line: &str) -> Bytes {
    let mut out = String::with_capacity(line.len() + 2);
    out.push_str(line);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Encode an `event: error` frame carrying a JSON payload.
#[must_use]
pub fn error_event_frame(payload: &serde_json::Value) -> Bytes {
    error_event_frame_raw(payload.to_string().as_bytes())
}

/// Encode an `event: error` frame from pre-serialized payload bytes, e.g. an
/// upstream error body forwarded verbatim.
#[must_use]
pub fn error_event_frame_raw(payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(22 + payload.len());
    out.extend_from_slice(b"event: error\ndata: ");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}
