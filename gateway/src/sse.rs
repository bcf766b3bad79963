//! Server-Sent-Events stream decoding.
//!
//! The gateway's streaming body is framed as `data: <json>` lines with a
//! literal `data: [DONE]` sentinel; lines starting with `:` are provider
//! keep-alive comments. Frames may be split across network chunks at
//! arbitrary byte boundaries, so [`SseDecoder`] keeps a rolling buffer and
//! only processes complete lines, re-buffering the trailing remainder.
//!
//! A malformed data line is logged and skipped; it never aborts the stream.

use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use murmur_types::CompletionChunk;
use tokio::sync::mpsc;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Incremental line-buffered SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

enum LineOutcome {
    Skip,
    Chunk(CompletionChunk),
    Done,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel has been seen.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes currently held for an incomplete line.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed a network chunk, returning the chunks completed by it in
    /// arrival order. Input after the terminal sentinel is discarded.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<CompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            // Exclude the newline and any trailing carriage return.
            let mut end = line.len() - 1;
            if end > 0 && line[end - 1] == b'\r' {
                end -= 1;
            }
            match decode_line(&line[..end]) {
                LineOutcome::Skip => {}
                LineOutcome::Chunk(chunk) => chunks.push(chunk),
                LineOutcome::Done => {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        chunks
    }

    /// Flush at stream end: best-effort parse of a trailing partial line.
    /// Failures are swallowed since the stream is already closing.
    pub fn finish(mut self) -> Option<CompletionChunk> {
        if self.finished || self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        let line = if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            &line[..]
        };
        match decode_line(line) {
            LineOutcome::Chunk(chunk) => Some(chunk),
            LineOutcome::Skip | LineOutcome::Done => None,
        }
    }
}

fn decode_line(line: &[u8]) -> LineOutcome {
    if line.is_empty() || line[0] == b':' {
        return LineOutcome::Skip;
    }
    let Ok(line) = std::str::from_utf8(line) else {
        tracing::warn!(line_bytes = line.len(), "Skipping non-UTF-8 SSE line");
        return LineOutcome::Skip;
    };
    let Some(mut data) = line.strip_prefix(DATA_PREFIX) else {
        // Other SSE fields (event:, id:, retry:) carry nothing we consume.
        return LineOutcome::Skip;
    };
    if let Some(stripped) = data.strip_prefix(' ') {
        data = stripped;
    }
    if data == DONE_SENTINEL {
        return LineOutcome::Done;
    }
    match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => LineOutcome::Chunk(chunk),
        Err(e) => {
            tracing::warn!(%e, payload_bytes = data.len(), "Skipping malformed SSE payload");
            LineOutcome::Skip
        }
    }
}

/// One item relayed from the decode pump to a consumer.
#[derive(Debug)]
pub enum StreamItem {
    Chunk(CompletionChunk),
    /// Normal terminal: `[DONE]` sentinel or clean end of the byte stream.
    End,
    /// The stream failed before completing (transport error, idle timeout,
    /// runaway buffer). Chunks relayed before the failure remain valid.
    Failed(String),
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("MURMUR_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

async fn send_item(tx: &mpsc::Sender<StreamItem>, item: StreamItem) -> bool {
    tx.send(item).await.is_ok()
}

/// Decode an HTTP response body into [`StreamItem`]s on a channel.
///
/// Every exit path sends a terminal `End` or `Failed` item, except when
/// the receiver has gone away (the consumer cancelled). Cancellation is
/// external: callers wrap this future in an `Abortable` and aborting it
/// closes the channel without a terminal item.
pub async fn relay_stream(response: reqwest::Response, tx: mpsc::Sender<StreamItem>) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let idle_timeout = stream_idle_timeout();

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_item(&tx, StreamItem::Failed("stream idle timeout".to_string())).await;
            return;
        };

        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = send_item(&tx, StreamItem::Failed(format!("stream read failed: {e}"))).await;
                return;
            }
        };

        for decoded in decoder.feed(&chunk) {
            if !send_item(&tx, StreamItem::Chunk(decoded)).await {
                return;
            }
        }

        if decoder.is_finished() {
            let _ = send_item(&tx, StreamItem::End).await;
            return;
        }

        // A line that never terminates means a broken peer; cap the buffer.
        if decoder.buffered_len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_item(
                &tx,
                StreamItem::Failed("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return;
        }
    }

    // Byte stream ended without the sentinel: flush the remainder and
    // treat it as a normal terminal.
    if let Some(chunk) = decoder.finish()
        && !send_item(&tx, StreamItem::Chunk(chunk)).await
    {
        return;
    }
    let _ = send_item(&tx, StreamItem::End).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_of(chunk: &CompletionChunk) -> &str {
        chunk
            .first_choice()
            .and_then(|c| c.delta.content.as_deref())
            .unwrap_or("")
    }

    fn decode_all(decoder: &mut SseDecoder, input: &[u8]) -> Vec<CompletionChunk> {
        decoder.feed(input)
    }

    #[test]
    fn decodes_single_data_line() {
        let mut decoder = SseDecoder::new();
        let chunks = decode_all(
            &mut decoder,
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(content_of(&chunks[0]), "hi");
    }

    #[test]
    fn byte_split_insensitive() {
        let body = concat!(
            "data: {\"id\":\"gen-1\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            ": keep-alive\n",
            "\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: [DONE]\n",
        );

        // Whole-body feed
        let mut whole = SseDecoder::new();
        let whole_chunks = whole.feed(body.as_bytes());
        assert!(whole.is_finished());

        // One byte at a time
        let mut split = SseDecoder::new();
        let mut split_chunks = Vec::new();
        for byte in body.as_bytes() {
            split_chunks.extend(split.feed(&[*byte]));
        }
        assert!(split.is_finished());

        assert_eq!(whole_chunks, split_chunks);
        assert_eq!(whole_chunks.len(), 3);
        assert_eq!(content_of(&whole_chunks[0]), "Hel");
        assert_eq!(content_of(&whole_chunks[1]), "lo");
        assert_eq!(whole_chunks[2].finish_reason(), Some("stop"));
    }

    #[test]
    fn comment_lines_produce_no_chunks() {
        let mut decoder = SseDecoder::new();
        let chunks = decode_all(&mut decoder, b": ping\n:another comment\n\n");
        assert!(chunks.is_empty());
        assert!(!decoder.is_finished());
    }

    #[test]
    fn done_terminates_and_discards_trailing_input() {
        let mut decoder = SseDecoder::new();
        let chunks = decode_all(
            &mut decoder,
            b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        );
        assert!(chunks.is_empty());
        assert!(decoder.is_finished());
        assert!(decoder.feed(b"data: {}\n").is_empty());
    }

    #[test]
    fn malformed_json_is_skipped_not_fatal() {
        let mut decoder = SseDecoder::new();
        let chunks = decode_all(
            &mut decoder,
            b"data: {not json}\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(content_of(&chunks[0]), "ok");
    }

    #[test]
    fn data_prefix_without_space_accepted() {
        let mut decoder = SseDecoder::new();
        let chunks = decode_all(
            &mut decoder,
            b"data:{\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(content_of(&chunks[0]), "x");
    }

    #[test]
    fn non_data_fields_ignored() {
        let mut decoder = SseDecoder::new();
        let chunks = decode_all(
            &mut decoder,
            b"event: message\nid: 42\nretry: 1000\ndata: {\"choices\":[]}\n",
        );
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn finish_parses_trailing_partial_line() {
        let mut decoder = SseDecoder::new();
        assert!(
            decoder
                .feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")
                .is_empty()
        );
        let chunk = decoder.finish().expect("trailing chunk");
        assert_eq!(content_of(&chunk), "tail");
    }

    #[test]
    fn finish_swallows_incomplete_json() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"choices\":[{\"del").is_empty());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn crlf_line_endings_handled() {
        let mut decoder = SseDecoder::new();
        let chunks = decode_all(
            &mut decoder,
            b"data: {\"choices\":[{\"delta\":{\"content\":\"win\"}}]}\r\ndata: [DONE]\r\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(content_of(&chunks[0]), "win");
        assert!(decoder.is_finished());
    }
}
