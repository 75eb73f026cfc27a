//! Incremental decoder for `data: `-prefixed event streams.
//!
//! Chunk boundaries are arbitrary: a chunk may end in the middle of a line,
//! a JSON object or a multi-byte character. The decoder keeps the unfinished
//! tail in a byte buffer and only decodes complete lines.

use std::fmt::Display;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::error::{ChatError, Result};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Item produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental fragment of assistant text.
    Delta(String),
    /// The completion sentinel was received.
    Done,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[derive(Deserialize, Debug, Default)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    content: Option<String>,
}

/// Line-oriented stream decoder with a residual buffer.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the completion sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one raw chunk and return the events completed by it.
    ///
    /// Nothing is returned once the stream is done.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.decode_line(&line) {
                events.push(event);
                if self.done {
                    self.buffer.clear();
                    break;
                }
            }
        }
        events
    }

    /// Decode whatever is left in the buffer when the source closes.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done || self.buffer.is_empty() {
            self.buffer.clear();
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let line = String::from_utf8_lossy(raw);
        let data = line.trim().strip_prefix(DATA_PREFIX)?.trim();

        if data == DONE_SENTINEL {
            self.done = true;
            return Some(StreamEvent::Done);
        }

        let payload: StreamPayload = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(%error, "Skipping malformed stream event");
                return None;
            }
        };

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(StreamEvent::Delta)
    }
}

/// Turn a byte-chunk source into a lazy sequence of events.
///
/// The sequence ends with `Ok(StreamEvent::Done)`. A source that errors or
/// closes before the sentinel ends it with `Err(ChatError::StreamAborted)`.
pub fn decode_stream<S, B, E>(source: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut source = Box::pin(source);
        let mut decoder = StreamDecoder::new();

        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(ChatError::StreamAborted(e.to_string()));
                    return;
                }
            };

            for event in decoder.push(chunk.as_ref()) {
                yield Ok(event);
            }
            if decoder.is_done() {
                return;
            }
        }

        // Last line may lack its trailing newline.
        for event in decoder.finish() {
            yield Ok(event);
        }
        if !decoder.is_done() {
            yield Err(ChatError::StreamAborted(
                "connection closed before [DONE]".to_string(),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn delta_line(content: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn test_delta_split_across_chunks() {
        let mut decoder = StreamDecoder::new();
        assert!(
            decoder
                .push(br#"data: {"choices":[{"delta":{"con"#)
                .is_empty()
        );
        let events = decoder.push(b"tent\":\"hi\"}}]}\n");
        assert_eq!(events, vec![StreamEvent::Delta("hi".to_string())]);
    }

    #[test]
    fn test_done_sentinel_emits_no_delta() {
        let mut decoder = StreamDecoder::new();
        let input = format!("{}data: [DONE]\n", delta_line("cap rate"));
        let events = decoder.push(input.as_bytes());
        assert_eq!(
            events,
            vec![StreamEvent::Delta("cap rate".to_string()), StreamEvent::Done]
        );
        assert!(decoder.is_done());
    }

    #[test]
    fn test_input_after_done_is_ignored() {
        let mut decoder = StreamDecoder::new();
        let input = format!("data: [DONE]\n{}", delta_line("late"));
        assert_eq!(decoder.push(input.as_bytes()), vec![StreamEvent::Done]);
        assert!(decoder.push(delta_line("later").as_bytes()).is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_malformed_and_foreign_lines_are_skipped() {
        let mut decoder = StreamDecoder::new();
        let input = format!(
            ": keepalive comment\nevent: message\ndata: {{not json\n{}data: {{\"choices\":[]}}\n",
            delta_line("ok")
        );
        let events = decoder.push(input.as_bytes());
        assert_eq!(events, vec![StreamEvent::Delta("ok".to_string())]);
    }

    #[test]
    fn test_empty_delta_is_not_emitted() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(delta_line("").as_bytes()).is_empty());
        assert!(
            decoder
                .push(b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n")
                .is_empty()
        );
    }

    #[test]
    fn test_crlf_lines_are_trimmed() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r\n\r\n");
        assert_eq!(events, vec![StreamEvent::Delta("a".to_string())]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let line = delta_line("m²");
        let bytes = line.as_bytes();
        let split = line.find('²').unwrap() + 1;

        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(
            decoder.push(&bytes[split..]),
            vec![StreamEvent::Delta("m²".to_string())]
        );
    }

    #[test]
    fn test_finish_flushes_unterminated_sentinel() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_decode_stream_yields_in_order() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(delta_line("Zoning ").into_bytes()),
            Ok(delta_line("allows ").into_bytes()),
            Ok(format!("{}data: [DONE]\n", delta_line("duplexes.")).into_bytes()),
        ];
        let events: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Zoning ".to_string()),
                StreamEvent::Delta("allows ".to_string()),
                StreamEvent::Delta("duplexes.".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_stream_reports_early_close() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> =
            vec![Ok(delta_line("partial").into_bytes())];
        let events: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(StreamEvent::Delta(_))));
        assert!(matches!(events[1], Err(ChatError::StreamAborted(_))));
    }

    #[tokio::test]
    async fn test_decode_stream_reports_source_error() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(delta_line("one").into_bytes()),
            Err("connection reset".to_string()),
        ];
        let events: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;
        match &events[1] {
            Err(ChatError::StreamAborted(reason)) => assert!(reason.contains("reset")),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
