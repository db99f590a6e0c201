//! Server-Sent-Events framing.
//!
//! Streamed prompt execution replies arrive as SSE: `event:` / `data:` /
//! `id:` / `retry:` fields terminated by a blank line. The decoder is
//! incremental (feed it chunks as they arrive), multi-line `data` fields are
//! joined with newlines, unknown fields are ignored, and events whose name
//! contains "error" carry a `{code, msg}` payload that surfaces as a
//! service error.

use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{LoopError, Result};

/// One decoded Server-Sent Event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSentEvent {
    pub event: String,
    pub data: String,
    pub id: String,
    pub retry: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEventPayload {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

impl ServerSentEvent {
    /// Deserialize the data field as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.data.is_empty() {
            return Err(LoopError::internal("empty sse data field"));
        }
        serde_json::from_str(&self.data)
            .map_err(|e| LoopError::internal(format!("malformed sse data: {}", e)))
    }

    /// Whether this event signals a server-side failure.
    pub fn is_error(&self) -> bool {
        self.event.contains("error")
    }

    /// Surface an error event's `{code, msg}` payload as a service error.
    pub fn service_error(&self) -> LoopError {
        let payload: ErrorEventPayload = serde_json::from_str(&self.data).unwrap_or_default();
        let message = if payload.msg.is_empty() {
            self.data.clone()
        } else {
            payload.msg
        };
        LoopError::remote_service(200, payload.code, "", message)
    }

    fn is_empty(&self) -> bool {
        self.event.is_empty() && self.data.is_empty() && self.id.is_empty() && self.retry.is_none()
    }
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: ServerSentEvent,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the stream; returns every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<ServerSentEvent> {
        self.buffer.push_str(chunk);
        let mut completed = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                completed.push(event);
            }
        }
        completed
    }

    /// Flush a trailing event not terminated by a blank line (EOF).
    pub fn finish(&mut self) -> Option<ServerSentEvent> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<ServerSentEvent> {
        if self.event.is_empty() && self.data_lines.is_empty() {
            return None;
        }
        let mut event = std::mem::take(&mut self.event);
        event.data = std::mem::take(&mut self.data_lines).join("\n");
        Some(event)
    }

    fn process_line(&mut self, line: &str) -> Option<ServerSentEvent> {
        if line.trim().is_empty() {
            return self.take_pending();
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (line[..idx].to_string(), value.strip_prefix(' ').unwrap_or(value))
            }
            // a line without a colon is a field name with an empty value
            None => (line.trim().to_string(), ""),
        };

        match field.as_str() {
            "event" => self.event.event = value.to_string(),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.event.id = value.to_string(),
            "retry" => {
                if let Ok(retry) = value.parse::<u64>() {
                    self.event.retry = Some(retry);
                }
            }
            _ => {}
        }
        None
    }
}

/// Async SSE reader over an HTTP response body.
pub struct SseStream {
    response: reqwest::Response,
    decoder: SseDecoder,
    pending: VecDeque<ServerSentEvent>,
    done: bool,
}

impl SseStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Adapt the reader into a [`futures::Stream`] of events. The stream
    /// ends at end of body; error events come through as `Err` items.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<ServerSentEvent>> {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.recv().await {
                Ok(Some(event)) => Some((Ok(event), reader)),
                Ok(None) => None,
                Err(e) => {
                    reader.done = true;
                    reader.pending.clear();
                    Some((Err(e), reader))
                }
            }
        })
    }

    /// Receive the next event, or `None` at end of stream. Error events are
    /// surfaced as `Err`.
    pub async fn recv(&mut self) -> Result<Option<ServerSentEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_error() {
                    return Err(event.service_error());
                }
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            match self.response.chunk().await? {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let events = self.decoder.push(&text);
                    self.pending.extend(events);
                }
                None => {
                    self.done = true;
                    if let Some(event) = self.decoder.finish() {
                        self.pending.push_back(event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("event: message\ndata: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_multi_line_data_joined() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("data: line one\ndata: line two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("event: mes").is_empty());
        assert!(decoder.push("sage\ndata: hi\n").is_empty());
        let events = decoder.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("comment: ignored\ndata: d\nretry: 300\nid: 7\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "d");
        assert_eq!(events[0].id, "7");
        assert_eq!(events[0].retry, Some(300));
    }

    #[test]
    fn test_crlf_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("data: hi\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn test_error_event_payload() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("event: gateway-error\ndata: {\"code\":600500100,\"msg\":\"downstream unavailable\"}\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
        let err = events[0].service_error();
        assert!(err.to_string().contains("downstream unavailable"));
    }

    #[test]
    fn test_finish_flushes_trailing_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: trailing\n").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "trailing");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_blank_lines_between_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("\n\ndata: a\n\n\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }
}
