//! Incremental decoder for the chat stream endpoint.
//!
//! The body is a sequence of newline-delimited `data:` records. Each record is
//! a JSON object tagged by `type` (`chunk`, `metadata`, `error`, `done`) or the
//! literal `[DONE]` sentinel. The decoder yields exactly one terminal event
//! (`Error` or `Done`) and then ends.

use crate::error::{ApiErrorBody, TransportError};
use crate::session::MessageMetadata;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, warn};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Metadata(MessageMetadata),
    Error(TransportError),
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done)
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Deserialize)]
struct StreamRecord {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    metadata: Option<MessageMetadata>,
    #[serde(default)]
    error: Option<RecordError>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    is_complete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordError {
    Text(String),
    Body(ApiErrorBody),
}

struct Decoder {
    bytes: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    status: u16,
    finished: bool,
}

/// Turns a response body into a stream of tagged events.
///
/// `status` is the HTTP status of the streaming response; it is attached to
/// error records reported by the server inside the stream.
pub fn decode_event_stream<S>(bytes: S, status: u16) -> EventStream
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    let decoder = Decoder {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        status,
        finished: false,
    };

    Box::pin(stream::unfold(decoder, |mut decoder| async move {
        loop {
            if decoder.finished {
                return None;
            }
            if let Some(event) = decoder.pending.pop_front() {
                if event.is_terminal() {
                    decoder.finished = true;
                    decoder.pending.clear();
                }
                return Some((event, decoder));
            }
            if let Some(position) = decoder.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = decoder.buffer.drain(..=position).collect();
                decoder.decode_line(&line);
                continue;
            }
            match decoder.bytes.next().await {
                Some(Ok(chunk)) => decoder.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => decoder.pending.push_back(StreamEvent::Error(err)),
                None => {
                    let rest = std::mem::take(&mut decoder.buffer);
                    decoder.decode_line(&rest);
                    // A body that ends without a terminal record completes normally.
                    decoder.pending.push_back(StreamEvent::Done);
                }
            }
        }
    }))
}

impl Decoder {
    fn decode_line(&mut self, raw: &[u8]) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(err) => {
                warn!(%err, "skipping stream record with invalid UTF-8");
                return;
            }
        };
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(payload) = line.strip_prefix("data:") else {
            debug!(line, "ignoring non-data stream line");
            return;
        };
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            self.pending.push_back(StreamEvent::Done);
            return;
        }
        match serde_json::from_str::<StreamRecord>(payload) {
            Ok(record) => self.push_record(record),
            Err(err) => warn!(%err, payload, "skipping malformed stream record"),
        }
    }

    fn push_record(&mut self, record: StreamRecord) {
        let kind = record.kind.as_deref().map(str::to_ascii_lowercase);
        match kind.as_deref() {
            Some("chunk") | Some("content") | Some("delta") => {
                let text = record.content.or(record.chunk).unwrap_or_default();
                self.pending.push_back(StreamEvent::Chunk(text));
            }
            Some("metadata") => {
                let metadata = record.metadata.unwrap_or_default();
                self.pending.push_back(StreamEvent::Metadata(metadata));
            }
            Some("error") => {
                let err = self.record_error(record.error, record.message.or(record.content));
                self.pending.push_back(StreamEvent::Error(err));
            }
            Some("done") | Some("complete") | Some("end") => {
                self.pending.push_back(StreamEvent::Done);
            }
            Some(other) => warn!(kind = other, "skipping stream record of unknown type"),
            None => self.push_untyped(record),
        }
    }

    /// Records in the backend's native shape carry no `type` tag.
    fn push_untyped(&mut self, record: StreamRecord) {
        if record.error.is_some() {
            let err = self.record_error(record.error, record.message);
            self.pending.push_back(StreamEvent::Error(err));
            return;
        }
        let text = record.chunk.or(record.content);
        if text.is_none() && !record.is_complete {
            warn!("skipping stream record without type or content");
            return;
        }
        if let Some(metadata) = record.metadata.filter(|m| !m.is_empty()) {
            self.pending.push_back(StreamEvent::Metadata(metadata));
        }
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            self.pending.push_back(StreamEvent::Chunk(text));
        }
        if record.is_complete {
            self.pending.push_back(StreamEvent::Done);
        }
    }

    fn record_error(&self, error: Option<RecordError>, message: Option<String>) -> TransportError {
        match error {
            Some(RecordError::Body(body)) => {
                let code = body.machine_code();
                let text = if body.message.is_empty() {
                    message.unwrap_or_else(|| "Stream interrupted".to_string())
                } else {
                    body.message
                };
                TransportError::server(self.status, code, text)
            }
            Some(RecordError::Text(text)) => match message {
                Some(message) => TransportError::server(self.status, text, message),
                None => TransportError::server(self.status, "STREAM_ERROR", text),
            },
            None => TransportError::server(
                self.status,
                "STREAM_ERROR",
                message.unwrap_or_else(|| "Stream interrupted".to_string()),
            ),
        }
    }
}
