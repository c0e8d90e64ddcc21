//! Newline-delimited JSON codec for worker communication.
//!
//! Uses AnyDelimiterCodec for line framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplex streams, etc).
//!
//! Decoding never fails on content: lines that are not protocol messages come
//! out as [`InboundFrame::Diagnostic`]. Only I/O errors end the stream.

use std::io;

use serde::Serialize;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::InboundMessage;

/// Longest inbound line accepted before it is discarded (16 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Why an inbound line was not routed as a protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticReason {
    NotJson,
    /// Valid JSON that lacks a recognizable `id`/`status`.
    NotProtocol(String),
    Oversized,
}

/// Out-of-band text the worker wrote to its protocol stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: String,
    pub reason: DiagnosticReason,
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(InboundMessage),
    Diagnostic(Diagnostic),
}

impl InboundFrame {
    /// Classify a single line (without its newline).
    pub fn parse(line: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                return Self::Diagnostic(Diagnostic {
                    line: line.to_string(),
                    reason: DiagnosticReason::NotJson,
                });
            }
        };
        match serde_json::from_value::<InboundMessage>(value) {
            Ok(msg) => Self::Message(msg),
            Err(e) => Self::Diagnostic(Diagnostic {
                line: line.to_string(),
                reason: DiagnosticReason::NotProtocol(e.to_string()),
            }),
        }
    }
}

/// Codec that frames messages as JSON lines.
///
/// Encodes any `Serialize` value as one line; decodes lines into [`InboundFrame`].
pub struct JsonLineCodec {
    inner: AnyDelimiterCodec,
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                vec![b'\n'],
                vec![b'\n'],
                max_line_length,
            ),
        }
    }

    fn frame(bytes: &[u8]) -> Option<InboundFrame> {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim();
        if line.is_empty() {
            return None;
        }
        Some(InboundFrame::parse(line))
    }

    fn oversized() -> InboundFrame {
        InboundFrame::Diagnostic(Diagnostic {
            line: String::new(),
            reason: DiagnosticReason::Oversized,
        })
    }
}

impl Decoder for JsonLineCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(bytes)) => {
                    if let Some(frame) = Self::frame(&bytes) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    return Ok(Some(Self::oversized()));
                }
                Err(AnyDelimiterCodecError::Io(e)) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode_eof(src) {
                Ok(Some(bytes)) => {
                    if let Some(frame) = Self::frame(&bytes) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    return Ok(Some(Self::oversized()));
                }
                Err(AnyDelimiterCodecError::Io(e)) => return Err(e),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Compact serde_json output escapes newlines inside strings.
        debug_assert!(!json.contains(&b'\n'));
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CorrelationId, OutboundMessage, ResponseStatus};
    use serde_json::json;

    fn decode_all(codec: &mut JsonLineCodec, input: &str) -> Vec<InboundFrame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        while let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_writes_one_terminated_line() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::new();
        let mut fields = serde_json::Map::new();
        fields.insert("query".to_string(), json!("a\nb"));
        let msg = OutboundMessage::new(CorrelationId::new(), "query", fields);

        codec.encode(&msg, &mut buf).unwrap();

        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        let back: OutboundMessage = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn decodes_messages_and_diagnostics_in_order() {
        let mut codec = JsonLineCodec::new();
        let input = concat!(
            "{\"id\":\"ready\",\"status\":\"success\"}\n",
            "UserWarning: something from a library\n",
            "\n",
            "{\"id\":\"ready\",\"status\":\"streaming\",\"data\":{\"type\":\"token\"}}\r\n",
        );

        let frames = decode_all(&mut codec, input);

        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], InboundFrame::Message(m) if m.status == ResponseStatus::Success));
        assert!(matches!(
            &frames[1],
            InboundFrame::Diagnostic(Diagnostic { reason: DiagnosticReason::NotJson, .. })
        ));
        assert!(matches!(&frames[2], InboundFrame::Message(m) if m.status == ResponseStatus::Streaming));
    }

    #[test]
    fn json_without_status_is_diagnostic() {
        let frame = InboundFrame::parse(r#"{"id":"abc","level":"info"}"#);
        assert!(matches!(
            frame,
            InboundFrame::Diagnostic(Diagnostic { reason: DiagnosticReason::NotProtocol(_), .. })
        ));
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from("{\"id\":\"ready\",");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"status\":\"success\"}\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Message(_))
        ));
    }

    #[test]
    fn trailing_line_without_newline_is_decoded_at_eof() {
        let mut codec = JsonLineCodec::new();
        let frames = decode_all(&mut codec, "{\"id\":\"ready\",\"status\":\"success\"}");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn oversized_line_is_discarded_and_decoding_continues() {
        let mut codec = JsonLineCodec::with_max_line_length(64);
        let long = "x".repeat(100);
        let input = format!("{long}\n{{\"id\":\"ready\",\"status\":\"success\"}}\n");

        let frames = decode_all(&mut codec, &input);

        assert!(matches!(
            &frames[0],
            InboundFrame::Diagnostic(Diagnostic { reason: DiagnosticReason::Oversized, .. })
        ));
        assert!(matches!(frames.last(), Some(InboundFrame::Message(_))));
    }

    #[test]
    fn invalid_utf8_becomes_diagnostic() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe garbage\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(
            frame,
            InboundFrame::Diagnostic(Diagnostic { reason: DiagnosticReason::NotJson, .. })
        ));
    }
}
