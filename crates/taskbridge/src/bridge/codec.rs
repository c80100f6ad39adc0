//! Line-delimited codec for bridge envelopes.
//!
//! Uses AnyDelimiterCodec for `\n` framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (stdio, pipes, in-memory duplex).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::Envelope;

/// Default inbound line limit (16 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Malformed inbound line. Reported to the supervisor, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

/// Serialize an envelope to a single line without the terminator.
///
/// Serialization failures degrade to an error envelope without execution id.
pub fn encode_line(envelope: &Envelope) -> String {
    match serde_json::to_string(envelope) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(kind = envelope.kind(), error = %e, "Failed to encode envelope");
            let fallback = Envelope::error(
                None,
                format!("failed to encode {} envelope", envelope.kind()),
                Some(serde_json::Value::String(e.to_string())),
            );
            serde_json::to_string(&fallback).unwrap_or_else(|_| {
                r#"{"type":"error","error":"failed to encode envelope"}"#.to_string()
            })
        }
    }
}

pub fn decode_line(line: &str) -> Result<Envelope, ParseError> {
    Ok(serde_json::from_str(line)?)
}

/// Codec that frames envelopes as newline-terminated JSON.
///
/// Decoding yields `Result<Envelope, ParseError>` items so a bad line is surfaced
/// without terminating the stream. Blank lines are skipped.
pub struct EnvelopeCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
            max_length,
        }
    }

    fn parse(line: &Bytes) -> Option<Result<Envelope, ParseError>> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(serde_json::from_slice(line).map_err(ParseError::from))
    }

    fn lift(
        &self,
        result: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Option<Result<Envelope, ParseError>>>, io::Error> {
        match result {
            Ok(Some(line)) => Ok(Some(Self::parse(&line))),
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::warn!(max = self.max_length, "Discarding over-long envelope line");
                Ok(Some(Some(Err(ParseError::LineTooLong {
                    max: self.max_length,
                }))))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, ParseError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.inner.decode(src);
            match self.lift(decoded)? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.inner.decode_eof(src);
            match self.lift(decoded)? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = encode_line(&item);
        tracing::trace!(kind = item.kind(), line_bytes = line.len(), "Encoding envelope");
        self.inner.encode(line, dst).map_err(|e| match e {
            AnyDelimiterCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}
