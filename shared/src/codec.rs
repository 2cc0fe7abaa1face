//! Line codec: frames a byte stream into protocol envelopes.
//!
//! Each envelope is a single JSON object terminated by `\n`. Blank lines are
//! skipped. Lines longer than the configured limit are rejected instead of
//! buffered without bound.

use bytes::BytesMut;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{DecodeError, Message, Registry, MAX_LINE_LENGTH};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({0} bytes)")]
    LineTooLong(usize),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decodes envelopes through a shared [`Registry`] and encodes any
/// [`Message`] as a newline-terminated JSON line.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    lines: LinesCodec,
    registry: Arc<Registry>,
    max_length: usize,
}

impl EnvelopeCodec {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_max_length(registry, MAX_LINE_LENGTH)
    }

    pub fn with_max_length(registry: Arc<Registry>, max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            registry,
            max_length,
        }
    }

    fn map_lines_error(&self, err: LinesCodecError) -> CodecError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => CodecError::LineTooLong(self.max_length),
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }

    fn decode_line(&self, line: Option<String>) -> Result<Option<Message>, CodecError> {
        match line {
            Some(line) => Ok(Some(self.registry.decode(&line)?)),
            None => Ok(None),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self
                .lines
                .decode(src)
                .map_err(|e| self.map_lines_error(e))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                line => return self.decode_line(line),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self
                .lines
                .decode_eof(src)
                .map_err(|e| self.map_lines_error(e))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                line => return self.decode_line(line),
            }
        }
    }
}

impl Encoder<Message> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.encode().map_err(CodecError::Encode)?;
        self.lines
            .encode(line, dst)
            .map_err(|e| self.map_lines_error(e))
    }
}
