//! Line codec for client-server communication.
//!
//! Every message is one line: `v<version> <payload-length> <payload>\n`, where the
//! payload is compact JSON. Byte strings travel as base64 and JSON escapes newlines
//! inside strings, so a payload never contains a raw line break.
//!
//! `encode`/`decode` map messages to and from a single line; `LineCodec` frames those
//! lines over any AsyncRead/AsyncWrite (pipes, stdio, in-memory duplex streams).

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::version::PROTOCOL_VERSION;

/// Upper bound on a single line; output captures of a few MiB fit comfortably.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 128 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("value cannot be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds the maximum of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("frame contains a raw line break")]
    EmbeddedNewline,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame header missing or incomplete")]
    MissingHeader,
    #[error("unsupported protocol version tag '{0}'")]
    UnsupportedVersion(String),
    #[error("invalid payload length '{0}'")]
    InvalidLength(String),
    #[error("payload length mismatch: header says {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame exceeds the maximum of {max} bytes")]
    TooLong { max: usize },
}

/// Errors raised while moving lines over a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("stream closed in the middle of a frame")]
    Truncated,
    #[error("i/o error on frame stream: {0}")]
    Io(#[from] io::Error),
}

/// Encode a message as a single line, without the terminator.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<String, EncodeError> {
    let payload = serde_json::to_string(message)?;
    Ok(format!("v{} {} {}", PROTOCOL_VERSION, payload.len(), payload))
}

/// Decode a single line produced by [`encode`]. A trailing terminator is tolerated.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, DecodeError> {
    let line = line.strip_suffix('\n').unwrap_or(line);

    let (tag, rest) = line.split_once(' ').ok_or(DecodeError::MissingHeader)?;
    let version = tag
        .strip_prefix('v')
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| DecodeError::UnsupportedVersion(tag.to_string()))?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(tag.to_string()));
    }

    let (len, payload) = rest.split_once(' ').ok_or(DecodeError::MissingHeader)?;
    if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::InvalidLength(len.to_string()));
    }
    let expected: usize = len
        .parse()
        .map_err(|_| DecodeError::InvalidLength(len.to_string()))?;
    if payload.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: payload.len(),
        });
    }

    Ok(serde_json::from_str(payload)?)
}

/// Newline framing with a length cap.
///
/// Wraps LinesCodec; end of stream with a partial line buffered is reported as
/// [`FrameError::Truncated`] instead of yielding the fragment as a message.
#[derive(Debug, Clone)]
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn convert(&self, err: LinesCodecError) -> FrameError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => DecodeError::TooLong {
                max: self.max_length,
            }
            .into(),
            LinesCodecError::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
                DecodeError::InvalidUtf8.into()
            }
            LinesCodecError::Io(e) => FrameError::Io(e),
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src).map_err(|e| self.convert(e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated),
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.as_ref();
        if line.len() > self.max_length {
            return Err(EncodeError::TooLarge {
                len: line.len(),
                max: self.max_length,
            }
            .into());
        }
        if line.contains('\n') {
            return Err(EncodeError::EmbeddedNewline.into());
        }
        tracing::trace!(frame_size_bytes = line.len(), "Encoding frame");
        self.inner.encode(line, dst).map_err(|e| self.convert(e))
    }
}
