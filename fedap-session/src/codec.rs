//! Base protocol framing for DAP: a `Content-Length` header block followed by a JSON body.
//!
//! ```text
//! Content-Length: 119\r\n
//! \r\n
//! {"seq": 1, "type": "request", ...}
//! ```
//!
//! Exposed as a `tokio_util` codec so that the session can wrap the two halves of a transport
//! in `FramedRead` / `FramedWrite` and treat them as a stream and a sink of [`Message`]s.
use crate::message::Message;
use thiserror::Error;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Largest frame body that will be accepted.  Anything bigger is treated as a corrupt stream
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Anything that can go wrong reading or writing a frame.  None of these are recoverable; the
/// stream is in an unknown state afterwards.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error on the protocol stream")]
    Io(#[from] std::io::Error),

    #[error("frame header has no Content-Length")]
    MissingContentLength,

    #[error("malformed frame header: {0}")]
    InvalidHeader(String),

    #[error("frame of {0} bytes exceeds the maximum of {MAX_FRAME_LENGTH} bytes")]
    FrameTooLarge(usize),

    #[error("frame body is not a valid protocol message")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug)]
enum DecodeState {
    /// Waiting for a complete header block
    Header,

    /// Header consumed; waiting for this many bytes of body
    Body(usize),
}

/// Encoder and decoder for DAP frames
#[derive(Debug)]
pub struct DapCodec {
    state: DecodeState,
}

impl DapCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Parse a complete header block (without the terminating blank line) and return the body
    /// length it announces.
    fn parse_header(header: &[u8]) -> Result<usize, CodecError> {
        let header = std::str::from_utf8(header)
            .map_err(|_| CodecError::InvalidHeader("header is not valid UTF-8".to_string()))?;

        let mut content_length = None;
        for line in header.split("\r\n") {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::InvalidHeader(line.to_string()))?;

            // Only Content-Length means anything; other headers are allowed and ignored
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| CodecError::InvalidHeader(line.to_string()))?;
                content_length = Some(length);
            }
        }

        let length = content_length.ok_or(CodecError::MissingContentLength)?;
        if length > MAX_FRAME_LENGTH {
            return Err(CodecError::FrameTooLarge(length));
        }

        Ok(length)
    }
}

impl Default for DapCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DapCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(end) = src
                        .windows(HEADER_TERMINATOR.len())
                        .position(|window| window == HEADER_TERMINATOR)
                    else {
                        // A header block is a handful of short lines; a buffer this big with no
                        // terminator is garbage, not a slow sender
                        if src.len() > MAX_FRAME_LENGTH {
                            return Err(CodecError::InvalidHeader(
                                "no end of header found".to_string(),
                            ));
                        }
                        return Ok(None);
                    };

                    let length = Self::parse_header(&src[..end])?;
                    src.advance(end + HEADER_TERMINATOR.len());
                    src.reserve(length);
                    self.state = DecodeState::Body(length);
                }
                DecodeState::Body(length) => {
                    if src.len() < length {
                        return Ok(None);
                    }

                    let body = src.split_to(length);
                    self.state = DecodeState::Header;
                    return Ok(Some(serde_json::from_slice(&body)?));
                }
            }
        }
    }
}

impl Encoder<Message> for DapCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&message)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);

        Ok(())
    }
}
