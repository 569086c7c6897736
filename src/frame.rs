//! Length-prefixed message framing.
//!
//! Every protobuf message, in either direction, travels as:
//!
//! ```text
//! <length>\r\n<exactly length bytes of protobuf>
//!
//! Example (5-byte message):
//! 5\r\n<5 bytes>
//! ```

use bytes::{Buf, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest header we accept before giving up on finding `\r\n`.
const MAX_HEADER_LEN: usize = 20;

/// Framing errors. All of them end the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid length header")]
    InvalidLength,
    #[error("frame of {length} bytes exceeds limit of {max} bytes")]
    TooLarge { length: usize, max: usize },
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("unexpected EOF while reading frame")]
    UnexpectedEof,
}

/// Header parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Header parsed; `length` bytes of message follow `header_len` bytes of header.
    Complete { length: usize, header_len: usize },
    /// Need more data for header.
    Incomplete,
    /// Header is not a decimal length.
    InvalidLength,
    /// Declared length is above the limit.
    TooLarge(usize),
}

/// Parse a frame header from the input buffer.
pub fn parse_header(input: &[u8], max_frame_size: usize) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_LEN => return ParseResult::InvalidLength,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];
    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return ParseResult::InvalidLength;
    }

    let length: usize = match std::str::from_utf8(line).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => return ParseResult::InvalidLength,
    };

    if length > max_frame_size {
        return ParseResult::TooLarge(length);
    }

    ParseResult::Complete {
        length,
        header_len: line_end + 2,
    }
}

/// Encode a message with its length header.
pub fn encode<M: Message>(message: &M) -> BytesMut {
    let body_len = message.encoded_len();
    let header = format!("{body_len}\r\n");
    let mut out = BytesMut::with_capacity(header.len() + body_len);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&message.encode_to_vec());
    out
}

/// Read one message.
///
/// `buffer` carries bytes read past the end of the previous frame and must
/// be reused across calls on the same stream. Returns `Ok(None)` on a clean
/// EOF between frames.
pub async fn read_message<R, M>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<M>, FrameError>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    loop {
        match parse_header(buffer, max_frame_size) {
            ParseResult::Complete { length, header_len } => {
                let total = header_len + length;
                while buffer.len() < total {
                    if reader.read_buf(buffer).await? == 0 {
                        return Err(FrameError::UnexpectedEof);
                    }
                }

                buffer.advance(header_len);
                let body = buffer.split_to(length);
                return Ok(Some(M::decode(body.freeze())?));
            }
            ParseResult::Incomplete => {
                if reader.read_buf(buffer).await? == 0 {
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(FrameError::UnexpectedEof);
                }
            }
            ParseResult::InvalidLength => return Err(FrameError::InvalidLength),
            ParseResult::TooLarge(length) => {
                return Err(FrameError::TooLarge {
                    length,
                    max: max_frame_size,
                })
            }
        }
    }
}

/// Write one message with its length header.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    writer.write_all(&encode(message)).await?;
    writer.flush().await
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
