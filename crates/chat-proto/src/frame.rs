use std::io::{self, Read, Write};

use crate::{
    bounded_string::{BoundedString, MAX_STRING_LEN},
    error::FramingError,
};

/// The one-octet frame-type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Register = 1,
    Send = 2,
    Deliver = 3,
    Status = 4,
}

impl Opcode {
    /// Classifies a raw opcode octet, rejecting anything outside `{1,2,3,4}`.
    pub fn classify(byte: u8) -> Result<Self, FramingError> {
        match byte {
            1 => Ok(Opcode::Register),
            2 => Ok(Opcode::Send),
            3 => Ok(Opcode::Deliver),
            4 => Ok(Opcode::Status),
            other => Err(FramingError::BadOpcode(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Good = 0,
    Error = 1,
}

impl StatusCode {
    fn from_byte(byte: u8) -> Result<Self, FramingError> {
        match byte {
            0 => Ok(StatusCode::Good),
            1 => Ok(StatusCode::Error),
            other => Err(FramingError::BadOpcode(other)),
        }
    }
}

/// A fully parsed BCP frame.
#[derive(Debug)]
pub enum Frame {
    Register { username: BoundedString },
    Send { message: BoundedString },
    Deliver { from: BoundedString, message: BoundedString },
    Status { code: StatusCode, message: BoundedString },
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Register { .. } => Opcode::Register,
            Frame::Send { .. } => Opcode::Send,
            Frame::Deliver { .. } => Opcode::Deliver,
            Frame::Status { .. } => Opcode::Status,
        }
    }
}

/// Reads a length-prefixed `BoundedString`: a big-endian `u16` length
/// followed by exactly that many bytes.
///
/// Any declared length over [`MAX_STRING_LEN`] is a fatal framing error.
/// Any short read (the peer closes or errors mid-frame) is also fatal,
/// because `read_exact` on a non-blocking stream surfaces `WouldBlock` or a
/// partial read as an `io::Error` immediately rather than retrying.
fn read_bounded_string<R: Read>(reader: &mut R) -> Result<BoundedString, FramingError> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).map_err(|_| FramingError::PartialFrame)?;
    let len = u16::from_be_bytes(len_buf);
    if len as usize > MAX_STRING_LEN {
        return Err(FramingError::OversizeLength(len));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).map_err(|_| FramingError::PartialFrame)?;
    BoundedString::from_slice(&data)
}

fn write_bounded_string<W: Write>(writer: &mut W, s: &BoundedString) -> io::Result<()> {
    writer.write_all(&(s.len() as u16).to_be_bytes())?;
    writer.write_all(s.as_bytes())
}

/// Reads the `Register` payload. The opcode octet has already been consumed
/// by the caller via [`Opcode::classify`].
pub fn read_register<R: Read>(reader: &mut R) -> Result<Frame, FramingError> {
    Ok(Frame::Register { username: read_bounded_string(reader)? })
}

pub fn read_send<R: Read>(reader: &mut R) -> Result<Frame, FramingError> {
    Ok(Frame::Send { message: read_bounded_string(reader)? })
}

pub fn read_deliver<R: Read>(reader: &mut R) -> Result<Frame, FramingError> {
    let from = read_bounded_string(reader)?;
    let message = read_bounded_string(reader)?;
    Ok(Frame::Deliver { from, message })
}

pub fn read_status<R: Read>(reader: &mut R) -> Result<Frame, FramingError> {
    let mut code_buf = [0u8; 1];
    reader.read_exact(&mut code_buf).map_err(|_| FramingError::PartialFrame)?;
    let code = StatusCode::from_byte(code_buf[0])?;
    let message = read_bounded_string(reader)?;
    Ok(Frame::Status { code, message })
}

/// Dispatches to the variant reader matching `opcode`. `opcode` must already
/// have been produced by [`Opcode::classify`] on the stream's leading octet.
pub fn read_frame<R: Read>(opcode: Opcode, reader: &mut R) -> Result<Frame, FramingError> {
    match opcode {
        Opcode::Register => read_register(reader),
        Opcode::Send => read_send(reader),
        Opcode::Deliver => read_deliver(reader),
        Opcode::Status => read_status(reader),
    }
}

/// Serialises a `Deliver` frame into a contiguous buffer. The server never
/// needs to encode `Register` or `Send`.
pub fn encode_deliver(from: &BoundedString, message: &BoundedString) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 2 + from.len() + 2 + message.len());
    buf.push(Opcode::Deliver as u8);
    write_bounded_string(&mut buf, from).expect("writing to a Vec cannot fail");
    write_bounded_string(&mut buf, message).expect("writing to a Vec cannot fail");
    buf
}

/// Serialises a `Status` frame into a contiguous buffer.
pub fn encode_status(code: StatusCode, message: &BoundedString) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 1 + 2 + message.len());
    buf.push(Opcode::Status as u8);
    buf.push(code as u8);
    write_bounded_string(&mut buf, message).expect("writing to a Vec cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_deliver(from: &str, message: &str) {
        let from = BoundedString::from(from);
        let message = BoundedString::from(message);
        let encoded = encode_deliver(&from, &message);
        let mut cursor = &encoded[1..];
        let decoded = read_deliver(&mut cursor).unwrap();
        match decoded {
            Frame::Deliver { from: df, message: dm } => {
                assert_eq!(df.as_bytes(), from.as_bytes());
                assert_eq!(dm.as_bytes(), message.as_bytes());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn deliver_roundtrip_various_lengths() {
        roundtrip_deliver("", "");
        roundtrip_deliver("a", "b");
        roundtrip_deliver("[Server]", &"x".repeat(MAX_STRING_LEN));
    }

    #[test]
    fn status_roundtrip() {
        let message = BoundedString::from("bad news");
        let encoded = encode_status(StatusCode::Error, &message);
        assert_eq!(encoded[0], Opcode::Status as u8);
        let mut cursor = &encoded[1..];
        let decoded = read_status(&mut cursor).unwrap();
        match decoded {
            Frame::Status { code, message: m } => {
                assert_eq!(code, StatusCode::Error);
                assert_eq!(m.as_bytes(), b"bad news");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn classify_rejects_unknown_opcode() {
        assert!(matches!(Opcode::classify(9), Err(FramingError::BadOpcode(9))));
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4096u16.to_be_bytes());
        let mut cursor = &buf[..];
        let err = read_register(&mut cursor).unwrap_err();
        assert!(matches!(err, FramingError::OversizeLength(4096)));
    }

    #[test]
    fn partial_frame_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u16.to_be_bytes());
        buf.extend_from_slice(b"short");
        let mut cursor = &buf[..];
        let err = read_register(&mut cursor).unwrap_err();
        assert!(matches!(err, FramingError::PartialFrame));
    }
}
