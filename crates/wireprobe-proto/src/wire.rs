//! Framed wire codec.
//!
//! Each message is `object_id: u32 LE`, `opcode: u16 LE`, `size: u16 LE`
//! (total bytes including this 8-byte header), then arguments encoded per the
//! message signature. Scalar arguments take 4 bytes LE; strings and arrays
//! are a `u32 LE` byte length, the bytes, and zero padding to a 4-byte
//! boundary.

use std::io;

use bytes::{Buf, BufMut};

use crate::arg::{Arg, Fixed, ObjectId};

/// Bytes in a message header.
pub const HEADER_LEN: usize = 8;

/// An undecoded incoming message. Decoding needs the receiving side's object
/// table (the signature lives on the target's interface), so transports hand
/// these up raw.
#[derive(Debug)]
pub struct RawMessage {
    pub object: ObjectId,
    pub opcode: u16,
    pub body: Vec<u8>,
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Encode a message addressed to `object`.
///
/// The argument list must match the signature; a mismatch here is a caller
/// bug, not a wire condition.
pub fn encode_message(object: ObjectId, opcode: u16, signature: &str, args: &[Arg]) -> Vec<u8> {
    assert!(
        args.len() >= signature.len(),
        "message {opcode} on {object}: {} args for signature {signature:?}",
        args.len()
    );

    let mut body = Vec::new();
    for (ch, arg) in signature.chars().zip(args) {
        assert!(
            arg.kind_char() == ch,
            "argument {arg} does not satisfy signature character '{ch}'"
        );
        match arg {
            Arg::Int(v) | Arg::Fd(v) => body.put_i32_le(*v),
            Arg::Uint(v) => body.put_u32_le(*v),
            Arg::Fixed(f) => body.put_i32_le(f.raw()),
            Arg::Object(id) | Arg::NewId(id) => body.put_u32_le(id.0),
            Arg::Str(s) => {
                body.put_u32_le(s.len() as u32);
                body.put_slice(s.as_bytes());
                body.put_bytes(0, pad4(s.len()) - s.len());
            }
            Arg::Array(a) => {
                body.put_u32_le(a.len() as u32);
                body.put_slice(a);
                body.put_bytes(0, pad4(a.len()) - a.len());
            }
        }
    }

    let total = HEADER_LEN + body.len();
    assert!(total <= u16::MAX as usize, "message too large for the wire");

    let mut out = Vec::with_capacity(total);
    out.put_u32_le(object.0);
    out.put_u16_le(opcode);
    out.put_u16_le(total as u16);
    out.extend_from_slice(&body);
    out
}

/// Split a raw header into (object, opcode, total size).
pub fn decode_header(header: &[u8; HEADER_LEN]) -> (ObjectId, u16, usize) {
    let mut buf = &header[..];
    let object = ObjectId(buf.get_u32_le());
    let opcode = buf.get_u16_le();
    let size = buf.get_u16_le() as usize;
    (object, opcode, size)
}

fn short(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("truncated {what} in message body"))
}

/// Decode a message body against a signature.
pub fn decode_args(signature: &str, body: &[u8]) -> io::Result<Vec<Arg>> {
    let mut buf = body;
    let mut args = Vec::with_capacity(signature.len());
    for ch in signature.chars() {
        match ch {
            'i' => {
                if buf.remaining() < 4 {
                    return Err(short("int"));
                }
                args.push(Arg::Int(buf.get_i32_le()));
            }
            'u' => {
                if buf.remaining() < 4 {
                    return Err(short("uint"));
                }
                args.push(Arg::Uint(buf.get_u32_le()));
            }
            'f' => {
                if buf.remaining() < 4 {
                    return Err(short("fixed"));
                }
                args.push(Arg::Fixed(Fixed::from_raw(buf.get_i32_le())));
            }
            'h' => {
                if buf.remaining() < 4 {
                    return Err(short("fd"));
                }
                args.push(Arg::Fd(buf.get_i32_le()));
            }
            'o' => {
                if buf.remaining() < 4 {
                    return Err(short("object id"));
                }
                args.push(Arg::Object(ObjectId(buf.get_u32_le())));
            }
            'n' => {
                if buf.remaining() < 4 {
                    return Err(short("new id"));
                }
                args.push(Arg::NewId(ObjectId(buf.get_u32_le())));
            }
            's' => {
                if buf.remaining() < 4 {
                    return Err(short("string length"));
                }
                let len = buf.get_u32_le() as usize;
                let padded = pad4(len);
                if buf.remaining() < padded {
                    return Err(short("string"));
                }
                let text = String::from_utf8(buf[..len].to_vec()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "string argument is not UTF-8")
                })?;
                buf.advance(padded);
                args.push(Arg::Str(text));
            }
            'a' => {
                if buf.remaining() < 4 {
                    return Err(short("array length"));
                }
                let len = buf.get_u32_le() as usize;
                let padded = pad4(len);
                if buf.remaining() < padded {
                    return Err(short("array"));
                }
                args.push(Arg::Array(buf[..len].to_vec()));
                buf.advance(padded);
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown signature character '{other}'"),
                ));
            }
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let msg = encode_message(ObjectId(3), 2, "u", &[Arg::Uint(9)]);
        assert_eq!(msg.len(), 12);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&msg[..HEADER_LEN]);
        let (object, opcode, size) = decode_header(&header);
        assert_eq!(object, ObjectId(3));
        assert_eq!(opcode, 2);
        assert_eq!(size, 12);
    }

    #[test]
    fn string_args_are_padded() {
        let msg = encode_message(
            ObjectId(1),
            1,
            "sn",
            &[Arg::Str("wp_hub".into()), Arg::NewId(ObjectId(2))],
        );
        // header + (len + 6 bytes padded to 8) + new id
        assert_eq!(msg.len(), HEADER_LEN + 4 + 8 + 4);

        let args = decode_args("sn", &msg[HEADER_LEN..]).unwrap();
        assert_eq!(
            args,
            vec![Arg::Str("wp_hub".into()), Arg::NewId(ObjectId(2))]
        );
    }

    #[test]
    fn truncated_body_is_rejected() {
        let err = decode_args("uu", &[1, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn mixed_signature_round_trip() {
        let args = vec![
            Arg::Uint(7),
            Arg::Object(ObjectId(4)),
            Arg::Fixed(Fixed::from_f64(2.5)),
            Arg::Fixed(Fixed::from_f64(-0.25)),
        ];
        let msg = encode_message(ObjectId(5), 0, "uoff", &args);
        assert_eq!(decode_args("uoff", &msg[HEADER_LEN..]).unwrap(), args);
    }
}
