//! The typed argument union and its scalar companions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::interface::ProtocolObject;

/// Stable small-integer identity of a protocol object.
///
/// Ids are chosen by the subject when it creates proxies and echoed into the
/// driver's resource table, so the two per-side object tables agree on them.
/// An id is safe to transmit across the process boundary; a live handle is
/// not.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Signed 24.8 fixed-point number, the protocol's fractional coordinate type.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Fixed(i32);

impl Fixed {
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn from_int(v: i32) -> Self {
        Self(v << 8)
    }

    pub fn from_f64(v: f64) -> Self {
        Self((v * 256.0) as i32)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// One message argument, tagged by its signature character.
///
/// Variable-length payloads (`Str`, `Array`) are owned: storing an `Arg`
/// deep-copies them, which is what makes a recorded message safe to ship
/// across the process boundary. Object references are reduced to ids at
/// construction time via [`Arg::object`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    /// `i` — signed 32-bit integer.
    Int(i32),
    /// `u` — unsigned 32-bit integer.
    Uint(u32),
    /// `f` — 24.8 fixed-point number.
    Fixed(Fixed),
    /// `h` — file handle, carried by value.
    Fd(i32),
    /// `s` — owned byte string.
    Str(String),
    /// `a` — owned byte array with explicit length.
    Array(Vec<u8>),
    /// `o` — reference to an existing object, by id.
    Object(ObjectId),
    /// `n` — id of an object being created by this message.
    NewId(ObjectId),
}

impl Arg {
    /// Record an object reference: extracts the transmissible id from a live
    /// proxy or resource handle.
    pub fn object<T: ProtocolObject>(obj: &T) -> Self {
        Arg::Object(obj.object_id())
    }

    /// The signature character this argument satisfies.
    pub fn kind_char(&self) -> char {
        match self {
            Arg::Int(_) => 'i',
            Arg::Uint(_) => 'u',
            Arg::Fixed(_) => 'f',
            Arg::Fd(_) => 'h',
            Arg::Str(_) => 's',
            Arg::Array(_) => 'a',
            Arg::Object(_) => 'o',
            Arg::NewId(_) => 'n',
        }
    }

    /// The fixed-size 8-byte image of this argument.
    ///
    /// Scalars contribute their little-endian value; strings and arrays
    /// contribute their byte length only. This is the unit of the log's
    /// structural comparison: variable payloads are compared at id level,
    /// never content level.
    pub fn fixed_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        match self {
            Arg::Int(v) | Arg::Fd(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Arg::Uint(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Arg::Fixed(f) => out[..4].copy_from_slice(&f.raw().to_le_bytes()),
            Arg::Object(id) | Arg::NewId(id) => {
                out[..4].copy_from_slice(&id.0.to_le_bytes());
            }
            Arg::Str(s) => out.copy_from_slice(&(s.len() as u64).to_le_bytes()),
            Arg::Array(a) => out.copy_from_slice(&(a.len() as u64).to_le_bytes()),
        }
        out
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{v}"),
            Arg::Uint(v) => write!(f, "{v}"),
            Arg::Fixed(x) => write!(f, "{x}"),
            Arg::Fd(v) => write!(f, "fd:{v}"),
            Arg::Str(s) => write!(f, "{s:?}"),
            Arg::Array(a) => write!(f, "[{} bytes]", a.len()),
            Arg::Object(id) => write!(f, "obj{id}"),
            Arg::NewId(id) => write!(f, "new{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_conversions() {
        assert_eq!(Fixed::from_int(3).raw(), 768);
        assert_eq!(Fixed::from_int(3).to_f64(), 3.0);
        assert_eq!(Fixed::from_f64(-1.5).raw(), -384);
        assert_eq!(Fixed::from_f64(-1.5).to_f64(), -1.5);
    }

    #[test]
    fn fixed_bytes_are_id_level_for_payloads() {
        // Equal-length strings are indistinguishable at the fixed-slot
        // level; only the length is compared.
        let a = Arg::Str("abc".into());
        let b = Arg::Str("xyz".into());
        assert_eq!(a.fixed_bytes(), b.fixed_bytes());

        let c = Arg::Str("abcd".into());
        assert_ne!(a.fixed_bytes(), c.fixed_bytes());
    }

    #[test]
    fn fixed_bytes_scalars() {
        assert_eq!(Arg::Uint(0x01020304).fixed_bytes()[..4], [4, 3, 2, 1]);
        assert_eq!(Arg::Object(ObjectId(7)).fixed_bytes()[..4], [7, 0, 0, 0]);
    }
}
