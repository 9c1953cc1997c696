//! ## Portal control-message codec
//!
//! The portal control protocol is a single-line, whitespace-separated ASCII
//! message carried over UDP (and, without the leading timestamp token, over
//! the static configuration file). This crate owns the wire grammar
//! (`REDIRECT`, `PEER`, `LOCAL`, `SIGN`) and the truncated HMAC-SHA256
//! signature scheme that guards it.
//!
//! The signature is intentionally weak: only the first 4 bytes of the
//! HMAC-SHA256 digest are kept, to fit the 1400 byte UDP payload budget
//! alongside a full path list. This is a deliberate trade-off, not an
//! oversight.

pub mod crypto;
pub mod message;

pub use crypto::{KeySet, SignMethod};
pub use message::{Message, PathEntry, PeerEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Unsigned,
    BadSignature,
    UnknownKeyword,
    Malformed,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
