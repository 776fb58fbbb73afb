//! Atoms
//!
//! Short string constants packed into a `u64`: a `0xF` marker followed by
//! six bits per character. Up to 10 characters from `[ 0-9A-Z_a-z]` fit.
//! Comparing atoms is a single integer comparison, which makes them the
//! preferred message tag.

use crate::error::{ActorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of characters in an atom
pub const MAX_ATOM_LEN: usize = 10;

const MARKER: u64 = 0xF;

const ENCODING: &[u8; 64] = b" 0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Compact interned-name constant
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Atom(u64);

const fn encode_char(c: u8) -> Option<u64> {
    match c {
        b' ' => Some(0),
        b'0'..=b'9' => Some((c - b'0') as u64 + 1),
        b'A'..=b'Z' => Some((c - b'A') as u64 + 11),
        b'_' => Some(37),
        b'a'..=b'z' => Some((c - b'a') as u64 + 38),
        _ => None,
    }
}

/// Create an atom from a literal
///
/// Intended for constants: invalid input fails compilation when used in a
/// `const` context. Use [`Atom::try_new`] for runtime text.
pub const fn atom(text: &str) -> Atom {
    let bytes = text.as_bytes();
    assert!(bytes.len() <= MAX_ATOM_LEN, "atoms hold at most 10 characters");
    let mut value = MARKER;
    let mut i = 0;
    while i < bytes.len() {
        let code = match encode_char(bytes[i]) {
            Some(code) => code,
            None => panic!("unsupported atom character"),
        };
        value = (value << 6) | code;
        i += 1;
    }
    Atom(value)
}

impl Atom {
    /// Validate and encode runtime text
    pub fn try_new(text: &str) -> Result<Self> {
        if text.len() > MAX_ATOM_LEN {
            return Err(ActorError::InvalidAtom {
                text: text.to_string(),
                reason: format!("longer than {} characters", MAX_ATOM_LEN),
            });
        }
        let mut value = MARKER;
        for (i, c) in text.bytes().enumerate() {
            let code = encode_char(c).ok_or_else(|| ActorError::InvalidAtom {
                text: text.to_string(),
                reason: format!("unsupported character at position {}", i),
            })?;
            value = (value << 6) | code;
        }
        Ok(Atom(value))
    }

    /// Raw encoded value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Decode back into text
    pub fn text(self) -> String {
        let mut chars = Vec::with_capacity(MAX_ATOM_LEN);
        let mut value = self.0;
        while value > MARKER {
            chars.push(ENCODING[(value & 0x3F) as usize]);
            value >>= 6;
        }
        chars.reverse();
        String::from_utf8_lossy(&chars).into_owned()
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.text())
    }
}

/// Generic request atoms
pub mod atoms {
    use super::{atom, Atom};

    pub const GET: Atom = atom("get");
    pub const PUT: Atom = atom("put");
    pub const ADD: Atom = atom("add");
    pub const DELETE: Atom = atom("delete");
    pub const OK: Atom = atom("ok");
    pub const ERROR: Atom = atom("error");
    pub const PING: Atom = atom("ping");
    pub const PONG: Atom = atom("pong");
    /// Tag of monitor notifications: `[DOWN, Actor(id), Reason(r)]`
    pub const DOWN: Atom = atom("DOWN");
    /// Tag of trapped exit notifications: `[EXIT, Actor(id), Reason(r)]`
    pub const EXIT: Atom = atom("EXIT");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_text_round_trips() {
        for text in ["", "a", "ping", "UNSUBSCRIB", "a_b 9"] {
            assert_eq!(Atom::try_new(text).unwrap().text(), text);
        }
    }

    #[test]
    fn test_const_and_runtime_encodings_agree() {
        const GET: Atom = atom("get");
        assert_eq!(GET, Atom::try_new("get").unwrap());
        assert_ne!(atoms::GET, atoms::PUT);
        assert_eq!(format!("{:?}", atoms::DOWN), "'DOWN'");
    }

    #[test]
    fn test_rejects_invalid_text() {
        assert!(matches!(
            Atom::try_new("elevenchars"),
            Err(ActorError::InvalidAtom { .. })
        ));
        assert!(Atom::try_new("dash-ed").is_err());
    }

    #[test]
    fn test_leading_spaces_are_preserved() {
        // A leading space encodes as zero bits but the marker keeps it
        let spaced = Atom::try_new("  x").unwrap();
        assert_eq!(spaced.text(), "  x");
        assert_ne!(spaced, Atom::try_new("x").unwrap());
    }
}
