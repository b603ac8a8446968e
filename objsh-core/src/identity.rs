//! Object and client identity: opaque 128-bit identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier for a shared object or a connected client (16 bytes).
///
/// A client is named by the identifier of its root object, so the same type
/// serves as object id and client id. Serialized fixed-width.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid([u8; 16]);

impl Uid {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Uid(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        uuid::Uuid::from_bytes(self.0).hyphenated().fmt(f)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self)
    }
}

/// Parse the dashed (or plain) hex form produced by `Display`.
impl FromStr for Uid {
    type Err = ParseUidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(|u| Uid(u.into_bytes()))
            .map_err(|_| ParseUidError(s.to_string()))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("not an identifier: {0}")]
pub struct ParseUidError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fresh_ids_are_unique() {
        let ids: HashSet<Uid> = (0..1000).map(|_| Uid::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn display_is_dashed_hex_and_parses_back() {
        let id = Uid::from_bytes([0xab; 16]);
        let s = id.to_string();
        assert_eq!(s, "abababab-abab-abab-abab-abababababab");
        assert_eq!(s.parse::<Uid>().unwrap(), id);
        assert!("root".parse::<Uid>().is_err());
    }

    #[test]
    fn serialized_fixed_width() {
        let id = Uid::new();
        let bytes = bincode::serialize(&id).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..], id.as_bytes());
        let back: Uid = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ordering_follows_bytes() {
        let a = Uid::from_bytes([0; 16]);
        let mut hi = [0; 16];
        hi[15] = 1;
        let b = Uid::from_bytes(hi);
        assert!(a < b);
    }
}
