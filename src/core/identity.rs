//! Identity atoms.
//!
//! NodeId / EdgeId: base-36 strings allocated from the replicated `id_seq`.
//! ClientId / SessionId / PatchSeq: integers allocated by the remote store
//! and the local durable log respectively.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::CoreError;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode a sequence number the way ids are minted: lowercase base-36.
pub fn id_from_seq(seq: u64) -> String {
    if seq == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    let mut n = seq;
    while n > 0 {
        digits.push(ID_ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are ascii")
}

fn validate_id(s: &str, what: &str) -> Result<(), CoreError> {
    if s.is_empty() {
        return Err(CoreError::InvalidId {
            raw: s.to_string(),
            reason: format!("empty {what}"),
        });
    }
    // Ids become patch path segments, so the alphabet must stay free of
    // '/' and '~'. Base-36 guarantees that.
    if !s.bytes().all(|b| ID_ALPHABET.contains(&b)) {
        return Err(CoreError::InvalidId {
            raw: s.to_string(),
            reason: format!("{what} must be lowercase base-36"),
        });
    }
    Ok(())
}

macro_rules! base36_id {
    ($name:ident, $what:literal) => {
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
                let s = s.into();
                validate_id(&s, $what)?;
                Ok(Self(s))
            }

            pub(crate) fn from_seq(seq: u64) -> Self {
                Self(id_from_seq(seq))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

base36_id!(NodeId, "node id");
base36_id!(EdgeId, "edge id");

/// Client identifier allocated by the remote store, one per device/browser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i64);

/// Session identifier, incremented once per durable-store open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

/// Patch sequence number within one session's chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchSeq(pub i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_encoding() {
        assert_eq!(id_from_seq(0), "0");
        assert_eq!(id_from_seq(35), "z");
        assert_eq!(id_from_seq(36), "10");
        assert_eq!(id_from_seq(36 * 36 + 1), "101");
    }

    #[test]
    fn parse_rejects_bad_ids() {
        assert!(NodeId::parse("a1").is_ok());
        assert!(NodeId::parse("").is_err());
        assert!(NodeId::parse("A1").is_err());
        assert!(NodeId::parse("a/b").is_err());
    }

    #[test]
    fn serde_is_transparent() {
        let id = NodeId::parse("k9").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"k9\"");
        let back: NodeId = serde_json::from_str("\"k9\"").unwrap();
        assert_eq!(back, id);
    }
}
