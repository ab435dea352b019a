//! Text codec seam.
//!
//! Node text is never stored directly: it is a projection over an ordered
//! list of reversible text patches. The codec that produces those patches is
//! an external collaborator; the engine only needs "diff two strings into an
//! opaque ops payload" and "apply a payload to a base string".
//!
//! `ReplaceCodec` is the built-in implementation: one whole-string
//! replacement per edit, trivially reversible. A compressing diff codec can
//! be swapped in without touching the data model.

use serde_json::{Value, json};

pub trait TextCodec: Send {
    /// Encode the edit `old -> new` as an opaque, reversible ops payload.
    fn diff(&self, old: &str, new: &str) -> Value;

    /// Apply an ops payload to `base`. Returns `Err` with a human-readable
    /// reason when the payload does not fit the base text.
    fn apply(&self, base: &str, ops: &Value) -> Result<String, String>;
}

/// Whole-string replacement codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceCodec;

impl TextCodec for ReplaceCodec {
    fn diff(&self, old: &str, new: &str) -> Value {
        json!({ "from": old, "to": new })
    }

    fn apply(&self, base: &str, ops: &Value) -> Result<String, String> {
        let from = ops
            .get("from")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing \"from\"".to_string())?;
        let to = ops
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing \"to\"".to_string())?;
        if base != from {
            return Err(format!("base mismatch: expected {from:?}"));
        }
        Ok(to.to_string())
    }
}

/// Fold a patch list into the projected text, starting from the empty
/// string.
pub fn project_text(codec: &dyn TextCodec, ops_list: impl Iterator<Item = Value>) -> Result<String, String> {
    let mut text = String::new();
    for ops in ops_list {
        text = codec.apply(&text, &ops)?;
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_codec_round_trips() {
        let codec = ReplaceCodec;
        let ops = codec.diff("", "hello");
        assert_eq!(codec.apply("", &ops).unwrap(), "hello");
        let ops2 = codec.diff("hello", "hello world");
        assert_eq!(codec.apply("hello", &ops2).unwrap(), "hello world");
    }

    #[test]
    fn apply_rejects_wrong_base() {
        let codec = ReplaceCodec;
        let ops = codec.diff("a", "b");
        assert!(codec.apply("c", &ops).is_err());
    }

    #[test]
    fn projection_folds_in_order() {
        let codec = ReplaceCodec;
        let patches = vec![codec.diff("", "a"), codec.diff("a", "ab")];
        assert_eq!(project_text(&codec, patches.into_iter()).unwrap(), "ab");
    }
}
