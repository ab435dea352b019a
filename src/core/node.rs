//! Node atoms: status, tracked ranges, text patches, the node record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::identity::EdgeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Todo,
    Done,
    Dont,
}

impl Status {
    pub fn is_todo(self) -> bool {
        matches!(self, Status::Todo)
    }
}

/// One tracked interval, milliseconds since the Unix epoch.
///
/// `end == None` means the range is still open. A node holds at most one
/// open range and it is always the last entry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: Option<u64>,
}

impl Range {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// One reversible text edit produced by the text codec.
///
/// The ops payload is opaque to the engine; the projected text is derived by
/// folding the patch list and is never replicated itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPatch {
    pub created_at: u64,
    pub ops: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub children: BTreeMap<EdgeId, f64>,
    pub end_time: Option<u64>,
    pub estimate: f64,
    pub parents: BTreeMap<EdgeId, f64>,
    pub ranges: Vec<Range>,
    pub start_time: u64,
    pub status: Status,
    pub text_patches: Vec<TextPatch>,
}

impl Node {
    pub fn new(now_ms: u64) -> Self {
        Self {
            children: BTreeMap::new(),
            end_time: None,
            estimate: 0.0,
            parents: BTreeMap::new(),
            ranges: Vec::new(),
            start_time: now_ms,
            status: Status::Todo,
            text_patches: Vec::new(),
        }
    }

    /// Whether the node has an open tracked range.
    pub fn is_running(&self) -> bool {
        self.ranges.last().is_some_and(Range::is_open)
    }

    pub fn has_estimate(&self) -> bool {
        self.estimate > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_means_last_range_open() {
        let mut node = Node::new(10);
        assert!(!node.is_running());
        node.ranges.push(Range {
            start: 10,
            end: None,
        });
        assert!(node.is_running());
        node.ranges.last_mut().unwrap().end = Some(20);
        assert!(!node.is_running());
    }

    #[test]
    fn status_round_trips_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Dont).unwrap(), "\"dont\"");
        let s: Status = serde_json::from_str("\"todo\"").unwrap();
        assert!(s.is_todo());
    }
}
