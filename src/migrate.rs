//! Schema migration chain.
//!
//! Persisted documents carry a version tag; on load, one-version-at-a-time
//! migrators run until the current version, each contributing its forward
//! ops to the load patch — migration lands in history like any other edit
//! and is therefore auditable and undoable. A version nothing matches is
//! fatal: there is no safe automatic recovery, the operator must be told.
//!
//! History of the format:
//! - v1: order maps held ascending positions (smallest value displayed
//!   first).
//! - v2: order maps normalized to dense descending integer positions
//!   (largest first), the convention everything now assumes.
//! - v3: quadrant lists, pinned subtrees and the timeline became first-class
//!   containers.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::core::{DATA_VERSION, PatchOp, diff_values};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MigrateError {
    #[error("no migrator matches document version {found:?}")]
    UnknownVersion { found: Option<u64> },

    #[error("document does not parse: {reason}")]
    Parse { reason: String },

    #[error("document malformed at {what}: {reason}")]
    Malformed { what: String, reason: String },
}

/// Run the migrator chain until the document is current. Returns the
/// concatenated forward ops of every step plus the exact reverse (both
/// empty when already current), so a migration lands in history like any
/// other invertible edit.
pub fn migrate_to_current(doc: &mut Value) -> Result<(Vec<PatchOp>, Vec<PatchOp>), MigrateError> {
    let mut forward_all = Vec::new();
    let mut reverse_all = Vec::new();
    loop {
        let version = doc.get("version").and_then(Value::as_u64);
        let migrator: fn(&Value) -> Result<Value, MigrateError> = match version {
            Some(v) if v == u64::from(DATA_VERSION) => return Ok((forward_all, reverse_all)),
            Some(1) => v1_to_v2,
            Some(2) => v2_to_v3,
            other => return Err(MigrateError::UnknownVersion { found: other }),
        };
        let next = migrator(doc)?;
        let (forward, reverse) = diff_values(doc, &next);
        forward_all.extend(forward);
        // Later steps must unwind first.
        reverse_all.splice(0..0, reverse);
        *doc = next;
    }
}

fn object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, MigrateError> {
    value.as_object().ok_or_else(|| MigrateError::Malformed {
        what: what.to_string(),
        reason: "expected an object".to_string(),
    })
}

/// v1 order maps were ascending (smallest position displayed first);
/// rewrite every order map to dense descending integers preserving the
/// display order.
fn v1_to_v2(doc: &Value) -> Result<Value, MigrateError> {
    let mut next = doc.clone();

    fn reindex(map: &mut Map<String, Value>, what: &str) -> Result<(), MigrateError> {
        let mut entries: Vec<(String, f64)> = Vec::with_capacity(map.len());
        for (key, value) in map.iter() {
            let position = value.as_f64().ok_or_else(|| MigrateError::Malformed {
                what: format!("{what}/{key}"),
                reason: "position is not a number".to_string(),
            })?;
            entries.push((key.clone(), position));
        }
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let n = entries.len();
        for (rank, (key, _)) in entries.into_iter().enumerate() {
            map.insert(key, json!((n - 1 - rank) as f64));
        }
        Ok(())
    }

    if let Some(queue) = next.get_mut("queue").and_then(Value::as_object_mut) {
        reindex(queue, "queue")?;
    }
    let node_ids: Vec<String> = object(doc, "/")?
        .get("nodes")
        .map(|nodes| object(nodes, "nodes"))
        .transpose()?
        .map(|nodes| nodes.keys().cloned().collect())
        .unwrap_or_default();
    for id in node_ids {
        for field in ["children", "parents"] {
            if let Some(map) = next
                .pointer_mut(&format!("/nodes/{id}/{field}"))
                .and_then(Value::as_object_mut)
            {
                reindex(map, &format!("nodes/{id}/{field}"))?;
            }
        }
    }
    let time_ids: Vec<String> = doc
        .pointer("/timeline/time_nodes")
        .and_then(Value::as_object)
        .map(|buckets| buckets.keys().cloned().collect())
        .unwrap_or_default();
    for id in time_ids {
        if let Some(map) = next
            .pointer_mut(&format!("/timeline/time_nodes/{id}/nodes"))
            .and_then(Value::as_object_mut)
        {
            reindex(map, &format!("timeline/time_nodes/{id}/nodes"))?;
        }
    }

    next["version"] = json!(2);
    Ok(next)
}

/// Backfill the containers added in v3.
fn v2_to_v3(doc: &Value) -> Result<Value, MigrateError> {
    let mut next = doc.clone();
    let root = next.as_object_mut().ok_or_else(|| MigrateError::Malformed {
        what: "/".to_string(),
        reason: "expected an object".to_string(),
    })?;
    root.entry("covey_quadrants").or_insert_with(|| {
        json!({
            "important_urgent": [],
            "not_important_urgent": [],
            "important_not_urgent": [],
            "not_important_not_urgent": [],
        })
    });
    root.entry("pinned_sub_trees").or_insert_with(|| json!([]));
    root.entry("timeline").or_insert_with(|| {
        json!({ "year_begin": 2020, "count": 0, "time_nodes": {} })
    });
    root.insert("version".to_string(), json!(3));
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::apply_patch;

    fn v1_doc() -> Value {
        json!({
            "version": 1,
            "root": "0",
            "id_seq": 3,
            "queue": { "1": -5.0, "2": -7.0, "3": 0.0 },
            "nodes": {
                "1": { "children": {}, "parents": { "e1": 0.0 } },
                "2": { "children": {}, "parents": { "e2": 0.0 } },
                "3": { "children": { "e1": 1.0, "e2": 2.0 }, "parents": {} }
            }
        })
    }

    #[test]
    fn current_documents_pass_through() {
        let mut doc = json!({ "version": DATA_VERSION });
        let (forward, reverse) = migrate_to_current(&mut doc).unwrap();
        assert!(forward.is_empty());
        assert!(reverse.is_empty());
    }

    #[test]
    fn unknown_versions_are_fatal() {
        let mut doc = json!({ "version": 99 });
        assert_eq!(
            migrate_to_current(&mut doc).unwrap_err(),
            MigrateError::UnknownVersion { found: Some(99) }
        );
        let mut doc = json!({ "no_version": true });
        assert!(matches!(
            migrate_to_current(&mut doc).unwrap_err(),
            MigrateError::UnknownVersion { found: None }
        ));
    }

    #[test]
    fn v1_chain_preserves_display_order_and_reaches_current() {
        let mut doc = v1_doc();
        migrate_to_current(&mut doc).unwrap();
        assert_eq!(doc["version"], json!(DATA_VERSION));

        // v1 ascending order was 2 (-7), 1 (-5), 3 (0); descending dense
        // positions must preserve that display order.
        assert_eq!(doc["queue"]["2"], json!(2.0));
        assert_eq!(doc["queue"]["1"], json!(1.0));
        assert_eq!(doc["queue"]["3"], json!(0.0));
        // v3 containers exist.
        assert!(doc["covey_quadrants"].is_object());
        assert!(doc["pinned_sub_trees"].is_array());
        assert!(doc["timeline"]["time_nodes"].is_object());
    }

    #[test]
    fn migration_ops_replay_and_unwind_the_migration() {
        let original = v1_doc();
        let mut migrated = original.clone();
        let (forward, reverse) = migrate_to_current(&mut migrated).unwrap();

        let mut replayed = original.clone();
        apply_patch(&mut replayed, &forward).unwrap();
        assert_eq!(replayed, migrated);

        apply_patch(&mut replayed, &reverse).unwrap();
        assert_eq!(replayed, original);
    }
}
