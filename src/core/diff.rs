//! Structural diff over serialized documents.
//!
//! `diff_values(a, b)` returns a forward patch (a -> b) and its exact
//! reverse (b -> a); applying forward then reverse to `a` reproduces `a`
//! byte-for-byte. This is the single patch producer behind the reducer,
//! undo/redo, and migration.
//!
//! Arrays diff element-wise over the common prefix with add/remove at the
//! tail. Our collections are keyed objects almost everywhere, so the simple
//! array strategy only sees append/truncate-shaped edits (ranges, text
//! patches, pin lists) and stays minimal for them.

use serde_json::Value;

use super::error::PatchError;
use super::patch::{OpKind, PatchOp};

/// Forward and reverse patches between two documents.
pub fn diff_values(a: &Value, b: &Value) -> (Vec<PatchOp>, Vec<PatchOp>) {
    let mut forward = Vec::new();
    let mut reverse = Vec::new();
    diff_rec(a, b, "", &mut forward, &mut reverse);
    (forward, reverse)
}

fn diff_rec(a: &Value, b: &Value, path: &str, forward: &mut Vec<PatchOp>, reverse: &mut Vec<PatchOp>) {
    if a == b {
        return;
    }
    match (a, b) {
        (Value::Object(ao), Value::Object(bo)) => {
            for (key, old) in ao {
                if !bo.contains_key(key) {
                    let child = format!("{path}/{key}");
                    forward.push(PatchOp::remove(child.clone()));
                    reverse.push(PatchOp::add(child, old.clone()));
                }
            }
            for (key, new) in bo {
                let child = format!("{path}/{key}");
                match ao.get(key) {
                    Some(old) => diff_rec(old, new, &child, forward, reverse),
                    None => {
                        forward.push(PatchOp::add(child.clone(), new.clone()));
                        reverse.push(PatchOp::remove(child));
                    }
                }
            }
        }
        (Value::Array(aa), Value::Array(ba)) => {
            let common = aa.len().min(ba.len());
            for i in 0..common {
                let child = format!("{path}/{i}");
                diff_rec(&aa[i], &ba[i], &child, forward, reverse);
            }
            // Forward removals walk down so indices stay valid; the reverse
            // additions walk up for the same reason.
            for i in (common..aa.len()).rev() {
                forward.push(PatchOp::remove(format!("{path}/{i}")));
            }
            for (i, old) in aa.iter().enumerate().skip(common) {
                reverse.push(PatchOp::add(format!("{path}/{i}"), old.clone()));
            }
            for (i, new) in ba.iter().enumerate().skip(common) {
                forward.push(PatchOp::add(format!("{path}/{i}"), new.clone()));
            }
            for i in (common..ba.len()).rev() {
                reverse.push(PatchOp::remove(format!("{path}/{i}")));
            }
        }
        _ => {
            forward.push(PatchOp::replace(path.to_string(), b.clone()));
            reverse.push(PatchOp::replace(path.to_string(), a.clone()));
        }
    }
}

/// Apply ops in order, mutating `doc`.
pub fn apply_patch(doc: &mut Value, ops: &[PatchOp]) -> Result<(), PatchError> {
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let value = || -> Result<Value, PatchError> {
        op.value.clone().ok_or(PatchError::MissingValue {
            path: op.path.clone(),
        })
    };
    if op.path.is_empty() {
        *doc = match op.op {
            OpKind::Add | OpKind::Replace => value()?,
            OpKind::Remove => Value::Null,
        };
        return Ok(());
    }

    let mut segments = op.path.split('/');
    if segments.next() != Some("") {
        return Err(PatchError::BadPath {
            path: op.path.clone(),
        });
    }
    let segments: Vec<&str> = segments.collect();
    let (last, parents) = segments.split_last().ok_or(PatchError::BadPath {
        path: op.path.clone(),
    })?;

    let mut cursor = doc;
    for segment in parents {
        cursor = step(cursor, segment, &op.path)?;
    }

    match cursor {
        Value::Object(map) => match op.op {
            OpKind::Add | OpKind::Replace => {
                map.insert((*last).to_string(), value()?);
            }
            OpKind::Remove => {
                map.remove(*last).ok_or(PatchError::MissingTarget {
                    path: op.path.clone(),
                })?;
            }
        },
        Value::Array(items) => {
            let index = parse_index(last, &op.path)?;
            match op.op {
                OpKind::Add => {
                    if index > items.len() {
                        return Err(PatchError::IndexOutOfRange {
                            path: op.path.clone(),
                            index,
                            len: items.len(),
                        });
                    }
                    items.insert(index, value()?);
                }
                OpKind::Replace => {
                    let len = items.len();
                    let slot = items.get_mut(index).ok_or(PatchError::IndexOutOfRange {
                        path: op.path.clone(),
                        index,
                        len,
                    })?;
                    *slot = value()?;
                }
                OpKind::Remove => {
                    if index >= items.len() {
                        return Err(PatchError::IndexOutOfRange {
                            path: op.path.clone(),
                            index,
                            len: items.len(),
                        });
                    }
                    items.remove(index);
                }
            }
        }
        _ => {
            return Err(PatchError::MissingTarget {
                path: op.path.clone(),
            });
        }
    }
    Ok(())
}

fn step<'a>(cursor: &'a mut Value, segment: &str, path: &str) -> Result<&'a mut Value, PatchError> {
    if segment.is_empty() {
        return Err(PatchError::BadPath {
            path: path.to_string(),
        });
    }
    match cursor {
        Value::Object(map) => map.get_mut(segment).ok_or(PatchError::MissingTarget {
            path: path.to_string(),
        }),
        Value::Array(items) => {
            let index = parse_index(segment, path)?;
            let len = items.len();
            items.get_mut(index).ok_or(PatchError::IndexOutOfRange {
                path: path.to_string(),
                index,
                len,
            })
        }
        _ => Err(PatchError::MissingTarget {
            path: path.to_string(),
        }),
    }
}

fn parse_index(segment: &str, path: &str) -> Result<usize, PatchError> {
    segment.parse().map_err(|_| PatchError::BadIndex {
        path: path.to_string(),
        segment: segment.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(a: Value, b: Value) {
        let (forward, reverse) = diff_values(&a, &b);
        let mut doc = a.clone();
        apply_patch(&mut doc, &forward).unwrap();
        assert_eq!(doc, b, "forward patch must produce b");
        apply_patch(&mut doc, &reverse).unwrap();
        assert_eq!(doc, a, "reverse patch must restore a");
    }

    #[test]
    fn equal_documents_diff_empty() {
        let v = json!({"a": [1, 2], "b": {"c": null}});
        let (forward, reverse) = diff_values(&v, &v);
        assert!(forward.is_empty());
        assert!(reverse.is_empty());
    }

    #[test]
    fn object_add_remove_replace() {
        round_trip(
            json!({"keep": 1, "drop": true, "change": "x"}),
            json!({"keep": 1, "grow": [5], "change": "y"}),
        );
    }

    #[test]
    fn nested_objects() {
        round_trip(
            json!({"nodes": {"a": {"estimate": 0.0, "status": "todo"}}}),
            json!({"nodes": {"a": {"estimate": 2.0, "status": "done"}, "b": {"estimate": 0.0}}}),
        );
    }

    #[test]
    fn array_grow_and_shrink() {
        round_trip(json!([1, 2, 3]), json!([1, 9]));
        round_trip(json!([1]), json!([1, 2, 3, 4]));
        round_trip(json!([]), json!([{"start": 1, "end": null}]));
        round_trip(json!([{"a": 1}, {"a": 2}]), json!([{"a": 1}, {"a": 5}, {"a": 6}]));
    }

    #[test]
    fn type_changes_replace_wholesale() {
        round_trip(json!({"x": [1, 2]}), json!({"x": {"k": 1}}));
        round_trip(json!(null), json!({"data": 1}));
    }

    #[test]
    fn apply_rejects_missing_targets() {
        let mut doc = json!({"a": 1});
        let err = apply_patch(&mut doc, &[PatchOp::remove("/b")]).unwrap_err();
        assert!(matches!(err, PatchError::MissingTarget { .. }));
        let err = apply_patch(
            &mut doc,
            &[PatchOp::replace("/a/deep", json!(1))],
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::MissingTarget { .. }));
    }
}
