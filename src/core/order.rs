//! Fractional position maps.
//!
//! An ordered collection is a key -> f64 map; descending position is display
//! order. Inserting or moving an element only ever writes that element's own
//! position (front: ceil of the max plus one, back: floor of the min minus
//! one, between: midpoint of the display neighbors), so siblings are never
//! renumbered.
//!
//! Limitation: repeated midpoint splits at the same spot halve the available
//! precision each time and can exhaust f64 over very long edit histories.
//! That is accepted at realistic volumes and intentionally not worked around
//! here.

use std::collections::BTreeMap;

/// Keys in display order: descending position, ties broken by key order so
/// the result is deterministic.
pub fn sorted_keys<K: Ord + Clone>(map: &BTreeMap<K, f64>) -> Vec<K> {
    let mut keys: Vec<K> = map.keys().cloned().collect();
    keys.sort_by(|a, b| {
        map[b]
            .partial_cmp(&map[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    keys
}

/// Position for a new front (display-first) element.
pub fn front_position<K: Ord>(map: &BTreeMap<K, f64>) -> f64 {
    map.values()
        .cloned()
        .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
        .map_or(0.0, |max| max.ceil() + 1.0)
}

/// Position for a new back (display-last) element.
pub fn back_position<K: Ord>(map: &BTreeMap<K, f64>) -> f64 {
    map.values()
        .cloned()
        .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
        .map_or(0.0, |min| min.floor() - 1.0)
}

pub fn insert_front<K: Ord>(map: &mut BTreeMap<K, f64>, key: K) {
    let pos = front_position(map);
    map.insert(key, pos);
}

pub fn insert_back<K: Ord>(map: &mut BTreeMap<K, f64>, key: K) {
    let pos = back_position(map);
    map.insert(key, pos);
}

/// Relocate the element at display index `src` so it lands before display
/// index `dst`, recomputing only its own position. `dst == len` means the
/// back. Returns false (untouched map) for out-of-range or no-op indices.
pub fn move_before<K: Ord + Clone>(map: &mut BTreeMap<K, f64>, src: usize, dst: usize) -> bool {
    let keys = sorted_keys(map);
    let n = keys.len();
    if src >= n || dst > n || src == dst {
        return false;
    }
    let pos = if dst == 0 {
        front_position(map)
    } else if dst == n {
        back_position(map)
    } else {
        (map[&keys[dst - 1]] + map[&keys[dst]]) / 2.0
    };
    map.insert(keys[src].clone(), pos);
    true
}

/// Move `key` one display slot toward the front.
pub fn move_up<K: Ord + Clone>(map: &mut BTreeMap<K, f64>, key: &K) -> bool {
    let keys = sorted_keys(map);
    match keys.iter().position(|k| k == key) {
        Some(i) if i >= 1 => move_before(map, i, i - 1),
        _ => false,
    }
}

/// Move `key` one display slot toward the back.
pub fn move_down<K: Ord + Clone>(map: &mut BTreeMap<K, f64>, key: &K) -> bool {
    let keys = sorted_keys(map);
    match keys.iter().position(|k| k == key) {
        Some(i) if i + 1 < keys.len() => move_before(map, i, i + 2),
        _ => false,
    }
}

/// Move `key` to the display front.
pub fn move_to_front<K: Ord + Clone>(map: &mut BTreeMap<K, f64>, key: &K) -> bool {
    let keys = sorted_keys(map);
    match keys.iter().position(|k| k == key) {
        Some(i) if i >= 1 => move_before(map, i, 0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(items: &[(&str, f64)]) -> BTreeMap<String, f64> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn front_and_back_extend_the_range() {
        let mut map = map_of(&[("a", 1.5), ("b", 0.0)]);
        insert_front(&mut map, "c".to_string());
        insert_back(&mut map, "d".to_string());
        assert_eq!(map["c"], 3.0);
        assert_eq!(map["d"], -1.0);
        assert_eq!(sorted_keys(&map), ["c", "a", "b", "d"]);
    }

    #[test]
    fn empty_map_inserts_at_zero() {
        let mut map: BTreeMap<String, f64> = BTreeMap::new();
        insert_front(&mut map, "a".to_string());
        assert_eq!(map["a"], 0.0);
    }

    #[test]
    fn move_before_matches_list_move() {
        // Property: move_before read back via sorted keys equals a plain
        // Vec::remove + insert of the same logical indices.
        let base = map_of(&[("a", 4.0), ("b", 3.0), ("c", 2.0), ("d", 1.0)]);
        for src in 0..4 {
            for dst in 0..=4 {
                let mut map = base.clone();
                let moved = move_before(&mut map, src, dst);

                let mut list: Vec<String> = sorted_keys(&base);
                if src != dst {
                    let item = list.remove(src);
                    let at = if dst > src { dst - 1 } else { dst };
                    list.insert(at, item);
                }
                if moved || src == dst {
                    assert_eq!(sorted_keys(&map), list, "src={src} dst={dst}");
                }
            }
        }
    }

    #[test]
    fn move_up_and_down_are_single_steps() {
        let mut map = map_of(&[("a", 3.0), ("b", 2.0), ("c", 1.0)]);
        assert!(move_down(&mut map, &"a".to_string()));
        assert_eq!(sorted_keys(&map), ["b", "a", "c"]);
        assert!(move_up(&mut map, &"a".to_string()));
        assert_eq!(sorted_keys(&map), ["a", "b", "c"]);
        // Ends are clamped.
        assert!(!move_up(&mut map, &"a".to_string()));
        assert!(!move_down(&mut map, &"c".to_string()));
    }

    #[test]
    fn move_only_rewrites_the_moved_key() {
        let base = map_of(&[("a", 3.0), ("b", 2.0), ("c", 1.0)]);
        let mut map = base.clone();
        move_before(&mut map, 2, 1);
        assert_eq!(map["a"], base["a"]);
        assert_eq!(map["b"], base["b"]);
        assert_eq!(map["c"], 2.5);
    }
}
