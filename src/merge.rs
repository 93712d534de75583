//! Deterministic merge of nested JSON containers.
//!
//! A container is either a JSON array or a JSON object. An object whose keys are
//! exactly `"0".."n-1"` is treated as list-like, same as an array. Scalars and
//! type mismatches resolve by letting the right-hand side win.

use serde_json::{Map, Value};

/// Merges `b` into `a`.
///
/// * Two flat arrays always concatenate, whatever the flags say.
/// * Two flat containers of any other shape union by key, `b` winning.
/// * Otherwise every key of `b` is resolved against `a`; nested containers go
///   through [`merge_values`].
pub fn merge(a: &Value, b: &Value, deep_merge: bool, concat_arrays: bool) -> Value {
    if is_empty_container(b) && is_container(a) {
        return a.clone();
    }
    if is_empty_container(a) && is_container(b) {
        return b.clone();
    }
    if !is_container(a) || !is_container(b) {
        return b.clone();
    }

    if is_flat(a) && is_flat(b) {
        return match (a, b) {
            (Value::Array(left), Value::Array(right)) => {
                Value::Array(left.iter().chain(right.iter()).cloned().collect())
            }
            _ => Value::Object(union(a, b)),
        };
    }

    let resolve = |left: &Value, right: &Value| {
        if is_container(left) && is_container(right) {
            merge_values(left, right, deep_merge, concat_arrays)
        } else {
            right.clone()
        }
    };

    match (a, b) {
        (Value::Array(left), Value::Array(right)) => {
            let mut out = left.clone();
            for (idx, value) in right.iter().enumerate() {
                match out.get(idx) {
                    Some(existing) => out[idx] = resolve(existing, value),
                    None => out.push(value.clone()),
                }
            }
            Value::Array(out)
        }
        _ => {
            let mut out = entries(a);
            for (key, value) in entries(b) {
                let merged = match out.get(&key) {
                    Some(existing) => resolve(existing, &value),
                    None => value,
                };
                out.insert(key, merged);
            }
            Value::Object(out)
        }
    }
}

/// Resolves two container values found under the same key.
///
/// Parallel lists are never merged positionally: they are concatenated when
/// `concat_arrays` is set and replaced otherwise. Without `deep_merge`, maps are
/// unioned one level deep; with it they recurse through [`merge`].
pub fn merge_values(v1: &Value, v2: &Value, deep_merge: bool, concat_arrays: bool) -> Value {
    if is_list_like(v1) && is_list_like(v2) {
        return if concat_arrays {
            let mut items = list_items(v1);
            items.extend(list_items(v2));
            Value::Array(items)
        } else {
            v2.clone()
        };
    }
    if deep_merge {
        merge(v1, v2, deep_merge, concat_arrays)
    } else {
        Value::Object(union(v1, v2))
    }
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Object(_))
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// A container none of whose values is itself a container.
fn is_flat(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.iter().any(is_container),
        Value::Object(map) => !map.values().any(is_container),
        _ => true,
    }
}

fn is_list_like(value: &Value) -> bool {
    match value {
        Value::Array(_) => true,
        Value::Object(map) => (0..map.len()).all(|idx| map.contains_key(&idx.to_string())),
        _ => false,
    }
}

fn list_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => (0..map.len())
            .filter_map(|idx| map.get(&idx.to_string()).cloned())
            .collect(),
        _ => vec![value.clone()],
    }
}

/// Key/value view of a container; array indices become string keys.
fn entries(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, v)| (idx.to_string(), v.clone()))
            .collect(),
        _ => Map::new(),
    }
}

fn union(a: &Value, b: &Value) -> Map<String, Value> {
    let mut out = entries(a);
    out.extend(entries(b));
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const FLAGS: [(bool, bool); 4] = [(false, false), (false, true), (true, false), (true, true)];

    #[test]
    fn empty_side_is_identity_for_every_flag_combination() {
        let a = json!({"a": [1, 2], "b": {"x": 1}});
        for (deep, concat) in FLAGS {
            assert_eq!(merge(&a, &json!({}), deep, concat), a);
            assert_eq!(merge(&json!({}), &a, deep, concat), a);
            assert_eq!(merge(&a, &json!([]), deep, concat), a);
        }
    }

    #[test]
    fn flat_arrays_concatenate_regardless_of_flags() {
        for (deep, concat) in FLAGS {
            assert_eq!(
                merge(&json!([1, 2]), &json!([3, 4]), deep, concat),
                json!([1, 2, 3, 4])
            );
        }
    }

    #[test]
    fn flat_maps_union_with_right_side_winning() {
        let merged = merge(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}), false, false);
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn deep_merge_with_concat_on_nested_maps() {
        let a = json!({"a": [1, 2], "b": {"x": 1, "y": [2, 3]}});
        let b = json!({"a": [3, 4], "b": {"y": [4, 5], "z": 6}});
        assert_eq!(
            merge(&a, &b, true, true),
            json!({"a": [1, 2, 3, 4], "b": {"x": 1, "y": [2, 3, 4, 5], "z": 6}})
        );
    }

    #[test]
    fn shallow_merge_without_concat_replaces_lists() {
        assert_eq!(
            merge(&json!({"a": [1, 2]}), &json!({"a": [3, 4]}), false, false),
            json!({"a": [3, 4]})
        );
    }

    #[test]
    fn shallow_merge_of_nested_maps_is_one_level_only() {
        let a = json!({"cfg": {"keep": 1, "inner": {"p": 1, "q": 2}}});
        let b = json!({"cfg": {"inner": {"q": 3}}});
        assert_eq!(
            merge(&a, &b, false, false),
            json!({"cfg": {"keep": 1, "inner": {"q": 3}}})
        );
        assert_eq!(
            merge(&a, &b, true, false),
            json!({"cfg": {"keep": 1, "inner": {"p": 1, "q": 3}}})
        );
    }

    #[test]
    fn scalar_against_container_lets_right_side_win() {
        let a = json!({"pending": [1, 2], "cursor": {"page": 1}});
        let b = json!({"pending": "reset", "cursor": 7});
        assert_eq!(
            merge(&a, &b, true, true),
            json!({"pending": "reset", "cursor": 7})
        );
        assert_eq!(merge(&json!(1), &json!({"a": 1}), true, true), json!({"a": 1}));
    }

    #[test]
    fn index_keyed_objects_are_list_like() {
        let a = json!({"rows": {"0": "a", "1": "b"}, "n": {"k": 1}});
        let b = json!({"rows": ["c"], "n": {"k": 2}});
        assert_eq!(
            merge(&a, &b, true, true),
            json!({"rows": ["a", "b", "c"], "n": {"k": 2}})
        );
    }

    #[test]
    fn nested_arrays_resolve_positionally_at_top_level() {
        let a = json!([[1], {"a": 1}]);
        let b = json!([[2], {"b": 2}, 9]);
        assert_eq!(
            merge(&a, &b, true, true),
            json!([[1, 2], {"a": 1, "b": 2}, 9])
        );
    }
}
