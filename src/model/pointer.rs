//! JSON pointer operations over dynamic values (RFC 6901).
//!
//! Lookup delegates to `serde_json`; `set` creates missing intermediate
//! objects and overwrites scalar intermediates with objects, `remove`
//! deletes the addressed node. Used by property-level commands and by the
//! field-selector projection.

use serde_json::Value;

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn segments(pointer: &str) -> Option<Vec<String>> {
    if pointer.is_empty() {
        return Some(Vec::new());
    }
    if !pointer.starts_with('/') {
        return None;
    }
    Some(pointer[1..].split('/').map(unescape).collect())
}

/// Look up the value at `pointer`, if present.
pub fn get<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    value.pointer(pointer)
}

/// Set `new_value` at `pointer`, creating intermediate objects as needed.
///
/// A scalar found on the way down is replaced by an object so the
/// remaining pointer segments can be built. Array elements are addressed
/// by in-bounds indices; an index equal to the length appends.
///
/// Returns `false` only for a syntactically invalid pointer (missing
/// leading `/`) or an out-of-bounds array index.
pub fn set(root: &mut Value, pointer: &str, new_value: Value) -> bool {
    let Some(segments) = segments(pointer) else {
        return false;
    };
    if segments.is_empty() {
        *root = new_value;
        return true;
    }

    let mut node = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;

        if let Value::Array(items) = node {
            let Ok(index) = segment.parse::<usize>() else {
                return false;
            };
            if index > items.len() {
                return false;
            }
            if index == items.len() {
                items.push(if last {
                    new_value.clone()
                } else {
                    Value::Object(Default::default())
                });
                if last {
                    return true;
                }
            } else if last {
                items[index] = new_value;
                return true;
            }
            node = &mut items[index];
            continue;
        }

        if !node.is_object() {
            *node = Value::Object(Default::default());
        }
        let map = node.as_object_mut().expect("node was just made an object");
        if last {
            map.insert(segment.clone(), new_value);
            return true;
        }
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    true
}

/// Remove the node at `pointer`. Returns `false` if it does not exist.
pub fn remove(root: &mut Value, pointer: &str) -> bool {
    let Some(segments) = segments(pointer) else {
        return false;
    };
    let Some((leaf, parents)) = segments.split_last() else {
        return false;
    };

    let mut node = root;
    for segment in parents {
        node = match node {
            Value::Object(map) => match map.get_mut(segment.as_str()) {
                Some(child) => child,
                None => return false,
            },
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => &mut items[index],
                _ => return false,
            },
            _ => return false,
        };
    }

    match node {
        Value::Object(map) => map.remove(leaf.as_str()).is_some(),
        Value::Array(items) => match leaf.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_objects() {
        let mut value = json!({});
        assert!(set(&mut value, "/a/b/c", json!(1)));
        assert_eq!(value, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_overwrites_scalar_intermediates() {
        let mut value = json!({"a": 5});
        assert!(set(&mut value, "/a/b", json!("x")));
        assert_eq!(value, json!({"a": {"b": "x"}}));
    }

    #[test]
    fn set_replaces_existing_leaf() {
        let mut value = json!({"a": {"b": 1}});
        assert!(set(&mut value, "/a/b", json!([1, 2])));
        assert_eq!(value, json!({"a": {"b": [1, 2]}}));
    }

    #[test]
    fn set_into_array_by_index() {
        let mut value = json!({"a": [1, 2]});
        assert!(set(&mut value, "/a/1", json!(9)));
        assert_eq!(value, json!({"a": [1, 9]}));
        assert!(set(&mut value, "/a/2", json!(3)));
        assert_eq!(value, json!({"a": [1, 9, 3]}));
        assert!(!set(&mut value, "/a/9", json!(0)));
    }

    #[test]
    fn set_with_escaped_segments() {
        let mut value = json!({});
        assert!(set(&mut value, "/a~1b/c~0d", json!(true)));
        assert_eq!(value, json!({"a/b": {"c~d": true}}));
    }

    #[test]
    fn remove_leaf_and_missing() {
        let mut value = json!({"a": {"b": 1, "c": 2}});
        assert!(remove(&mut value, "/a/b"));
        assert_eq!(value, json!({"a": {"c": 2}}));
        assert!(!remove(&mut value, "/a/b"));
        assert!(!remove(&mut value, "/x/y"));
    }

    #[test]
    fn remove_array_element() {
        let mut value = json!({"a": [1, 2, 3]});
        assert!(remove(&mut value, "/a/1"));
        assert_eq!(value, json!({"a": [1, 3]}));
        assert!(!remove(&mut value, "/a/7"));
    }
}
