//! JSON merge patch (RFC 7396)

use serde_json::{Map, Value};

/// Apply `patch` to `target` in place.
///
/// Object members in the patch overwrite those in the target, `null` members
/// delete, and members the patch doesn't mention are left alone. Anything
/// that isn't an object replaces the target wholesale, arrays included.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_members) = patch else {
        *target = patch.to_owned();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(members) = target {
        for (key, value) in patch_members {
            if value.is_null() {
                members.remove(key);
            } else {
                merge_patch(members.entry(key.to_owned()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Paths that a patch sets but that don't survive a typed round trip of the
/// result. These are fields the rule kind doesn't have, which would otherwise
/// be silently dropped.
pub(crate) fn unknown_paths(patch: &Value, typed: &Value) -> Vec<String> {
    let mut res = Vec::new();
    collect_unknown_paths(patch, typed, "", &mut res);
    res
}

fn collect_unknown_paths(patch: &Value, typed: &Value, prefix: &str, res: &mut Vec<String>) {
    match patch {
        Value::Object(patch_members) => {
            for (key, value) in patch_members {
                if value.is_null() {
                    continue;
                }
                let path = if prefix.is_empty() {
                    key.to_owned()
                } else {
                    format!("{prefix}.{key}")
                };
                match typed.get(key) {
                    None => res.push(path),
                    Some(inner) => collect_unknown_paths(value, inner, &path, res),
                }
            }
        }
        // Arrays are replaced wholesale, so element i of the patch became
        // element i of the result
        Value::Array(items) => {
            let Value::Array(typed_items) = typed else {
                return;
            };
            for (i, (item, typed_item)) in items.iter().zip(typed_items).enumerate() {
                collect_unknown_paths(item, typed_item, &format!("{prefix}[{i}]"), res);
            }
        }
        _ => (),
    }
}
