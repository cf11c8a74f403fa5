use serde_json::Value;

/// Deep-merge `patch` into `current`.
///
/// Objects merge recursively; scalars and arrays replace the current value,
/// including the case where the current value is a scalar and the patch is
/// an object (the object wins).
pub fn deep_merge(current: &Value, patch: &Value) -> Value {
    match (current, patch) {
        (Value::Object(cur), Value::Object(pat)) => {
            let mut out = cur.clone();
            for (key, patch_value) in pat {
                let merged = match out.get(key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => patch_value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, replacement) => replacement.clone(),
    }
}
