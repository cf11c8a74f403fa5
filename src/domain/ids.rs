use uuid::Uuid;

/// Normalize a raw entity id to canonical UUID text.
///
/// Malformed upstream data occasionally delivers entity ids as stringified
/// arrays like `"[uuid-a, uuid-b]"`. Those are reduced to their first
/// well-formed UUID. Returns `None` when no UUID can be recovered; callers
/// treat that as a validation failure.
pub fn normalize_entity_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();

    if let Ok(id) = Uuid::parse_str(trimmed) {
        return Some(id.to_string());
    }

    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        // Prefer a real JSON parse, fall back to naive splitting for
        // unquoted pseudo-arrays like "[a, b]".
        if let Ok(serde_json::Value::Array(items)) =
            serde_json::from_str::<serde_json::Value>(trimmed)
        {
            for item in &items {
                if let Some(s) = item.as_str() {
                    if let Ok(id) = Uuid::parse_str(s.trim()) {
                        return Some(id.to_string());
                    }
                }
            }
        }

        let inner = &trimmed[1..trimmed.len() - 1];
        for part in inner.split(',') {
            let candidate = part.trim().trim_matches('"').trim_matches('\'');
            if let Ok(id) = Uuid::parse_str(candidate) {
                return Some(id.to_string());
            }
        }
    }

    None
}

/// True when `raw` already is (or normalizes to) a valid UUID.
pub fn is_valid_entity_id(raw: &str) -> bool {
    normalize_entity_id(raw).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "6a64cb51-2c17-4bb9-a216-6a6a9c0d5d25";
    const B: &str = "f8a6b0b8-98a9-4d67-9a6e-0a8a3c4f2b11";

    #[test]
    fn passes_through_canonical_uuid() {
        assert_eq!(normalize_entity_id(A), Some(A.to_string()));
    }

    #[test]
    fn reduces_json_array_to_first_uuid() {
        let raw = format!("[\"{}\", \"{}\"]", A, B);
        assert_eq!(normalize_entity_id(&raw), Some(A.to_string()));
    }

    #[test]
    fn reduces_unquoted_array_to_first_uuid() {
        let raw = format!("[{}, {}]", A, B);
        assert_eq!(normalize_entity_id(&raw), Some(A.to_string()));
    }

    #[test]
    fn skips_malformed_leading_entries() {
        let raw = format!("[\"not-a-uuid\", \"{}\"]", B);
        assert_eq!(normalize_entity_id(&raw), Some(B.to_string()));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize_entity_id("not-a-uuid"), None);
        assert_eq!(normalize_entity_id("[]"), None);
        assert_eq!(normalize_entity_id("[nope]"), None);
    }
}
