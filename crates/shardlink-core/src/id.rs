//! ID generation utilities.

use uuid::Uuid;

/// Length of the random suffix appended to instance routing keys.
const ROUTING_SUFFIX_BYTES: usize = 4;

/// Generate a new UUID v4.
pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a short random ID (8 hex characters).
pub fn short_id() -> String {
    let bytes: [u8; ROUTING_SUFFIX_BYTES] = rand::random();
    hex::encode(bytes)
}

/// Build a worker routing key from a prefix and a random suffix.
///
/// The prefix is normalized so the key is safe to use as a bus routing key
/// and as part of a queue name: `Worker A` becomes `worker_a-1f2e3d4c`.
pub fn routing_key(prefix: &str) -> String {
    let prefix = normalize(prefix);
    let prefix = if prefix.is_empty() { "worker".to_string() } else { prefix };
    format!("{}-{}", prefix, short_id())
}

/// Normalize an identifier.
///
/// - Converts to lowercase
/// - Replaces spaces and dashes with underscores
/// - Removes non-alphanumeric characters (except underscores)
pub fn normalize(id: &str) -> String {
    id.to_lowercase()
        .replace([' ', '-'], "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Check if a routing key is usable as a bus key (non-empty, no whitespace or dots).
pub fn is_valid_routing_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid() {
        let id = uuid();
        assert_eq!(id.len(), 36);
        assert!(id.contains('-'));
    }

    #[test]
    fn test_short_id() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_routing_key_is_prefixed_and_random() {
        let a = routing_key("Worker A");
        let b = routing_key("Worker A");
        assert!(a.starts_with("worker_a-"));
        assert_ne!(a, b);
        assert!(is_valid_routing_key(&a));
    }

    #[test]
    fn test_routing_key_empty_prefix() {
        let key = routing_key("!!!");
        assert!(key.starts_with("worker-"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("My Worker"), "my_worker");
        assert_eq!(normalize("test-worker"), "test_worker");
        assert_eq!(normalize("special!@#chars"), "specialchars");
    }

    #[test]
    fn test_is_valid_routing_key() {
        assert!(is_valid_routing_key("worker-1a2b"));
        assert!(!is_valid_routing_key(""));
        assert!(!is_valid_routing_key("has.dot"));
        assert!(!is_valid_routing_key("has space"));
    }
}
