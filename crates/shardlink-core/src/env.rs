//! Environment variable handling.

use std::env;

/// Shared secret for the socket handshake.
pub const PASSWORD_VAR: &str = "SHARDLINK_PASSWORD";

/// Socket server port.
pub const PORT_VAR: &str = "SHARDLINK_PORT";

/// Message bus URL.
pub const BUS_URL_VAR: &str = "SHARDLINK_BUS_URL";

/// Fixed routing key for this worker instance.
pub const ROUTING_KEY_VAR: &str = "SHARDLINK_ROUTING_KEY";

/// Disable the message bus transport.
pub const NO_BUS_VAR: &str = "SHARDLINK_NO_BUS";

/// Get an environment variable, returning None if not set or empty.
pub fn get_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Get an environment variable as a boolean.
pub fn get_bool(name: &str) -> bool {
    get_var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Get an environment variable as a u16 (e.g., for ports).
pub fn get_u16(name: &str) -> Option<u16> {
    get_var(name).and_then(|v| v.parse().ok())
}
