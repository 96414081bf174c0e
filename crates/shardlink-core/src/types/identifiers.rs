//! Strongly-typed identifiers.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Identifier of one upstream gateway shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Get the raw shard number.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Snowflake identifier of an upstream guild.
///
/// Coordinators send snowflakes either as JSON numbers or as decimal strings;
/// both decode. Serialization always emits a string so 64-bit values survive
/// JavaScript clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuildId(pub u64);

impl GuildId {
    /// Get the raw snowflake.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Shard owning this guild for a gateway split into `total_shards` shards.
    pub fn shard(self, total_shards: u32) -> ShardId {
        let total = u64::from(total_shards.max(1));
        ShardId(((self.0 >> 22) % total) as u32)
    }
}

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GuildId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Serialize for GuildId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for GuildId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => s.parse().map(Self).map_err(serde::de::Error::custom),
        }
    }
}

/// Identifier of a resumable socket session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a fresh random session id.
    pub fn generate() -> Self {
        Self(crate::id::uuid())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guild_id_accepts_number_and_string() {
        let a: GuildId = serde_json::from_str("81384788765712384").unwrap();
        let b: GuildId = serde_json::from_str("\"81384788765712384\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"81384788765712384\"");
    }

    #[test]
    fn test_guild_id_rejects_garbage() {
        assert!(serde_json::from_str::<GuildId>("\"not-a-number\"").is_err());
    }

    #[test]
    fn test_guild_shard_formula() {
        // 81384788765712384 >> 22 = 19403645698
        let guild = GuildId(81384788765712384);
        assert_eq!(guild.shard(1), ShardId(0));
        assert_eq!(guild.shard(10), ShardId(8));
        // total of zero is treated as a single shard
        assert_eq!(guild.shard(0), ShardId(0));
    }

    #[test]
    fn test_session_id_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
