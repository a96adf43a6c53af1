//! Cache records and lookup outcomes

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Storage tier, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Memory,
    Remote,
    Disk,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Remote => "remote",
            Self::Disk => "disk",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value, or a tombstone when `value` is `None`
///
/// Timestamps are Unix milliseconds; `expires_at == 0` means the record never expires.
/// The serialized form is shared by the remote and disk tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub key: String,
    pub value: Option<Value>,
    pub expires_at: i64,
    pub created_at: i64,
}

impl CacheRecord {
    /// New record living for `ttl`, or forever when `ttl` is `None`
    pub fn new(key: impl Into<String>, value: Option<Value>, ttl: Option<Duration>) -> Self {
        let now = Utc::now().timestamp_millis();
        let expires_at = ttl.map_or(0, |ttl| now + (ttl.as_millis() as i64).max(1));
        Self {
            key: key.into(),
            value,
            expires_at,
            created_at: now,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn never_expires(&self) -> bool {
        self.expires_at == 0
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        !self.never_expires() && self.expires_at <= now_ms
    }

    /// Time left before expiry; `None` for records that never expire
    pub fn remaining_ttl(&self) -> Option<Duration> {
        if self.never_expires() {
            return None;
        }
        let left = self.expires_at - Utc::now().timestamp_millis();
        Some(Duration::from_millis(left.max(0) as u64))
    }
}

/// Result of reading through the tiers
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit { value: Value, tier: CacheTier },
    /// Known-absent marker
    Tombstone { tier: CacheTier },
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        !matches!(self, Self::Miss)
    }

    /// The cached value; `None` for tombstones and misses
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Hit { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn tier(&self) -> Option<CacheTier> {
        match self {
            Self::Hit { tier, .. } | Self::Tombstone { tier } => Some(*tier),
            Self::Miss => None,
        }
    }
}
