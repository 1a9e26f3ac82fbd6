//! Core type definitions for vaultkv.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// The closed set of logical operations a vault dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Read a value.
    Get,
    /// Write a value (and optional metadata).
    Set,
    /// Delete a key.
    Remove,
    /// Delete every key.
    Clear,
    /// Enumerate keys.
    Keys,
    /// Count keys.
    Length,
    /// Read the metadata stored beside a value.
    GetMeta,
}

impl Operation {
    /// Returns true if the operation targets a single key.
    #[must_use]
    pub const fn is_key_scoped(self) -> bool {
        matches!(self, Self::Get | Self::Set | Self::Remove | Self::GetMeta)
    }

    /// Returns true if the operation changes stored state.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Set | Self::Remove | Self::Clear)
    }

    /// Returns the operation tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Remove => "remove",
            Self::Clear => "clear",
            Self::Keys => "keys",
            Self::Length => "length",
            Self::GetMeta => "getMeta",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write timestamp used for last-writer-wins comparisons.
///
/// Versions are Unix milliseconds. They are non-decreasing within one vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// Creates a new version.
    #[must_use]
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the raw millisecond value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{}", self.0)
    }
}

/// Issues non-decreasing [`Version`]s from the wall clock.
///
/// If the wall clock steps backwards the clock keeps returning the last
/// issued value until real time catches up.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    /// Creates a new clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next version.
    pub fn tick(&self) -> Version {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.observe(now)
    }

    /// Returns the last issued version.
    pub fn current(&self) -> Version {
        Version(self.last.load(Ordering::SeqCst))
    }

    fn observe(&self, now: u64) -> Version {
        let prev = self.last.fetch_max(now, Ordering::SeqCst);
        Version(prev.max(now))
    }
}
