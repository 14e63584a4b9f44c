//! Capability and version types.
//!
//! A capability is a named, versioned feature this agent claims to support.
//! Capabilities are unique by name within an agent card; negotiation grants a
//! subset of them to each session.

use crate::error::ParleyError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A named, versioned feature advertised in the agent card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Unique capability name (e.g. `code_execution`).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Semantic version string (`MAJOR.MINOR.PATCH`).
    pub version: String,
    /// Disabled capabilities are never discovered or granted.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Capability {
    /// Create an enabled capability.
    pub fn new(name: &str, description: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            version: version.to_string(),
            enabled: true,
        }
    }

    /// Check the name is non-empty and the version parses.
    pub fn validate(&self) -> Result<Version, ParleyError> {
        if self.name.trim().is_empty() {
            return Err(ParleyError::InvalidCapability(
                "capability name must not be empty".to_string(),
            ));
        }
        Version::parse(&self.version).map_err(|e| {
            ParleyError::InvalidCapability(format!("capability '{}': {e}", self.name))
        })
    }
}

/// A parsed `MAJOR.MINOR.PATCH` version.
///
/// A pre-release suffix (`1.2.0-beta`) is accepted and kept for display but
/// does not participate in ordering. Missing minor/patch components default
/// to zero, so `"1"` and `"1.0"` are both valid.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse a version string.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("version must not be empty".to_string());
        }
        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(format!("invalid version '{s}': empty pre-release")),
            None => (s, None),
        };
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return Err(format!("invalid version '{s}': too many components"));
        }
        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(parts.iter()) {
            *slot = part
                .parse::<u64>()
                .map_err(|_| format!("invalid version '{s}': '{part}' is not a number"))?;
        }
        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
            pre,
        })
    }

    /// Whether a peer asking for `requested` can be served by `self`.
    ///
    /// Same major version, and at least the requested minor.
    pub fn satisfies(&self, requested: &Version) -> bool {
        self.major == requested.major && self.minor >= requested.minor
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}
