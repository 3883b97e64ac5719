//! Typed ID definitions.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Runners and Passes
// =============================================================================

define_id!(InstanceId, "runner");
define_id!(PassId, "pass");

// =============================================================================
// Job Dedup Keys
// =============================================================================

/// Upper bound on dedup key length; keys are stored in VM tags.
pub const MAX_DEDUP_KEY_LEN: usize = 128;

/// Identifier of a logical job request.
///
/// At most one runner is ever created per key, no matter how many times the
/// queue delivers the request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// Validates and wraps a dedup key.
    pub fn new(key: impl Into<String>) -> Result<Self, IdError> {
        let key = key.into();
        if key.is_empty() {
            return Err(IdError::Empty);
        }
        if key.len() > MAX_DEDUP_KEY_LEN {
            return Err(IdError::InvalidFormat {
                message: format!("dedup key longer than {MAX_DEDUP_KEY_LEN} bytes"),
            });
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(IdError::InvalidFormat {
                message: "dedup key contains whitespace or control characters".to_string(),
            });
        }
        Ok(Self(key))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DedupKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for DedupKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for DedupKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DedupKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Producers commonly send numeric job ids.
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        let raw = match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s,
            Raw::Num(n) => n.to_string(),
        };
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
