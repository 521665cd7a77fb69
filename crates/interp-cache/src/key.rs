use std::fmt;

use serde::{Deserialize, Serialize};
use stepwright_core_types::PageFingerprint;

use crate::hash::{hash_bytes, hash_fields};

/// Content address of one interpretation: a pure function of the step
/// description and the page fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(description: &str, fingerprint: &PageFingerprint) -> Self {
        let description = normalize_description(description);
        Self(hash_fields("ik", &[description.as_str(), fingerprint.as_str()]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Digest persisted next to each entry instead of the raw step text.
pub fn description_hash(description: &str) -> String {
    hash_bytes("sd", normalize_description(description).as_bytes())
}

/// Collapse runs of whitespace; step text is otherwise taken verbatim.
pub fn normalize_description(description: &str) -> String {
    description.split_whitespace().collect::<Vec<_>>().join(" ")
}
