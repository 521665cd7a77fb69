//! Page fingerprints derived from the interactive element set.
//!
//! The digest ignores element order, attribute order and incidental
//! whitespace so that re-rendering an unchanged page yields the same value,
//! while any added, removed or relabelled control changes it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwright_core_types::PageFingerprint;

use crate::hash::hash_fields;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Accessible name or visible label.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl InteractiveElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    fn canonical(&self) -> String {
        let attrs: BTreeMap<String, String> = self
            .attrs
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), collapse(v)))
            .collect();
        let attrs = attrs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "{}|{}|{}|{}",
            self.tag.trim().to_ascii_lowercase(),
            self.role.as_deref().map(collapse).unwrap_or_default(),
            self.name.as_deref().map(collapse).unwrap_or_default(),
            attrs
        )
    }
}

fn collapse(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn digest_elements(elements: &[InteractiveElement]) -> PageFingerprint {
    let mut lines: Vec<String> = elements.iter().map(InteractiveElement::canonical).collect();
    lines.sort_unstable();
    PageFingerprint(hash_fields("fp", &lines))
}
