//! Image selection: keep a cluster-side patch upgrade, revert anything else to the pinned image.

use serde::{Deserialize, Serialize};

/// `repository:major.minor.patch`, split the way the policy compares it.
/// Missing components are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageRef {
    pub repository: String,
    pub major: String,
    pub minor: String,
    pub patch: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        // Digest is not part of the comparison.
        let name = reference.split('@').next().unwrap_or(reference);
        // A ':' before the last '/' belongs to a registry port.
        let tail_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[tail_start..].rfind(':') {
            Some(i) => (&name[..tail_start + i], &name[tail_start + i + 1..]),
            None => (name, ""),
        };
        let mut parts = tag.splitn(3, '.');
        Self {
            repository: repository.to_string(),
            major: parts.next().unwrap_or("").to_string(),
            minor: parts.next().unwrap_or("").to_string(),
            patch: parts.next().unwrap_or("").to_string(),
        }
    }

    pub fn patch_number(&self) -> Option<u64> { self.patch.parse().ok() }

    fn same_line(&self, other: &ImageRef) -> bool {
        self.repository == other.repository && self.major == other.major && self.minor == other.minor
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePolicy {
    /// Image the operator ships with.
    pub pinned: String,
    /// Spec-level override; wins unconditionally when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_image: Option<String>,
}

impl ImagePolicy {
    pub fn pinned(image: impl Into<String>) -> Self { Self { pinned: image.into(), override_image: None } }

    pub fn with_override(mut self, image: Option<String>) -> Self {
        self.override_image = image.filter(|s| !s.is_empty());
        self
    }

    /// Image the workload should run given what is currently observed.
    pub fn select(&self, observed: Option<&str>) -> String {
        if let Some(o) = self.override_image.as_deref().filter(|s| !s.is_empty()) {
            return o.to_string();
        }
        let Some(observed) = observed else { return self.pinned.clone() };
        let current = ImageRef::parse(observed);
        let pinned = ImageRef::parse(&self.pinned);
        match (current.patch_number(), pinned.patch_number()) {
            (Some(cur), Some(pin)) if current.same_line(&pinned) && cur > pin => observed.to_string(),
            _ => self.pinned.clone(),
        }
    }
}
