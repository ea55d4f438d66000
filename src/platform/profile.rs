use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::version::{Version, VersionError, VersionReq};

/// Concrete capabilities an environment provides: capability name to version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityProfile {
    capabilities: BTreeMap<String, Version>,
}

impl CapabilityProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, capability: impl Into<String>, version: Version) -> Self {
        self.insert(capability, version);
        self
    }

    pub fn insert(&mut self, capability: impl Into<String>, version: Version) {
        self.capabilities.insert(capability.into(), version);
    }

    pub fn get(&self, capability: &str) -> Option<&Version> {
        self.capabilities.get(capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Version)> {
        self.capabilities.iter()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Parses `name:version` pairs separated by commas, the format used for
    /// the worker's `ENABLED_PLATFORMS` variable and the CLI.
    pub fn parse_pairs(text: &str) -> Result<Self, VersionError> {
        let mut profile = Self::new();
        for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, version) = pair
                .split_once([':', '@', '='])
                .ok_or_else(|| VersionError::InvalidVersion(pair.to_string()))?;
            profile.insert(name.trim(), version.parse()?);
        }
        Ok(profile)
    }
}

impl fmt::Display for CapabilityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, version) in &self.capabilities {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", name, version)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub capability: String,
    pub range: VersionReq,
}

impl Requirement {
    pub fn new(capability: impl Into<String>, range: VersionReq) -> Self {
        Self {
            capability: capability.into(),
            range,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.capability, self.range)
    }
}

/// What a task needs. At most one requirement per capability; insertion
/// order is kept so the first-detected capability is reported first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementSet {
    requirements: Vec<Requirement>,
}

impl RequirementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style add; panics on an unparsable range, for literals in
    /// tests and defaults.
    pub fn require(mut self, capability: &str, range: &str) -> Self {
        let range = range
            .parse()
            .unwrap_or_else(|e| panic!("invalid range literal {range}: {e}"));
        self.insert(Requirement::new(capability, range));
        self
    }

    /// Adds or replaces the requirement for the requirement's capability.
    pub fn insert(&mut self, requirement: Requirement) {
        match self
            .requirements
            .iter_mut()
            .find(|r| r.capability == requirement.capability)
        {
            Some(existing) => *existing = requirement,
            None => self.requirements.push(requirement),
        }
    }

    pub fn get(&self, capability: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.capability == capability)
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.get(capability).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Requirement> {
        self.requirements.iter()
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Requirements equivalent to running on exactly `profile`.
    pub fn from_profile(profile: &CapabilityProfile) -> Self {
        let mut set = Self::new();
        for (name, version) in profile.iter() {
            set.insert(Requirement::new(name.clone(), VersionReq::exact(version)));
        }
        set
    }
}

impl<'a> IntoIterator for &'a RequirementSet {
    type Item = &'a Requirement;
    type IntoIter = std::slice::Iter<'a, Requirement>;

    fn into_iter(self) -> Self::IntoIter {
        self.requirements.iter()
    }
}

impl fmt::Display for RequirementSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requirements.is_empty() {
            return f.write_str("(none)");
        }
        let rendered: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&rendered.join(", "))
    }
}
