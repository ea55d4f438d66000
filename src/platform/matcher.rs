use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::profile::{CapabilityProfile, Requirement, RequirementSet};
use super::version::Version;

/// True iff every requirement names a capability the profile provides at a
/// version inside the requested range. Extra capabilities are ignored.
pub fn satisfies(profile: &CapabilityProfile, requirements: &RequirementSet) -> bool {
    requirements.iter().all(|r| requirement_met(profile, r))
}

/// The requirements `profile` does not meet.
pub fn unsatisfied<'a>(
    profile: &CapabilityProfile,
    requirements: &'a RequirementSet,
) -> Vec<&'a Requirement> {
    requirements
        .iter()
        .filter(|r| !requirement_met(profile, r))
        .collect()
}

fn requirement_met(profile: &CapabilityProfile, requirement: &Requirement) -> bool {
    profile
        .get(&requirement.capability)
        .is_some_and(|v| requirement.range.matches(v))
}

/// A pre-provisioned worker shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub name: String,
    /// Container image override; the sandbox default image is used when unset.
    #[serde(default)]
    pub image: Option<String>,
    pub capabilities: CapabilityProfile,
}

/// First template, in configured order, whose profile satisfies the
/// requirements.
pub fn select_template<'a>(
    templates: &'a [WorkerTemplate],
    requirements: &RequirementSet,
) -> Option<&'a WorkerTemplate> {
    templates
        .iter()
        .find(|t| satisfies(&t.capabilities, requirements))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub default_version: Version,
    #[serde(default)]
    pub supported_versions: Vec<Version>,
}

impl PlatformSpec {
    fn candidates(&self) -> impl Iterator<Item = &Version> {
        self.supported_versions
            .iter()
            .chain(std::iter::once(&self.default_version))
    }
}

/// Capabilities the provisioner can install on demand, with the versions
/// available for each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformCatalog {
    platforms: BTreeMap<String, PlatformSpec>,
}

impl Default for PlatformCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        let builtin: [(&str, &str, &[&str]); 8] = [
            ("nodejs", "18.16.0", &["16.20.2", "18.16.0", "20.11.1"]),
            ("python", "3.11", &["3.9", "3.10", "3.11", "3.12"]),
            ("dotnet", "8.0", &["6.0", "7.0", "8.0"]),
            ("java", "17", &["11", "17", "21"]),
            ("golang", "1.21", &["1.20", "1.21", "1.22"]),
            ("rust", "1.75", &["1.74", "1.75", "1.76"]),
            ("php", "8.2", &["8.1", "8.2", "8.3"]),
            ("ruby", "3.2", &["3.1", "3.2", "3.3"]),
        ];
        for (name, default, supported) in builtin {
            let parse = |s: &str| s.parse::<Version>().ok();
            if let Some(default_version) = parse(default) {
                catalog.insert(
                    name,
                    PlatformSpec {
                        default_version,
                        supported_versions: supported.iter().filter_map(|s| parse(*s)).collect(),
                    },
                );
            }
        }
        catalog
    }
}

impl PlatformCatalog {
    pub fn empty() -> Self {
        Self {
            platforms: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: PlatformSpec) {
        self.platforms.insert(name.into(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&PlatformSpec> {
        self.platforms.get(name)
    }

    pub fn default_version(&self, name: &str) -> Option<&Version> {
        self.platforms.get(name).map(|p| &p.default_version)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.platforms.keys()
    }

    /// Smallest profile covering `requirements`: only the requested
    /// capabilities, each at the newest available version inside its range.
    ///
    /// On failure returns the requirements no catalog version can meet.
    pub fn minimal_profile_for<'a>(
        &self,
        requirements: &'a RequirementSet,
    ) -> Result<CapabilityProfile, Vec<&'a Requirement>> {
        let mut profile = CapabilityProfile::new();
        let mut missing = Vec::new();

        for requirement in requirements {
            let chosen = self.platforms.get(&requirement.capability).and_then(|spec| {
                spec.candidates()
                    .filter(|v| requirement.range.matches(v))
                    .max()
                    .cloned()
            });
            match chosen {
                Some(version) => profile.insert(requirement.capability.clone(), version),
                None => missing.push(requirement),
            }
        }

        if missing.is_empty() {
            Ok(profile)
        } else {
            Err(missing)
        }
    }

    pub fn can_provision(&self, requirements: &RequirementSet) -> bool {
        self.minimal_profile_for(requirements).is_ok()
    }
}
