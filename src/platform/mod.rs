mod detect;
mod matcher;
mod profile;
mod version;

pub use detect::{keywords_in, Conflict, Detector, Inference, Manifests, Signal, TaskMetadata};
pub use matcher::{
    satisfies, select_template, unsatisfied, PlatformCatalog, PlatformSpec, WorkerTemplate,
};
pub use profile::{CapabilityProfile, Requirement, RequirementSet};
pub use version::{Version, VersionError, VersionReq};
