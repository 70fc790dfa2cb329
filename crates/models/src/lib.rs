mod conflation;
mod errors;
mod id;
mod jobs;
mod terrain;

pub use conflation::{
    Coverage, ConflationDocument, ConflationMetadata, ConflationMetrics, Lengths, ReachConflation,
    XsOffsets, XsRef,
};
pub use errors::{ErrorKind, JobError};
pub use id::JobId;
pub use jobs::{Job, JobStatus, LogStream};
pub use terrain::{
    ElevationAgreement, Residuals, ResidualSummary, TerrainAgreement, XsAgreement, XsSummary,
};

/// Result document of a stage that short-circuited instead of running,
/// e.g. a submodel extraction against an eclipsed reach.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SkippedResult {
    pub status: String,
    pub reason: String,
}

impl SkippedResult {
    pub fn eclipsed() -> Self {
        Self {
            status: "skipped".to_string(),
            reason: "eclipsed".to_string(),
        }
    }
}
