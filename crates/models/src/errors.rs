/// ErrorKind is the closed taxonomy of job failure reasons.
/// Kinds cross the child-process boundary as the `kind` field of the
/// error document written to the child's final stderr line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// The named process is not registered. Surfaces as HTTP 404.
    UnknownProcess,
    /// The input document violates the process descriptor. Surfaces as HTTP 400.
    InvalidInput,
    /// A file the stage requires does not exist yet.
    Precondition,
    /// Another job holds the submodel directory lock. Retriable.
    ReachBusy,
    /// The reach is eclipsed; not an error, recorded as a skip reason.
    Eclipsed,
    /// The external solver exited non-zero.
    SolverCrash,
    /// The DEM does not cover the reach footprint.
    TerrainOutOfBounds,
    /// The source model's network contains a divergence.
    DivergingNetwork,
    /// The primary plan's flow file is not steady-state.
    UnsteadyFlowUnsupported,
    /// No plan without encroachments exists.
    NoValidPlan,
    /// The directory is not a valid source-model bundle.
    NotASourceModel,
    /// The job was cancelled by the operator.
    Dismissed,
    /// Unclassified; always carries a traceback.
    Internal,
}

impl ErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::ReachBusy)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// JobError is the error document recorded against a failed or dismissed job.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Synthesize a generic Internal error from an unparseable child tail.
    pub fn internal(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            kind: ErrorKind::Internal,
            traceback: Some(detail.clone()),
            detail,
        }
    }
}
