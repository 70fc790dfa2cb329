//! The hydraulic workflow: nine pipeline stages that repurpose a source
//! river model into reach-scoped submodels, terrain, depth grids, and
//! rating curves, plus the geometry, codecs, and adapter seams they share.
//! Stages are synchronous end-to-end; they run inside a worker child
//! process and communicate only through the on-disk reach layout.

use models::{ErrorKind, JobError};

pub mod geometry;
pub mod gpkg;
pub mod layout;
pub mod model;
pub mod raster;
pub mod solver;
pub mod sources;
pub mod stages;

/// Error of a pipeline stage. Variants mirror the job error taxonomy so a
/// failure crosses the process boundary with its kind intact.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("not a source model: {0}")]
    NotASourceModel(String),
    #[error("no valid plan: {0}")]
    NoValidPlan(String),
    #[error("unsteady flow is unsupported: {0}")]
    UnsteadyFlowUnsupported(String),
    #[error("diverging network: {0}")]
    DivergingNetwork(String),
    #[error("terrain out of bounds: {0}")]
    TerrainOutOfBounds(String),
    #[error("solver crash: {0}")]
    SolverCrash(String),
    #[error("precondition: {0}")]
    Precondition(String),
    #[error("reach busy: {0}")]
    ReachBusy(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::NotASourceModel(_) => ErrorKind::NotASourceModel,
            StageError::NoValidPlan(_) => ErrorKind::NoValidPlan,
            StageError::UnsteadyFlowUnsupported(_) => ErrorKind::UnsteadyFlowUnsupported,
            StageError::DivergingNetwork(_) => ErrorKind::DivergingNetwork,
            StageError::TerrainOutOfBounds(_) => ErrorKind::TerrainOutOfBounds,
            StageError::SolverCrash(_) => ErrorKind::SolverCrash,
            StageError::Precondition(_) => ErrorKind::Precondition,
            StageError::ReachBusy(_) => ErrorKind::ReachBusy,
            StageError::InvalidInput(_) => ErrorKind::InvalidInput,
            StageError::Io(_) | StageError::Sqlite(_) | StageError::Json(_) => ErrorKind::Internal,
            StageError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn into_job_error(self) -> JobError {
        let detail = self.to_string();
        let mut err = JobError::new(self.kind(), detail);
        if err.kind == ErrorKind::Internal {
            err = err.with_traceback(format!("{self:?}"));
        }
        err
    }
}

/// Tunables threaded from service configuration into the stages.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Downstream energy slope of normal-depth boundaries.
    pub normal_depth_slope: f64,
    /// Length units of the source models.
    pub units: String,
    /// Extra margin, in model units, around the cross-section footprint
    /// when clipping the DEM.
    pub terrain_buffer: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            normal_depth_slope: 0.001,
            units: "feet".to_string(),
            terrain_buffer: 100.0,
        }
    }
}

/// The ambient adapters a stage runs against.
pub struct StageContext {
    pub solver: Box<dyn solver::Solver>,
    pub dem: Box<dyn sources::DemProvider>,
    pub network: Box<dyn sources::NetworkProvider>,
    pub config: StageConfig,
}

impl StageContext {
    pub fn new(
        solver: Box<dyn solver::Solver>,
        dem: Box<dyn sources::DemProvider>,
        network: Box<dyn sources::NetworkProvider>,
        config: StageConfig,
    ) -> Self {
        Self {
            solver,
            dem,
            network,
            config,
        }
    }

    /// A context with no external dependencies: the synthetic solver, a
    /// flat DEM, and an empty network. Tests extend it with fixtures.
    pub fn synthetic() -> Self {
        Self {
            solver: Box::new(solver::SyntheticSolver::default()),
            dem: Box::new(sources::PlaneDem::flat(170.0)),
            network: Box::new(sources::VecNetwork::default()),
            config: StageConfig::default(),
        }
    }
}
