//! The worker-child entry point: the service binary re-invoked with a
//! process name and input document. The child runs the stage synchronously,
//! prints the result document as its final stdout line, and on failure
//! prints the error document as its final stderr line and exits non-zero.

use hydraulics::solver::{ExternalSolver, Solver, SyntheticSolver};
use hydraulics::sources::{
    DemProvider, FileDem, NetworkProvider, ParquetNetwork, PlaneDem, VecNetwork,
};
use hydraulics::{StageConfig, StageContext};
use models::JobError;
use std::path::PathBuf;

/// Adapter configuration threaded from service flags and environment into
/// the child process.
#[derive(Debug, Clone, clap::Args)]
pub struct AdapterArgs {
    /// Path of the reference-network parquet file.
    #[clap(long = "network-parquet", env = "FIM_NETWORK_PARQUET")]
    pub network_parquet: Option<PathBuf>,
    /// URL of the DEM source; file:// URLs and bare paths are read locally.
    #[clap(long = "dem-url", env = "FIM_DEM_URL")]
    pub dem_url: Option<String>,
    /// Path of the external solver binary. Without one, the built-in
    /// synthetic solver serves local development and tests.
    #[clap(long = "solver-bin", env = "FIM_SOLVER_BIN")]
    pub solver_bin: Option<PathBuf>,
    /// Downstream energy slope of normal-depth boundaries.
    #[clap(
        long = "normal-depth-slope",
        env = "FIM_NORMAL_DEPTH_SLOPE",
        default_value = "0.001"
    )]
    pub normal_depth_slope: f64,
}

#[derive(Debug, clap::Args)]
pub struct InvokeArgs {
    /// Registered process name.
    #[clap(long)]
    pub process: String,
    /// The job's input document, as JSON.
    #[clap(long)]
    pub input: String,
    #[clap(flatten)]
    pub adapters: AdapterArgs,
}

pub fn stage_context(adapters: &AdapterArgs) -> StageContext {
    let solver: Box<dyn Solver> = match &adapters.solver_bin {
        Some(bin) => Box::new(ExternalSolver::new(bin)),
        None => Box::new(SyntheticSolver::default()),
    };
    let network: Box<dyn NetworkProvider> = match &adapters.network_parquet {
        Some(path) => Box::new(ParquetNetwork::open(path)),
        None => Box::new(VecNetwork::default()),
    };
    let dem: Box<dyn DemProvider> = match &adapters.dem_url {
        Some(url) => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Box::new(FileDem::open(path))
        }
        None => Box::new(PlaneDem::flat(0.0)),
    };
    StageContext::new(
        solver,
        dem,
        network,
        StageConfig {
            normal_depth_slope: adapters.normal_depth_slope,
            ..StageConfig::default()
        },
    )
}

/// Run the stage and emit the wire documents. Returns the process exit code.
pub fn run(args: &InvokeArgs) -> i32 {
    let input: serde_json::Value = match serde_json::from_str(&args.input) {
        Ok(input) => input,
        Err(err) => {
            let error = JobError::new(
                models::ErrorKind::InvalidInput,
                format!("input document is not JSON: {err}"),
            );
            eprintln!("{}", serde_json::to_string(&error).expect("JobError serializes"));
            return 1;
        }
    };

    let ctx = stage_context(&args.adapters);
    let registry = registry::Registry::default();
    match registry.dispatch(&args.process, input, &ctx) {
        Ok(result) => {
            println!("{result}");
            0
        }
        Err(err) => {
            let error = err.into_job_error();
            tracing::error!(process = %args.process, kind = %error.kind, detail = %error.detail, "stage failed");
            eprintln!("{}", serde_json::to_string(&error).expect("JobError serializes"));
            1
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn invoke(process: &str, input: serde_json::Value) -> InvokeArgs {
        InvokeArgs {
            process: process.to_string(),
            input: input.to_string(),
            adapters: AdapterArgs {
                network_parquet: None,
                dem_url: None,
                solver_bin: None,
                normal_depth_slope: 0.001,
            },
        }
    }

    #[test]
    fn test_health_check_exits_zero() {
        assert_eq!(run(&invoke("test_job_queue", serde_json::json!({}))), 0);
    }

    #[test]
    fn test_unknown_process_exits_nonzero() {
        assert_ne!(run(&invoke("not_a_process", serde_json::json!({}))), 0);
    }

    #[test]
    fn test_bad_input_document_exits_nonzero() {
        let args = InvokeArgs {
            process: "test_job_queue".to_string(),
            input: "{not json".to_string(),
            adapters: AdapterArgs {
                network_parquet: None,
                dem_url: None,
                solver_bin: None,
                normal_depth_slope: 0.001,
            },
        };
        assert_ne!(run(&args), 0);
    }
}
