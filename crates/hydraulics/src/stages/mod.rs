//! The nine pipeline stages. Each stage is a function over (input
//! document, ambient adapters) with documented side effects on the reach
//! layout, independently invocable and retriable on its own inputs: a
//! stage re-derives everything it needs from the files it reads, never
//! from state left behind by an earlier attempt.

use crate::StageError;

pub mod conflation;
pub mod fimlib;
pub mod gpkg_export;
pub mod runs;
pub mod submodel;
pub mod terrain;

pub use conflation::{compute_conflation_metrics, conflate_model};
pub use fimlib::{create_fim_lib, create_rating_curves_db};
pub use gpkg_export::ras_to_gpkg;
pub use runs::{create_model_run_normal_depth, run_incremental_normal_depth, run_known_wse};
pub use submodel::extract_submodel;
pub use terrain::create_ras_terrain;

pub(crate) fn parse_input<T: serde::de::DeserializeOwned>(
    input: serde_json::Value,
) -> Result<T, StageError> {
    serde_json::from_value(input).map_err(|err| StageError::InvalidInput(err.to_string()))
}

pub(crate) fn to_result<T: serde::Serialize>(value: T) -> Result<serde_json::Value, StageError> {
    Ok(serde_json::to_value(value)?)
}
