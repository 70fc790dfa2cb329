//! The process registry: the static catalog of invocable processes, their
//! recognized inputs, and their file preconditions. Populated once at
//! startup and never mutated, it is the authority for input validation at
//! enqueue time and for handler dispatch inside the worker child.

use hydraulics::layout::{SourceModel, Submodel};
use hydraulics::{StageContext, StageError};
use std::collections::BTreeMap;

mod specs;

pub use specs::built_in;

/// The value domain of one recognized input field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Domain {
    /// Free-form string.
    String,
    /// String path on the service host.
    Path,
    Boolean,
    Integer { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Enum(&'static [&'static str]),
    /// List of strings, e.g. plan suffixes.
    StringList,
}

impl Domain {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            Domain::String | Domain::Path => value.is_string(),
            Domain::Boolean => value.is_boolean(),
            Domain::Integer { min, max } => value
                .as_i64()
                .is_some_and(|v| (*min..=*max).contains(&v)),
            Domain::Float { min, max } => value
                .as_f64()
                .is_some_and(|v| v >= *min && v <= *max),
            Domain::Enum(options) => value
                .as_str()
                .is_some_and(|v| options.contains(&v)),
            Domain::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(|i| i.is_string())),
        }
    }

    fn describe(&self) -> String {
        match self {
            Domain::String => "a string".to_string(),
            Domain::Path => "a path string".to_string(),
            Domain::Boolean => "a boolean".to_string(),
            Domain::Integer { min, max } => format!("an integer in [{min}, {max}]"),
            Domain::Float { min, max } => format!("a number in [{min}, {max}]"),
            Domain::Enum(options) => format!("one of {options:?}"),
            Domain::StringList => "a list of strings".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InputField {
    pub name: &'static str,
    pub domain: Domain,
    pub required: bool,
}

/// Files that must exist before the handler is worth invoking. Checked by
/// dispatch so a missing prerequisite fails fast with a clear reason; the
/// stages re-verify as they read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Precondition {
    SourceGeopackage,
    ConflationDocument,
    SubmodelGeopackage,
    TerrainBundle,
    InitialResults,
    IncrementalResults,
}

impl Precondition {
    fn check(&self, input: &serde_json::Value) -> Result<(), StageError> {
        let str_input = |key: &str| -> Result<&str, StageError> {
            input.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
                StageError::InvalidInput(format!("input {key:?} is required"))
            })
        };
        let missing = |path: std::path::PathBuf| -> Result<(), StageError> {
            if path.exists() {
                Ok(())
            } else {
                Err(StageError::Precondition(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
        };
        match self {
            Precondition::SourceGeopackage => {
                missing(SourceModel::open(str_input("source_model_directory")?)?.gpkg_path())
            }
            Precondition::ConflationDocument => {
                missing(SourceModel::open(str_input("source_model_directory")?)?.conflation_path())
            }
            Precondition::SubmodelGeopackage => {
                missing(Submodel::open(str_input("submodel_directory")?)?.gpkg_path())
            }
            Precondition::TerrainBundle => {
                missing(Submodel::open(str_input("submodel_directory")?)?.terrain_path())
            }
            Precondition::InitialResults => {
                missing(Submodel::open(str_input("submodel_directory")?)?.results_path("01"))
            }
            Precondition::IncrementalResults => {
                missing(Submodel::open(str_input("submodel_directory")?)?.results_path("02"))
            }
        }
    }
}

/// Whether a process may target an eclipsed reach.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EclipsedPolicy {
    /// The process is not reach-scoped.
    NotApplicable,
    /// The process succeeds immediately with a recorded skip reason.
    ShortCircuit,
    /// The process cannot run against an eclipsed reach.
    Reject,
}

pub type Handler = fn(&StageContext, serde_json::Value) -> Result<serde_json::Value, StageError>;

#[derive(Debug, Clone, Copy)]
pub struct ProcessSpec {
    pub name: &'static str,
    pub title: &'static str,
    pub inputs: &'static [InputField],
    pub preconditions: &'static [Precondition],
    pub eclipsed: EclipsedPolicy,
    pub handler: Handler,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("process {0:?} is not registered")]
    UnknownProcess(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// The process catalog. Built once at startup; never mutated.
pub struct Registry {
    by_name: BTreeMap<&'static str, ProcessSpec>,
}

impl Registry {
    pub fn new(specs: Vec<ProcessSpec>) -> Registry {
        let mut by_name = BTreeMap::new();
        for spec in specs {
            let name = spec.name;
            if by_name.insert(name, spec).is_some() {
                panic!("a process named {name:?} is already registered");
            }
        }
        Registry { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&ProcessSpec> {
        self.by_name.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &ProcessSpec> {
        self.by_name.values()
    }

    /// Validate an execution request against the descriptor. This is the
    /// gate applied by the HTTP surface before a job is enqueued.
    pub fn validate(&self, name: &str, input: &serde_json::Value) -> Result<(), ValidateError> {
        let spec = self
            .by_name
            .get(name)
            .ok_or_else(|| ValidateError::UnknownProcess(name.to_string()))?;

        let Some(object) = input.as_object() else {
            return Err(ValidateError::InvalidInput(
                "the input document must be a JSON object".to_string(),
            ));
        };
        for key in object.keys() {
            if !spec.inputs.iter().any(|f| f.name == key) {
                return Err(ValidateError::InvalidInput(format!(
                    "{key:?} is not a recognized input of {name}"
                )));
            }
        }
        for field in spec.inputs {
            match object.get(field.name) {
                None if field.required => {
                    return Err(ValidateError::InvalidInput(format!(
                        "{:?} is required",
                        field.name
                    )))
                }
                None => {}
                Some(value) => {
                    if !field.domain.accepts(value) {
                        return Err(ValidateError::InvalidInput(format!(
                            "{:?} must be {}",
                            field.name,
                            field.domain.describe()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate, check preconditions, and invoke the handler. This is the
    /// entry point of the worker child.
    pub fn dispatch(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &StageContext,
    ) -> Result<serde_json::Value, StageError> {
        self.validate(name, &input).map_err(|err| match err {
            ValidateError::UnknownProcess(name) => {
                StageError::InvalidInput(format!("process {name:?} is not registered"))
            }
            ValidateError::InvalidInput(detail) => StageError::InvalidInput(detail),
        })?;
        let spec = self.by_name.get(name).expect("validated above");
        for precondition in spec.preconditions {
            precondition.check(&input)?;
        }
        tracing::info!(process = name, "dispatching");
        (spec.handler)(ctx, input)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(built_in())
    }
}

/// Handler of the `test_job_queue` health-check process: proves the queue,
/// the supervisor, and the result path end-to-end without touching data.
pub(crate) fn test_job_queue(
    _ctx: &StageContext,
    _input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    Ok(serde_json::json!({}))
}

#[cfg(test)]
mod test;
