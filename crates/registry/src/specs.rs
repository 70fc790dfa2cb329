//! The built-in process table: the nine pipeline stages plus the queue
//! health check, with their input descriptors and file preconditions.

use super::{Domain, EclipsedPolicy, InputField, Precondition, ProcessSpec};
use hydraulics::stages;

const fn required(name: &'static str, domain: Domain) -> InputField {
    InputField {
        name,
        domain,
        required: true,
    }
}

const fn optional(name: &'static str, domain: Domain) -> InputField {
    InputField {
        name,
        domain,
        required: false,
    }
}

const MULTIPLIER: Domain = Domain::Float {
    min: 0.01,
    max: 100.0,
};
const ELEVATION: Domain = Domain::Float {
    min: -1000.0,
    max: 100000.0,
};

pub fn built_in() -> Vec<ProcessSpec> {
    BUILT_IN.to_vec()
}

const BUILT_IN: &[ProcessSpec] = &[
        ProcessSpec {
            name: "ras_to_gpkg",
            title: "Extract source-model geometry into a geopackage",
            inputs: &[
                required("source_model_directory", Domain::Path),
                optional("crs", Domain::String),
            ],
            preconditions: &[],
            eclipsed: EclipsedPolicy::NotApplicable,
            handler: stages::ras_to_gpkg,
        },
        ProcessSpec {
            name: "conflate_model",
            title: "Associate cross sections with reference-network reaches",
            inputs: &[
                required("source_model_directory", Domain::Path),
                optional("low_flow_multiplier", MULTIPLIER),
                optional("high_flow_multiplier", MULTIPLIER),
                optional("source_network", Domain::String),
            ],
            preconditions: &[Precondition::SourceGeopackage],
            eclipsed: EclipsedPolicy::NotApplicable,
            handler: stages::conflate_model,
        },
        ProcessSpec {
            name: "compute_conflation_metrics",
            title: "Recompute conflation summary statistics",
            inputs: &[required("source_model_directory", Domain::Path)],
            preconditions: &[
                Precondition::SourceGeopackage,
                Precondition::ConflationDocument,
            ],
            eclipsed: EclipsedPolicy::NotApplicable,
            handler: stages::compute_conflation_metrics,
        },
        ProcessSpec {
            name: "extract_submodel",
            title: "Extract one reach into its own submodel",
            inputs: &[
                required("source_model_directory", Domain::Path),
                required("submodel_directory", Domain::Path),
                required("nwm_id", Domain::String),
                optional("low_flow_multiplier", MULTIPLIER),
                optional("high_flow_multiplier", MULTIPLIER),
                optional("ignore_source_flows", Domain::Boolean),
                optional("ignore_reference_flows", Domain::Boolean),
            ],
            preconditions: &[
                Precondition::SourceGeopackage,
                Precondition::ConflationDocument,
            ],
            eclipsed: EclipsedPolicy::ShortCircuit,
            handler: stages::extract_submodel,
        },
        ProcessSpec {
            name: "create_ras_terrain",
            title: "Clip the DEM into the submodel terrain bundle",
            inputs: &[
                required("submodel_directory", Domain::Path),
                optional("resolution", Domain::Float { min: 0.1, max: 1000.0 }),
                optional("units", Domain::Enum(&["feet", "meters"])),
            ],
            preconditions: &[Precondition::SubmodelGeopackage],
            eclipsed: EclipsedPolicy::Reject,
            handler: stages::create_ras_terrain,
        },
        ProcessSpec {
            name: "create_model_run_normal_depth",
            title: "Initial normal-depth discharge sweep",
            inputs: &[
                required("submodel_directory", Domain::Path),
                optional(
                    "num_of_discharges_for_initial_normal_depth_runs",
                    Domain::Integer { min: 2, max: 10000 },
                ),
            ],
            preconditions: &[Precondition::SubmodelGeopackage],
            eclipsed: EclipsedPolicy::Reject,
            handler: stages::create_model_run_normal_depth,
        },
        ProcessSpec {
            name: "run_incremental_normal_depth",
            title: "Re-run discharges at even stage increments",
            inputs: &[
                required("submodel_directory", Domain::Path),
                optional("depth_increment", Domain::Float { min: 0.01, max: 100.0 }),
                optional("write_depth_grids", Domain::Boolean),
            ],
            preconditions: &[
                Precondition::SubmodelGeopackage,
                Precondition::InitialResults,
            ],
            eclipsed: EclipsedPolicy::Reject,
            handler: stages::run_incremental_normal_depth,
        },
        ProcessSpec {
            name: "run_known_wse",
            title: "Known water-surface-elevation runs",
            inputs: &[
                required("submodel_directory", Domain::Path),
                required("min_elevation", ELEVATION),
                required("max_elevation", ELEVATION),
                optional("depth_increment", Domain::Float { min: 0.01, max: 100.0 }),
                optional("write_depth_grids", Domain::Boolean),
            ],
            preconditions: &[
                Precondition::SubmodelGeopackage,
                Precondition::IncrementalResults,
            ],
            eclipsed: EclipsedPolicy::Reject,
            handler: stages::run_known_wse,
        },
        ProcessSpec {
            name: "create_fim_lib",
            title: "Clip depth grids into the map library",
            inputs: &[
                required("submodel_directory", Domain::Path),
                optional("plans", Domain::StringList),
                optional("cleanup", Domain::Boolean),
            ],
            preconditions: &[Precondition::SubmodelGeopackage],
            eclipsed: EclipsedPolicy::Reject,
            handler: stages::create_fim_lib,
        },
        ProcessSpec {
            name: "create_rating_curves_db",
            title: "Aggregate rating curves into the reach database",
            inputs: &[
                required("submodel_directory", Domain::Path),
                optional("plans", Domain::StringList),
            ],
            preconditions: &[Precondition::SubmodelGeopackage],
            eclipsed: EclipsedPolicy::Reject,
            handler: stages::create_rating_curves_db,
        },
        ProcessSpec {
            name: "test_job_queue",
            title: "Queue health check",
            inputs: &[],
            preconditions: &[],
            eclipsed: EclipsedPolicy::NotApplicable,
            handler: super::test_job_queue,
        },
];
