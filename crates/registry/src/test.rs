use super::{Registry, ValidateError};
use hydraulics::{StageContext, StageError};

fn registry() -> Registry {
    Registry::default()
}

#[test]
fn test_registered_processes() {
    let names: Vec<&str> = registry().all().map(|s| s.name).collect();
    insta::assert_json_snapshot!(names, @r###"
    [
      "compute_conflation_metrics",
      "conflate_model",
      "create_fim_lib",
      "create_model_run_normal_depth",
      "create_ras_terrain",
      "create_rating_curves_db",
      "extract_submodel",
      "ras_to_gpkg",
      "run_incremental_normal_depth",
      "run_known_wse",
      "test_job_queue"
    ]
    "###);
}

#[test]
fn test_unknown_process_is_rejected() {
    let err = registry()
        .validate("solve_shallow_water", &serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, ValidateError::UnknownProcess(_)));
}

#[test]
fn test_required_fields_are_enforced() {
    let registry = registry();

    assert!(registry
        .validate(
            "ras_to_gpkg",
            &serde_json::json!({"source_model_directory": "/data/Baxter"}),
        )
        .is_ok());

    let err = registry
        .validate("ras_to_gpkg", &serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, ValidateError::InvalidInput(_)));

    let err = registry
        .validate(
            "run_known_wse",
            &serde_json::json!({"submodel_directory": "/m/2823932", "min_elevation": 163.0}),
        )
        .unwrap_err();
    assert!(matches!(err, ValidateError::InvalidInput(_)));
}

#[test]
fn test_domains_are_enforced() {
    let registry = registry();

    // Integer out of range.
    let err = registry
        .validate(
            "create_model_run_normal_depth",
            &serde_json::json!({
                "submodel_directory": "/m/2823932",
                "num_of_discharges_for_initial_normal_depth_runs": 1,
            }),
        )
        .unwrap_err();
    assert!(matches!(err, ValidateError::InvalidInput(_)));

    // Enumerated string.
    let err = registry
        .validate(
            "create_ras_terrain",
            &serde_json::json!({"submodel_directory": "/m/2823932", "units": "furlongs"}),
        )
        .unwrap_err();
    assert!(matches!(err, ValidateError::InvalidInput(_)));

    // Wrong type.
    let err = registry
        .validate(
            "create_fim_lib",
            &serde_json::json!({"submodel_directory": "/m/2823932", "cleanup": "yes"}),
        )
        .unwrap_err();
    assert!(matches!(err, ValidateError::InvalidInput(_)));

    assert!(registry
        .validate(
            "create_fim_lib",
            &serde_json::json!({
                "submodel_directory": "/m/2823932",
                "plans": ["02", "03"],
                "cleanup": true,
            }),
        )
        .is_ok());
}

#[test]
fn test_unrecognized_fields_are_rejected() {
    let err = registry()
        .validate(
            "test_job_queue",
            &serde_json::json!({"unexpected": true}),
        )
        .unwrap_err();
    assert!(matches!(err, ValidateError::InvalidInput(_)));
}

#[test]
fn test_dispatch_health_check() {
    let ctx = StageContext::synthetic();
    let result = registry()
        .dispatch("test_job_queue", serde_json::json!({}), &ctx)
        .unwrap();
    assert_eq!(result, serde_json::json!({}));
}

#[test]
fn test_dispatch_checks_preconditions() {
    let dir = tempfile::tempdir().unwrap();
    let submodel = dir.path().join("2823932");
    std::fs::create_dir_all(&submodel).unwrap();
    let ctx = StageContext::synthetic();

    // No geopackage exists yet; the terrain stage must fail fast.
    let err = registry()
        .dispatch(
            "create_ras_terrain",
            serde_json::json!({"submodel_directory": submodel}),
            &ctx,
        )
        .unwrap_err();
    assert!(matches!(err, StageError::Precondition(_)));
}

#[test]
fn test_dispatch_validates_input() {
    let ctx = StageContext::synthetic();
    let err = registry()
        .dispatch(
            "conflate_model",
            serde_json::json!({"source_model_directory": 42}),
            &ctx,
        )
        .unwrap_err();
    assert!(matches!(err, StageError::InvalidInput(_)));
}
