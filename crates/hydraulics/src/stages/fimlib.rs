//! `create_fim_lib` and `create_rating_curves_db`: clip depth grids to the
//! reach corridor and aggregate the synthetic rating curves into the
//! per-reach relational store the forecasting service reads.

use super::runs::grid_name;
use super::{parse_input, to_result};
use crate::geometry::{corridor, merge_junction, Polygon};
use crate::layout::Submodel;
use crate::model::{Boundary, JsonModelFormat, ModelFormat};
use crate::solver::read_results;
use crate::{gpkg, raster, StageContext, StageError};

fn default_plans() -> Vec<String> {
    vec!["02".to_string(), "03".to_string()]
}

#[derive(Debug, serde::Deserialize)]
pub struct FimLibInput {
    pub submodel_directory: String,
    #[serde(default = "default_plans")]
    pub plans: Vec<String>,
    #[serde(default)]
    pub cleanup: bool,
}

pub fn create_fim_lib(
    _ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: FimLibInput = parse_input(input)?;
    let submodel = Submodel::open(&input.submodel_directory)?;
    let _lock = submodel.lock()?;

    let hull = reach_hull(&submodel)?;
    std::fs::create_dir_all(submodel.fim_dir())?;

    let mut clipped = 0;
    let mut cleaned = 0;
    for suffix in &input.plans {
        let dir = submodel.depth_grid_dir(suffix);
        if !dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tif") {
                continue;
            }
            let mut grid = raster::read_tiff(&path)?;
            for row in 0..grid.height {
                for col in 0..grid.width {
                    if !hull.contains(&grid.cell_center(col, row)) {
                        grid.set(col, row, grid.nodata);
                    }
                }
            }
            let name = path.file_name().expect("read_dir yields named files");
            raster::write_tiff(&submodel.fim_dir().join(name), &grid)?;
            clipped += 1;
            if input.cleanup {
                std::fs::remove_file(&path)?;
                cleaned += 1;
            }
        }
    }
    if clipped == 0 {
        return Err(StageError::Precondition(format!(
            "no depth grids found under {} for plans {:?}; run the simulation stages first",
            submodel.dir().display(),
            input.plans
        )));
    }

    tracing::info!(
        library = %submodel.fim_dir().display(),
        grids = clipped,
        cleaned,
        "built flood-inundation map library"
    );
    to_result(serde_json::json!({
        "library": submodel.fim_dir().display().to_string(),
        "grids": clipped,
        "cleaned_up": cleaned,
    }))
}

/// The corridor polygon of the reach's cross sections, with any junction
/// polygon merged in so clipped grids keep the junction area.
fn reach_hull(submodel: &Submodel) -> Result<Polygon, StageError> {
    let (geometry, _) = gpkg::read_gpkg(&submodel.gpkg_path())?;
    let lines: Vec<_> = geometry
        .cross_sections
        .iter()
        .map(|xs| xs.line.clone())
        .collect();
    let mut hull = corridor(&lines).ok_or_else(|| {
        StageError::Precondition(
            "at least two cross sections are required to form the clipping hull".to_string(),
        )
    })?;
    for junction in &geometry.junctions {
        if let Some(polygon) = &junction.polygon {
            hull = merge_junction(&hull, polygon);
        }
    }
    Ok(hull)
}

#[derive(Debug, serde::Deserialize)]
pub struct RatingCurvesInput {
    pub submodel_directory: String,
    #[serde(default = "default_plans")]
    pub plans: Vec<String>,
}

/// Open or append to the reach's rating-curve database. Re-invocation
/// replaces rows on matching keys, so the stage is idempotent.
pub fn create_rating_curves_db(
    _ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: RatingCurvesInput = parse_input(input)?;
    let submodel = Submodel::open(&input.submodel_directory)?;
    let _lock = submodel.lock()?;
    let reach = submodel.reach().to_string();

    let (geometry, _) = gpkg::read_gpkg(&submodel.gpkg_path())?;
    let us_xs = geometry
        .cross_sections
        .iter()
        .max_by(|a, b| a.river_station.total_cmp(&b.river_station));
    let ds_xs = geometry
        .cross_sections
        .iter()
        .min_by(|a, b| a.river_station.total_cmp(&b.river_station));
    let (Some(us_xs), Some(ds_xs)) = (us_xs, ds_xs) else {
        return Err(StageError::Precondition(
            "submodel geopackage holds no cross sections".to_string(),
        ));
    };
    let (us_thalweg, ds_thalweg) = (us_xs.min_elevation(), ds_xs.min_elevation());
    let (us_station, ds_station) = (us_xs.river_station, ds_xs.river_station);

    let conn = rusqlite::Connection::open(submodel.rating_db_path())?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rating_curves (
             reach_id            TEXT NOT NULL,
             us_flow             REAL NOT NULL,
             us_depth            REAL NOT NULL,
             us_wse              REAL NOT NULL,
             ds_flow             REAL NOT NULL,
             ds_depth            REAL NOT NULL,
             ds_wse              REAL NOT NULL,
             boundary_condition  TEXT NOT NULL,
             plan_suffix         TEXT NOT NULL,
             map_exists          INTEGER NOT NULL,
             PRIMARY KEY (reach_id, us_flow, ds_wse, plan_suffix)
         );",
    )?;

    let format = JsonModelFormat;
    let mut rows = 0usize;
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO rating_curves
             (reach_id, us_flow, us_depth, us_wse, ds_flow, ds_depth, ds_wse,
              boundary_condition, plan_suffix, map_exists)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
    )?;

    for suffix in &input.plans {
        let results_path = submodel.results_path(suffix);
        if !results_path.exists() {
            continue;
        }
        let results = read_results(&results_path)?;
        let plan = format.read_plan(&submodel.plan_path(suffix))?;

        for (index, profile) in results.profiles.iter().enumerate() {
            let at = |station: f64| {
                profile.records.iter().min_by(|a, b| {
                    (a.station - station)
                        .abs()
                        .total_cmp(&(b.station - station).abs())
                })
            };
            let (Some(us), Some(ds)) = (at(us_station), at(ds_station)) else {
                continue;
            };

            let boundary_label = match &plan.boundary {
                Boundary::NormalDepth { .. } => "z".to_string(),
                Boundary::KnownWse { elevations } => elevations
                    .get(index)
                    .map(|e| format!("{e:.1}"))
                    .unwrap_or_else(|| "z".to_string()),
            };
            let map_exists = submodel
                .fim_dir()
                .join(grid_name(ds.discharge, &boundary_label))
                .exists();

            stmt.execute(rusqlite::params![
                reach,
                us.discharge,
                us.water_surface_elevation - us_thalweg,
                us.water_surface_elevation,
                ds.discharge,
                ds.water_surface_elevation - ds_thalweg,
                ds.water_surface_elevation,
                boundary_label,
                suffix,
                map_exists,
            ])?;
            rows += 1;
        }
    }
    drop(stmt);

    if rows == 0 {
        return Err(StageError::Precondition(format!(
            "no results found under {} for plans {:?}",
            submodel.dir().display(),
            input.plans
        )));
    }
    tracing::info!(
        database = %submodel.rating_db_path().display(),
        rows,
        "wrote rating curves"
    );
    to_result(serde_json::json!({
        "database": submodel.rating_db_path().display().to_string(),
        "rows": rows,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stages::runs::test::run_ready;
    use crate::stages::{create_model_run_normal_depth, run_incremental_normal_depth, run_known_wse};

    fn simulated(dir: &std::path::Path) -> (crate::StageContext, String) {
        let (ctx, submodel_dir) = run_ready(dir);
        create_model_run_normal_depth(
            &ctx,
            serde_json::json!({"submodel_directory": submodel_dir}),
        )
        .unwrap();
        run_incremental_normal_depth(
            &ctx,
            serde_json::json!({
                "submodel_directory": submodel_dir,
                "depth_increment": 5.0,
                "write_depth_grids": true,
            }),
        )
        .unwrap();
        run_known_wse(
            &ctx,
            serde_json::json!({
                "submodel_directory": submodel_dir,
                "min_elevation": 165.0,
                "max_elevation": 185.0,
                "depth_increment": 10.0,
                "write_depth_grids": true,
            }),
        )
        .unwrap();
        (ctx, submodel_dir)
    }

    #[test]
    fn test_fim_lib_clips_grids_into_the_library() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, submodel_dir) = simulated(dir.path());

        let result = create_fim_lib(
            &ctx,
            serde_json::json!({"submodel_directory": submodel_dir}),
        )
        .unwrap();
        let grids = result["grids"].as_u64().unwrap() as usize;
        assert!(grids > 0);
        assert_eq!(result["cleaned_up"], 0);

        let submodel = Submodel::open(&submodel_dir).unwrap();
        let library: Vec<_> = std::fs::read_dir(submodel.fim_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(library.len(), grids);

        // Clipping can only remove data.
        for clipped_path in &library {
            let name = clipped_path.file_name().unwrap();
            let original = submodel.depth_grid_dir("02").join(name);
            let original = if original.exists() {
                original
            } else {
                submodel.depth_grid_dir("03").join(name)
            };
            let clipped = raster::read_tiff(clipped_path).unwrap();
            let unclipped = raster::read_tiff(&original).unwrap();
            assert!(clipped.data_cells() <= unclipped.data_cells());
        }
    }

    #[test]
    fn test_fim_lib_cleanup_removes_originals() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, submodel_dir) = simulated(dir.path());

        create_fim_lib(
            &ctx,
            serde_json::json!({
                "submodel_directory": submodel_dir,
                "plans": ["02"],
                "cleanup": true,
            }),
        )
        .unwrap();

        let submodel = Submodel::open(&submodel_dir).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(submodel.depth_grid_dir("02"))
            .unwrap()
            .collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_fim_lib_without_grids_is_a_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, submodel_dir) = run_ready(dir.path());
        let err = create_fim_lib(
            &ctx,
            serde_json::json!({"submodel_directory": submodel_dir}),
        )
        .unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
    }

    #[test]
    fn test_rating_curves_db_rows_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, submodel_dir) = simulated(dir.path());
        create_fim_lib(
            &ctx,
            serde_json::json!({"submodel_directory": submodel_dir}),
        )
        .unwrap();

        let first = create_rating_curves_db(
            &ctx,
            serde_json::json!({"submodel_directory": submodel_dir}),
        )
        .unwrap();
        let rows = first["rows"].as_u64().unwrap();
        assert!(rows > 0);

        let dump = |path: &std::path::Path| -> Vec<(f64, f64, String, String, bool)> {
            let conn = rusqlite::Connection::open(path).unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT us_flow, ds_wse, boundary_condition, plan_suffix, map_exists
                     FROM rating_curves ORDER BY plan_suffix, us_flow, ds_wse;",
                )
                .unwrap();
            let out = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })
                .unwrap()
                .map(Result::unwrap)
                .collect();
            out
        };

        let submodel = Submodel::open(&submodel_dir).unwrap();
        let before = dump(&submodel.rating_db_path());
        assert_eq!(before.len(), rows as usize);
        // Every clipped grid is visible to the `map_exists` flag.
        assert!(before.iter().any(|(_, _, _, _, exists)| *exists));

        // Calling the stage twice leaves the same rows.
        let second = create_rating_curves_db(
            &ctx,
            serde_json::json!({"submodel_directory": submodel_dir}),
        )
        .unwrap();
        assert_eq!(second["rows"], first["rows"]);
        assert_eq!(dump(&submodel.rating_db_path()), before);
    }

    #[test]
    fn test_rating_curves_include_both_generations() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, submodel_dir) = simulated(dir.path());
        create_rating_curves_db(
            &ctx,
            serde_json::json!({"submodel_directory": submodel_dir}),
        )
        .unwrap();

        let submodel = Submodel::open(&submodel_dir).unwrap();
        let conn = rusqlite::Connection::open(submodel.rating_db_path()).unwrap();
        let suffixes: Vec<String> = conn
            .prepare("SELECT DISTINCT plan_suffix FROM rating_curves ORDER BY plan_suffix;")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(suffixes, vec!["02".to_string(), "03".to_string()]);

        // Known-WSE rows carry their boundary elevation, normal-depth rows
        // carry the "z" marker.
        let boundaries: Vec<String> = conn
            .prepare("SELECT DISTINCT boundary_condition FROM rating_curves WHERE plan_suffix = '03';")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert!(boundaries.iter().all(|b| b != "z"));
    }
}
