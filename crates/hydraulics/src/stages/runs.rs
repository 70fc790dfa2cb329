//! The three simulation stages: the initial normal-depth sweep, the
//! stage-regularized re-run, and the known water-surface-elevation runs.
//! Each writes a plan/flow generation into the submodel, drives the solver
//! adapter, and leaves the results bundle beside the plan.

use super::conflation::centerline_station;
use super::{parse_input, to_result};
use crate::geometry::LineString;
use crate::layout::Submodel;
use crate::model::{Boundary, FlowFile, FlowProfile, JsonModelFormat, ModelFormat, Plan, ReachFlow};
use crate::raster::RasterTile;
use crate::solver::{read_results, RatingCurve, RunResults};
use crate::{gpkg, raster, StageContext, StageError};
use std::path::PathBuf;

pub const INITIAL_SUFFIX: &str = "01";
pub const INCREMENTAL_SUFFIX: &str = "02";
pub const KNOWN_WSE_SUFFIX: &str = "03";

#[derive(Debug, serde::Deserialize)]
pub struct NormalDepthInput {
    pub submodel_directory: String,
    #[serde(default = "default_discharge_count")]
    pub num_of_discharges_for_initial_normal_depth_runs: usize,
}

fn default_discharge_count() -> usize {
    50
}

/// `create_model_run_normal_depth`: sweep evenly spaced discharges between
/// the submodel's flow bounds under a slope boundary.
pub fn create_model_run_normal_depth(
    ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: NormalDepthInput = parse_input(input)?;
    let count = input.num_of_discharges_for_initial_normal_depth_runs;
    if count < 2 {
        return Err(StageError::InvalidInput(format!(
            "at least two discharges are required, got {count}"
        )));
    }
    let submodel = Submodel::open(&input.submodel_directory)?;
    let _lock = submodel.lock()?;
    let reach_model = ReachModel::load(&submodel)?;

    let discharges = crate::geometry::linspace(reach_model.low_flow, reach_model.high_flow, count);
    let results = run_plan(
        ctx,
        &submodel,
        &reach_model,
        INITIAL_SUFFIX,
        &discharges,
        Boundary::NormalDepth {
            slope: ctx.config.normal_depth_slope,
        },
    )?;

    to_result(serde_json::json!({
        "plan_suffix": INITIAL_SUFFIX,
        "plan": submodel.plan_path(INITIAL_SUFFIX).display().to_string(),
        "profiles": results.profiles.len(),
        "results": submodel.results_path(INITIAL_SUFFIX).display().to_string(),
    }))
}

#[derive(Debug, serde::Deserialize)]
pub struct IncrementalInput {
    pub submodel_directory: String,
    #[serde(default = "default_depth_increment")]
    pub depth_increment: f64,
    #[serde(default)]
    pub write_depth_grids: bool,
}

fn default_depth_increment() -> f64 {
    0.5
}

/// `run_incremental_normal_depth`: re-run the discharges that regularize
/// the downstream rating curve into even stage increments.
pub fn run_incremental_normal_depth(
    ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: IncrementalInput = parse_input(input)?;
    if input.depth_increment <= 0.0 {
        return Err(StageError::InvalidInput(format!(
            "depth increment {} must be positive",
            input.depth_increment
        )));
    }
    let submodel = Submodel::open(&input.submodel_directory)?;
    let _lock = submodel.lock()?;
    let reach_model = ReachModel::load(&submodel)?;

    let initial = read_results(&submodel.results_path(INITIAL_SUFFIX))?;
    let curve = reach_model.downstream_curve(&initial)?;

    let mut discharges = Vec::new();
    let mut stage = curve.min_stage();
    while stage <= curve.max_stage() + 1e-9 {
        if let Some(q) = curve.discharge_at(stage) {
            discharges.push(q.round());
        }
        stage += input.depth_increment;
    }
    discharges.sort_by(|a, b| a.total_cmp(b));
    discharges.dedup();
    if discharges.is_empty() {
        return Err(StageError::Internal(anyhow::anyhow!(
            "the initial rating curve yields no discharges to re-run"
        )));
    }

    let results = run_plan(
        ctx,
        &submodel,
        &reach_model,
        INCREMENTAL_SUFFIX,
        &discharges,
        Boundary::NormalDepth {
            slope: ctx.config.normal_depth_slope,
        },
    )?;

    let depth_grids = if input.write_depth_grids {
        write_depth_grids(&submodel, INCREMENTAL_SUFFIX, &results, &reach_model, None)?
    } else {
        0
    };

    to_result(serde_json::json!({
        "plan_suffix": INCREMENTAL_SUFFIX,
        "profiles": results.profiles.len(),
        "depth_grids": depth_grids,
        "results": submodel.results_path(INCREMENTAL_SUFFIX).display().to_string(),
    }))
}

#[derive(Debug, serde::Deserialize)]
pub struct KnownWseInput {
    pub submodel_directory: String,
    pub min_elevation: f64,
    pub max_elevation: f64,
    #[serde(default = "default_wse_increment")]
    pub depth_increment: f64,
    #[serde(default)]
    pub write_depth_grids: bool,
}

fn default_wse_increment() -> f64 {
    1.0
}

/// `run_known_wse`: the Cartesian product of the regularized discharges and
/// the boundary elevations, with combinations whose boundary sits below the
/// normal-depth water surface filtered out before simulation. The filter is
/// the correctness rule here: an unconstrained boundary would not control,
/// and simulating it would double-count the normal-depth condition in the
/// downstream rating curve.
pub fn run_known_wse(
    ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: KnownWseInput = parse_input(input)?;
    if input.depth_increment <= 0.0 || input.max_elevation < input.min_elevation {
        return Err(StageError::InvalidInput(format!(
            "elevations [{}, {}] stepped by {} do not form a range",
            input.min_elevation, input.max_elevation, input.depth_increment
        )));
    }
    let submodel = Submodel::open(&input.submodel_directory)?;
    let _lock = submodel.lock()?;
    let reach_model = ReachModel::load(&submodel)?;

    let incremental = read_results(&submodel.results_path(INCREMENTAL_SUFFIX))?;
    let curve = reach_model.downstream_curve(&incremental)?;
    let discharges: Vec<f64> = curve.points().iter().map(|&(q, _)| q).collect();

    let mut elevations = Vec::new();
    let mut e = input.min_elevation;
    while e <= input.max_elevation + 1e-9 {
        elevations.push(e);
        e += input.depth_increment;
    }

    let total = discharges.len() * elevations.len();
    let mut pairs = Vec::new();
    for &q in &discharges {
        let normal = curve.stage_at(q);
        for &e in &elevations {
            if e >= normal {
                pairs.push((q, e));
            }
        }
    }
    let filtered_out = total - pairs.len();

    if pairs.is_empty() {
        tracing::info!(total, "every combination is controlled by normal depth; nothing to run");
        return to_result(serde_json::json!({
            "plan_suffix": KNOWN_WSE_SUFFIX,
            "total": total,
            "filtered_out": filtered_out,
            "ran": 0,
            "depth_grids": 0,
        }));
    }

    let qs: Vec<f64> = pairs.iter().map(|&(q, _)| q).collect();
    let es: Vec<f64> = pairs.iter().map(|&(_, e)| e).collect();
    let results = run_plan(
        ctx,
        &submodel,
        &reach_model,
        KNOWN_WSE_SUFFIX,
        &qs,
        Boundary::KnownWse { elevations: es.clone() },
    )?;

    let depth_grids = if input.write_depth_grids {
        write_depth_grids(&submodel, KNOWN_WSE_SUFFIX, &results, &reach_model, Some(&es))?
    } else {
        0
    };

    to_result(serde_json::json!({
        "plan_suffix": KNOWN_WSE_SUFFIX,
        "total": total,
        "filtered_out": filtered_out,
        "ran": pairs.len(),
        "depth_grids": depth_grids,
    }))
}

/// The submodel's geometry and flow bounds, loaded once per stage.
pub(crate) struct ReachModel {
    pub river: String,
    pub reach: String,
    pub low_flow: f64,
    pub high_flow: f64,
    /// Downstream-most cross section's river station.
    pub ds_station: f64,
    pub centerline: LineString,
    /// (centerline station, river station) pairs, ordered by centerline
    /// station, for interpolating water surfaces along the corridor.
    pub stations: Vec<(f64, f64)>,
}

impl ReachModel {
    pub fn load(submodel: &Submodel) -> Result<ReachModel, StageError> {
        let (geometry, meta) = gpkg::read_gpkg(&submodel.gpkg_path())?;
        let need = |key: &str| -> Result<f64, StageError> {
            meta.get(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    StageError::Precondition(format!(
                        "submodel geopackage records no {key}; run extract_submodel first"
                    ))
                })
        };
        let river_line = geometry.rivers.first().ok_or_else(|| {
            StageError::Precondition("submodel geopackage holds no centerline".to_string())
        })?;
        let ds_station = geometry
            .cross_sections
            .iter()
            .map(|xs| xs.river_station)
            .fold(f64::INFINITY, f64::min);

        let mut stations: Vec<(f64, f64)> = geometry
            .cross_sections
            .iter()
            .map(|xs| {
                (
                    centerline_station(&river_line.centerline, xs),
                    xs.river_station,
                )
            })
            .collect();
        stations.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(ReachModel {
            river: river_line.river.clone(),
            reach: river_line.reach.clone(),
            low_flow: need("low_flow")?,
            high_flow: need("high_flow")?,
            ds_station,
            centerline: river_line.centerline.clone(),
            stations,
        })
    }

    pub fn downstream_curve(&self, results: &RunResults) -> Result<RatingCurve, StageError> {
        RatingCurve::from_results(results, &self.river, &self.reach, self.ds_station)
    }
}

/// Write one plan/flow generation and drive the solver over it.
fn run_plan(
    ctx: &StageContext,
    submodel: &Submodel,
    reach_model: &ReachModel,
    suffix: &str,
    discharges: &[f64],
    boundary: Boundary,
) -> Result<RunResults, StageError> {
    let format = JsonModelFormat;
    let reach = submodel.reach();

    let flow = FlowFile {
        title: format!("reach {reach} generation {suffix}"),
        suffix: suffix.to_string(),
        steady: true,
        profiles: discharges
            .iter()
            .enumerate()
            .map(|(i, &q)| FlowProfile {
                name: format!("f_{}", i + 1),
                flows: vec![ReachFlow {
                    river: reach_model.river.clone(),
                    reach: reach_model.reach.clone(),
                    discharge: q,
                }],
            })
            .collect(),
    };
    format.write_flow(&submodel.flow_path(suffix), &flow)?;

    let plan = Plan {
        title: format!("reach {reach} {}", boundary.name()),
        suffix: suffix.to_string(),
        geometry_file: format!("{reach}.gpkg"),
        flow_file: format!("{reach}.f{suffix}"),
        encroachments: false,
        boundary,
    };
    format.write_plan(&submodel.plan_path(suffix), &plan)?;

    let outcome = ctx.solver.run(&submodel.plan_path(suffix))?;
    if outcome.exit_code != 0 {
        return Err(StageError::SolverCrash(format!(
            "solver exited {} for plan {}",
            outcome.exit_code,
            submodel.plan_path(suffix).display()
        )));
    }
    read_results(&outcome.results_path)
}

/// One depth grid per profile: the water surface interpolated along the
/// corridor, minus the terrain. Grids land unclipped under the submodel's
/// depth_grids directory; `create_fim_lib` clips them into the library.
pub(crate) fn write_depth_grids(
    submodel: &Submodel,
    suffix: &str,
    results: &RunResults,
    reach_model: &ReachModel,
    boundary_elevations: Option<&[f64]>,
) -> Result<usize, StageError> {
    let terrain = raster::read_tiff(&submodel.terrain_path())?;
    let dir = submodel.depth_grid_dir(suffix);
    std::fs::create_dir_all(&dir)?;

    let mut written = 0;
    for (index, profile) in results.profiles.iter().enumerate() {
        // Water surface per cross section, keyed by centerline station.
        let mut surface: Vec<(f64, f64)> = Vec::new();
        for &(cl_station, river_station) in &reach_model.stations {
            let record = profile
                .records
                .iter()
                .min_by(|a, b| {
                    (a.station - river_station)
                        .abs()
                        .total_cmp(&(b.station - river_station).abs())
                })
                .ok_or_else(|| {
                    StageError::Internal(anyhow::anyhow!("profile {} has no records", profile.profile))
                })?;
            surface.push((cl_station, record.water_surface_elevation));
        }

        let discharge = profile
            .records
            .first()
            .map(|r| r.discharge)
            .unwrap_or_default();
        let label = match boundary_elevations {
            Some(es) => format!("{:.1}", es[index]),
            None => "z".to_string(),
        };

        let mut grid = RasterTile::empty(terrain.bbox(), terrain.dx, &terrain.crs);
        for row in 0..grid.height {
            for col in 0..grid.width {
                let center = grid.cell_center(col, row);
                let Some(ground) = terrain.sample(center.x, center.y) else {
                    continue;
                };
                let station = reach_model.centerline.project(&center).0;
                let wse = interpolate(&surface, station);
                let depth = wse - ground as f64;
                if depth > 0.0 {
                    grid.set(col, row, depth as f32);
                }
            }
        }

        raster::write_tiff(&dir.join(grid_name(discharge, &label)), &grid)?;
        written += 1;
    }
    tracing::info!(suffix, grids = written, "wrote depth grids");
    Ok(written)
}

pub(crate) fn grid_name(discharge: f64, boundary_label: &str) -> PathBuf {
    PathBuf::from(format!("{:.0}-{boundary_label}.tif", discharge.round()))
}

/// Piecewise-linear interpolation over (station, value) pairs sorted by
/// station, clamped at the ends.
fn interpolate(pairs: &[(f64, f64)], station: f64) -> f64 {
    match pairs {
        [] => 0.0,
        [only] => only.1,
        _ => {
            if station <= pairs[0].0 {
                return pairs[0].1;
            }
            for w in pairs.windows(2) {
                if station <= w[1].0 {
                    let span = w[1].0 - w[0].0;
                    if span <= 0.0 {
                        return w[0].1;
                    }
                    let t = (station - w[0].0) / span;
                    return w[0].1 + t * (w[1].1 - w[0].1);
                }
            }
            pairs[pairs.len() - 1].1
        }
    }
}
