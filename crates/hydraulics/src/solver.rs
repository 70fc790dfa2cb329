//! The hydraulic solver seam. The engine never links the solver; it writes
//! a plan/flow/geometry triple, invokes `Solver::run`, and reads the
//! results bundle back through `read_results`. The production
//! implementation shells out to the configured solver binary; the
//! synthetic implementation computes Manning normal depths from the
//! cross-section geometry so tests and local development get monotone,
//! physically plausible rating curves without the external binary.

use crate::model::{Boundary, CrossSection, JsonModelFormat, ModelFormat};
use crate::{gpkg, StageError};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub exit_code: i32,
    pub results_path: PathBuf,
}

pub trait Solver: Send + Sync {
    /// Run the plan at `plan_path`, producing a results bundle.
    fn run(&self, plan_path: &Path) -> Result<SolverOutcome, StageError>;
}

/// The results bundle: per profile, a record per cross section.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunResults {
    pub plan_suffix: String,
    pub profiles: Vec<ProfileResults>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProfileResults {
    pub profile: String,
    pub records: Vec<ResultRecord>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResultRecord {
    pub river: String,
    pub reach: String,
    pub station: f64,
    pub discharge: f64,
    pub water_surface_elevation: f64,
    pub velocity: f64,
}

/// `<reach>.p01 -> <reach>.r01`
pub fn results_path_for(plan_path: &Path) -> PathBuf {
    let name = plan_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let renamed = match name.rfind(".p") {
        Some(at) => format!("{}.r{}", &name[..at], &name[at + 2..]),
        None => format!("{name}.results"),
    };
    plan_path.with_file_name(renamed)
}

pub fn read_results(path: &Path) -> Result<RunResults, StageError> {
    let bytes = std::fs::read(path).map_err(|err| {
        StageError::Precondition(format!("results {}: {err}", path.display()))
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn write_results(path: &Path, results: &RunResults) -> Result<(), StageError> {
    std::fs::write(path, serde_json::to_vec_pretty(results)?)?;
    Ok(())
}

/// Invokes the external solver binary with the plan path as its argument.
pub struct ExternalSolver {
    bin: PathBuf,
}

impl ExternalSolver {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Solver for ExternalSolver {
    fn run(&self, plan_path: &Path) -> Result<SolverOutcome, StageError> {
        tracing::info!(bin = %self.bin.display(), plan = %plan_path.display(), "invoking solver");
        let status = std::process::Command::new(&self.bin)
            .arg(plan_path)
            .status()
            .map_err(|err| {
                StageError::SolverCrash(format!("failed to start {}: {err}", self.bin.display()))
            })?;
        Ok(SolverOutcome {
            exit_code: status.code().unwrap_or(-1),
            results_path: results_path_for(plan_path),
        })
    }
}

// Manning coefficient for US customary units; metric uses 1.0.
fn manning_k(units: &str) -> f64 {
    match units {
        "meters" | "metric" | "si" => 1.0,
        _ => 1.486,
    }
}

/// Wetted-section properties at a water-surface elevation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Section {
    pub area: f64,
    pub top_width: f64,
    pub wetted_perimeter: f64,
}

impl Section {
    pub fn hydraulic_radius(&self) -> f64 {
        if self.wetted_perimeter > 0.0 {
            self.area / self.wetted_perimeter
        } else {
            0.0
        }
    }
}

/// Integrate area, top width, and wetted perimeter of the station-elevation
/// profile below `wse`.
pub fn section_at(station_elevation: &[(f64, f64)], wse: f64) -> Section {
    let mut out = Section::default();
    for w in station_elevation.windows(2) {
        let ((s0, z0), (s1, z1)) = (w[0], w[1]);
        let dx = s1 - s0;
        if dx <= 0.0 {
            continue;
        }
        let (d0, d1) = (wse - z0, wse - z1);
        if d0 <= 0.0 && d1 <= 0.0 {
            continue;
        }
        // Clip the segment to the waterline.
        let (d0c, d1c, frac) = if d0 > 0.0 && d1 > 0.0 {
            (d0, d1, 1.0)
        } else if d0 > 0.0 {
            (d0, 0.0, d0 / (d0 - d1))
        } else {
            (0.0, d1, d1 / (d1 - d0))
        };
        let width = dx * frac;
        out.area += 0.5 * (d0c + d1c) * width;
        out.top_width += width;
        out.wetted_perimeter += (width * width + (d0c - d1c) * (d0c - d1c)).sqrt();
    }
    out
}

/// Manning discharge through the section at `wse`.
pub fn manning_q(xs: &CrossSection, wse: f64, slope: f64, units: &str) -> f64 {
    let section = section_at(&xs.station_elevation, wse);
    if section.area <= 0.0 {
        return 0.0;
    }
    manning_k(units) / xs.roughness
        * section.area
        * section.hydraulic_radius().powf(2.0 / 3.0)
        * slope.sqrt()
}

/// The steady-flow water surface at the section for `q`, computed with a
/// slope boundary by bisection on the monotone Manning relation.
pub fn normal_depth(xs: &CrossSection, q: f64, slope: f64, units: &str) -> f64 {
    let lo0 = xs.min_elevation();
    // Headroom above the surveyed section accommodates flows that overtop it.
    let hi0 = xs.max_elevation() + 50.0;
    if q <= 0.0 {
        return lo0;
    }
    let (mut lo, mut hi) = (lo0, hi0);
    if manning_q(xs, hi, slope, units) < q {
        return hi;
    }
    for _ in 0..64 {
        let mid = 0.5 * (lo + hi);
        if manning_q(xs, mid, slope, units) < q {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// A monotone, finite discharge-to-stage curve at one cross section.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingCurve(Vec<(f64, f64)>);

impl RatingCurve {
    /// Build the curve at the record nearest `station` on (river, reach).
    pub fn from_results(
        results: &RunResults,
        river: &str,
        reach: &str,
        station: f64,
    ) -> Result<RatingCurve, StageError> {
        let mut points = Vec::new();
        for profile in &results.profiles {
            let record = profile
                .records
                .iter()
                .filter(|r| r.river == river && r.reach == reach)
                .min_by(|a, b| {
                    (a.station - station)
                        .abs()
                        .total_cmp(&(b.station - station).abs())
                })
                .ok_or_else(|| {
                    StageError::Internal(anyhow::anyhow!(
                        "results carry no records for {river}/{reach}"
                    ))
                })?;
            points.push((record.discharge, record.water_surface_elevation));
        }
        if points.is_empty() {
            return Err(StageError::Internal(anyhow::anyhow!(
                "results carry no profiles"
            )));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        points.dedup_by(|a, b| a.0 == b.0);
        Ok(RatingCurve(points))
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.0
    }

    pub fn min_stage(&self) -> f64 {
        self.0.iter().map(|p| p.1).fold(f64::INFINITY, f64::min)
    }

    pub fn max_stage(&self) -> f64 {
        self.0.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max)
    }

    /// Stage at `q`, by linear interpolation, clamped to the curve's ends.
    pub fn stage_at(&self, q: f64) -> f64 {
        let pts = &self.0;
        if q <= pts[0].0 {
            return pts[0].1;
        }
        for w in pts.windows(2) {
            if q <= w[1].0 {
                let t = (q - w[0].0) / (w[1].0 - w[0].0);
                return w[0].1 + t * (w[1].1 - w[0].1);
            }
        }
        pts[pts.len() - 1].1
    }

    /// Discharge producing `stage`, by inverse interpolation; None outside
    /// the curve's stage range.
    pub fn discharge_at(&self, stage: f64) -> Option<f64> {
        let pts = &self.0;
        if stage < pts[0].1 || stage > pts[pts.len() - 1].1 {
            return None;
        }
        for w in pts.windows(2) {
            if stage <= w[1].1 {
                if w[1].1 == w[0].1 {
                    return Some(w[0].0);
                }
                let t = (stage - w[0].1) / (w[1].1 - w[0].1);
                return Some(w[0].0 + t * (w[1].0 - w[0].0));
            }
        }
        Some(pts[pts.len() - 1].0)
    }
}

/// The deterministic in-process solver used by tests and by deployments
/// with no external binary configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticSolver {
    pub units: UnitsHint,
}

#[derive(Debug, Default, Clone, Copy)]
pub enum UnitsHint {
    #[default]
    UsCustomary,
    Metric,
}

impl UnitsHint {
    fn as_str(&self) -> &'static str {
        match self {
            UnitsHint::UsCustomary => "feet",
            UnitsHint::Metric => "meters",
        }
    }
}

impl Solver for SyntheticSolver {
    fn run(&self, plan_path: &Path) -> Result<SolverOutcome, StageError> {
        let format = JsonModelFormat;
        let dir = plan_path.parent().unwrap_or_else(|| Path::new("."));
        let plan = format.read_plan(plan_path)?;
        let flow = format.read_flow(&dir.join(&plan.flow_file))?;

        let geometry_path = dir.join(&plan.geometry_file);
        let cross_sections = if plan.geometry_file.ends_with(".gpkg") {
            gpkg::read_gpkg(&geometry_path)?.0.cross_sections
        } else {
            format.read_geometry(&geometry_path)?.cross_sections
        };
        if cross_sections.is_empty() {
            return Err(StageError::Internal(anyhow::anyhow!(
                "plan geometry {} holds no cross sections",
                geometry_path.display()
            )));
        }
        let units = self.units.as_str();

        let mut profiles = Vec::with_capacity(flow.profiles.len());
        for (index, profile) in flow.profiles.iter().enumerate() {
            let mut records = Vec::new();
            for reach_flow in &profile.flows {
                let q = reach_flow.discharge;
                // Cross sections of this reach, downstream first.
                let mut sections: Vec<&CrossSection> = cross_sections
                    .iter()
                    .filter(|xs| xs.river == reach_flow.river && xs.reach == reach_flow.reach)
                    .collect();
                sections.sort_by(|a, b| a.river_station.total_cmp(&b.river_station));

                let mut downstream_wse = None;
                for xs in &sections {
                    let nd = match &plan.boundary {
                        Boundary::NormalDepth { slope } => normal_depth(xs, q, *slope, units),
                        // The known boundary applies at the downstream
                        // section; upstream sections fall back to a normal
                        // slope consistent with the initial runs.
                        Boundary::KnownWse { .. } => normal_depth(xs, q, 0.001, units),
                    };
                    let wse = match (downstream_wse, &plan.boundary) {
                        (None, Boundary::KnownWse { elevations }) => {
                            let e = *elevations.get(index).ok_or_else(|| {
                                StageError::Internal(anyhow::anyhow!(
                                    "plan has {} boundary elevations for {} profiles",
                                    elevations.len(),
                                    flow.profiles.len()
                                ))
                            })?;
                            // A boundary below normal depth would not
                            // control; the water surface stays at normal.
                            e.max(nd)
                        }
                        // Backwater floor: a section never sits below the
                        // pool established downstream.
                        (Some(ds), _) => nd.max(ds),
                        (None, Boundary::NormalDepth { .. }) => nd,
                    };
                    downstream_wse = Some(wse);

                    let section = section_at(&xs.station_elevation, wse);
                    records.push(ResultRecord {
                        river: xs.river.clone(),
                        reach: xs.reach.clone(),
                        station: xs.river_station,
                        discharge: q,
                        water_surface_elevation: wse,
                        velocity: if section.area > 0.0 { q / section.area } else { 0.0 },
                    });
                }
            }
            profiles.push(ProfileResults {
                profile: profile.name.clone(),
                records,
            });
        }

        let results_path = results_path_for(plan_path);
        write_results(
            &results_path,
            &RunResults {
                plan_suffix: plan.suffix.clone(),
                profiles,
            },
        )?;
        Ok(SolverOutcome {
            exit_code: 0,
            results_path,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::{LineString, Point};

    // A symmetric triangular channel, 1:1 side slopes, invert at 160.
    fn xs(station: f64) -> CrossSection {
        CrossSection {
            river: "Baxter".to_string(),
            reach: "Upper".to_string(),
            river_station: station,
            line: LineString::new(vec![
                Point::new(station, -40.0),
                Point::new(station, 40.0),
            ]),
            station_elevation: vec![(0.0, 200.0), (40.0, 160.0), (80.0, 200.0)],
            roughness: 0.035,
        }
    }

    #[test]
    fn test_section_properties_triangle() {
        let section = section_at(&xs(0.0).station_elevation, 170.0);
        // Depth 10 in a 1:1 triangle: area = d^2, width = 2d.
        assert!((section.area - 100.0).abs() < 1e-9);
        assert!((section.top_width - 20.0).abs() < 1e-9);
        assert!(section.wetted_perimeter > section.top_width);

        let dry = section_at(&xs(0.0).station_elevation, 150.0);
        assert_eq!(dry.area, 0.0);
    }

    #[test]
    fn test_normal_depth_is_monotone_in_discharge() {
        let xs = xs(1000.0);
        let w1 = normal_depth(&xs, 100.0, 0.001, "feet");
        let w2 = normal_depth(&xs, 1000.0, 0.001, "feet");
        let w3 = normal_depth(&xs, 5000.0, 0.001, "feet");
        assert!(w1 > 160.0);
        assert!(w2 > w1);
        assert!(w3 > w2);

        // The bisection converges: Manning flow at the answer matches q.
        let q = manning_q(&xs, w2, 0.001, "feet");
        assert!((q - 1000.0).abs() / 1000.0 < 1e-6);
    }

    #[test]
    fn test_rating_curve_interpolation() {
        let curve = RatingCurve(vec![(100.0, 161.0), (200.0, 162.0), (400.0, 164.0)]);
        assert_eq!(curve.stage_at(150.0), 161.5);
        assert_eq!(curve.stage_at(50.0), 161.0);
        assert_eq!(curve.stage_at(500.0), 164.0);
        assert_eq!(curve.discharge_at(163.0), Some(300.0));
        assert_eq!(curve.discharge_at(160.0), None);
        assert_eq!(curve.discharge_at(165.0), None);
        assert_eq!(curve.min_stage(), 161.0);
        assert_eq!(curve.max_stage(), 164.0);
    }

    #[test]
    fn test_results_path() {
        assert_eq!(
            results_path_for(Path::new("/m/2823932/2823932.p02")),
            Path::new("/m/2823932/2823932.r02")
        );
    }
}
