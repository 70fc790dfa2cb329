//! The source-model file containers: project, geometry, plan, and flow.
//! Their on-disk binary layout is outside this crate's scope; the engine
//! reads and writes the documented field set through the `ModelFormat`
//! adapter. The default adapter encodes those fields as JSON inside the
//! container files; the native codec plugs in behind the same trait.

use crate::geometry::{LineString, Point, Polygon};
use crate::StageError;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Project {
    pub title: String,
    /// Suffix of the plan marked current in the project, e.g. "01".
    pub active_plan: Option<String>,
    pub length_units: String,
    pub flow_units: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeometryFile {
    pub title: String,
    pub rivers: Vec<RiverLine>,
    pub cross_sections: Vec<CrossSection>,
    #[serde(default)]
    pub junctions: Vec<Junction>,
    #[serde(default)]
    pub structures: Vec<Structure>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RiverLine {
    pub river: String,
    pub reach: String,
    /// Digitized upstream to downstream.
    pub centerline: LineString,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CrossSection {
    pub river: String,
    pub reach: String,
    /// Stationing along the river, decreasing downstream.
    pub river_station: f64,
    /// Digitized across the channel, bank to bank.
    pub line: LineString,
    /// (station, elevation) samples across the section.
    pub station_elevation: Vec<(f64, f64)>,
    /// Manning roughness of the main channel.
    pub roughness: f64,
}

impl CrossSection {
    /// The station id as the model renders it, e.g. "47694.5".
    pub fn id(&self) -> String {
        format_station(self.river_station)
    }

    pub fn min_elevation(&self) -> f64 {
        self.station_elevation
            .iter()
            .map(|&(_, z)| z)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max_elevation(&self) -> f64 {
        self.station_elevation
            .iter()
            .map(|&(_, z)| z)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Plan-view location of the section's lowest point.
    pub fn thalweg_point(&self) -> Point {
        let (min_sta, _) = self
            .station_elevation
            .iter()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0.0, 0.0));
        let max_sta = self
            .station_elevation
            .last()
            .map(|&(s, _)| s)
            .filter(|&s| s > 0.0)
            .unwrap_or(1.0);
        self.line.point_at(min_sta / max_sta * self.line.length())
    }

    pub fn xs_ref(&self) -> models::XsRef {
        models::XsRef {
            river: self.river.clone(),
            reach: self.reach.clone(),
            xs_id: self.id(),
            min_elevation: self.min_elevation(),
            max_elevation: self.max_elevation(),
        }
    }
}

pub fn format_station(station: f64) -> String {
    if station.fract() == 0.0 {
        format!("{station:.0}")
    } else {
        format!("{station}")
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Junction {
    pub name: String,
    pub location: Point,
    /// (river, reach) pairs flowing into and out of the junction.
    pub upstream: Vec<(String, String)>,
    pub downstream: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Polygon>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Structure {
    pub river: String,
    pub reach: String,
    pub river_station: f64,
    pub kind: String,
    pub line: LineString,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Plan {
    pub title: String,
    /// This plan's own suffix, e.g. "01".
    pub suffix: String,
    /// File name of the geometry this plan runs against, relative to the
    /// plan: either a container (`Baxter.g01`) or a reach geopackage.
    pub geometry_file: String,
    /// File name of the flow file, relative to the plan.
    pub flow_file: String,
    /// Plans with encroachments encode floodway constrictions and are never
    /// selected as the primary plan.
    #[serde(default)]
    pub encroachments: bool,
    pub boundary: Boundary,
}

/// The downstream boundary condition of a steady-flow plan.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Boundary {
    /// Normal depth from an energy slope.
    NormalDepth { slope: f64 },
    /// A known water-surface elevation per profile, parallel to the flow
    /// file's profile list.
    KnownWse { elevations: Vec<f64> },
}

impl Boundary {
    pub fn name(&self) -> &'static str {
        match self {
            Boundary::NormalDepth { .. } => "normal_depth",
            Boundary::KnownWse { .. } => "known_wse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FlowFile {
    pub title: String,
    pub suffix: String,
    pub steady: bool,
    pub profiles: Vec<FlowProfile>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FlowProfile {
    pub name: String,
    pub flows: Vec<ReachFlow>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReachFlow {
    pub river: String,
    pub reach: String,
    pub discharge: f64,
}

impl FlowFile {
    /// Smallest and largest discharge across all profiles and reaches.
    pub fn discharge_range(&self) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for q in self
            .profiles
            .iter()
            .flat_map(|p| p.flows.iter().map(|f| f.discharge))
        {
            range = Some(match range {
                None => (q, q),
                Some((lo, hi)) => (lo.min(q), hi.max(q)),
            });
        }
        range
    }
}

/// Adapter over the opaque container formats.
pub trait ModelFormat: Send + Sync {
    fn read_project(&self, path: &Path) -> Result<Project, StageError>;
    fn read_geometry(&self, path: &Path) -> Result<GeometryFile, StageError>;
    fn read_plan(&self, path: &Path) -> Result<Plan, StageError>;
    fn read_flow(&self, path: &Path) -> Result<FlowFile, StageError>;
    fn write_plan(&self, path: &Path, plan: &Plan) -> Result<(), StageError>;
    fn write_flow(&self, path: &Path, flow: &FlowFile) -> Result<(), StageError>;
}

/// The default container codec: the documented field set, encoded as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonModelFormat;

impl JsonModelFormat {
    fn read<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T, StageError> {
        let bytes = std::fs::read(path).map_err(|err| {
            StageError::Precondition(format!("{}: {err}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            StageError::NotASourceModel(format!("{}: {err}", path.display()))
        })
    }

    fn write<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), StageError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl ModelFormat for JsonModelFormat {
    fn read_project(&self, path: &Path) -> Result<Project, StageError> {
        self.read(path)
    }
    fn read_geometry(&self, path: &Path) -> Result<GeometryFile, StageError> {
        self.read(path)
    }
    fn read_plan(&self, path: &Path) -> Result<Plan, StageError> {
        self.read(path)
    }
    fn read_flow(&self, path: &Path) -> Result<FlowFile, StageError> {
        self.read(path)
    }
    fn write_plan(&self, path: &Path, plan: &Plan) -> Result<(), StageError> {
        self.write(path, plan)
    }
    fn write_flow(&self, path: &Path, flow: &FlowFile) -> Result<(), StageError> {
        self.write(path, flow)
    }
}

/// Select the primary plan: the active plan if it has no encroachments,
/// otherwise the first plan without encroachments, otherwise `NoValidPlan`.
pub fn select_primary_plan<'p>(
    plans: &'p [Plan],
    active: Option<&str>,
) -> Result<&'p Plan, StageError> {
    if let Some(active) = active {
        if let Some(plan) = plans.iter().find(|p| p.suffix == active) {
            if !plan.encroachments {
                return Ok(plan);
            }
        }
    }
    plans
        .iter()
        .find(|p| !p.encroachments)
        .ok_or_else(|| StageError::NoValidPlan("every plan carries encroachments".to_string()))
}
