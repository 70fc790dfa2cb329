//! `ras_to_gpkg`: scan a source-model directory, select its primary plan,
//! and extract the geometry into a geopackage beside the source files.

use super::{parse_input, to_result};
use crate::layout::SourceModel;
use crate::model::{select_primary_plan, JsonModelFormat, ModelFormat, Plan};
use crate::{gpkg, StageContext, StageError};
use std::collections::BTreeMap;

#[derive(Debug, serde::Deserialize)]
pub struct Input {
    pub source_model_directory: String,
    #[serde(default = "default_crs")]
    pub crs: String,
}

fn default_crs() -> String {
    "EPSG:4326".to_string()
}

#[derive(Debug, serde::Serialize)]
pub struct Output {
    pub geopackage: String,
    pub primary_plan: String,
    pub cross_sections: usize,
    pub rivers: usize,
    pub junctions: usize,
    pub structures: usize,
}

pub fn ras_to_gpkg(
    _ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: Input = parse_input(input)?;
    let model = SourceModel::open(&input.source_model_directory)?;
    let format = JsonModelFormat;

    let project = format.read_project(&model.project_path())?;
    let suffixes = model.plan_suffixes()?;
    if suffixes.is_empty() {
        return Err(StageError::NotASourceModel(format!(
            "{} contains no plan files",
            model.root().display()
        )));
    }
    let plans = suffixes
        .iter()
        .map(|suffix| format.read_plan(&model.plan_path(suffix)))
        .collect::<Result<Vec<Plan>, _>>()?;
    let plan = select_primary_plan(&plans, project.active_plan.as_deref())?;

    let flow = format.read_flow(&model.root().join(&plan.flow_file))?;
    if !flow.steady {
        return Err(StageError::UnsteadyFlowUnsupported(format!(
            "primary plan {} references unsteady flow file {}",
            plan.suffix, plan.flow_file
        )));
    }
    let geometry = format.read_geometry(&model.root().join(&plan.geometry_file))?;

    let mut metadata = BTreeMap::from([
        ("model_name".to_string(), model.name().to_string()),
        ("primary_plan".to_string(), plan.suffix.clone()),
        ("length_units".to_string(), project.length_units.clone()),
        ("flow_units".to_string(), project.flow_units.clone()),
    ]);
    if let Some((lo, hi)) = flow.discharge_range() {
        metadata.insert("source_min_flow".to_string(), lo.to_string());
        metadata.insert("source_max_flow".to_string(), hi.to_string());
    }

    gpkg::write_gpkg(&model.gpkg_path(), &geometry, &input.crs, &metadata)?;
    tracing::info!(
        gpkg = %model.gpkg_path().display(),
        cross_sections = geometry.cross_sections.len(),
        "extracted geopackage"
    );

    to_result(Output {
        geopackage: model.gpkg_path().display().to_string(),
        primary_plan: plan.suffix.clone(),
        cross_sections: geometry.cross_sections.len(),
        rivers: geometry.rivers.len(),
        junctions: geometry.junctions.len(),
        structures: geometry.structures.len(),
    })
}
