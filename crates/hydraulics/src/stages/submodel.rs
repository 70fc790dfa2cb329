//! `extract_submodel`: carve one reach's cross sections out of a conflated
//! source model into its own submodel directory, with discharge bounds
//! blended from the source flows and the reference network.

use super::conflation::{centerline_station, sections_between};
use super::{parse_input, to_result};
use crate::layout::{SourceModel, Submodel};
use crate::model::{GeometryFile, RiverLine};
use crate::{gpkg, StageContext, StageError};
use models::{ConflationDocument, ReachConflation, SkippedResult};
use std::collections::BTreeMap;

#[derive(Debug, serde::Deserialize)]
pub struct Input {
    pub source_model_directory: String,
    /// Parent directory of the submodel library; the reach's directory is
    /// created beneath it.
    pub submodel_directory: String,
    pub nwm_id: String,
    #[serde(default)]
    pub low_flow_multiplier: Option<f64>,
    #[serde(default)]
    pub high_flow_multiplier: Option<f64>,
    #[serde(default)]
    pub ignore_source_flows: bool,
    #[serde(default)]
    pub ignore_reference_flows: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct Output {
    pub submodel_directory: String,
    pub cross_sections: usize,
    pub low_flow: f64,
    pub high_flow: f64,
}

pub fn extract_submodel(
    ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: Input = parse_input(input)?;
    if input.ignore_source_flows && input.ignore_reference_flows {
        return Err(StageError::InvalidInput(
            "ignore_source_flows and ignore_reference_flows cannot both be set".to_string(),
        ));
    }
    let model = SourceModel::open(&input.source_model_directory)?;

    let bytes = std::fs::read(model.conflation_path()).map_err(|err| {
        StageError::Precondition(format!(
            "conflation document {}: {err}",
            model.conflation_path().display()
        ))
    })?;
    let doc: ConflationDocument = serde_json::from_slice(&bytes)?;
    let entry = doc.reach(&input.nwm_id).ok_or_else(|| {
        StageError::Precondition(format!(
            "reach {} is not present in the conflation document",
            input.nwm_id
        ))
    })?;
    if entry.eclipsed {
        tracing::info!(reach = %input.nwm_id, "reach is eclipsed; skipping extraction");
        return to_result(SkippedResult::eclipsed());
    }

    let submodel = Submodel::new(&input.submodel_directory, &input.nwm_id);
    submodel.create()?;
    let _lock = submodel.lock()?;

    let (geometry, meta) = gpkg::read_gpkg(&model.gpkg_path())?;
    let sections = sections_between(&geometry, entry);
    if sections.len() < 2 {
        return Err(StageError::Precondition(format!(
            "reach {} spans {} cross sections; at least two are required",
            input.nwm_id,
            sections.len()
        )));
    }

    let (low_flow, high_flow) = discharge_bounds(ctx, &input, entry, source_flows(&meta))?;

    // Clip the centerline to the extracted span and carry along the
    // junctions and structures the span touches.
    let river_line = geometry
        .rivers
        .iter()
        .find(|r| r.river == entry.us_xs.river && r.reach == entry.us_xs.reach)
        .ok_or_else(|| {
            StageError::Internal(anyhow::anyhow!(
                "geopackage lacks a centerline for {}/{}",
                entry.us_xs.river,
                entry.us_xs.reach
            ))
        })?;
    let s0 = centerline_station(&river_line.centerline, sections[0]);
    let s1 = centerline_station(&river_line.centerline, sections[sections.len() - 1]);
    let clipped = river_line.centerline.slice(s0, s1);

    let (max_rs, min_rs) = (sections[0].river_station, sections[sections.len() - 1].river_station);
    let submodel_geometry = GeometryFile {
        title: format!("reach {}", input.nwm_id),
        rivers: vec![RiverLine {
            river: river_line.river.clone(),
            reach: river_line.reach.clone(),
            centerline: clipped,
        }],
        cross_sections: sections.iter().map(|&xs| xs.clone()).collect(),
        junctions: geometry
            .junctions
            .iter()
            .filter(|j| {
                j.upstream
                    .iter()
                    .chain(j.downstream.iter())
                    .any(|(r, rc)| *r == entry.us_xs.river && *rc == entry.us_xs.reach)
            })
            .cloned()
            .collect(),
        structures: geometry
            .structures
            .iter()
            .filter(|s| {
                s.river == entry.us_xs.river
                    && s.reach == entry.us_xs.reach
                    && s.river_station <= max_rs
                    && s.river_station >= min_rs
            })
            .cloned()
            .collect(),
    };

    let crs = meta.get("crs").cloned().unwrap_or_default();
    let metadata = BTreeMap::from([
        ("reach_id".to_string(), input.nwm_id.clone()),
        ("network_to_id".to_string(), entry.network_to_id.clone()),
        ("low_flow".to_string(), low_flow.to_string()),
        ("high_flow".to_string(), high_flow.to_string()),
        (
            "model_name".to_string(),
            meta.get("model_name").cloned().unwrap_or_default(),
        ),
        (
            "length_units".to_string(),
            meta.get("length_units").cloned().unwrap_or_default(),
        ),
        (
            "flow_units".to_string(),
            meta.get("flow_units").cloned().unwrap_or_default(),
        ),
    ]);
    gpkg::write_gpkg(&submodel.gpkg_path(), &submodel_geometry, &crs, &metadata)?;

    tracing::info!(
        reach = %input.nwm_id,
        gpkg = %submodel.gpkg_path().display(),
        cross_sections = sections.len(),
        low_flow,
        high_flow,
        "extracted submodel"
    );
    to_result(Output {
        submodel_directory: submodel.dir().display().to_string(),
        cross_sections: sections.len(),
        low_flow,
        high_flow,
    })
}

fn source_flows(meta: &BTreeMap<String, String>) -> Option<(f64, f64)> {
    match (
        meta.get("source_min_flow").and_then(|v| v.parse().ok()),
        meta.get("source_max_flow").and_then(|v| v.parse().ok()),
    ) {
        (Some(lo), Some(hi)) => Some((lo, hi)),
        _ => None,
    }
}

/// `[min(source_min, low_mult * high_flow_threshold),
///   max(source_max, hundred_year)]`, subject to the ignore toggles.
fn discharge_bounds(
    ctx: &StageContext,
    input: &Input,
    entry: &ReachConflation,
    source: Option<(f64, f64)>,
) -> Result<(f64, f64), StageError> {
    // The conflation document already carries multiplied reference bounds;
    // explicit multipliers recompute them from the network attributes.
    let (mut ref_low, mut ref_high) = (entry.low_flow, entry.high_flow);
    if input.low_flow_multiplier.is_some() || input.high_flow_multiplier.is_some() {
        if let Some(reach) = ctx.network.get(&input.nwm_id)? {
            if let Some(mult) = input.low_flow_multiplier {
                ref_low = mult * reach.high_flow_threshold;
            }
            if let Some(mult) = input.high_flow_multiplier {
                ref_high = mult * reach.hundred_year_flow;
            }
        }
    }

    let bounds = match (input.ignore_source_flows, input.ignore_reference_flows, source) {
        (true, false, _) | (false, false, None) => (ref_low, ref_high),
        (false, true, Some((lo, hi))) => (lo, hi),
        (false, true, None) => {
            return Err(StageError::Precondition(
                "source flows were requested but the geopackage records none".to_string(),
            ))
        }
        (false, false, Some((lo, hi))) => (lo.min(ref_low), hi.max(ref_high)),
        (true, true, _) => unreachable!("rejected during input validation"),
    };
    if bounds.0 >= bounds.1 {
        return Err(StageError::InvalidInput(format!(
            "degenerate discharge bounds [{}, {}]",
            bounds.0, bounds.1
        )));
    }
    Ok(bounds)
}
