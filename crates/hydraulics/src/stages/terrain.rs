//! `create_ras_terrain`: clip the DEM to the submodel's cross-section
//! footprint, write the terrain bundle, and score how well the terrain
//! tracks the surveyed sections (the agreement document of the submodel).

use super::{parse_input, to_result};
use crate::geometry::Bbox;
use crate::layout::Submodel;
use crate::model::CrossSection;
use crate::raster::RasterTile;
use crate::solver::section_at;
use crate::{geometry, gpkg, raster, StageContext, StageError};
use models::{
    ElevationAgreement, Residuals, ResidualSummary, TerrainAgreement, XsAgreement, XsSummary,
};
use std::collections::BTreeMap;

#[derive(Debug, serde::Deserialize)]
pub struct Input {
    pub submodel_directory: String,
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    #[serde(default = "default_units")]
    pub units: String,
}

fn default_resolution() -> f64 {
    3.0
}

fn default_units() -> String {
    "feet".to_string()
}

#[derive(Debug, serde::Serialize)]
pub struct Output {
    pub terrain: String,
    pub agreement: String,
    pub cross_sections: usize,
    pub model_rmse: f64,
}

pub fn create_ras_terrain(
    ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: Input = parse_input(input)?;
    if input.resolution <= 0.0 {
        return Err(StageError::InvalidInput(format!(
            "resolution {} must be positive",
            input.resolution
        )));
    }
    let submodel = Submodel::open(&input.submodel_directory)?;
    let _lock = submodel.lock()?;
    let (geometry, _) = gpkg::read_gpkg(&submodel.gpkg_path())?;

    let footprint = Bbox::of_points(
        geometry
            .cross_sections
            .iter()
            .flat_map(|xs| xs.line.points().iter().copied()),
    )
    .ok_or_else(|| {
        StageError::Precondition("submodel geopackage holds no cross sections".to_string())
    })?
    .buffer(ctx.config.terrain_buffer);

    let tile = ctx.dem.read(&footprint, input.resolution, &input.units)?;
    raster::write_tiff(&submodel.terrain_path(), &tile)?;

    let agreement = agreement(&geometry.cross_sections, &tile);
    std::fs::create_dir_all(submodel.terrain_dir())?;
    std::fs::write(
        submodel.agreement_path(),
        serde_json::to_vec_pretty(&agreement)?,
    )?;

    tracing::info!(
        terrain = %submodel.terrain_path().display(),
        cross_sections = geometry.cross_sections.len(),
        rmse = agreement.summary.residuals.rmse,
        "wrote terrain bundle"
    );
    to_result(Output {
        terrain: submodel.terrain_path().display().to_string(),
        agreement: submodel.agreement_path().display().to_string(),
        cross_sections: geometry.cross_sections.len(),
        model_rmse: agreement.summary.residuals.rmse,
    })
}

/// Sampled profile pair of one cross section: the surveyed elevations and
/// the terrain elevations at the same stations.
struct ProfilePair {
    stations: Vec<f64>,
    model: Vec<f64>,
    dem: Vec<f64>,
}

fn sample_pair(xs: &CrossSection, tile: &RasterTile) -> Option<ProfilePair> {
    let max_station = xs.station_elevation.last().map(|&(s, _)| s)?;
    if max_station <= 0.0 {
        return None;
    }
    let line_len = xs.line.length();
    let mut pair = ProfilePair {
        stations: Vec::new(),
        model: Vec::new(),
        dem: Vec::new(),
    };
    for &(station, z) in &xs.station_elevation {
        let point = xs.line.point_at(station / max_station * line_len);
        if let Some(ground) = tile.sample(point.x, point.y) {
            pair.stations.push(station);
            pair.model.push(z);
            pair.dem.push(ground as f64);
        }
    }
    (pair.model.len() >= 3).then_some(pair)
}

pub(crate) fn agreement(sections: &[CrossSection], tile: &RasterTile) -> TerrainAgreement {
    let mut xs_out = BTreeMap::new();
    let mut pooled_model = Vec::new();
    let mut pooled_dem = Vec::new();

    for xs in sections {
        let Some(pair) = sample_pair(xs, tile) else {
            continue;
        };

        let min_z = pair.model.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_z = pair.model.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = max_z - min_z;
        let mut elevation = BTreeMap::new();
        for e in geometry::linspace(min_z + 0.2 * range, max_z, 5) {
            elevation.insert(format!("{e:.1}"), slice_metrics(&pair, e));
        }

        pooled_model.extend_from_slice(&pair.model);
        pooled_dem.extend_from_slice(&pair.dem);
        xs_out.insert(
            xs.id(),
            XsAgreement {
                elevation,
                summary: profile_summary(&pair, max_z),
            },
        );
    }

    TerrainAgreement {
        xs: xs_out,
        summary: ResidualSummary {
            residuals: residual_stats(&pooled_model, &pooled_dem),
        },
    }
}

/// Agreement between the two profiles at one water-surface elevation.
fn slice_metrics(pair: &ProfilePair, e: f64) -> ElevationAgreement {
    let weights = station_weights(&pair.stations);
    let pairs = |zs: &[f64]| -> Vec<(f64, f64)> {
        pair.stations.iter().copied().zip(zs.iter().copied()).collect()
    };
    let model_section = section_at(&pairs(&pair.model), e);
    let dem_section = section_at(&pairs(&pair.dem), e);

    let mut inter = 0.0;
    let mut union = 0.0;
    let mut area_min = 0.0;
    let mut area_max = 0.0;
    let mut wet_model = Vec::new();
    let mut wet_dem = Vec::new();
    for i in 0..pair.model.len() {
        let dm = (e - pair.model[i]).max(0.0);
        let dd = (e - pair.dem[i]).max(0.0);
        let w = weights[i];
        if dm > 0.0 && dd > 0.0 {
            inter += w;
        }
        if dm > 0.0 || dd > 0.0 {
            union += w;
            wet_model.push(pair.model[i]);
            wet_dem.push(pair.dem[i]);
        }
        area_min += w * dm.min(dd);
        area_max += w * dm.max(dd);
    }

    ElevationAgreement {
        inundation_overlap: if union > 0.0 { inter / union } else { 1.0 },
        flow_area_overlap: if area_max > 0.0 { area_min / area_max } else { 1.0 },
        top_width_agreement: ratio(model_section.top_width, dem_section.top_width),
        flow_area_agreement: ratio(model_section.area, dem_section.area),
        hydraulic_radius_agreement: ratio(
            model_section.hydraulic_radius(),
            dem_section.hydraulic_radius(),
        ),
        residuals: residual_stats(&wet_model, &wet_dem),
    }
}

fn profile_summary(pair: &ProfilePair, max_z: f64) -> XsSummary {
    let model = &pair.model;
    let dem = &pair.dem;
    let residuals = residual_stats(model, dem);

    let dem_mean = mean(dem);
    let ss_res: f64 = model
        .iter()
        .zip(dem)
        .map(|(m, d)| (d - m) * (d - m))
        .sum();
    let ss_tot: f64 = dem.iter().map(|d| (d - dem_mean) * (d - dem_mean)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    // Shape comparisons are insensitive to the absolute datum; work on
    // depths below the section's crown.
    let m_depth: Vec<f64> = model.iter().map(|z| max_z - z).collect();
    let d_depth: Vec<f64> = dem.iter().map(|z| max_z - z).collect();
    let dot: f64 = m_depth.iter().zip(&d_depth).map(|(a, b)| a * b).sum();
    let norm = |v: &[f64]| v.iter().map(|a| a * a).sum::<f64>().sqrt();
    let spectral_angle = if norm(&m_depth) > 0.0 && norm(&d_depth) > 0.0 {
        (dot / (norm(&m_depth) * norm(&d_depth))).clamp(-1.0, 1.0).acos()
    } else {
        0.0
    };

    let diffs = |v: &[f64]| -> Vec<f64> { v.windows(2).map(|w| w[1] - w[0]).collect() };
    let spectral_correlation = pearson(&diffs(model), &diffs(dem));
    let correlation = pearson(model, dem);

    let mut max_cross_correlation = correlation;
    let max_lag = (model.len() / 4).min(3);
    for lag in 1..=max_lag {
        let forward = pearson(&model[lag..], &dem[..dem.len() - lag]);
        let backward = pearson(&model[..model.len() - lag], &dem[lag..]);
        max_cross_correlation = max_cross_correlation.max(forward).max(backward);
    }

    let thalweg_elevation_difference = dem.iter().cloned().fold(f64::INFINITY, f64::min)
        - model.iter().cloned().fold(f64::INFINITY, f64::min);

    XsSummary {
        agreement: ElevationAgreement {
            inundation_overlap: 1.0,
            flow_area_overlap: 1.0,
            top_width_agreement: 1.0,
            flow_area_agreement: 1.0,
            hydraulic_radius_agreement: 1.0,
            residuals,
        },
        r_squared,
        spectral_angle,
        spectral_correlation,
        correlation,
        max_cross_correlation,
        thalweg_elevation_difference,
    }
}

/// Half-distance weights of irregularly spaced stations.
fn station_weights(stations: &[f64]) -> Vec<f64> {
    let n = stations.len();
    (0..n)
        .map(|i| {
            let left = if i > 0 { stations[i] - stations[i - 1] } else { 0.0 };
            let right = if i + 1 < n { stations[i + 1] - stations[i] } else { 0.0 };
            (left + right) / 2.0
        })
        .collect()
}

fn ratio(a: f64, b: f64) -> f64 {
    if a <= 0.0 && b <= 0.0 {
        1.0
    } else {
        a.min(b) / a.max(b)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return 0.0;
    }
    let (ma, mb) = (mean(a), mean(b));
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma) * (x - ma);
        vb += (y - mb) * (y - mb);
    }
    if va > 0.0 && vb > 0.0 {
        cov / (va.sqrt() * vb.sqrt())
    } else {
        0.0
    }
}

/// Residuals are terrain minus survey, elementwise.
fn residual_stats(model: &[f64], dem: &[f64]) -> Residuals {
    let residuals: Vec<f64> = dem.iter().zip(model).map(|(d, m)| d - m).collect();
    if residuals.is_empty() {
        return Residuals::default();
    }
    let m = mean(&residuals);
    let var = residuals.iter().map(|r| (r - m) * (r - m)).sum::<f64>() / residuals.len() as f64;
    let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt();
    let mut sorted = residuals.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let z_range = model.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        - model.iter().cloned().fold(f64::INFINITY, f64::min);
    Residuals {
        mean: m,
        std: var.sqrt(),
        max: *sorted.last().unwrap(),
        min: sorted[0],
        p_25: percentile(&sorted, 0.25),
        p_50: percentile(&sorted, 0.50),
        p_75: percentile(&sorted, 0.75),
        rmse,
        normalized_rmse: if z_range > 0.0 { rmse / z_range } else { 0.0 },
    }
}
