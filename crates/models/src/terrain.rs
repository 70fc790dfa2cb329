use std::collections::BTreeMap;

/// TerrainAgreement reports how closely the downloaded terrain raster tracks
/// the surveyed cross-section geometry, per cross section and per elevation
/// slice, plus model-level aggregates.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TerrainAgreement {
    pub xs: BTreeMap<String, XsAgreement>,
    pub summary: ResidualSummary,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct XsAgreement {
    /// Keyed by the evaluation elevation rendered to one decimal place.
    pub elevation: BTreeMap<String, ElevationAgreement>,
    pub summary: XsSummary,
}

/// Agreement metrics at one water-surface elevation slice of one cross section.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ElevationAgreement {
    pub inundation_overlap: f64,
    pub flow_area_overlap: f64,
    pub top_width_agreement: f64,
    pub flow_area_agreement: f64,
    pub hydraulic_radius_agreement: f64,
    pub residuals: Residuals,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Residuals {
    pub mean: f64,
    pub std: f64,
    pub max: f64,
    pub min: f64,
    pub p_25: f64,
    pub p_50: f64,
    pub p_75: f64,
    pub rmse: f64,
    pub normalized_rmse: f64,
}

/// Whole-profile summary of one cross section: the residual statistics plus
/// profile-shape comparisons between the surveyed and DEM-sampled sections.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct XsSummary {
    #[serde(flatten)]
    pub agreement: ElevationAgreement,
    pub r_squared: f64,
    pub spectral_angle: f64,
    pub spectral_correlation: f64,
    pub correlation: f64,
    pub max_cross_correlation: f64,
    pub thalweg_elevation_difference: f64,
}

/// Model-level aggregate: residual statistics pooled across cross sections.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResidualSummary {
    pub residuals: Residuals,
}
