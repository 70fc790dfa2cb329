use std::collections::BTreeMap;

/// ConflationDocument maps every visited network reach to the source-model
/// cross sections that bracket it, and records how well the two lined up.
/// It is written as `<name>.conflation.json` beside the source model and is
/// the contract between conflation and submodel extraction.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConflationDocument {
    pub metadata: ConflationMetadata,
    /// Reach ids are keys of the document itself, beside `metadata`.
    #[serde(flatten)]
    pub reaches: BTreeMap<String, ReachConflation>,
}

impl ConflationDocument {
    pub fn reach(&self, id: &str) -> Option<&ReachConflation> {
        self.reaches.get(id)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConflationMetadata {
    pub source_network: String,
    pub source_ras_model: String,
    pub length_units: String,
    pub flow_units: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReachConflation {
    pub us_xs: XsRef,
    pub ds_xs: XsRef,
    /// True when the reach intersects no cross sections but is bracketed by
    /// intersected neighbours. Eclipsed reaches carry `us_xs == ds_xs`.
    pub eclipsed: bool,
    pub low_flow: f64,
    pub high_flow: f64,
    pub network_to_id: String,
    pub metrics: ConflationMetrics,
    #[serde(default)]
    pub overlapped_reaches: Vec<String>,
    #[serde(default)]
    pub eclipsed_reaches: Vec<String>,
}

/// A reference to one cross section of the source model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct XsRef {
    pub river: String,
    pub reach: String,
    /// River station of the cross section, rendered as the model renders it.
    pub xs_id: String,
    pub min_elevation: f64,
    pub max_elevation: f64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConflationMetrics {
    pub xs: XsOffsets,
    pub lengths: Lengths,
    pub coverage: Coverage,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct XsOffsets {
    /// Mean plan-view offset between the network reach line and the
    /// source-model centerline, sampled along the overlap.
    pub centerline_offset: f64,
    /// Mean plan-view offset between cross-section thalweg points and the
    /// network reach line.
    pub thalweg_offset: f64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Lengths {
    pub ras: f64,
    pub network: f64,
    pub network_to_ras_ratio: f64,
}

/// Fractions along the network reach covered by the cross-section range,
/// each in [0, 1] with start <= end.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Coverage {
    pub start: f64,
    pub end: f64,
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> ConflationDocument {
        let xs = XsRef {
            river: "Baxter".to_string(),
            reach: "Upper".to_string(),
            xs_id: "47694.5".to_string(),
            min_elevation: 161.2,
            max_elevation: 196.0,
        };
        ConflationDocument {
            metadata: ConflationMetadata {
                source_network: "reference-network.parquet".to_string(),
                source_ras_model: "Baxter".to_string(),
                length_units: "feet".to_string(),
                flow_units: "cfs".to_string(),
            },
            reaches: BTreeMap::from([(
                "2823932".to_string(),
                ReachConflation {
                    us_xs: xs.clone(),
                    ds_xs: XsRef {
                        xs_id: "41971.4".to_string(),
                        ..xs
                    },
                    eclipsed: false,
                    low_flow: 93.6,
                    high_flow: 12500.0,
                    network_to_id: "2823934".to_string(),
                    metrics: ConflationMetrics {
                        xs: XsOffsets {
                            centerline_offset: 18.4,
                            thalweg_offset: 24.1,
                        },
                        lengths: Lengths {
                            ras: 5723.1,
                            network: 5691.0,
                            network_to_ras_ratio: 0.994,
                        },
                        coverage: Coverage {
                            start: 0.02,
                            end: 0.97,
                        },
                    },
                    overlapped_reaches: vec![],
                    eclipsed_reaches: vec!["2823930".to_string()],
                },
            )]),
        }
    }

    #[test]
    fn test_document_round_trip() {
        let doc = fixture();
        let json = serde_json::to_value(&doc).unwrap();
        // Reach ids sit at the document's top level, beside metadata.
        assert!(json.get("2823932").is_some());
        assert!(json.get("metadata").is_some());
        assert!(json.get("reaches").is_none());

        let back: ConflationDocument = serde_json::from_value(json).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_eclipsed_pairs_share_cross_sections() {
        let mut doc = fixture();
        let entry = doc.reaches.get_mut("2823932").unwrap();
        entry.eclipsed = true;
        entry.ds_xs = entry.us_xs.clone();
        assert_eq!(entry.us_xs, entry.ds_xs);
    }
}
