//! `conflate_model` and `compute_conflation_metrics`: associate the source
//! model's cross sections with reference-network reaches, producing the
//! conflation document that scopes every downstream stage.

use super::{parse_input, to_result};
use crate::geometry::LineString;
use crate::gpkg;
use crate::layout::SourceModel;
use crate::model::{CrossSection, GeometryFile, Junction};
use crate::sources::{NetworkProvider, Reach};
use crate::{StageContext, StageError};
use models::{
    ConflationDocument, ConflationMetadata, ConflationMetrics, Coverage, Lengths, ReachConflation,
    XsOffsets,
};
use std::collections::BTreeMap;

#[derive(Debug, serde::Deserialize)]
pub struct Input {
    pub source_model_directory: String,
    #[serde(default = "default_low_multiplier")]
    pub low_flow_multiplier: f64,
    #[serde(default = "default_high_multiplier")]
    pub high_flow_multiplier: f64,
    #[serde(default)]
    pub source_network: Option<String>,
}

fn default_low_multiplier() -> f64 {
    0.9
}

fn default_high_multiplier() -> f64 {
    1.2
}

#[derive(Debug, serde::Serialize)]
pub struct Output {
    pub document: String,
    pub reaches: usize,
    pub eclipsed: usize,
}

pub fn conflate_model(
    ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: Input = parse_input(input)?;
    let model = SourceModel::open(&input.source_model_directory)?;
    let (geometry, meta) = gpkg::read_gpkg(&model.gpkg_path())?;

    let doc = conflate(
        &geometry,
        &meta,
        ctx.network.as_ref(),
        input.low_flow_multiplier,
        input.high_flow_multiplier,
        input.source_network.as_deref().unwrap_or("reference-network"),
    )?;

    std::fs::write(model.conflation_path(), serde_json::to_vec_pretty(&doc)?)?;
    let eclipsed = doc.reaches.values().filter(|r| r.eclipsed).count();
    tracing::info!(
        document = %model.conflation_path().display(),
        reaches = doc.reaches.len(),
        eclipsed,
        "conflated model"
    );
    to_result(Output {
        document: model.conflation_path().display().to_string(),
        reaches: doc.reaches.len(),
        eclipsed,
    })
}

#[derive(Debug, serde::Deserialize)]
pub struct MetricsInput {
    pub source_model_directory: String,
}

/// Recompute the per-reach summary statistics of an existing conflation
/// document without re-running conflation. Idempotent.
pub fn compute_conflation_metrics(
    ctx: &StageContext,
    input: serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let input: MetricsInput = parse_input(input)?;
    let model = SourceModel::open(&input.source_model_directory)?;
    let (geometry, _) = gpkg::read_gpkg(&model.gpkg_path())?;

    let bytes = std::fs::read(model.conflation_path()).map_err(|err| {
        StageError::Precondition(format!(
            "conflation document {}: {err}",
            model.conflation_path().display()
        ))
    })?;
    let mut doc: ConflationDocument = serde_json::from_slice(&bytes)?;

    let mut recomputed = 0;
    for (id, entry) in doc.reaches.iter_mut() {
        if entry.eclipsed {
            continue;
        }
        let Some(reach) = ctx.network.get(id)? else {
            tracing::warn!(reach = %id, "reach absent from the reference network; keeping prior metrics");
            continue;
        };
        let Some(line) = geometry
            .rivers
            .iter()
            .find(|r| r.river == entry.us_xs.river && r.reach == entry.us_xs.reach)
        else {
            continue;
        };
        let sections = sections_between(&geometry, entry);
        entry.metrics = entry_metrics(&reach, &line.centerline, &sections);
        recomputed += 1;
    }

    std::fs::write(model.conflation_path(), serde_json::to_vec_pretty(&doc)?)?;
    to_result(serde_json::json!({
        "document": model.conflation_path().display().to_string(),
        "recomputed": recomputed,
    }))
}

/// Cross sections of the entry's model reach between its upstream and
/// downstream selections, ordered upstream first.
pub(crate) fn sections_between<'g>(
    geometry: &'g GeometryFile,
    entry: &ReachConflation,
) -> Vec<&'g CrossSection> {
    let (hi, lo) = (
        entry.us_xs.xs_id.parse::<f64>().unwrap_or(f64::INFINITY),
        entry.ds_xs.xs_id.parse::<f64>().unwrap_or(f64::NEG_INFINITY),
    );
    let mut out: Vec<&CrossSection> = geometry
        .cross_sections
        .iter()
        .filter(|xs| {
            xs.river == entry.us_xs.river
                && xs.reach == entry.us_xs.reach
                && xs.river_station <= hi
                && xs.river_station >= lo
        })
        .collect();
    out.sort_by(|a, b| b.river_station.total_cmp(&a.river_station));
    out
}

struct ChainLink {
    reach: Reach,
    /// (index into the ordered section list, station along the reach).
    crossings: Vec<(usize, f64)>,
}

pub(crate) fn conflate(
    geometry: &GeometryFile,
    meta: &BTreeMap<String, String>,
    network: &dyn NetworkProvider,
    low_multiplier: f64,
    high_multiplier: f64,
    source_network: &str,
) -> Result<ConflationDocument, StageError> {
    // The reference network is traversed as a tree; a source model whose
    // own graph diverges cannot be walked that way.
    for junction in &geometry.junctions {
        if junction.downstream.len() > 1 {
            return Err(StageError::DivergingNetwork(format!(
                "junction {} has {} downstream reaches",
                junction.name,
                junction.downstream.len()
            )));
        }
    }

    let mut reaches: BTreeMap<String, ReachConflation> = BTreeMap::new();
    // Conflated reach ids per model reach, in traversal order, for the
    // junction pass below.
    let mut chains: Vec<((String, String), Vec<String>)> = Vec::new();

    for river_line in &geometry.rivers {
        let centerline = &river_line.centerline;
        let mut sections: Vec<&CrossSection> = geometry
            .cross_sections
            .iter()
            .filter(|xs| xs.river == river_line.river && xs.reach == river_line.reach)
            .collect();
        sections.sort_by(|a, b| b.river_station.total_cmp(&a.river_station));
        if sections.is_empty() {
            continue;
        }

        // Clip the centerline to the extents of the outermost sections.
        let first_station = centerline_station(centerline, sections[0]);
        let last_station = centerline_station(centerline, sections[sections.len() - 1]);
        let clipped = centerline.slice(first_station, last_station);

        let buffer = sections
            .iter()
            .map(|xs| xs.line.length())
            .fold(100.0_f64, f64::max);
        let candidates = network.query(&clipped.bbox().buffer(buffer))?;
        if candidates.is_empty() {
            tracing::warn!(
                river = %river_line.river,
                reach = %river_line.reach,
                "no reference reaches near the clipped centerline"
            );
            continue;
        }

        let nearest = |p: crate::geometry::Point| -> &Reach {
            candidates
                .iter()
                .min_by(|a, b| {
                    a.geometry
                        .distance_to(&p)
                        .total_cmp(&b.geometry.distance_to(&p))
                })
                .expect("candidates are non-empty")
        };
        let us_reach = nearest(clipped.first());
        let ds_reach = nearest(clipped.last());

        let chain = traverse(network, &candidates, us_reach, ds_reach)?;
        let links: Vec<ChainLink> = chain
            .into_iter()
            .map(|reach| {
                let mut crossings = Vec::new();
                for (index, xs) in sections.iter().enumerate() {
                    if let Some(hit) = reach.geometry.crossings(&xs.line).first() {
                        crossings.push((index, hit.station_a));
                    }
                }
                ChainLink { reach, crossings }
            })
            .collect();

        let mut chain_ids = Vec::new();
        for (position, link) in links.iter().enumerate() {
            if link.crossings.is_empty() {
                continue;
            }
            // Upstream selection: the section intersecting closest to the
            // reach's upstream end.
            let (us_index, _) = *link
                .crossings
                .iter()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .expect("crossings are non-empty");
            // Downstream selection: the section immediately downstream of
            // the last intersected one, extending past a junction when the
            // model continues there.
            let last_index = link.crossings.iter().map(|&(i, _)| i).max().unwrap();
            let ds_xs = if last_index + 1 < sections.len() {
                sections[last_index + 1].xs_ref()
            } else if let Some(xs) =
                past_junction(geometry, &river_line.river, &river_line.reach)
            {
                xs.xs_ref()
            } else {
                sections[last_index].xs_ref()
            };
            let us_xs = sections[us_index].xs_ref();
            if us_xs == ds_xs {
                // A reach grazing a single terminal section has no usable
                // span; leave it out rather than fabricate one.
                continue;
            }

            let (range_lo, range_hi) = (us_index.min(last_index), us_index.max(last_index));
            let in_range: Vec<&CrossSection> = sections[range_lo..=range_hi].to_vec();
            let metrics = entry_metrics(&link.reach, centerline, &in_range);

            // Eclipsed neighbours: reaches later in the chain with no
            // crossings of their own, bracketed by this link and a later
            // intersected link.
            let mut eclipsed_ids = Vec::new();
            for later in links.iter().skip(position + 1) {
                if !later.crossings.is_empty() {
                    break;
                }
                if links
                    .iter()
                    .skip(position + 1)
                    .any(|l| !l.crossings.is_empty())
                {
                    eclipsed_ids.push(later.reach.id.clone());
                }
            }

            for eclipsed_id in &eclipsed_ids {
                let eclipsed_reach = links
                    .iter()
                    .find(|l| &l.reach.id == eclipsed_id)
                    .expect("eclipsed ids come from the chain");
                reaches.insert(
                    eclipsed_id.clone(),
                    ReachConflation {
                        us_xs: ds_xs.clone(),
                        ds_xs: ds_xs.clone(),
                        eclipsed: true,
                        low_flow: low_multiplier * eclipsed_reach.reach.high_flow_threshold,
                        high_flow: high_multiplier * eclipsed_reach.reach.hundred_year_flow,
                        network_to_id: eclipsed_reach.reach.to_id.clone(),
                        metrics: ConflationMetrics::default(),
                        overlapped_reaches: Vec::new(),
                        eclipsed_reaches: Vec::new(),
                    },
                );
                chain_ids.push(eclipsed_id.clone());
            }

            reaches.insert(
                link.reach.id.clone(),
                ReachConflation {
                    us_xs,
                    ds_xs,
                    eclipsed: false,
                    low_flow: low_multiplier * link.reach.high_flow_threshold,
                    high_flow: high_multiplier * link.reach.hundred_year_flow,
                    network_to_id: link.reach.to_id.clone(),
                    metrics,
                    overlapped_reaches: Vec::new(),
                    eclipsed_reaches: eclipsed_ids,
                },
            );
            chain_ids.push(link.reach.id.clone());
        }

        mark_overlaps(&mut reaches, &chain_ids);
        chains.push((
            (river_line.river.clone(), river_line.reach.clone()),
            chain_ids,
        ));
    }

    lock_confluences(geometry, &mut reaches, &chains);

    Ok(ConflationDocument {
        metadata: ConflationMetadata {
            source_network: source_network.to_string(),
            source_ras_model: meta
                .get("model_name")
                .or_else(|| meta.get("title"))
                .cloned()
                .unwrap_or_default(),
            length_units: meta.get("length_units").cloned().unwrap_or_default(),
            flow_units: meta.get("flow_units").cloned().unwrap_or_default(),
        },
        reaches,
    })
}

/// Station of the section along the model centerline: the crossing when
/// one exists, else the projection of the section's midpoint.
pub(crate) fn centerline_station(centerline: &LineString, xs: &CrossSection) -> f64 {
    match centerline.crossings(&xs.line).first() {
        Some(hit) => hit.station_a,
        None => {
            let mid = xs.line.point_at(xs.line.length() / 2.0);
            centerline.project(&mid).0
        }
    }
}

/// Walk to_id links from `us` until `ds`, returning every visited reach.
fn traverse(
    network: &dyn NetworkProvider,
    candidates: &[Reach],
    us: &Reach,
    ds: &Reach,
) -> Result<Vec<Reach>, StageError> {
    let mut chain = vec![us.clone()];
    let mut visited = std::collections::BTreeSet::from([us.id.clone()]);
    let mut current = us.clone();
    while current.id != ds.id {
        let next_id = current.to_id.clone();
        let next = match candidates.iter().find(|r| r.id == next_id) {
            Some(found) => found.clone(),
            None => network.get(&next_id)?.ok_or_else(|| {
                StageError::Internal(anyhow::anyhow!(
                    "traversal from reach {} ended at {next_id}, which is not in the network",
                    us.id
                ))
            })?,
        };
        if !visited.insert(next.id.clone()) {
            return Err(StageError::Internal(anyhow::anyhow!(
                "reference network traversal revisited reach {next_id}"
            )));
        }
        chain.push(next.clone());
        current = next;
    }
    Ok(chain)
}

/// The first section past the junction at the downstream end of (river,
/// reach), when the model continues there.
fn past_junction<'g>(
    geometry: &'g GeometryFile,
    river: &str,
    reach: &str,
) -> Option<&'g CrossSection> {
    let junction: &Junction = geometry.junctions.iter().find(|j| {
        j.upstream
            .iter()
            .any(|(r, rc)| r == river && rc == reach)
    })?;
    let (down_river, down_reach) = junction.downstream.first()?;
    geometry
        .cross_sections
        .iter()
        .filter(|xs| &xs.river == down_river && &xs.reach == down_reach)
        .max_by(|a, b| a.river_station.total_cmp(&b.river_station))
}

fn entry_metrics(
    reach: &Reach,
    centerline: &LineString,
    sections: &[&CrossSection],
) -> ConflationMetrics {
    let reach_len = reach.geometry.length();
    let mut stations = Vec::new();
    let mut thalweg_offsets = Vec::new();
    for xs in sections {
        if let Some(hit) = reach.geometry.crossings(&xs.line).first() {
            stations.push(hit.station_a);
        }
        thalweg_offsets.push(reach.geometry.distance_to(&xs.thalweg_point()));
    }
    let (min_s, max_s) = match (
        stations.iter().cloned().reduce(f64::min),
        stations.iter().cloned().reduce(f64::max),
    ) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => (0.0, 0.0),
    };

    let mut centerline_offsets = Vec::new();
    if max_s > min_s {
        for i in 0..=10 {
            let s = min_s + (max_s - min_s) * i as f64 / 10.0;
            let p = reach.geometry.point_at(s);
            centerline_offsets.push(centerline.distance_to(&p));
        }
    }

    let ras_len = match (sections.first(), sections.last()) {
        (Some(first), Some(last)) if sections.len() > 1 => {
            (centerline_station(centerline, first) - centerline_station(centerline, last)).abs()
        }
        _ => 0.0,
    };

    ConflationMetrics {
        xs: XsOffsets {
            centerline_offset: mean(&centerline_offsets),
            thalweg_offset: mean(&thalweg_offsets),
        },
        lengths: Lengths {
            ras: ras_len,
            network: reach_len,
            network_to_ras_ratio: if ras_len > 0.0 { reach_len / ras_len } else { 0.0 },
        },
        coverage: Coverage {
            start: (min_s / reach_len).clamp(0.0, 1.0),
            end: (max_s / reach_len).clamp(0.0, 1.0),
        },
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Mark entries of one chain whose model station ranges overlap.
fn mark_overlaps(reaches: &mut BTreeMap<String, ReachConflation>, chain_ids: &[String]) {
    let spans: Vec<(String, f64, f64)> = chain_ids
        .iter()
        .filter_map(|id| {
            let entry = reaches.get(id)?;
            if entry.eclipsed {
                return None;
            }
            let hi: f64 = entry.us_xs.xs_id.parse().ok()?;
            let lo: f64 = entry.ds_xs.xs_id.parse().ok()?;
            Some((id.clone(), lo, hi))
        })
        .collect();

    for (id, lo, hi) in &spans {
        let overlapped: Vec<String> = spans
            .iter()
            .filter(|(other, olo, ohi)| other != id && olo.max(*lo) < ohi.min(*hi))
            .map(|(other, _, _)| other.clone())
            .collect();
        if let Some(entry) = reaches.get_mut(id) {
            entry.overlapped_reaches = overlapped;
        }
    }
}

/// Where a confluence exists in both graphs, the tributaries share their
/// downstream cross section with the outlet's upstream cross section.
fn lock_confluences(
    geometry: &GeometryFile,
    reaches: &mut BTreeMap<String, ReachConflation>,
    chains: &[((String, String), Vec<String>)],
) {
    let chain_of = |river: &str, reach: &str| {
        chains
            .iter()
            .find(|((r, rc), _)| r == river && rc == reach)
            .map(|(_, ids)| ids.as_slice())
    };

    for junction in &geometry.junctions {
        let Some((down_river, down_reach)) = junction.downstream.first() else {
            continue;
        };
        let Some(outlet_chain) = chain_of(down_river, down_reach) else {
            continue;
        };
        let Some(outlet_first) = outlet_chain
            .iter()
            .find(|id| reaches.get(*id).is_some_and(|e| !e.eclipsed))
        else {
            continue;
        };
        let outlet_us = reaches[outlet_first].us_xs.clone();
        let outlet_first = outlet_first.clone();

        for (up_river, up_reach) in &junction.upstream {
            let Some(trib_chain) = chain_of(up_river, up_reach) else {
                continue;
            };
            let Some(trib_last) = trib_chain
                .iter()
                .rev()
                .find(|id| reaches.get(*id).is_some_and(|e| !e.eclipsed))
            else {
                continue;
            };
            let trib_last = trib_last.clone();
            // Both graphs must agree this is a confluence: the tributary's
            // terminal reach drains into the outlet's first reach.
            if reaches[&trib_last].network_to_id != outlet_first {
                continue;
            }
            if let Some(entry) = reaches.get_mut(&trib_last) {
                entry.ds_xs = outlet_us.clone();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::{Bbox, LineString, Point};
    use crate::model::RiverLine;
    use crate::sources::VecNetwork;

    fn xs(station: f64, x: f64) -> CrossSection {
        CrossSection {
            river: "Baxter".to_string(),
            reach: "Upper".to_string(),
            river_station: station,
            line: LineString::new(vec![Point::new(x, -200.0), Point::new(x, 200.0)]),
            station_elevation: vec![(0.0, 200.0), (200.0, 160.0), (400.0, 200.0)],
            roughness: 0.035,
        }
    }

    fn geometry(stations: &[(f64, f64)]) -> GeometryFile {
        GeometryFile {
            title: "Baxter geometry".to_string(),
            rivers: vec![RiverLine {
                river: "Baxter".to_string(),
                reach: "Upper".to_string(),
                centerline: LineString::new(vec![Point::new(0.0, 0.0), Point::new(10000.0, 0.0)]),
            }],
            cross_sections: stations.iter().map(|&(rs, x)| xs(rs, x)).collect(),
            junctions: vec![],
            structures: vec![],
        }
    }

    fn reach(id: &str, to: &str, x0: f64, x1: f64) -> Reach {
        Reach {
            id: id.to_string(),
            to_id: to.to_string(),
            geometry: LineString::new(vec![Point::new(x0, 5.0), Point::new(x1, 5.0)]),
            high_flow_threshold: 104.0,
            hundred_year_flow: 10000.0,
        }
    }

    fn meta() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("model_name".to_string(), "Baxter".to_string()),
            ("length_units".to_string(), "feet".to_string()),
            ("flow_units".to_string(), "cfs".to_string()),
        ])
    }

    #[test]
    fn test_single_reach_conflation() {
        // Four sections spanning one network reach.
        let geometry = geometry(&[
            (4000.0, 1000.0),
            (3000.0, 2000.0),
            (2000.0, 3000.0),
            (1000.0, 4000.0),
        ]);
        let network = VecNetwork(vec![reach("2823932", "2823934", 500.0, 4500.0)]);

        let doc = conflate(&geometry, &meta(), &network, 0.9, 1.2, "test-network").unwrap();
        assert_eq!(doc.reaches.len(), 1);

        let entry = doc.reach("2823932").unwrap();
        assert!(!entry.eclipsed);
        assert_eq!(entry.us_xs.xs_id, "4000");
        // The last intersected section has nothing downstream of it, so the
        // downstream selection stays at the terminal section.
        assert_eq!(entry.ds_xs.xs_id, "1000");
        assert_eq!(entry.network_to_id, "2823934");
        assert!((entry.low_flow - 93.6).abs() < 1e-9);
        assert!((entry.high_flow - 12000.0).abs() < 1e-9);

        let coverage = &entry.metrics.coverage;
        assert!((0.0..=1.0).contains(&coverage.start));
        assert!((0.0..=1.0).contains(&coverage.end));
        assert!(coverage.start < coverage.end);
        assert!(entry.metrics.xs.centerline_offset > 0.0);
        assert!(entry.metrics.lengths.ras > 0.0);
    }

    #[test]
    fn test_chain_with_eclipsed_middle_reach() {
        // Sections bracket a short middle reach that intersects none.
        let geometry = geometry(&[(4000.0, 500.0), (3000.0, 1500.0), (2000.0, 3500.0), (1000.0, 4800.0)]);
        let network = VecNetwork(vec![
            reach("up", "mid", 0.0, 2000.0),
            reach("mid", "down", 2000.0, 3000.0),
            reach("down", "out", 3000.0, 5000.0),
        ]);

        let doc = conflate(&geometry, &meta(), &network, 0.9, 1.2, "test-network").unwrap();
        let mid = doc.reach("mid").unwrap();
        assert!(mid.eclipsed);
        // Eclipsed reaches carry a degenerate pair.
        assert_eq!(mid.us_xs, mid.ds_xs);

        let up = doc.reach("up").unwrap();
        assert!(!up.eclipsed);
        assert_eq!(up.eclipsed_reaches, vec!["mid".to_string()]);
        assert!(doc.reach("down").is_some_and(|d| !d.eclipsed));

        // Invariant: eclipsed <=> us_xs == ds_xs.
        for entry in doc.reaches.values() {
            assert_eq!(entry.eclipsed, entry.us_xs == entry.ds_xs);
        }
    }

    #[test]
    fn test_divergent_model_is_rejected() {
        let mut geom = geometry(&[(4000.0, 1000.0), (1000.0, 4000.0)]);
        geom.junctions.push(Junction {
            name: "split".to_string(),
            location: Point::new(5000.0, 0.0),
            upstream: vec![("Baxter".to_string(), "Upper".to_string())],
            downstream: vec![
                ("Baxter".to_string(), "Left".to_string()),
                ("Baxter".to_string(), "Right".to_string()),
            ],
            polygon: None,
        });
        let network = VecNetwork(vec![reach("a", "b", 0.0, 5000.0)]);

        assert!(matches!(
            conflate(&geom, &meta(), &network, 0.9, 1.2, "test"),
            Err(StageError::DivergingNetwork(_))
        ));
    }

    #[test]
    fn test_traversal_visits_intermediate_reaches() {
        let geometry = geometry(&[
            (4000.0, 500.0),
            (3000.0, 1500.0),
            (2500.0, 2500.0),
            (2000.0, 3500.0),
            (1000.0, 4800.0),
        ]);
        let network = VecNetwork(vec![
            reach("up", "mid", 0.0, 2000.0),
            reach("mid", "down", 2000.0, 3000.0),
            reach("down", "out", 3000.0, 5000.0),
        ]);

        let doc = conflate(&geometry, &meta(), &network, 0.9, 1.2, "test").unwrap();
        assert_eq!(doc.reaches.len(), 3);
        assert!(doc.reaches.values().all(|e| !e.eclipsed));
    }

    #[test]
    fn test_metrics_recompute_is_idempotent() {
        let geometry = geometry(&[
            (4000.0, 1000.0),
            (3000.0, 2000.0),
            (2000.0, 3000.0),
            (1000.0, 4000.0),
        ]);
        let network = VecNetwork(vec![reach("2823932", "out", 500.0, 4500.0)]);
        let doc = conflate(&geometry, &meta(), &network, 0.9, 1.2, "test").unwrap();

        let entry = doc.reach("2823932").unwrap();
        let sections = sections_between(&geometry, entry);
        let again = entry_metrics(
            &network.get("2823932").unwrap().unwrap(),
            &geometry.rivers[0].centerline,
            &sections,
        );
        assert_eq!(entry.metrics, again);
    }

    #[test]
    fn test_bbox_query_buffer_reaches_the_network() {
        // The network line sits 5 units off the centerline; the query
        // buffer must still find it.
        let geometry = geometry(&[(4000.0, 1000.0), (1000.0, 4000.0)]);
        let network = VecNetwork(vec![reach("only", "out", 900.0, 4100.0)]);
        let doc = conflate(&geometry, &meta(), &network, 0.9, 1.2, "test").unwrap();
        assert_eq!(doc.reaches.len(), 1);
        let bbox = Bbox {
            min_x: 0.0,
            min_y: -1.0,
            max_x: 1.0,
            max_y: 1.0,
        };
        assert!(network.query(&bbox).unwrap().is_empty());
    }
}
