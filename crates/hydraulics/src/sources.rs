//! Adapters over external data sources: the reference hydrologic network,
//! the DEM, and (optionally) a remote object catalog. Stages depend only
//! on the traits; production implementations read a network parquet file
//! and a local elevation raster, while tests substitute synthetic fakes.

use crate::geometry::{Bbox, LineString};
use crate::gpkg::wkb;
use crate::raster::{self, RasterTile};
use crate::StageError;
use std::path::PathBuf;

/// One reach of the reference network. Geometry is digitized upstream to
/// downstream; `to_id` names the next reach downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Reach {
    pub id: String,
    pub to_id: String,
    pub geometry: LineString,
    pub high_flow_threshold: f64,
    pub hundred_year_flow: f64,
}

pub trait NetworkProvider: Send + Sync {
    /// Reaches whose geometry intersects the bounding box.
    fn query(&self, bbox: &Bbox) -> Result<Vec<Reach>, StageError>;

    fn get(&self, id: &str) -> Result<Option<Reach>, StageError>;
}

/// Network provider backed by a parquet file with columns
/// `id, to_id, geometry_wkb, high_flow_threshold, hundred_year_flow`.
pub struct ParquetNetwork {
    path: PathBuf,
}

impl ParquetNetwork {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn scan(&self, mut keep: impl FnMut(&Reach) -> bool) -> Result<Vec<Reach>, StageError> {
        use parquet::file::reader::{FileReader, SerializedFileReader};
        use parquet::record::Field;

        let file = std::fs::File::open(&self.path).map_err(|err| {
            StageError::Precondition(format!("network parquet {}: {err}", self.path.display()))
        })?;
        let reader = SerializedFileReader::new(file)
            .map_err(|err| StageError::Internal(anyhow::anyhow!("reading parquet: {err}")))?;

        let mut out = Vec::new();
        for row in reader
            .get_row_iter(None)
            .map_err(|err| StageError::Internal(anyhow::anyhow!("parquet rows: {err}")))?
        {
            let row =
                row.map_err(|err| StageError::Internal(anyhow::anyhow!("parquet row: {err}")))?;

            let mut id = None;
            let mut to_id = None;
            let mut geometry = None;
            let mut high_flow_threshold = 0.0;
            let mut hundred_year_flow = 0.0;

            for (name, field) in row.get_column_iter() {
                match (name.as_str(), field) {
                    ("id", Field::Str(v)) => id = Some(v.clone()),
                    ("id", Field::Long(v)) => id = Some(v.to_string()),
                    ("to_id", Field::Str(v)) => to_id = Some(v.clone()),
                    ("to_id", Field::Long(v)) => to_id = Some(v.to_string()),
                    ("geometry_wkb", Field::Bytes(v)) => {
                        geometry = Some(wkb::decode_linestring(wkb::gpkg_unwrap(v.data())?)?)
                    }
                    ("high_flow_threshold", Field::Double(v)) => high_flow_threshold = *v,
                    ("high_flow_threshold", Field::Float(v)) => high_flow_threshold = *v as f64,
                    ("hundred_year_flow", Field::Double(v)) => hundred_year_flow = *v,
                    ("hundred_year_flow", Field::Float(v)) => hundred_year_flow = *v as f64,
                    _ => {}
                }
            }
            let (Some(id), Some(to_id), Some(geometry)) = (id, to_id, geometry) else {
                return Err(StageError::Internal(anyhow::anyhow!(
                    "network parquet row lacks id, to_id, or geometry_wkb"
                )));
            };
            let reach = Reach {
                id,
                to_id,
                geometry,
                high_flow_threshold,
                hundred_year_flow,
            };
            if keep(&reach) {
                out.push(reach);
            }
        }
        Ok(out)
    }
}

impl NetworkProvider for ParquetNetwork {
    fn query(&self, bbox: &Bbox) -> Result<Vec<Reach>, StageError> {
        self.scan(|reach| reach.geometry.bbox().intersects(bbox))
    }

    fn get(&self, id: &str) -> Result<Option<Reach>, StageError> {
        Ok(self.scan(|reach| reach.id == id)?.into_iter().next())
    }
}

/// In-memory network used by tests and fixtures.
#[derive(Debug, Default, Clone)]
pub struct VecNetwork(pub Vec<Reach>);

impl NetworkProvider for VecNetwork {
    fn query(&self, bbox: &Bbox) -> Result<Vec<Reach>, StageError> {
        Ok(self
            .0
            .iter()
            .filter(|r| r.geometry.bbox().intersects(bbox))
            .cloned()
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<Reach>, StageError> {
        Ok(self.0.iter().find(|r| r.id == id).cloned())
    }
}

pub trait DemProvider: Send + Sync {
    /// A clipped elevation raster covering `bbox` at `resolution`.
    /// `TerrainOutOfBounds` when the DEM does not cover the footprint.
    fn read(&self, bbox: &Bbox, resolution: f64, units: &str) -> Result<RasterTile, StageError>;
}

/// DEM provider over a local elevation raster.
pub struct FileDem {
    path: PathBuf,
}

impl FileDem {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DemProvider for FileDem {
    fn read(&self, bbox: &Bbox, resolution: f64, _units: &str) -> Result<RasterTile, StageError> {
        let source = raster::read_tiff(&self.path)?;
        if !source.bbox().covers(bbox) {
            return Err(StageError::TerrainOutOfBounds(format!(
                "DEM {} covers {:?} but the reach footprint is {:?}",
                self.path.display(),
                source.bbox(),
                bbox,
            )));
        }
        let mut tile = RasterTile::empty(*bbox, resolution, &source.crs);
        for row in 0..tile.height {
            for col in 0..tile.width {
                let center = tile.cell_center(col, row);
                if let Some(z) = source.sample(center.x, center.y) {
                    tile.set(col, row, z);
                }
            }
        }
        Ok(tile)
    }
}

/// Synthetic planar DEM: z = base + sx*x + sy*y, optionally bounded so
/// tests can exercise the out-of-bounds failure.
#[derive(Debug, Clone)]
pub struct PlaneDem {
    pub base: f64,
    pub sx: f64,
    pub sy: f64,
    pub bounds: Option<Bbox>,
    pub crs: String,
}

impl PlaneDem {
    pub fn flat(base: f64) -> Self {
        Self {
            base,
            sx: 0.0,
            sy: 0.0,
            bounds: None,
            crs: "EPSG:2227".to_string(),
        }
    }
}

impl DemProvider for PlaneDem {
    fn read(&self, bbox: &Bbox, resolution: f64, _units: &str) -> Result<RasterTile, StageError> {
        if let Some(bounds) = &self.bounds {
            if !bounds.covers(bbox) {
                return Err(StageError::TerrainOutOfBounds(format!(
                    "synthetic DEM bounds {bounds:?} do not cover {bbox:?}"
                )));
            }
        }
        let mut tile = RasterTile::empty(*bbox, resolution, &self.crs);
        for row in 0..tile.height {
            for col in 0..tile.width {
                let c = tile.cell_center(col, row);
                tile.set(col, row, (self.base + self.sx * c.x + self.sy * c.y) as f32);
            }
        }
        Ok(tile)
    }
}

/// Optional remote catalog for stages that export their products.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StageError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StageError>;
}

/// Filesystem-backed object store rooted at a directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StageError> {
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(StageError::InvalidInput(format!(
                "object key {key:?} escapes the store root"
            )));
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StageError> {
        Ok(std::fs::read(self.resolve(key)?)?)
    }
}
