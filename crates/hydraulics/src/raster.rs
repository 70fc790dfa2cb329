//! Single-band float32 rasters: the terrain bundle's elevation layer and
//! the depth grids. Files are written as uncompressed single-strip TIFFs
//! with the georeferencing tags (pixel scale, tiepoint, nodata) that
//! downstream GIS tooling expects; nothing else of the format is used.

use crate::geometry::{Bbox, Point};
use crate::StageError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const NODATA: f32 = -9999.0;

/// A north-up grid of float32 samples. `data` is row-major starting at the
/// north-west corner; `dx` and `dy` are positive pixel sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    pub west: f64,
    pub north: f64,
    pub dx: f64,
    pub dy: f64,
    pub width: usize,
    pub height: usize,
    pub nodata: f32,
    pub crs: String,
    pub data: Vec<f32>,
}

impl RasterTile {
    /// An all-nodata tile covering `bbox` at `resolution`.
    pub fn empty(bbox: Bbox, resolution: f64, crs: &str) -> RasterTile {
        let width = (bbox.width() / resolution).ceil().max(1.0) as usize;
        let height = (bbox.height() / resolution).ceil().max(1.0) as usize;
        RasterTile {
            west: bbox.min_x,
            north: bbox.max_y,
            dx: resolution,
            dy: resolution,
            width,
            height,
            nodata: NODATA,
            crs: crs.to_string(),
            data: vec![NODATA; width * height],
        }
    }

    pub fn bbox(&self) -> Bbox {
        Bbox {
            min_x: self.west,
            min_y: self.north - self.dy * self.height as f64,
            max_x: self.west + self.dx * self.width as f64,
            max_y: self.north,
        }
    }

    pub fn cell_center(&self, col: usize, row: usize) -> Point {
        Point::new(
            self.west + (col as f64 + 0.5) * self.dx,
            self.north - (row as f64 + 0.5) * self.dy,
        )
    }

    pub fn get(&self, col: usize, row: usize) -> f32 {
        self.data[row * self.width + col]
    }

    pub fn set(&mut self, col: usize, row: usize, value: f32) {
        self.data[row * self.width + col] = value;
    }

    /// Nearest-neighbour sample at a world coordinate. None outside the
    /// tile or at nodata cells.
    pub fn sample(&self, x: f64, y: f64) -> Option<f32> {
        let col = ((x - self.west) / self.dx).floor();
        let row = ((self.north - y) / self.dy).floor();
        if col < 0.0 || row < 0.0 || col >= self.width as f64 || row >= self.height as f64 {
            return None;
        }
        let v = self.get(col as usize, row as usize);
        if v == self.nodata || v.is_nan() {
            None
        } else {
            Some(v)
        }
    }

    /// Count of cells holding data.
    pub fn data_cells(&self) -> usize {
        self.data
            .iter()
            .filter(|&&v| v != self.nodata && !v.is_nan())
            .count()
    }
}

// TIFF constants used below.
const T_SHORT: u16 = 3;
const T_LONG: u16 = 4;
const T_ASCII: u16 = 2;
const T_DOUBLE: u16 = 12;

struct Entry {
    tag: u16,
    kind: u16,
    count: u32,
    // Inline value, or offset patched during layout.
    value: u32,
    payload: Option<Vec<u8>>,
}

/// Write the tile as an uncompressed single-strip float32 TIFF.
pub fn write_tiff(path: &Path, tile: &RasterTile) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);

    let strip_len = (tile.width * tile.height * 4) as u32;
    let strip_offset = 8u32;

    let mut scale = Vec::new();
    for v in [tile.dx, tile.dy, 0.0] {
        scale.write_f64::<LittleEndian>(v).unwrap();
    }
    let mut tiepoint = Vec::new();
    for v in [0.0, 0.0, 0.0, tile.west, tile.north, 0.0] {
        tiepoint.write_f64::<LittleEndian>(v).unwrap();
    }
    let mut nodata = format!("{}", tile.nodata).into_bytes();
    nodata.push(0);
    let mut description = tile.crs.clone().into_bytes();
    description.push(0);

    let mut entries = vec![
        Entry { tag: 256, kind: T_LONG, count: 1, value: tile.width as u32, payload: None },
        Entry { tag: 257, kind: T_LONG, count: 1, value: tile.height as u32, payload: None },
        Entry { tag: 258, kind: T_SHORT, count: 1, value: 32, payload: None },
        Entry { tag: 259, kind: T_SHORT, count: 1, value: 1, payload: None },
        Entry { tag: 262, kind: T_SHORT, count: 1, value: 1, payload: None },
        Entry {
            tag: 270,
            kind: T_ASCII,
            count: description.len() as u32,
            value: 0,
            payload: Some(description),
        },
        Entry { tag: 273, kind: T_LONG, count: 1, value: strip_offset, payload: None },
        Entry { tag: 277, kind: T_SHORT, count: 1, value: 1, payload: None },
        Entry { tag: 278, kind: T_LONG, count: 1, value: tile.height as u32, payload: None },
        Entry { tag: 279, kind: T_LONG, count: 1, value: strip_len, payload: None },
        Entry { tag: 339, kind: T_SHORT, count: 1, value: 3, payload: None },
        Entry { tag: 33550, kind: T_DOUBLE, count: 3, value: 0, payload: Some(scale) },
        Entry { tag: 33922, kind: T_DOUBLE, count: 6, value: 0, payload: Some(tiepoint) },
        Entry {
            tag: 42113,
            kind: T_ASCII,
            count: nodata.len() as u32,
            value: 0,
            payload: Some(nodata),
        },
    ];

    // Out-of-line payloads land after the strip; the IFD follows them.
    let mut cursor = strip_offset + strip_len;
    for entry in entries.iter_mut() {
        if let Some(payload) = &entry.payload {
            if payload.len() <= 4 {
                let mut v = [0u8; 4];
                v[..payload.len()].copy_from_slice(payload);
                entry.value = u32::from_le_bytes(v);
                entry.payload = None;
            } else {
                entry.value = cursor;
                cursor += payload.len() as u32;
            }
        }
    }
    let ifd_offset = cursor;

    file.write_all(b"II")?;
    file.write_u16::<LittleEndian>(42)?;
    file.write_u32::<LittleEndian>(ifd_offset)?;
    for v in &tile.data {
        file.write_f32::<LittleEndian>(*v)?;
    }
    for entry in &entries {
        if let Some(payload) = &entry.payload {
            file.write_all(payload)?;
        }
    }
    file.write_u16::<LittleEndian>(entries.len() as u16)?;
    for entry in &entries {
        file.write_u16::<LittleEndian>(entry.tag)?;
        file.write_u16::<LittleEndian>(entry.kind)?;
        file.write_u32::<LittleEndian>(entry.count)?;
        file.write_u32::<LittleEndian>(entry.value)?;
    }
    file.write_u32::<LittleEndian>(0)?; // no further IFDs
    file.flush()?;
    Ok(())
}

/// Read a TIFF written by `write_tiff`.
pub fn read_tiff(path: &Path) -> Result<RasterTile, StageError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|err| {
        StageError::Precondition(format!("{}: {err}", path.display()))
    })?);

    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)?;
    if &magic != b"II" || file.read_u16::<LittleEndian>()? != 42 {
        return Err(StageError::Internal(anyhow::anyhow!(
            "{} is not a little-endian TIFF",
            path.display()
        )));
    }
    let ifd_offset = file.read_u32::<LittleEndian>()?;
    file.seek(SeekFrom::Start(ifd_offset as u64))?;

    let count = file.read_u16::<LittleEndian>()?;
    let mut tags = std::collections::BTreeMap::new();
    for _ in 0..count {
        let tag = file.read_u16::<LittleEndian>()?;
        let kind = file.read_u16::<LittleEndian>()?;
        let n = file.read_u32::<LittleEndian>()?;
        let value = file.read_u32::<LittleEndian>()?;
        tags.insert(tag, (kind, n, value));
    }

    let long = |tag: u16| -> Result<u32, StageError> {
        tags.get(&tag)
            .map(|&(_, _, v)| v)
            .ok_or_else(|| StageError::Internal(anyhow::anyhow!("TIFF tag {tag} missing")))
    };
    let width = long(256)? as usize;
    let height = long(257)? as usize;
    let strip_offset = long(273)?;
    let strip_len = long(279)? as usize;
    if strip_len != width * height * 4 {
        return Err(StageError::Internal(anyhow::anyhow!(
            "unexpected strip length {strip_len} for {width}x{height} float32 raster"
        )));
    }

    let read_doubles = |file: &mut std::io::BufReader<std::fs::File>,
                        entry: (u16, u32, u32)|
     -> Result<Vec<f64>, StageError> {
        let (_, n, offset) = entry;
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            out.push(file.read_f64::<LittleEndian>()?);
        }
        Ok(out)
    };
    let read_ascii = |file: &mut std::io::BufReader<std::fs::File>,
                      entry: (u16, u32, u32)|
     -> Result<String, StageError> {
        let (_, n, value) = entry;
        let bytes = if n <= 4 {
            value.to_le_bytes()[..n as usize].to_vec()
        } else {
            file.seek(SeekFrom::Start(value as u64))?;
            let mut buf = vec![0u8; n as usize];
            file.read_exact(&mut buf)?;
            buf
        };
        Ok(String::from_utf8_lossy(&bytes)
            .trim_end_matches('\0')
            .to_string())
    };

    let scale = read_doubles(&mut file, *tags.get(&33550).ok_or_else(missing_georef)?)?;
    let tiepoint = read_doubles(&mut file, *tags.get(&33922).ok_or_else(missing_georef)?)?;
    if scale.len() < 2 || tiepoint.len() < 5 {
        return Err(missing_georef());
    }
    let nodata = match tags.get(&42113) {
        Some(&entry) => read_ascii(&mut file, entry)?.parse().unwrap_or(NODATA),
        None => NODATA,
    };
    let crs = match tags.get(&270) {
        Some(&entry) => read_ascii(&mut file, entry)?,
        None => String::new(),
    };

    file.seek(SeekFrom::Start(strip_offset as u64))?;
    let mut data = vec![0f32; width * height];
    for v in data.iter_mut() {
        *v = file.read_f32::<LittleEndian>()?;
    }

    Ok(RasterTile {
        west: tiepoint[3],
        north: tiepoint[4],
        dx: scale[0],
        dy: scale[1],
        width,
        height,
        nodata,
        crs,
        data,
    })
}

fn missing_georef() -> StageError {
    StageError::Internal(anyhow::anyhow!("TIFF lacks georeferencing tags"))
}
