//! Minimal GeoPackage reader/writer. A geopackage is a SQLite container
//! with a small amount of required metadata; the feature tables written
//! here carry the cross sections, centerlines, junctions, and structures
//! of one model plus a non-spatial `metadata` record. Geometries use the
//! standard GeoPackage binary wrapping of little-endian WKB.

use crate::geometry::{LineString, Point};
use crate::model::{CrossSection, GeometryFile, Junction, RiverLine, Structure};
use crate::StageError;
use std::collections::BTreeMap;
use std::path::Path;

pub mod wkb {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    const WKB_POINT: u32 = 1;
    const WKB_LINESTRING: u32 = 2;

    pub fn encode_linestring(line: &LineString) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + line.points().len() * 16);
        out.push(1); // little endian
        out.write_u32::<LittleEndian>(WKB_LINESTRING).unwrap();
        out.write_u32::<LittleEndian>(line.points().len() as u32)
            .unwrap();
        for p in line.points() {
            out.write_f64::<LittleEndian>(p.x).unwrap();
            out.write_f64::<LittleEndian>(p.y).unwrap();
        }
        out
    }

    pub fn encode_point(p: &Point) -> Vec<u8> {
        let mut out = Vec::with_capacity(21);
        out.push(1);
        out.write_u32::<LittleEndian>(WKB_POINT).unwrap();
        out.write_f64::<LittleEndian>(p.x).unwrap();
        out.write_f64::<LittleEndian>(p.y).unwrap();
        out
    }

    pub fn decode_linestring(bytes: &[u8]) -> Result<LineString, StageError> {
        let mut cur = std::io::Cursor::new(bytes);
        let order = cur.read_u8().map_err(bad)?;
        if order != 1 {
            return Err(StageError::Internal(anyhow::anyhow!(
                "big-endian WKB is not supported"
            )));
        }
        let kind = cur.read_u32::<LittleEndian>().map_err(bad)?;
        if kind & 0xff != WKB_LINESTRING {
            return Err(StageError::Internal(anyhow::anyhow!(
                "expected a WKB LineString, found type {kind}"
            )));
        }
        let count = cur.read_u32::<LittleEndian>().map_err(bad)? as usize;
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let x = cur.read_f64::<LittleEndian>().map_err(bad)?;
            let y = cur.read_f64::<LittleEndian>().map_err(bad)?;
            points.push(Point::new(x, y));
        }
        Ok(LineString::new(points))
    }

    pub fn decode_point(bytes: &[u8]) -> Result<Point, StageError> {
        let mut cur = std::io::Cursor::new(bytes);
        let order = cur.read_u8().map_err(bad)?;
        if order != 1 {
            return Err(StageError::Internal(anyhow::anyhow!(
                "big-endian WKB is not supported"
            )));
        }
        let kind = cur.read_u32::<LittleEndian>().map_err(bad)?;
        if kind & 0xff != WKB_POINT {
            return Err(StageError::Internal(anyhow::anyhow!(
                "expected a WKB Point, found type {kind}"
            )));
        }
        let x = cur.read_f64::<LittleEndian>().map_err(bad)?;
        let y = cur.read_f64::<LittleEndian>().map_err(bad)?;
        Ok(Point::new(x, y))
    }

    fn bad(err: std::io::Error) -> StageError {
        StageError::Internal(anyhow::anyhow!("truncated WKB: {err}"))
    }

    /// Wrap raw WKB in the standard GeoPackage binary header.
    pub fn gpkg_wrap(wkb: Vec<u8>, srs_id: i32) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + wkb.len());
        out.extend_from_slice(b"GP");
        out.push(0); // version
        out.push(0x01); // flags: little endian, no envelope
        out.write_i32::<LittleEndian>(srs_id).unwrap();
        out.extend_from_slice(&wkb);
        out
    }

    /// Strip a GeoPackage binary header when present, returning raw WKB.
    pub fn gpkg_unwrap(bytes: &[u8]) -> Result<&[u8], StageError> {
        if bytes.len() >= 8 && &bytes[..2] == b"GP" {
            let flags = bytes[3];
            let envelope_len = match (flags >> 1) & 0x07 {
                0 => 0,
                1 => 32,
                2 | 3 => 48,
                4 => 64,
                other => {
                    return Err(StageError::Internal(anyhow::anyhow!(
                        "invalid geopackage envelope indicator {other}"
                    )))
                }
            };
            Ok(&bytes[8 + envelope_len..])
        } else {
            Ok(bytes)
        }
    }
}

fn srs_id_of(crs: &str) -> i32 {
    crs.rsplit(':')
        .next()
        .and_then(|tail| tail.parse().ok())
        .unwrap_or(0)
}

/// Create (truncating any existing file) a geopackage holding the model's
/// features and a non-spatial metadata record.
pub fn write_gpkg(
    path: &Path,
    geom: &GeometryFile,
    crs: &str,
    metadata: &BTreeMap<String, String>,
) -> Result<(), StageError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let srs_id = srs_id_of(crs);
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(&format!(
        "PRAGMA application_id = 0x47504B47;
         BEGIN;
         CREATE TABLE gpkg_spatial_ref_sys (
             srs_name TEXT NOT NULL,
             srs_id INTEGER PRIMARY KEY,
             organization TEXT NOT NULL,
             organization_coordsys_id INTEGER NOT NULL,
             definition TEXT NOT NULL,
             description TEXT
         );
         INSERT INTO gpkg_spatial_ref_sys VALUES
             ('Undefined cartesian', -1, 'NONE', -1, 'undefined', NULL),
             ('Undefined geographic', 0, 'NONE', 0, 'undefined', NULL),
             ('{crs}', {srs_id}, 'EPSG', {srs_id}, '{crs}', NULL);
         CREATE TABLE gpkg_contents (
             table_name TEXT PRIMARY KEY,
             data_type TEXT NOT NULL,
             identifier TEXT UNIQUE,
             description TEXT DEFAULT '',
             last_change DATETIME DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
             min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
             srs_id INTEGER
         );
         CREATE TABLE gpkg_geometry_columns (
             table_name TEXT NOT NULL,
             column_name TEXT NOT NULL,
             geometry_type_name TEXT NOT NULL,
             srs_id INTEGER NOT NULL,
             z TINYINT NOT NULL,
             m TINYINT NOT NULL,
             CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name)
         );
         CREATE TABLE XS (
             fid INTEGER PRIMARY KEY AUTOINCREMENT,
             river TEXT NOT NULL,
             reach TEXT NOT NULL,
             river_station REAL NOT NULL,
             station_elevation TEXT NOT NULL,
             roughness REAL NOT NULL,
             geom BLOB NOT NULL
         );
         CREATE TABLE River (
             fid INTEGER PRIMARY KEY AUTOINCREMENT,
             river TEXT NOT NULL,
             reach TEXT NOT NULL,
             geom BLOB NOT NULL
         );
         CREATE TABLE Junction (
             fid INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL,
             upstream TEXT NOT NULL,
             downstream TEXT NOT NULL,
             polygon TEXT,
             geom BLOB NOT NULL
         );
         CREATE TABLE Structure (
             fid INTEGER PRIMARY KEY AUTOINCREMENT,
             river TEXT NOT NULL,
             reach TEXT NOT NULL,
             river_station REAL NOT NULL,
             kind TEXT NOT NULL,
             geom BLOB NOT NULL
         );
         CREATE TABLE metadata (
             key TEXT PRIMARY KEY NOT NULL,
             value TEXT NOT NULL
         );
         INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id) VALUES
             ('XS', 'features', 'XS', {srs_id}),
             ('River', 'features', 'River', {srs_id}),
             ('Junction', 'features', 'Junction', {srs_id}),
             ('Structure', 'features', 'Structure', {srs_id}),
             ('metadata', 'attributes', 'metadata', NULL);
         INSERT INTO gpkg_geometry_columns VALUES
             ('XS', 'geom', 'LINESTRING', {srs_id}, 0, 0),
             ('River', 'geom', 'LINESTRING', {srs_id}, 0, 0),
             ('Junction', 'geom', 'POINT', {srs_id}, 0, 0),
             ('Structure', 'geom', 'LINESTRING', {srs_id}, 0, 0);
         COMMIT;",
    ))?;

    let txn = conn.unchecked_transaction()?;
    {
        let mut stmt = txn.prepare(
            "INSERT INTO XS (river, reach, river_station, station_elevation, roughness, geom)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        )?;
        for xs in &geom.cross_sections {
            stmt.execute(rusqlite::params![
                xs.river,
                xs.reach,
                xs.river_station,
                serde_json::to_string(&xs.station_elevation)?,
                xs.roughness,
                wkb::gpkg_wrap(wkb::encode_linestring(&xs.line), srs_id),
            ])?;
        }
        let mut stmt =
            txn.prepare("INSERT INTO River (river, reach, geom) VALUES (?1, ?2, ?3);")?;
        for river in &geom.rivers {
            stmt.execute(rusqlite::params![
                river.river,
                river.reach,
                wkb::gpkg_wrap(wkb::encode_linestring(&river.centerline), srs_id),
            ])?;
        }
        let mut stmt = txn.prepare(
            "INSERT INTO Junction (name, upstream, downstream, polygon, geom)
             VALUES (?1, ?2, ?3, ?4, ?5);",
        )?;
        for junction in &geom.junctions {
            stmt.execute(rusqlite::params![
                junction.name,
                serde_json::to_string(&junction.upstream)?,
                serde_json::to_string(&junction.downstream)?,
                junction
                    .polygon
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                wkb::gpkg_wrap(wkb::encode_point(&junction.location), srs_id),
            ])?;
        }
        let mut stmt = txn.prepare(
            "INSERT INTO Structure (river, reach, river_station, kind, geom)
             VALUES (?1, ?2, ?3, ?4, ?5);",
        )?;
        for s in &geom.structures {
            stmt.execute(rusqlite::params![
                s.river,
                s.reach,
                s.river_station,
                s.kind,
                wkb::gpkg_wrap(wkb::encode_linestring(&s.line), srs_id),
            ])?;
        }
        let mut stmt =
            txn.prepare("INSERT INTO metadata (key, value) VALUES (?1, ?2);")?;
        stmt.execute(rusqlite::params!["title", geom.title])?;
        stmt.execute(rusqlite::params!["crs", crs])?;
        for (key, value) in metadata {
            stmt.execute(rusqlite::params![key, value])?;
        }
    }
    txn.commit()?;
    Ok(())
}

/// Read a geopackage written by `write_gpkg` back into memory.
pub fn read_gpkg(path: &Path) -> Result<(GeometryFile, BTreeMap<String, String>), StageError> {
    if !path.exists() {
        return Err(StageError::Precondition(format!(
            "geopackage {} does not exist",
            path.display()
        )));
    }
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;

    let mut metadata = BTreeMap::new();
    let mut stmt = conn.prepare("SELECT key, value FROM metadata;")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        metadata.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
    }

    let mut cross_sections = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT river, reach, river_station, station_elevation, roughness, geom
         FROM XS ORDER BY river, reach, river_station DESC;",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let se: String = row.get(3)?;
        let blob: Vec<u8> = row.get(5)?;
        cross_sections.push(CrossSection {
            river: row.get(0)?,
            reach: row.get(1)?,
            river_station: row.get(2)?,
            station_elevation: serde_json::from_str(&se)?,
            roughness: row.get(4)?,
            line: wkb::decode_linestring(wkb::gpkg_unwrap(&blob)?)?,
        });
    }

    let mut rivers = Vec::new();
    let mut stmt = conn.prepare("SELECT river, reach, geom FROM River ORDER BY fid;")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(2)?;
        rivers.push(RiverLine {
            river: row.get(0)?,
            reach: row.get(1)?,
            centerline: wkb::decode_linestring(wkb::gpkg_unwrap(&blob)?)?,
        });
    }

    let mut junctions = Vec::new();
    let mut stmt =
        conn.prepare("SELECT name, upstream, downstream, polygon, geom FROM Junction ORDER BY fid;")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let upstream: String = row.get(1)?;
        let downstream: String = row.get(2)?;
        let polygon: Option<String> = row.get(3)?;
        let blob: Vec<u8> = row.get(4)?;
        junctions.push(Junction {
            name: row.get(0)?,
            upstream: serde_json::from_str(&upstream)?,
            downstream: serde_json::from_str(&downstream)?,
            polygon: polygon.as_deref().map(serde_json::from_str).transpose()?,
            location: wkb::decode_point(wkb::gpkg_unwrap(&blob)?)?,
        });
    }

    let mut structures = Vec::new();
    let mut stmt =
        conn.prepare("SELECT river, reach, river_station, kind, geom FROM Structure ORDER BY fid;")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let blob: Vec<u8> = row.get(4)?;
        structures.push(Structure {
            river: row.get(0)?,
            reach: row.get(1)?,
            river_station: row.get(2)?,
            kind: row.get(3)?,
            line: wkb::decode_linestring(wkb::gpkg_unwrap(&blob)?)?,
        });
    }

    let title = metadata.get("title").cloned().unwrap_or_default();
    Ok((
        GeometryFile {
            title,
            rivers,
            cross_sections,
            junctions,
            structures,
        },
        metadata,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Point;

    fn fixture() -> GeometryFile {
        let xs = |station: f64, x: f64| CrossSection {
            river: "Baxter".to_string(),
            reach: "Upper".to_string(),
            river_station: station,
            line: LineString::new(vec![Point::new(x, -100.0), Point::new(x, 100.0)]),
            station_elevation: vec![(0.0, 180.0), (100.0, 161.2), (200.0, 181.5)],
            roughness: 0.035,
        };
        GeometryFile {
            title: "Baxter geometry".to_string(),
            rivers: vec![RiverLine {
                river: "Baxter".to_string(),
                reach: "Upper".to_string(),
                centerline: LineString::new(vec![Point::new(0.0, 0.0), Point::new(5000.0, 0.0)]),
            }],
            cross_sections: vec![xs(47694.5, 100.0), xs(41971.0, 4000.0)],
            junctions: vec![Junction {
                name: "Confluence".to_string(),
                location: Point::new(5000.0, 0.0),
                upstream: vec![("Baxter".to_string(), "Upper".to_string())],
                downstream: vec![("Baxter".to_string(), "Lower".to_string())],
                polygon: None,
            }],
            structures: vec![Structure {
                river: "Baxter".to_string(),
                reach: "Upper".to_string(),
                river_station: 44000.0,
                kind: "bridge".to_string(),
                line: LineString::new(vec![Point::new(2000.0, -50.0), Point::new(2000.0, 50.0)]),
            }],
        }
    }

    #[test]
    fn test_round_trip_preserves_cross_section_polylines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Baxter.gpkg");
        let geom = fixture();
        let meta = BTreeMap::from([("low_flow".to_string(), "93.6".to_string())]);

        write_gpkg(&path, &geom, "EPSG:2227", &meta).unwrap();
        let (back, meta_back) = read_gpkg(&path).unwrap();

        assert_eq!(back.cross_sections, geom.cross_sections);
        assert_eq!(back.rivers, geom.rivers);
        assert_eq!(back.junctions, geom.junctions);
        assert_eq!(back.structures, geom.structures);
        assert_eq!(meta_back.get("low_flow").map(String::as_str), Some("93.6"));
        assert_eq!(meta_back.get("crs").map(String::as_str), Some("EPSG:2227"));
    }

    #[test]
    fn test_rewriting_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Baxter.gpkg");
        let geom = fixture();

        write_gpkg(&path, &geom, "EPSG:2227", &BTreeMap::new()).unwrap();
        write_gpkg(&path, &geom, "EPSG:2227", &BTreeMap::new()).unwrap();
        let (back, _) = read_gpkg(&path).unwrap();
        assert_eq!(back.cross_sections.len(), 2);
    }

    #[test]
    fn test_missing_gpkg_is_a_precondition_error() {
        assert!(matches!(
            read_gpkg(Path::new("/nonexistent/x.gpkg")),
            Err(StageError::Precondition(_))
        ));
    }

    #[test]
    fn test_wkb_wrap_unwrap() {
        let line = LineString::new(vec![Point::new(1.0, 2.0), Point::new(3.0, 4.0)]);
        let wrapped = wkb::gpkg_wrap(wkb::encode_linestring(&line), 2227);
        assert_eq!(&wrapped[..2], b"GP");
        let raw = wkb::gpkg_unwrap(&wrapped).unwrap();
        assert_eq!(wkb::decode_linestring(raw).unwrap(), line);
        // Raw WKB passes through untouched.
        assert_eq!(
            wkb::decode_linestring(wkb::gpkg_unwrap(raw).unwrap()).unwrap(),
            line
        );
    }
}
