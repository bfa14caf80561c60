//! Geometry parsing, validity checks and overlap measures.
//!
//! Geometries are stored as WKT in SRID 4326. Validation runs before any
//! spatial predicate so that a malformed record is reported against its own
//! id instead of producing a wrong answer.

use geo::{Area, BooleanOps, Coord, CoordsIter, Geometry, Line, LineString, MultiPolygon, Polygon};
use rstar::{RTree, RTreeObject, AABB};

/// Spatial reference system of every stored geometry (WGS84 lon/lat).
pub const SRID_WGS84: i32 = 4326;

/// Parse a WKT string to a geo-types Geometry.
pub fn parse_wkt(wkt: &str) -> Result<Geometry<f64>, String> {
    use std::str::FromStr;
    wkt::Wkt::from_str(wkt.trim())
        .map_err(|e| format!("WKT parse error: {}", e))
        .and_then(|w| {
            w.try_into()
                .map_err(|e: wkt::conversion::Error| format!("WKT conversion error: {:?}", e))
        })
}

/// Check that a geometry can take part in a containment query.
///
/// Rejects empty geometries, non-finite or non-WGS84 coordinates, lines with
/// fewer than two points, polygon rings that are too short or unclosed, and
/// self-intersecting rings.
pub fn validate_geometry(geom: &Geometry<f64>) -> Result<(), String> {
    if geom.coords_count() == 0 {
        return Err("empty geometry".to_string());
    }

    for c in geom.coords_iter() {
        if !c.x.is_finite() || !c.y.is_finite() {
            return Err("non-finite coordinate".to_string());
        }
        if !(-180.0..=180.0).contains(&c.x) || !(-90.0..=90.0).contains(&c.y) {
            return Err(format!(
                "coordinate ({}, {}) outside WGS84 range (wrong SRID?)",
                c.x, c.y
            ));
        }
    }

    match geom {
        Geometry::LineString(ls) => validate_line(ls),
        Geometry::MultiLineString(mls) => mls.0.iter().try_for_each(validate_line),
        Geometry::Polygon(p) => validate_polygon(p),
        Geometry::MultiPolygon(mp) => mp.0.iter().try_for_each(validate_polygon),
        Geometry::GeometryCollection(gc) => gc
            .0
            .iter()
            .filter(|g| g.coords_count() > 0)
            .try_for_each(validate_geometry),
        _ => Ok(()),
    }
}

fn validate_line(ls: &LineString<f64>) -> Result<(), String> {
    if ls.0.len() < 2 {
        return Err(format!("line with {} point(s)", ls.0.len()));
    }
    Ok(())
}

fn validate_polygon(polygon: &Polygon<f64>) -> Result<(), String> {
    validate_ring(polygon.exterior(), "exterior ring")?;
    for (i, ring) in polygon.interiors().iter().enumerate() {
        validate_ring(ring, &format!("interior ring {}", i))?;
    }
    Ok(())
}

fn validate_ring(ring: &LineString<f64>, label: &str) -> Result<(), String> {
    if ring.0.len() < 4 {
        return Err(format!("{} has {} coordinates (minimum 4)", label, ring.0.len()));
    }
    if !ring.is_closed() {
        return Err(format!("{} is not closed", label));
    }
    let mut distinct = ring.0.clone();
    distinct.dedup();
    if distinct.len() < 4 {
        return Err(format!("{} is degenerate", label));
    }
    if ring_self_intersects(&distinct) {
        return Err(format!("{} self-intersects", label));
    }
    Ok(())
}

// ============================================================================
// Ring self-intersection
// ============================================================================

/// A ring segment with its position, for R-tree queries.
#[derive(Debug, Clone, Copy)]
struct IndexedSegment {
    idx: usize,
    line: Line<f64>,
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.line.start.x, self.line.start.y],
            [self.line.end.x, self.line.end.y],
        )
    }
}

/// Whether two non-adjacent segments of a closed ring touch or cross.
///
/// Expects consecutive duplicate vertices to be collapsed already; they are
/// common in OSM-derived rings and do not make a ring invalid.
fn ring_self_intersects(coords: &[Coord<f64>]) -> bool {
    let segments: Vec<IndexedSegment> = coords
        .windows(2)
        .enumerate()
        .map(|(idx, w)| IndexedSegment {
            idx,
            line: Line::new(w[0], w[1]),
        })
        .collect();
    let n = segments.len();
    let adjacent = |a: usize, b: usize| b == a + 1 || (a == 0 && b == n - 1);

    let tree = RTree::bulk_load(segments.clone());
    for seg in &segments {
        for other in tree.locate_in_envelope_intersecting(&seg.envelope()) {
            if other.idx <= seg.idx || adjacent(seg.idx, other.idx) {
                continue;
            }
            if geo::algorithm::line_intersection::line_intersection(seg.line, other.line).is_some()
            {
                return true;
            }
        }
    }
    false
}

// ============================================================================
// Overlap
// ============================================================================

/// Area shared by two areal geometries, in square degrees.
///
/// Returns `None` when either side is not a polygon or multipolygon.
pub fn overlap_area(a: &Geometry<f64>, b: &Geometry<f64>) -> Option<f64> {
    let a = as_multi_polygon(a)?;
    let b = as_multi_polygon(b)?;
    Some(a.intersection(&b).unsigned_area())
}

fn as_multi_polygon(geom: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geom {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_polygon() {
        let geom = parse_wkt("POLYGON((10 43, 11 43, 11 44, 10 44, 10 43))").unwrap();
        assert!(matches!(geom, Geometry::Polygon(_)));
        assert!(validate_geometry(&geom).is_ok());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_wkt("LINESTRING(10 43,").is_err());
        assert!(parse_wkt("not wkt").is_err());
    }

    #[test]
    fn test_empty_geometry_rejected() {
        let geom = parse_wkt("LINESTRING EMPTY").unwrap();
        assert_eq!(validate_geometry(&geom).unwrap_err(), "empty geometry");
    }

    #[test]
    fn test_projected_coordinates_rejected() {
        // Web Mercator meters look like a valid shape but are not lon/lat
        let geom = parse_wkt("POINT(1113194.9 5465442.2)").unwrap();
        assert!(validate_geometry(&geom).unwrap_err().contains("WGS84"));
    }

    #[test]
    fn test_bowtie_polygon_rejected() {
        let geom = parse_wkt("POLYGON((10 43, 11 44, 11 43, 10 44, 10 43))").unwrap();
        assert!(validate_geometry(&geom).unwrap_err().contains("self-intersects"));
    }

    #[test]
    fn test_repeated_vertices_accepted() {
        let geom =
            parse_wkt("POLYGON((10 43, 11 43, 11 43, 11 44, 10 44, 10 44, 10 43))").unwrap();
        assert!(validate_geometry(&geom).is_ok());
    }

    #[test]
    fn test_collapsed_ring_rejected() {
        let geom = parse_wkt("POLYGON((10 43, 10 43, 11 43, 11 43, 10 43))").unwrap();
        assert!(validate_geometry(&geom).unwrap_err().contains("degenerate"));
    }

    #[test]
    fn test_single_point_line_rejected() {
        let geom = Geometry::LineString(LineString::from(vec![(10.0, 43.0)]));
        assert!(validate_geometry(&geom).is_err());
    }

    #[test]
    fn test_overlap_area() {
        let a = parse_wkt("POLYGON((0 0, 2 0, 2 2, 0 2, 0 0))").unwrap();
        let b = parse_wkt("POLYGON((1 0, 3 0, 3 2, 1 2, 1 0))").unwrap();
        let area = overlap_area(&a, &b).unwrap();
        assert!((area - 2.0).abs() < 1e-9);

        let line = parse_wkt("LINESTRING(0 0, 1 1)").unwrap();
        assert!(overlap_area(&a, &line).is_none());
    }
}
