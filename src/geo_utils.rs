//! Geographic utilities for proximity associations.
//!
//! Distances are haversine meters. Point-to-line distances go through the
//! closest point on the great-circle arc.

use geo::{
    Closest, Coord, Distance, Geometry, Haversine, HaversineClosestPoint, LineString, Point,
    Polygon,
};

/// Great-circle distance between two lon/lat coordinates.
pub fn haversine_distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Haversine::distance(Point::from(a), Point::from(b))
}

/// Convert a distance in meters to (latitude, longitude) degree offsets at
/// the given reference latitude.
pub fn meters_to_degrees(meters: f64, ref_lat: f64) -> (f64, f64) {
    let dlat = meters / 111_320.0;
    let cos_lat = ref_lat.to_radians().cos().abs().max(1e-6);
    let dlng = meters / (111_320.0 * cos_lat);
    (dlat, dlng)
}

fn closest_distance(p: Point<f64>, closest: Closest<f64>) -> Option<f64> {
    match closest {
        Closest::Intersection(_) => Some(0.0),
        Closest::SinglePoint(q) => Some(Haversine::distance(p, q)),
        Closest::Indeterminate => None,
    }
}

fn point_linestring_distance(p: Point<f64>, ls: &LineString<f64>) -> Option<f64> {
    match ls.0.len() {
        0 => None,
        1 => Some(Haversine::distance(p, Point::from(ls.0[0]))),
        _ => closest_distance(p, ls.haversine_closest_point(&p)),
    }
}

fn point_polygon_distance(p: Point<f64>, polygon: &Polygon<f64>) -> Option<f64> {
    use geo::Contains;
    if polygon.contains(&p) {
        return Some(0.0);
    }
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .filter_map(|ring| point_linestring_distance(p, ring))
        .min_by(|a, b| a.total_cmp(b))
}

/// Minimum distance from a point to any part of a geometry.
///
/// Returns `None` for an empty geometry.
pub fn point_geometry_distance(p: Coord<f64>, geom: &Geometry<f64>) -> Option<f64> {
    let p = Point::from(p);
    match geom {
        Geometry::Point(q) => Some(Haversine::distance(p, *q)),
        Geometry::MultiPoint(mp) => mp
            .0
            .iter()
            .map(|q| Haversine::distance(p, *q))
            .min_by(|a, b| a.total_cmp(b)),
        Geometry::Line(l) => closest_distance(p, l.haversine_closest_point(&p)),
        Geometry::LineString(ls) => point_linestring_distance(p, ls),
        Geometry::MultiLineString(mls) => mls
            .0
            .iter()
            .filter_map(|ls| point_linestring_distance(p, ls))
            .min_by(|a, b| a.total_cmp(b)),
        Geometry::Polygon(polygon) => point_polygon_distance(p, polygon),
        Geometry::MultiPolygon(mp) => mp
            .0
            .iter()
            .filter_map(|polygon| point_polygon_distance(p, polygon))
            .min_by(|a, b| a.total_cmp(b)),
        Geometry::GeometryCollection(gc) => gc
            .0
            .iter()
            .filter_map(|g| point_geometry_distance(p.0, g))
            .min_by(|a, b| a.total_cmp(b)),
        Geometry::Rect(r) => point_polygon_distance(p, &r.to_polygon()),
        Geometry::Triangle(t) => point_polygon_distance(p, &t.to_polygon()),
    }
}

/// Representative point of a point-like geometry (huts and POIs).
pub fn anchor_point(geom: &Geometry<f64>) -> Option<Coord<f64>> {
    use geo::Centroid;
    match geom {
        Geometry::Point(p) => Some(p.0),
        other => other.centroid().map(|c| c.0),
    }
}
