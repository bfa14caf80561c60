//! # Territory Reconciler
//!
//! Spatial reconciliation of hiking routes, POIs, huts and mountain groups
//! against the region → province → area → sector hierarchy.
//!
//! This library provides:
//! - A containment resolver (R-tree bounding-box prefilter + exact
//!   intersection test) returning deterministic ascending container ids
//! - A reconciliation engine that links containers to their parents and
//!   assigns features to every container they intersect
//! - A dispatch layer for chunked, dry-run, synchronous or queued runs with
//!   idempotent retry
//!
//! ## Features
//!
//! - **`parallel`** - Evaluate exact predicates in parallel with rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use territory_reconciler::{
//!     Container, ContainerLevel, Feature, FeatureKind, ReconcileConfig, ReconciliationEngine,
//! };
//!
//! let mut engine = ReconciliationEngine::in_memory(ReconcileConfig::default()).unwrap();
//! let store = engine.store();
//! store
//!     .save_container(&Container::new(
//!         ContainerLevel::Sector,
//!         5,
//!         "S1",
//!         "POLYGON((10 43, 11 43, 11 44, 10 44, 10 43))",
//!     ))
//!     .unwrap();
//! store
//!     .save_feature(&Feature::new(
//!         FeatureKind::HikingRoute,
//!         1,
//!         Some("LINESTRING(10.2 43.5, 10.8 43.5)"),
//!     ))
//!     .unwrap();
//!
//! let outcome = engine
//!     .reconcile_feature(FeatureKind::HikingRoute, 1, ContainerLevel::Sector)
//!     .unwrap();
//! assert_eq!(outcome.container_ids(), &[5]);
//! ```

use std::fmt;
use std::str::FromStr;

use rstar::{RTreeObject, AABB};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, ReconcileError, Result};

// Configuration (JSON file + defaults)
pub mod config;
pub use config::{ReconcileConfig, TieBreak, MAX_CHUNK_SIZE};

// WKT parsing, validation and overlap measures
pub mod geometry;
pub use geometry::{parse_wkt, validate_geometry, SRID_WGS84};

// Geographic utilities (haversine, point-to-line distance, buffers)
pub mod geo_utils;

// SQLite-backed geometry store and feature repository
pub mod store;
pub use store::{FeatureFilter, Notification, SpatialStore};

// Containment resolver (bbox prefilter + exact intersects)
pub mod resolver;
pub use resolver::ContainmentResolver;

// Hierarchical reconciliation engine
pub mod engine;
pub use engine::{
    AssociationReport, ChunkMode, ChunkReport, FeatureOutcome, LinkReport, ReconciliationEngine,
};

// Dispatch, job queues and workers
pub mod dispatch;
pub use dispatch::{
    dispatch, execute_job, reconcile_scope, spawn_workers, DispatchOptions, DispatchOutcome,
    JobCounts, JobQueue, JobStatus, MemoryQueue, QueuedJob, ReconcileJob, ScopeOptions,
    ScopeReport, SqliteJobQueue, Worker, WorkerPoolHandle, WorkerReport,
};

// ============================================================================
// Core Types
// ============================================================================

/// Kind of geolocated feature being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    HikingRoute,
    EcPoi,
    CaiHut,
    MountainGroup,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 4] = [
        FeatureKind::HikingRoute,
        FeatureKind::EcPoi,
        FeatureKind::CaiHut,
        FeatureKind::MountainGroup,
    ];

    /// Singular snake-case name, also the prefix of assignment tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::HikingRoute => "hiking_route",
            FeatureKind::EcPoi => "ec_poi",
            FeatureKind::CaiHut => "cai_hut",
            FeatureKind::MountainGroup => "mountain_group",
        }
    }

    /// Table holding the feature records.
    pub fn table(&self) -> &'static str {
        match self {
            FeatureKind::HikingRoute => "hiking_routes",
            FeatureKind::EcPoi => "ec_pois",
            FeatureKind::CaiHut => "cai_huts",
            FeatureKind::MountainGroup => "mountain_groups",
        }
    }

    /// Name used on the command line.
    pub fn cli_name(&self) -> &'static str {
        match self {
            FeatureKind::HikingRoute => "hiking-routes",
            FeatureKind::EcPoi => "ec-pois",
            FeatureKind::CaiHut => "cai-huts",
            FeatureKind::MountainGroup => "mountain-groups",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureKind {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        FeatureKind::ALL
            .into_iter()
            .find(|k| normalized == k.as_str() || normalized == k.table())
            .ok_or_else(|| ReconcileError::Config(format!("unknown feature type '{}'", s)))
    }
}

/// Level of the administrative/geographic container hierarchy.
///
/// Ordered top-down: a region contains provinces, a province contains areas,
/// an area contains sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerLevel {
    Region,
    Province,
    Area,
    Sector,
}

impl ContainerLevel {
    pub const ALL: [ContainerLevel; 4] = [
        ContainerLevel::Region,
        ContainerLevel::Province,
        ContainerLevel::Area,
        ContainerLevel::Sector,
    ];

    pub fn singular(&self) -> &'static str {
        match self {
            ContainerLevel::Region => "region",
            ContainerLevel::Province => "province",
            ContainerLevel::Area => "area",
            ContainerLevel::Sector => "sector",
        }
    }

    /// Table holding the container records; also the `--model` value.
    pub fn table(&self) -> &'static str {
        match self {
            ContainerLevel::Region => "regions",
            ContainerLevel::Province => "provinces",
            ContainerLevel::Area => "areas",
            ContainerLevel::Sector => "sectors",
        }
    }

    /// Immediate parent level (`None` for regions).
    pub fn parent(&self) -> Option<ContainerLevel> {
        match self {
            ContainerLevel::Region => None,
            ContainerLevel::Province => Some(ContainerLevel::Region),
            ContainerLevel::Area => Some(ContainerLevel::Province),
            ContainerLevel::Sector => Some(ContainerLevel::Area),
        }
    }

    /// Immediate child level (`None` for sectors).
    pub fn child(&self) -> Option<ContainerLevel> {
        match self {
            ContainerLevel::Region => Some(ContainerLevel::Province),
            ContainerLevel::Province => Some(ContainerLevel::Area),
            ContainerLevel::Area => Some(ContainerLevel::Sector),
            ContainerLevel::Sector => None,
        }
    }

    /// Pivot table linking features of `kind` to containers of this level.
    pub fn assignment_table(&self, kind: FeatureKind) -> String {
        format!("{}_{}", kind.as_str(), self.singular())
    }
}

impl fmt::Display for ContainerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for ContainerLevel {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        ContainerLevel::ALL
            .into_iter()
            .find(|l| normalized == l.table() || normalized == l.singular())
            .ok_or_else(|| {
                ReconcileError::Config(format!(
                    "unknown container model '{}' (expected regions|provinces|areas|sectors)",
                    s
                ))
            })
    }
}

/// Many-to-many links between hiking routes and other entities, resolved by
/// identifier matching or proximity rather than containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Association {
    /// Routes ↔ clubs, matched on `source_ref` codes.
    Club,
    /// Routes ↔ huts within the configured distance.
    CaiHut,
    /// Routes ↔ POIs within the configured distance.
    EcPoi,
}

impl Association {
    pub fn pivot_table(&self) -> &'static str {
        match self {
            Association::Club => "hiking_route_club",
            Association::CaiHut => "hiking_route_cai_hut",
            Association::EcPoi => "hiking_route_ec_poi",
        }
    }

    /// Feature kind on the related side, if it is a feature.
    pub fn related_kind(&self) -> Option<FeatureKind> {
        match self {
            Association::Club => None,
            Association::CaiHut => Some(FeatureKind::CaiHut),
            Association::EcPoi => Some(FeatureKind::EcPoi),
        }
    }
}

/// A geolocated feature record.
///
/// The geometry is kept as WKT, the store's source of truth, and parsed per
/// feature so that one malformed record never fails a whole chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub kind: FeatureKind,
    pub name: Option<String>,
    /// WKT geometry (SRID given by `srid`); `None` when not yet geolocated
    pub geometry_wkt: Option<String>,
    pub srid: i32,
    /// Curation maturity 0-4; 4 = validated
    pub osm2cai_status: u8,
    /// `;`-separated club codes (hiking routes only)
    pub source_ref: Option<String>,
}

impl Feature {
    /// Create a feature with default status and WGS84 geometry.
    pub fn new(kind: FeatureKind, id: i64, geometry_wkt: Option<&str>) -> Self {
        Self {
            id,
            kind,
            name: None,
            geometry_wkt: geometry_wkt.map(str::to_string),
            srid: SRID_WGS84,
            osm2cai_status: 0,
            source_ref: None,
        }
    }

    pub fn with_status(mut self, status: u8) -> Self {
        self.osm2cai_status = status;
        self
    }

    pub fn with_source_ref(mut self, source_ref: &str) -> Self {
        self.source_ref = Some(source_ref.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry_wkt
            .as_deref()
            .map(|w| !w.trim().is_empty())
            .unwrap_or(false)
    }

    /// Parse and validate the geometry.
    ///
    /// Returns `Ok(None)` for a feature without geometry.
    pub fn geometry(&self) -> Result<Option<geo::Geometry<f64>>> {
        let wkt = match self.geometry_wkt.as_deref() {
            Some(w) if !w.trim().is_empty() => w,
            _ => return Ok(None),
        };
        let invalid = |reason: String| ReconcileError::invalid_feature_geometry(self.kind, self.id, reason);
        if self.srid != SRID_WGS84 {
            return Err(invalid(format!("SRID {} (expected {})", self.srid, SRID_WGS84)));
        }
        let geom = parse_wkt(wkt).map_err(invalid)?;
        validate_geometry(&geom).map_err(invalid)?;
        Ok(Some(geom))
    }
}

/// An administrative/geographic boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: i64,
    pub level: ContainerLevel,
    pub name: String,
    pub code: Option<String>,
    /// WKT polygon or multipolygon in WGS84
    pub geometry_wkt: String,
    /// Immediate parent, maintained by the engine
    pub parent_id: Option<i64>,
}

impl Container {
    pub fn new(level: ContainerLevel, id: i64, name: &str, geometry_wkt: &str) -> Self {
        Self {
            id,
            level,
            name: name.to_string(),
            code: None,
            geometry_wkt: geometry_wkt.to_string(),
            parent_id: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// A CAI section/club; routes reference it through its `cai_code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Club {
    pub id: i64,
    pub name: String,
    pub cai_code: String,
}

impl Club {
    pub fn new(id: i64, name: &str, cai_code: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            cai_code: cai_code.to_string(),
        }
    }
}

/// Bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Compute bounds of a geometry (`None` for an empty geometry).
    pub fn from_geometry(geom: &geo::Geometry<f64>) -> Option<Self> {
        use geo::BoundingRect;
        let rect = geom.bounding_rect()?;
        Some(Self {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lng: rect.min().x,
            max_lng: rect.max().x,
        })
    }

    /// Check if this box intersects another.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }

    /// Grow the box by a distance in meters on every side.
    pub fn expand_meters(&self, meters: f64) -> Self {
        let ref_lat = (self.min_lat + self.max_lat) / 2.0;
        let (dlat, dlng) = geo_utils::meters_to_degrees(meters, ref_lat);
        Self {
            min_lat: self.min_lat - dlat,
            max_lat: self.max_lat + dlat,
            min_lng: self.min_lng - dlng,
            max_lng: self.max_lng + dlng,
        }
    }

    pub fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

// ============================================================================
// Spatial Indexing Types
// ============================================================================

/// Container envelope stored in the resolver's R-tree.
#[derive(Debug, Clone)]
pub struct ContainerBounds {
    pub container_id: i64,
    pub bounds: Bounds,
}

impl RTreeObject for ContainerBounds {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds.envelope()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_hierarchy() {
        assert_eq!(ContainerLevel::Region.parent(), None);
        assert_eq!(ContainerLevel::Sector.parent(), Some(ContainerLevel::Area));
        assert_eq!(ContainerLevel::Province.child(), Some(ContainerLevel::Area));
        for level in ContainerLevel::ALL {
            if let Some(parent) = level.parent() {
                assert_eq!(parent.child(), Some(level));
            }
        }
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("sectors".parse::<ContainerLevel>().unwrap(), ContainerLevel::Sector);
        assert_eq!("Province".parse::<ContainerLevel>().unwrap(), ContainerLevel::Province);
        assert!(matches!(
            "districts".parse::<ContainerLevel>(),
            Err(ReconcileError::Config(_))
        ));
    }

    #[test]
    fn test_feature_kind_from_str() {
        assert_eq!("hiking-routes".parse::<FeatureKind>().unwrap(), FeatureKind::HikingRoute);
        assert_eq!("ec_poi".parse::<FeatureKind>().unwrap(), FeatureKind::EcPoi);
        assert!("trails".parse::<FeatureKind>().is_err());
    }

    #[test]
    fn test_assignment_table_names() {
        assert_eq!(
            ContainerLevel::Sector.assignment_table(FeatureKind::HikingRoute),
            "hiking_route_sector"
        );
        assert_eq!(
            ContainerLevel::Region.assignment_table(FeatureKind::MountainGroup),
            "mountain_group_region"
        );
    }

    #[test]
    fn test_feature_geometry_null_and_srid() {
        let f = Feature::new(FeatureKind::HikingRoute, 1, None);
        assert!(!f.has_geometry());
        assert!(f.geometry().unwrap().is_none());

        let mut f = Feature::new(FeatureKind::HikingRoute, 2, Some("LINESTRING(10 43, 11 44)"));
        assert!(f.geometry().unwrap().is_some());
        f.srid = 3857;
        assert!(matches!(f.geometry(), Err(ReconcileError::InvalidGeometry { .. })));
    }

    #[test]
    fn test_bounds_expand() {
        let b = Bounds {
            min_lat: 43.0,
            max_lat: 43.0,
            min_lng: 10.0,
            max_lng: 10.0,
        };
        let e = b.expand_meters(1000.0);
        assert!(e.min_lat < 43.0 && e.max_lat > 43.0);
        assert!((e.max_lat - 43.0 - 0.009).abs() < 0.001);
        assert!(e.max_lng - 10.0 > e.max_lat - 43.0);
    }
}
