//! # Containment Resolver
//!
//! Answers "which containers of a level intersect this geometry?".
//!
//! ## Memory Tiers
//!
//! 1. **Always loaded** per level, on first use:
//!    - Container envelopes in an R-tree (a few dozen bytes per container)
//!
//! 2. **LRU cached**:
//!    - Parsed and validated container geometries, keyed by (level, id)
//!
//! A query first collects the containers whose envelope intersects the
//! geometry's envelope, then runs the exact `Intersects` test against each
//! candidate. Results are ascending container ids.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use geo::{Geometry, Intersects};
use lru::LruCache;
use rstar::RTree;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{OptionExt, ReconcileError, Result};
use crate::geometry::{parse_wkt, validate_geometry};
use crate::store::SpatialStore;
use crate::{Bounds, ContainerBounds, ContainerLevel};

struct LevelIndex {
    tree: RTree<ContainerBounds>,
    /// Store container generation this index was built from
    generation: u64,
}

/// Bounding-box prefilter plus exact intersection test, per container level.
pub struct ContainmentResolver {
    indexes: HashMap<ContainerLevel, LevelIndex>,
    geometries: LruCache<(ContainerLevel, i64), Arc<Geometry<f64>>>,
}

impl ContainmentResolver {
    /// Create a resolver caching up to `cache_size` container geometries.
    pub fn new(cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            indexes: HashMap::new(),
            geometries: LruCache::new(capacity),
        }
    }

    /// Drop a level's index and cached geometries after container edits.
    pub fn invalidate(&mut self, level: ContainerLevel) {
        self.indexes.remove(&level);
        let stale: Vec<(ContainerLevel, i64)> = self
            .geometries
            .iter()
            .filter(|((l, _), _)| *l == level)
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            self.geometries.pop(&key);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.indexes.clear();
        self.geometries.clear();
    }

    /// Number of containers indexed at a level (0 if not yet loaded).
    pub fn indexed_count(&self, level: ContainerLevel) -> usize {
        self.indexes.get(&level).map(|i| i.tree.size()).unwrap_or(0)
    }

    /// Number of container geometries currently cached.
    pub fn cached_geometries(&self) -> usize {
        self.geometries.len()
    }

    fn ensure_index(&mut self, store: &SpatialStore, level: ContainerLevel) -> Result<()> {
        let generation = store.container_generation();
        let fresh = self
            .indexes
            .get(&level)
            .map(|i| i.generation == generation)
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }

        self.invalidate(level);
        let entries = store.container_bounds(level)?;
        log::info!("[Resolver] Indexed {} {}", entries.len(), level);
        self.indexes.insert(
            level,
            LevelIndex {
                tree: RTree::bulk_load(entries),
                generation,
            },
        );
        Ok(())
    }

    /// Containers whose envelope intersects `bounds`, ascending.
    pub fn candidates(
        &mut self,
        store: &SpatialStore,
        bounds: &Bounds,
        level: ContainerLevel,
    ) -> Result<Vec<i64>> {
        self.ensure_index(store, level)?;
        let mut ids: Vec<i64> = match self.indexes.get(&level) {
            Some(index) => index
                .tree
                .locate_in_envelope_intersecting(&bounds.envelope())
                .map(|entry| entry.container_id)
                .collect(),
            None => Vec::new(),
        };
        ids.sort_unstable();
        Ok(ids)
    }

    /// Parsed geometry of one container, loading it into the cache if needed.
    pub fn geometry(
        &mut self,
        store: &SpatialStore,
        level: ContainerLevel,
        id: i64,
    ) -> Result<Arc<Geometry<f64>>> {
        if let Some(geom) = self.geometries.get(&(level, id)) {
            return Ok(Arc::clone(geom));
        }

        let wkt = store
            .container_geometry_wkt(level, id)?
            .ok_or_not_found(level.singular(), id)?;
        let invalid = |reason: String| ReconcileError::invalid_container_geometry(level, id, reason);
        let geom = parse_wkt(&wkt).map_err(invalid)?;
        validate_geometry(&geom).map_err(invalid)?;

        let geom = Arc::new(geom);
        self.geometries.put((level, id), Arc::clone(&geom));
        Ok(geom)
    }

    /// Candidate geometries for `bounds`. Invalid containers are logged and
    /// left out so one broken boundary cannot fail every feature.
    fn candidate_geometries(
        &mut self,
        store: &SpatialStore,
        bounds: &Bounds,
        level: ContainerLevel,
    ) -> Result<Vec<(i64, Arc<Geometry<f64>>)>> {
        let ids = self.candidates(store, bounds, level)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.geometry(store, level, id) {
                Ok(geom) => out.push((id, geom)),
                Err(e @ ReconcileError::InvalidGeometry { .. }) => {
                    log::warn!("[Resolver] Skipping container: {}", e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Ascending ids of the containers at `level` intersecting `geom`.
    ///
    /// `geom` is expected to be validated already.
    pub fn resolve(
        &mut self,
        store: &SpatialStore,
        geom: &Geometry<f64>,
        level: ContainerLevel,
    ) -> Result<Vec<i64>> {
        let Some(bounds) = Bounds::from_geometry(geom) else {
            return Ok(Vec::new());
        };
        let candidates = self.candidate_geometries(store, &bounds, level)?;
        Ok(exact_matches(geom, &candidates))
    }

    /// Resolve a batch of geometries against one level.
    ///
    /// Candidate loading is sequential (it touches the store and the cache);
    /// the exact tests run in parallel with the `parallel` feature.
    pub fn resolve_many(
        &mut self,
        store: &SpatialStore,
        geoms: &[Geometry<f64>],
        level: ContainerLevel,
    ) -> Result<Vec<Vec<i64>>> {
        let mut work: Vec<(&Geometry<f64>, Vec<(i64, Arc<Geometry<f64>>)>)> =
            Vec::with_capacity(geoms.len());
        for geom in geoms {
            let candidates = match Bounds::from_geometry(geom) {
                Some(bounds) => self.candidate_geometries(store, &bounds, level)?,
                None => Vec::new(),
            };
            work.push((geom, candidates));
        }

        #[cfg(feature = "parallel")]
        let results = work
            .par_iter()
            .map(|(geom, candidates)| exact_matches(geom, candidates))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let results = work
            .iter()
            .map(|(geom, candidates)| exact_matches(geom, candidates))
            .collect();

        Ok(results)
    }
}

/// Exact test over ascending candidates; output stays ascending.
fn exact_matches(geom: &Geometry<f64>, candidates: &[(i64, Arc<Geometry<f64>>)]) -> Vec<i64> {
    candidates
        .iter()
        .filter(|(_, container)| container.as_ref().intersects(geom))
        .map(|(id, _)| *id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_wkt, Container};

    fn square(min_lng: f64, min_lat: f64, size: f64) -> String {
        format!(
            "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
            x0 = min_lng,
            y0 = min_lat,
            x1 = min_lng + size,
            y1 = min_lat + size
        )
    }

    fn sector_store() -> SpatialStore {
        let store = SpatialStore::in_memory().unwrap();
        // Two adjacent sectors and a distant one
        for (id, lng) in [(9, 11.0), (5, 10.0), (7, 20.0)] {
            store
                .save_container(&Container::new(
                    ContainerLevel::Sector,
                    id,
                    &format!("S{}", id),
                    &square(lng, 43.0, 1.0),
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_resolve_ascending_ids() {
        let store = sector_store();
        let mut resolver = ContainmentResolver::new(16);
        let route = parse_wkt("LINESTRING(10.5 43.5, 11.5 43.5)").unwrap();

        let ids = resolver.resolve(&store, &route, ContainerLevel::Sector).unwrap();
        assert_eq!(ids, vec![5, 9]);
        assert_eq!(resolver.indexed_count(ContainerLevel::Sector), 3);

        // Deterministic on repeat, now served from the cache
        assert_eq!(resolver.resolve(&store, &route, ContainerLevel::Sector).unwrap(), ids);
        assert_eq!(resolver.cached_geometries(), 2);
    }

    #[test]
    fn test_bbox_hit_without_intersection() {
        let store = SpatialStore::in_memory().unwrap();
        // L-shaped sector whose envelope covers the empty corner
        store
            .save_container(&Container::new(
                ContainerLevel::Sector,
                1,
                "L",
                "POLYGON((0 0, 2 0, 2 1, 1 1, 1 2, 0 2, 0 0))",
            ))
            .unwrap();
        let mut resolver = ContainmentResolver::new(4);
        let point = parse_wkt("POINT(1.5 1.5)").unwrap();

        let bounds = Bounds::from_geometry(&point).unwrap();
        assert_eq!(resolver.candidates(&store, &bounds, ContainerLevel::Sector).unwrap(), vec![1]);
        assert!(resolver.resolve(&store, &point, ContainerLevel::Sector).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_container_is_skipped() {
        let store = sector_store();
        // Bowtie overlapping sector 5
        store
            .save_container(&Container::new(
                ContainerLevel::Sector,
                6,
                "bad",
                "POLYGON((10 43, 11 44, 11 43, 10 44, 10 43))",
            ))
            .unwrap();
        let mut resolver = ContainmentResolver::new(16);
        let route = parse_wkt("LINESTRING(10.2 43.5, 10.4 43.5)").unwrap();

        assert_eq!(resolver.resolve(&store, &route, ContainerLevel::Sector).unwrap(), vec![5]);
        assert!(matches!(
            resolver.geometry(&store, ContainerLevel::Sector, 6),
            Err(ReconcileError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_index_rebuilds_after_container_write() {
        let store = sector_store();
        let mut resolver = ContainmentResolver::new(16);
        let point = parse_wkt("POINT(30.5 43.5)").unwrap();
        assert!(resolver.resolve(&store, &point, ContainerLevel::Sector).unwrap().is_empty());

        store
            .save_container(&Container::new(ContainerLevel::Sector, 12, "S12", &square(30.0, 43.0, 1.0)))
            .unwrap();
        assert_eq!(resolver.resolve(&store, &point, ContainerLevel::Sector).unwrap(), vec![12]);
    }

    #[test]
    fn test_resolve_many_matches_resolve() {
        let store = sector_store();
        let mut resolver = ContainmentResolver::new(2);
        let geoms: Vec<Geometry<f64>> = [
            "LINESTRING(10.5 43.5, 11.5 43.5)",
            "POINT(20.5 43.5)",
            "POINT(50 50)",
        ]
        .iter()
        .map(|w| parse_wkt(w).unwrap())
        .collect();

        let batch = resolver.resolve_many(&store, &geoms, ContainerLevel::Sector).unwrap();
        assert_eq!(batch, vec![vec![5, 9], vec![7], vec![]]);
    }

    #[test]
    fn test_invalidate_level() {
        let store = sector_store();
        let mut resolver = ContainmentResolver::new(16);
        let route = parse_wkt("LINESTRING(10.5 43.5, 11.5 43.5)").unwrap();
        resolver.resolve(&store, &route, ContainerLevel::Sector).unwrap();

        resolver.invalidate(ContainerLevel::Sector);
        assert_eq!(resolver.indexed_count(ContainerLevel::Sector), 0);
        assert_eq!(resolver.cached_geometries(), 0);
    }
}
