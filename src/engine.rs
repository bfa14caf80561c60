//! # Reconciliation Engine
//!
//! Maintains the container hierarchy and the feature assignment tables.
//!
//! ## Operations
//!
//! - **Container linking**: every container at a level is resolved against
//!   the level above and gets exactly one `parent_id`, chosen by the
//!   configured [`TieBreak`]. One sequential sweep per level.
//! - **Feature assignment**: a feature is resolved against a level and one
//!   row is written per intersecting container. Additive by default;
//!   replace mode recomputes the rows of the exact scope.
//! - **Associations**: routes ↔ clubs by `source_ref` code, routes ↔ huts
//!   and routes ↔ POIs by distance.
//!
//! Per-feature failures are logged with the feature id and aggregated into
//! reports; a chunk never aborts on one record.

use std::collections::BTreeSet;

use geo::Geometry;
use serde::{Deserialize, Serialize};

use crate::config::{ReconcileConfig, TieBreak};
use crate::error::{OptionExt, ReconcileError, Result};
use crate::geometry::{self, validate_geometry};
use crate::resolver::ContainmentResolver;
use crate::store::{FeatureFilter, SpatialStore};
use crate::{geo_utils, Association, Bounds, ContainerLevel, Feature, FeatureKind};

// ============================================================================
// Types
// ============================================================================

/// How a chunk writes its assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Insert-if-absent; existing rows are never removed.
    #[default]
    Additive,
    /// Delete the in-scope rows of each feature, then insert the fresh set.
    Replace,
}

/// Result of reconciling one feature against one level.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutcome {
    /// At least one container intersects.
    Assigned { container_ids: Vec<i64>, changed: bool },
    /// No container intersects; tracked by the gap metric.
    Unresolved { changed: bool },
    /// The feature has no geometry.
    Skipped,
}

impl FeatureOutcome {
    /// Intersecting container ids, ascending (empty unless assigned).
    pub fn container_ids(&self) -> &[i64] {
        match self {
            FeatureOutcome::Assigned { container_ids, .. } => container_ids,
            _ => &[],
        }
    }

    /// Whether the stored assignment set changed.
    pub fn changed(&self) -> bool {
        match self {
            FeatureOutcome::Assigned { changed, .. } | FeatureOutcome::Unresolved { changed } => {
                *changed
            }
            FeatureOutcome::Skipped => false,
        }
    }
}

/// Counts for one chunk of features.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkReport {
    /// Features resolved and written (assigned or unresolved)
    pub processed: usize,
    /// Features whose assignment set changed
    pub updated: usize,
    /// Processed features intersecting no container
    pub unresolved: usize,
    /// Features without geometry or with invalid geometry
    pub skipped: usize,
    /// Features that hit a store error
    pub failed: Vec<i64>,
    /// Features with invalid geometry (also counted in `skipped`)
    pub invalid: Vec<i64>,
    /// Last store error seen, for job bookkeeping
    pub last_error: Option<String>,
}

impl ChunkReport {
    pub fn merge(&mut self, other: ChunkReport) {
        self.processed += other.processed;
        self.updated += other.updated;
        self.unresolved += other.unresolved;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
        self.invalid.extend(other.invalid);
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
    }

    fn record_failure(&mut self, id: i64, error: &ReconcileError) {
        self.failed.push(id);
        self.last_error = Some(error.to_string());
    }
}

/// Result of linking one container level to its parent level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkReport {
    pub level: ContainerLevel,
    /// Containers given a parent
    pub linked: usize,
    /// Containers whose stored parent changed
    pub changed: usize,
    /// Containers intersecting no parent (parent set to NULL)
    pub orphaned: Vec<i64>,
    /// Containers intersecting several parents
    pub ambiguous: Vec<i64>,
    pub invalid: Vec<i64>,
    pub failed: Vec<i64>,
}

impl LinkReport {
    fn new(level: ContainerLevel) -> Self {
        Self {
            level,
            linked: 0,
            changed: 0,
            orphaned: Vec::new(),
            ambiguous: Vec::new(),
            invalid: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Result of a club or proximity association pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationReport {
    pub association: Association,
    /// Routes examined
    pub processed: usize,
    /// New association rows
    pub linked: usize,
    /// Routes without codes (clubs) or without geometry (proximity)
    pub skipped: usize,
    pub invalid: Vec<i64>,
    pub failed: Vec<i64>,
    /// `source_ref` codes matching no club, sorted
    pub unmatched_codes: Vec<String>,
}

impl AssociationReport {
    fn new(association: Association) -> Self {
        Self {
            association,
            processed: 0,
            linked: 0,
            skipped: 0,
            invalid: Vec::new(),
            failed: Vec::new(),
            unmatched_codes: Vec::new(),
        }
    }
}

// ============================================================================
// Reconciliation Engine
// ============================================================================

/// Hierarchical reconciliation engine over one store connection.
pub struct ReconciliationEngine {
    store: SpatialStore,
    resolver: ContainmentResolver,
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    // ========================================================================
    // Initialization
    // ========================================================================

    pub fn new(store: SpatialStore, config: ReconcileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            resolver: ContainmentResolver::new(config.geometry_cache_size),
            config,
        })
    }

    /// Open an engine on a database file.
    pub fn open(path: &str, config: ReconcileConfig) -> Result<Self> {
        let store = SpatialStore::open(path, config.busy_timeout_ms)?;
        Self::new(store, config)
    }

    /// Create an engine over an in-memory database (for testing).
    pub fn in_memory(config: ReconcileConfig) -> Result<Self> {
        Self::new(SpatialStore::in_memory()?, config)
    }

    pub fn store(&self) -> &SpatialStore {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ContainmentResolver {
        &self.resolver
    }

    /// Drop cached container data for a level after out-of-band edits.
    pub fn invalidate(&mut self, level: ContainerLevel) {
        self.resolver.invalidate(level);
    }

    // ========================================================================
    // Containment
    // ========================================================================

    /// Ascending ids of the containers at `level` intersecting `geom`.
    pub fn resolve_containment(
        &mut self,
        geom: &Geometry<f64>,
        level: ContainerLevel,
    ) -> Result<Vec<i64>> {
        validate_geometry(geom).map_err(|reason| ReconcileError::InvalidGeometry {
            feature: "input geometry".to_string(),
            reason,
        })?;
        self.resolver.resolve(&self.store, geom, level)
    }

    /// Gap metric: features with geometry and no assignment at `level`.
    pub fn missing_count(&self, kind: FeatureKind, level: ContainerLevel) -> Result<usize> {
        self.store.missing_count(kind, level)
    }

    // ========================================================================
    // Container Linking
    // ========================================================================

    /// Set `parent_id` for every container at `level`.
    pub fn link_containers(&mut self, level: ContainerLevel) -> Result<LinkReport> {
        let parent_level = level.parent().ok_or_else(|| {
            ReconcileError::Config(format!("{} have no parent level to link to", level))
        })?;
        let mut report = LinkReport::new(level);

        for id in self.store.container_ids(level)? {
            match self.link_container(level, parent_level, id, &mut report) {
                Ok(()) => {}
                Err(e @ ReconcileError::InvalidGeometry { .. }) => {
                    log::warn!("[Engine] {}", e);
                    report.invalid.push(id);
                }
                Err(e) => {
                    log::error!("[Engine] Linking {} {} failed: {}", level.singular(), id, e);
                    report.failed.push(id);
                }
            }
        }

        log::info!(
            "[Engine] Linked {}: {} linked, {} changed, {} orphaned, {} ambiguous, {} invalid, {} failed",
            level,
            report.linked,
            report.changed,
            report.orphaned.len(),
            report.ambiguous.len(),
            report.invalid.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn link_container(
        &mut self,
        level: ContainerLevel,
        parent_level: ContainerLevel,
        id: i64,
        report: &mut LinkReport,
    ) -> Result<()> {
        let geom = self.resolver.geometry(&self.store, level, id)?;
        let candidates = self.resolver.resolve(&self.store, &geom, parent_level)?;

        let parent = match candidates.as_slice() {
            [] => None,
            [only] => Some(*only),
            several => {
                let chosen = self.pick_parent(&geom, parent_level, several)?;
                log::warn!(
                    "[Engine] {} {} intersects {} {:?}; picked {} ({:?})",
                    level.singular(),
                    id,
                    parent_level,
                    several,
                    chosen,
                    self.config.tie_break
                );
                report.ambiguous.push(id);
                Some(chosen)
            }
        };

        if self.store.set_container_parent(level, id, parent)? {
            report.changed += 1;
        }
        match parent {
            Some(_) => report.linked += 1,
            None => {
                log::debug!("[Engine] {} {} has no parent", level.singular(), id);
                report.orphaned.push(id);
            }
        }
        Ok(())
    }

    /// Apply the tie-break policy to ascending candidates (at least two).
    fn pick_parent(
        &mut self,
        child: &Geometry<f64>,
        parent_level: ContainerLevel,
        candidates: &[i64],
    ) -> Result<i64> {
        let smallest = candidates[0];
        if self.config.tie_break == TieBreak::SmallestId {
            return Ok(smallest);
        }

        let mut best: Option<(i64, f64)> = None;
        for &id in candidates {
            let parent = self.resolver.geometry(&self.store, parent_level, id)?;
            let Some(area) = geometry::overlap_area(child, &parent) else {
                continue;
            };
            // Strictly greater keeps the smallest id on equal areas
            if best.map_or(true, |(_, a)| area > a) {
                best = Some((id, area));
            }
        }
        Ok(best.map(|(id, _)| id).unwrap_or(smallest))
    }

    /// Link provinces, then areas, then sectors.
    pub fn link_hierarchy(&mut self) -> Result<Vec<LinkReport>> {
        ContainerLevel::ALL
            .into_iter()
            .filter(|level| level.parent().is_some())
            .map(|level| self.link_containers(level))
            .collect()
    }

    // ========================================================================
    // Feature Assignment
    // ========================================================================

    /// Reconcile one feature against one level, additively.
    ///
    /// Errors surface to the caller: a missing feature is `NotFound`, a bad
    /// geometry is `InvalidGeometry`.
    pub fn reconcile_feature(
        &mut self,
        kind: FeatureKind,
        id: i64,
        level: ContainerLevel,
    ) -> Result<FeatureOutcome> {
        let feature = self
            .store
            .get_feature(kind, id)?
            .ok_or_not_found(kind.as_str(), id)?;

        let geom = match feature.geometry()? {
            Some(geom) => geom,
            None => return Ok(FeatureOutcome::Skipped),
        };
        let ids = self.resolver.resolve(&self.store, &geom, level)?;
        let outcome = write_assignments(&self.store, &feature, level, ids, ChunkMode::Additive, &[])?;
        log::debug!("[Engine] {} {} -> {} {:?}", kind, id, level, outcome.container_ids());
        Ok(outcome)
    }

    /// Reconcile a chunk of features against one level.
    ///
    /// `container_filter` restricts the scope to those containers of `level`
    /// (empty means every container). Writes for the chunk share one
    /// transaction.
    pub fn reconcile_chunk(
        &mut self,
        level: ContainerLevel,
        features: &[Feature],
        mode: ChunkMode,
        container_filter: &[i64],
    ) -> Result<ChunkReport> {
        let mut report = ChunkReport::default();
        let mut targets: Vec<&Feature> = Vec::new();
        // Features whose rows a replace run clears without recomputing
        let mut unplaceable: Vec<&Feature> = Vec::new();
        let mut geoms: Vec<Geometry<f64>> = Vec::new();

        for feature in features {
            match feature.geometry() {
                Ok(Some(geom)) => {
                    targets.push(feature);
                    geoms.push(geom);
                }
                Ok(None) => {
                    report.skipped += 1;
                    unplaceable.push(feature);
                }
                Err(e) => {
                    log::warn!("[Engine] Skipping {}", e);
                    report.skipped += 1;
                    report.invalid.push(feature.id);
                    unplaceable.push(feature);
                }
            }
        }

        let resolved = match self.resolver.resolve_many(&self.store, &geoms, level) {
            Ok(resolved) => resolved,
            Err(e) => {
                log::error!("[Engine] Resolving chunk against {} failed: {}", level, e);
                for feature in &targets {
                    report.record_failure(feature.id, &e);
                }
                return Ok(report);
            }
        };

        let writes = self.store.in_transaction(|store| {
            let mut outcomes = Vec::with_capacity(targets.len());
            for (feature, ids) in targets.iter().zip(resolved) {
                outcomes.push((
                    feature.id,
                    write_assignments(store, feature, level, ids, mode, container_filter),
                ));
            }
            // Features without a usable geometry keep no rows in a replace run
            if mode == ChunkMode::Replace {
                for feature in &unplaceable {
                    store.delete_assignments(feature.kind, level, feature.id, container_filter)?;
                }
            }
            Ok(outcomes)
        });

        match writes {
            Ok(outcomes) => {
                for (id, outcome) in outcomes {
                    match outcome {
                        Ok(outcome) => {
                            report.processed += 1;
                            if outcome.changed() {
                                report.updated += 1;
                            }
                            if matches!(outcome, FeatureOutcome::Unresolved { .. }) {
                                report.unresolved += 1;
                            }
                        }
                        Err(e) => {
                            log::error!("[Engine] Writing feature {} failed: {}", id, e);
                            report.record_failure(id, &e);
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("[Engine] Chunk transaction against {} failed: {}", level, e);
                for feature in &targets {
                    report.record_failure(feature.id, &e);
                }
            }
        }

        Ok(report)
    }

    // ========================================================================
    // Associations
    // ========================================================================

    /// Link routes to clubs whose `cai_code` appears in the route's
    /// `source_ref`. `route_ids` empty means every route.
    pub fn associate_clubs(&mut self, route_ids: &[i64]) -> Result<AssociationReport> {
        let mut report = AssociationReport::new(Association::Club);
        let mut unmatched = BTreeSet::new();
        let filter = FeatureFilter::default().with_ids(route_ids);
        let mut after = None;

        loop {
            let routes = self.store.feature_chunk(
                FeatureKind::HikingRoute,
                after,
                self.config.chunk_size,
                &filter,
            )?;
            let Some(last) = routes.last() else { break };
            after = Some(last.id);

            self.store.in_transaction(|store| {
                for route in &routes {
                    let codes = source_ref_codes(route.source_ref.as_deref());
                    if codes.is_empty() {
                        report.skipped += 1;
                        continue;
                    }
                    report.processed += 1;
                    match link_clubs(store, route.id, &codes, &mut unmatched) {
                        Ok(linked) => report.linked += linked,
                        Err(e) => {
                            log::error!("[Engine] Club association for route {} failed: {}", route.id, e);
                            report.failed.push(route.id);
                        }
                    }
                }
                Ok(())
            })?;
        }

        report.unmatched_codes = unmatched.into_iter().collect();
        log::info!(
            "[Engine] Club association: {} routes, {} new links, {} unmatched codes",
            report.processed,
            report.linked,
            report.unmatched_codes.len()
        );
        Ok(report)
    }

    /// Link routes to huts or POIs within `max_distance` meters (default from
    /// the configuration). `route_ids` empty means every geolocated route.
    pub fn associate_nearby(
        &mut self,
        target: Association,
        route_ids: &[i64],
        max_distance: Option<f64>,
    ) -> Result<AssociationReport> {
        let kind = target.related_kind().ok_or_else(|| {
            ReconcileError::Config(format!("{} is not a proximity association", target.pivot_table()))
        })?;
        let distance = max_distance.unwrap_or(match target {
            Association::EcPoi => self.config.poi_distance_meters,
            _ => self.config.hut_distance_meters,
        });
        if !distance.is_finite() || distance < 0.0 {
            return Err(ReconcileError::Config(format!("invalid distance {}", distance)));
        }

        let mut report = AssociationReport::new(target);
        let filter = FeatureFilter::geolocated().with_ids(route_ids);
        let mut after = None;

        loop {
            let routes = self.store.feature_chunk(
                FeatureKind::HikingRoute,
                after,
                self.config.chunk_size,
                &filter,
            )?;
            let Some(last) = routes.last() else { break };
            after = Some(last.id);

            self.store.in_transaction(|store| {
                for route in &routes {
                    let geom = match route.geometry() {
                        Ok(Some(geom)) => geom,
                        Ok(None) => {
                            report.skipped += 1;
                            continue;
                        }
                        Err(e) => {
                            log::warn!("[Engine] Skipping {}", e);
                            report.invalid.push(route.id);
                            continue;
                        }
                    };
                    report.processed += 1;
                    match link_nearby(store, target, kind, route.id, &geom, distance) {
                        Ok(linked) => report.linked += linked,
                        Err(e) => {
                            log::error!("[Engine] {} association for route {} failed: {}", kind, route.id, e);
                            report.failed.push(route.id);
                        }
                    }
                }
                Ok(())
            })?;
        }

        log::info!(
            "[Engine] {} association within {} m: {} routes, {} new links",
            kind,
            distance,
            report.processed,
            report.linked
        );
        Ok(report)
    }
}

// ============================================================================
// Write helpers
// ============================================================================

fn write_assignments(
    store: &SpatialStore,
    feature: &Feature,
    level: ContainerLevel,
    mut ids: Vec<i64>,
    mode: ChunkMode,
    container_filter: &[i64],
) -> Result<FeatureOutcome> {
    if !container_filter.is_empty() {
        ids.retain(|id| container_filter.contains(id));
    }

    let changed = match mode {
        ChunkMode::Additive => {
            store.in_savepoint(|s| s.insert_assignments(feature.kind, level, feature.id, &ids))? > 0
        }
        ChunkMode::Replace => {
            store.replace_assignments(feature.kind, level, feature.id, container_filter, &ids)?
        }
    };

    Ok(if ids.is_empty() {
        FeatureOutcome::Unresolved { changed }
    } else {
        FeatureOutcome::Assigned {
            container_ids: ids,
            changed,
        }
    })
}

/// Codes listed in a `source_ref` (`;`-separated, blanks ignored).
fn source_ref_codes(source_ref: Option<&str>) -> Vec<&str> {
    source_ref
        .map(|s| s.split(';').map(str::trim).filter(|c| !c.is_empty()).collect())
        .unwrap_or_default()
}

fn link_clubs(
    store: &SpatialStore,
    route_id: i64,
    codes: &[&str],
    unmatched: &mut BTreeSet<String>,
) -> Result<usize> {
    let mut linked = 0;
    for code in codes {
        let clubs = store.clubs_by_code(code)?;
        if clubs.is_empty() {
            unmatched.insert(code.to_string());
        }
        for club_id in clubs {
            if store.insert_association(Association::Club, route_id, club_id, None)? {
                linked += 1;
            }
        }
    }
    Ok(linked)
}

fn link_nearby(
    store: &SpatialStore,
    target: Association,
    kind: FeatureKind,
    route_id: i64,
    route: &Geometry<f64>,
    max_distance: f64,
) -> Result<usize> {
    let Some(bounds) = Bounds::from_geometry(route) else {
        return Ok(0);
    };
    let mut linked = 0;

    for candidate in store.features_in_bounds(kind, &bounds.expand_meters(max_distance))? {
        let anchor = match candidate.geometry() {
            Ok(Some(geom)) => geo_utils::anchor_point(&geom),
            Ok(None) => None,
            Err(e) => {
                log::debug!("[Engine] Ignoring {}", e);
                None
            }
        };
        let Some(anchor) = anchor else { continue };
        let Some(distance) = geo_utils::point_geometry_distance(anchor, route) else {
            continue;
        };
        if distance <= max_distance
            && store.insert_association(target, route_id, candidate.id, Some(distance))?
        {
            linked += 1;
        }
    }
    Ok(linked)
}

// ============================================================================
// Tests
// ============================================================================
