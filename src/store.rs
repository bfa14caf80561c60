//! # Spatial Store
//!
//! SQLite-backed feature repository and geometry store.
//!
//! ## Layout
//!
//! - One table per feature kind (`hiking_routes`, `ec_pois`, ...) and per
//!   container level (`regions`, ..., `sectors`). Geometries are WKT in SRID
//!   4326 with precomputed bounding-box columns.
//! - One assignment pivot per (feature kind × container level), e.g.
//!   `hiking_route_sector(feature_id, container_id, created_at)` with a
//!   primary key on the pair. All writes are `INSERT OR IGNORE`, so
//!   re-inserting an existing pair is a silent no-op.
//! - Route associations (`hiking_route_club`, `hiking_route_cai_hut`,
//!   `hiking_route_ec_poi`).
//! - A `change_notifications` outbox written by `save_*` and skipped by
//!   `save_*_without_notification` and by every bulk assignment write.

use std::cell::Cell;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::{
    geometry, Association, Bounds, Club, Container, ContainerBounds, ContainerLevel, Feature,
    FeatureKind,
};

// ============================================================================
// Types
// ============================================================================

/// Selection of features for a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFilter {
    /// Explicit feature ids. When non-empty, the stable-status exclusion is
    /// bypassed: a feature targeted by id is always processed.
    pub feature_ids: Vec<i64>,
    /// Status value excluded from untargeted scans.
    pub stable_status: Option<u8>,
    /// Only features with no assignment row at this level.
    pub missing_level: Option<ContainerLevel>,
    /// Only features with a non-null geometry.
    pub require_geometry: bool,
}

impl FeatureFilter {
    /// Every geolocated feature, whatever its status.
    pub fn geolocated() -> Self {
        Self {
            require_geometry: true,
            ..Default::default()
        }
    }

    pub fn with_ids(mut self, ids: &[i64]) -> Self {
        self.feature_ids = ids.to_vec();
        self
    }

    pub fn excluding_status(mut self, status: Option<u8>) -> Self {
        self.stable_status = status;
        self
    }

    pub fn missing_at(mut self, level: ContainerLevel) -> Self {
        self.missing_level = Some(level);
        self
    }
}

/// A row of the change-notification outbox.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Notification {
    pub id: i64,
    /// Table of the changed record
    pub entity: String,
    pub record_id: i64,
    /// "created", "updated" or "deleted"
    pub action: String,
    pub created_at: i64,
}

#[derive(Clone, Copy, PartialEq)]
enum GeometryCond {
    Any,
    Present,
    Absent,
}

const HAS_GEOMETRY: &str = "geometry IS NOT NULL AND trim(geometry) != ''";
const NO_GEOMETRY: &str = "(geometry IS NULL OR trim(geometry) = '')";

// ============================================================================
// Spatial Store
// ============================================================================

/// Feature repository over a single SQLite connection.
///
/// A store is owned by one thread; workers open their own store on the same
/// database file.
pub struct SpatialStore {
    conn: Connection,
    path: String,
    /// Bumped on every container write so resolvers know to rebuild
    container_generation: Cell<u64>,
}

impl SpatialStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a store at `path`.
    pub fn open(path: &str, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
        if path != ":memory:" {
            // Readers do not block the writer across worker connections
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        }
        Self::init_schema(&conn)?;
        log::debug!("[Store] Opened {}", path);

        Ok(Self {
            conn,
            path: path.to_string(),
            container_generation: Cell::new(0),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:", 0)
    }

    /// Database path, used to open per-thread connections.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        let mut sql = String::new();

        for kind in FeatureKind::ALL {
            sql.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY,
                    name TEXT,
                    geometry TEXT,
                    srid INTEGER NOT NULL DEFAULT 4326,
                    osm2cai_status INTEGER NOT NULL DEFAULT 0,
                    source_ref TEXT,
                    min_lat REAL,
                    max_lat REAL,
                    min_lng REAL,
                    max_lng REAL,
                    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(osm2cai_status);
                CREATE INDEX IF NOT EXISTS idx_{table}_bounds ON {table}(min_lng, max_lng, min_lat, max_lat);
                "#,
                table = kind.table()
            ));
        }

        for level in ContainerLevel::ALL {
            sql.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    code TEXT,
                    geometry TEXT NOT NULL,
                    parent_id INTEGER,
                    min_lat REAL,
                    max_lat REAL,
                    min_lng REAL,
                    max_lng REAL,
                    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_parent ON {table}(parent_id);
                "#,
                table = level.table()
            ));

            for kind in FeatureKind::ALL {
                sql.push_str(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {pivot} (
                        feature_id INTEGER NOT NULL,
                        container_id INTEGER NOT NULL,
                        created_at INTEGER DEFAULT (strftime('%s', 'now')),
                        PRIMARY KEY (feature_id, container_id)
                    );
                    CREATE INDEX IF NOT EXISTS idx_{pivot}_container ON {pivot}(container_id);
                    "#,
                    pivot = level.assignment_table(kind)
                ));
            }
        }

        for assoc in [Association::Club, Association::CaiHut, Association::EcPoi] {
            sql.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {pivot} (
                    hiking_route_id INTEGER NOT NULL,
                    related_id INTEGER NOT NULL,
                    distance_meters REAL,
                    created_at INTEGER DEFAULT (strftime('%s', 'now')),
                    PRIMARY KEY (hiking_route_id, related_id)
                );
                "#,
                pivot = assoc.pivot_table()
            ));
        }

        sql.push_str(
            r#"
            CREATE TABLE IF NOT EXISTS clubs (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                cai_code TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clubs_code ON clubs(cai_code);

            -- Outbox for downstream consumers (search index, exports)
            CREATE TABLE IF NOT EXISTS change_notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity TEXT NOT NULL,
                record_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        );

        conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Run `f` inside one transaction; rolled back if it returns an error.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside a savepoint; its writes are undone if it fails.
    /// Nests inside [`in_transaction`](Self::in_transaction).
    pub fn in_savepoint<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("SAVEPOINT feature_write")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE feature_write")?;
                Ok(value)
            }
            Err(e) => {
                self.conn
                    .execute_batch("ROLLBACK TO feature_write; RELEASE feature_write")?;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Features
    // ========================================================================

    /// Insert or update a feature and record a change notification.
    pub fn save_feature(&self, feature: &Feature) -> Result<()> {
        self.in_transaction(|store| {
            let action = store.upsert_feature(feature)?;
            store.notify(feature.kind.table(), feature.id, action)
        })
    }

    /// Insert or update a feature without touching the outbox.
    pub fn save_feature_without_notification(&self, feature: &Feature) -> Result<()> {
        self.upsert_feature(feature)?;
        Ok(())
    }

    fn upsert_feature(&self, feature: &Feature) -> Result<&'static str> {
        let table = feature.kind.table();
        let exists = self.row_exists(table, feature.id)?;
        let bounds = feature_bounds(feature);

        self.conn.execute(
            &format!(
                "INSERT INTO {table} (id, name, geometry, srid, osm2cai_status, source_ref,
                                      min_lat, max_lat, min_lng, max_lng)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    geometry = excluded.geometry,
                    srid = excluded.srid,
                    osm2cai_status = excluded.osm2cai_status,
                    source_ref = excluded.source_ref,
                    min_lat = excluded.min_lat,
                    max_lat = excluded.max_lat,
                    min_lng = excluded.min_lng,
                    max_lng = excluded.max_lng,
                    updated_at = strftime('%s', 'now')"
            ),
            params![
                feature.id,
                feature.name,
                feature.geometry_wkt,
                feature.srid,
                feature.osm2cai_status,
                feature.source_ref,
                bounds.map(|b| b.min_lat),
                bounds.map(|b| b.max_lat),
                bounds.map(|b| b.min_lng),
                bounds.map(|b| b.max_lng),
            ],
        )?;

        Ok(if exists { "updated" } else { "created" })
    }

    /// Delete a feature and record a change notification.
    ///
    /// Assignment rows are left for the next fix-missing run to purge.
    pub fn delete_feature(&self, kind: FeatureKind, id: i64) -> Result<bool> {
        self.in_transaction(|store| {
            let removed = store
                .conn
                .execute(&format!("DELETE FROM {} WHERE id = ?", kind.table()), [id])?;
            if removed > 0 {
                store.notify(kind.table(), id, "deleted")?;
            }
            Ok(removed > 0)
        })
    }

    pub fn get_feature(&self, kind: FeatureKind, id: i64) -> Result<Option<Feature>> {
        let feature = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, name, geometry, srid, osm2cai_status, source_ref FROM {} WHERE id = ?",
                    kind.table()
                ),
                [id],
                |row| feature_from_row(kind, row),
            )
            .optional()?;
        Ok(feature)
    }

    /// Load the features among `ids` that exist, in ascending id order.
    pub fn features_by_ids(&self, kind: FeatureKind, ids: &[i64]) -> Result<Vec<Feature>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, name, geometry, srid, osm2cai_status, source_ref FROM {}
             WHERE id IN ({}) ORDER BY id",
            kind.table(),
            placeholders(ids.len())
        ))?;
        let features = stmt
            .query_map(params_from_iter(ids.iter()), |row| feature_from_row(kind, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(features)
    }

    /// Next chunk of features in primary-key order, strictly after `after_id`.
    pub fn feature_chunk(
        &self,
        kind: FeatureKind,
        after_id: Option<i64>,
        limit: usize,
        filter: &FeatureFilter,
    ) -> Result<Vec<Feature>> {
        let (clause, mut values) = self.where_clause(kind, filter, geometry_cond(filter));
        values.push(Value::Integer(after_id.unwrap_or(i64::MIN)));
        values.push(Value::Integer(limit as i64));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, name, geometry, srid, osm2cai_status, source_ref FROM {} t
             WHERE {} AND t.id > ? ORDER BY t.id LIMIT ?",
            kind.table(),
            clause
        ))?;
        let features = stmt
            .query_map(params_from_iter(values), |row| feature_from_row(kind, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(features)
    }

    /// Like [`feature_chunk`](Self::feature_chunk) but reads ids only.
    pub fn feature_id_chunk(
        &self,
        kind: FeatureKind,
        after_id: Option<i64>,
        limit: usize,
        filter: &FeatureFilter,
    ) -> Result<Vec<i64>> {
        let (clause, mut values) = self.where_clause(kind, filter, geometry_cond(filter));
        values.push(Value::Integer(after_id.unwrap_or(i64::MIN)));
        values.push(Value::Integer(limit as i64));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT t.id FROM {} t WHERE {} AND t.id > ? ORDER BY t.id LIMIT ?",
            kind.table(),
            clause
        ))?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Count the features matching `filter`.
    pub fn count_features(&self, kind: FeatureKind, filter: &FeatureFilter) -> Result<usize> {
        self.count_where(kind, filter, geometry_cond(filter))
    }

    /// Count the features matching `filter` apart from the geometry
    /// requirement, whose geometry is null.
    pub fn count_ungeolocated(&self, kind: FeatureKind, filter: &FeatureFilter) -> Result<usize> {
        self.count_where(kind, filter, GeometryCond::Absent)
    }

    fn count_where(
        &self,
        kind: FeatureKind,
        filter: &FeatureFilter,
        cond: GeometryCond,
    ) -> Result<usize> {
        let (clause, values) = self.where_clause(kind, filter, cond);
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} t WHERE {}", kind.table(), clause),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn where_clause(
        &self,
        kind: FeatureKind,
        filter: &FeatureFilter,
        cond: GeometryCond,
    ) -> (String, Vec<Value>) {
        let mut clauses = vec!["1 = 1".to_string()];
        let mut values = Vec::new();

        match cond {
            GeometryCond::Any => {}
            GeometryCond::Present => clauses.push(format!("({})", HAS_GEOMETRY)),
            GeometryCond::Absent => clauses.push(NO_GEOMETRY.to_string()),
        }

        if !filter.feature_ids.is_empty() {
            clauses.push(format!("t.id IN ({})", placeholders(filter.feature_ids.len())));
            values.extend(filter.feature_ids.iter().map(|id| Value::Integer(*id)));
        } else if let Some(status) = filter.stable_status {
            clauses.push("t.osm2cai_status != ?".to_string());
            values.push(Value::Integer(status as i64));
        }

        if let Some(level) = filter.missing_level {
            clauses.push(format!(
                "NOT EXISTS (SELECT 1 FROM {} p WHERE p.feature_id = t.id)",
                level.assignment_table(kind)
            ));
        }

        (clauses.join(" AND "), values)
    }

    /// Features whose bounding box intersects `bounds`, in ascending id order.
    pub fn features_in_bounds(&self, kind: FeatureKind, bounds: &Bounds) -> Result<Vec<Feature>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, name, geometry, srid, osm2cai_status, source_ref FROM {}
             WHERE min_lng <= ?1 AND max_lng >= ?2 AND min_lat <= ?3 AND max_lat >= ?4
             ORDER BY id",
            kind.table()
        ))?;
        let features = stmt
            .query_map(
                params![bounds.max_lng, bounds.min_lng, bounds.max_lat, bounds.min_lat],
                |row| feature_from_row(kind, row),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(features)
    }

    // ========================================================================
    // Containers
    // ========================================================================

    /// Insert or update a container and record a change notification.
    pub fn save_container(&self, container: &Container) -> Result<()> {
        self.in_transaction(|store| {
            let action = store.upsert_container(container)?;
            store.notify(container.level.table(), container.id, action)
        })
    }

    /// Insert or update a container without touching the outbox.
    pub fn save_container_without_notification(&self, container: &Container) -> Result<()> {
        self.upsert_container(container)?;
        Ok(())
    }

    fn upsert_container(&self, container: &Container) -> Result<&'static str> {
        let table = container.level.table();
        let exists = self.row_exists(table, container.id)?;

        let bounds = geometry::parse_wkt(&container.geometry_wkt)
            .ok()
            .and_then(|g| Bounds::from_geometry(&g));
        if bounds.is_none() {
            log::warn!(
                "[Store] {} {} has no usable geometry; it will never match",
                container.level.singular(),
                container.id
            );
        }

        self.conn.execute(
            &format!(
                "INSERT INTO {table} (id, name, code, geometry, parent_id,
                                      min_lat, max_lat, min_lng, max_lng)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    code = excluded.code,
                    geometry = excluded.geometry,
                    parent_id = excluded.parent_id,
                    min_lat = excluded.min_lat,
                    max_lat = excluded.max_lat,
                    min_lng = excluded.min_lng,
                    max_lng = excluded.max_lng,
                    updated_at = strftime('%s', 'now')"
            ),
            params![
                container.id,
                container.name,
                container.code,
                container.geometry_wkt,
                container.parent_id,
                bounds.map(|b| b.min_lat),
                bounds.map(|b| b.max_lat),
                bounds.map(|b| b.min_lng),
                bounds.map(|b| b.max_lng),
            ],
        )?;
        self.container_generation.set(self.container_generation.get() + 1);

        Ok(if exists { "updated" } else { "created" })
    }

    pub fn get_container(&self, level: ContainerLevel, id: i64) -> Result<Option<Container>> {
        let container = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, name, code, geometry, parent_id FROM {} WHERE id = ?",
                    level.table()
                ),
                [id],
                |row| {
                    Ok(Container {
                        id: row.get(0)?,
                        level,
                        name: row.get(1)?,
                        code: row.get(2)?,
                        geometry_wkt: row.get(3)?,
                        parent_id: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(container)
    }

    /// WKT geometry of one container.
    pub fn container_geometry_wkt(&self, level: ContainerLevel, id: i64) -> Result<Option<String>> {
        let wkt = self
            .conn
            .query_row(
                &format!("SELECT geometry FROM {} WHERE id = ?", level.table()),
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(wkt)
    }

    /// Envelopes of every container at a level with a usable geometry.
    pub fn container_bounds(&self, level: ContainerLevel) -> Result<Vec<ContainerBounds>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, min_lat, max_lat, min_lng, max_lng FROM {}
             WHERE min_lat IS NOT NULL ORDER BY id",
            level.table()
        ))?;
        let entries = stmt
            .query_map([], |row| {
                Ok(ContainerBounds {
                    container_id: row.get(0)?,
                    bounds: Bounds {
                        min_lat: row.get(1)?,
                        max_lat: row.get(2)?,
                        min_lng: row.get(3)?,
                        max_lng: row.get(4)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Every container id at a level, ascending.
    pub fn container_ids(&self, level: ContainerLevel) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {} ORDER BY id", level.table()))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// The ids among `ids` with no container at `level`.
    pub fn unknown_container_ids(&self, level: ContainerLevel, ids: &[i64]) -> Result<Vec<i64>> {
        let mut unknown = Vec::new();
        for &id in ids {
            if !self.row_exists(level.table(), id)? {
                unknown.push(id);
            }
        }
        Ok(unknown)
    }

    /// Set a container's parent. Engine-only write, no notification.
    pub fn set_container_parent(
        &self,
        level: ContainerLevel,
        id: i64,
        parent_id: Option<i64>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET parent_id = ?1 WHERE id = ?2 AND parent_id IS NOT ?1",
                level.table()
            ),
            params![parent_id, id],
        )?;
        Ok(changed > 0)
    }

    /// Counter of container writes made through this store.
    pub fn container_generation(&self) -> u64 {
        self.container_generation.get()
    }

    // ========================================================================
    // Assignments
    // ========================================================================

    /// Insert assignment rows, ignoring pairs that already exist.
    ///
    /// Returns the number of rows actually inserted.
    pub fn insert_assignments(
        &self,
        kind: FeatureKind,
        level: ContainerLevel,
        feature_id: i64,
        container_ids: &[i64],
    ) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "INSERT OR IGNORE INTO {} (feature_id, container_id) VALUES (?, ?)",
            level.assignment_table(kind)
        ))?;
        let mut inserted = 0;
        for &container_id in container_ids {
            inserted += stmt.execute(params![feature_id, container_id])?;
        }
        Ok(inserted)
    }

    /// Delete a feature's rows at a level, restricted to `container_filter`
    /// when it is non-empty.
    pub fn delete_assignments(
        &self,
        kind: FeatureKind,
        level: ContainerLevel,
        feature_id: i64,
        container_filter: &[i64],
    ) -> Result<usize> {
        let mut sql = format!(
            "DELETE FROM {} WHERE feature_id = ?",
            level.assignment_table(kind)
        );
        let mut values = vec![Value::Integer(feature_id)];
        if !container_filter.is_empty() {
            sql.push_str(&format!(
                " AND container_id IN ({})",
                placeholders(container_filter.len())
            ));
            values.extend(container_filter.iter().map(|id| Value::Integer(*id)));
        }
        Ok(self.conn.execute(&sql, params_from_iter(values))?)
    }

    /// Replace a feature's rows in scope with `container_ids`, atomically.
    ///
    /// Returns whether the in-scope assignment set changed.
    pub fn replace_assignments(
        &self,
        kind: FeatureKind,
        level: ContainerLevel,
        feature_id: i64,
        container_filter: &[i64],
        container_ids: &[i64],
    ) -> Result<bool> {
        let mut before = self.assignments_for(kind, level, feature_id)?;
        if !container_filter.is_empty() {
            before.retain(|id| container_filter.contains(id));
        }

        self.in_savepoint(|store| {
            store.delete_assignments(kind, level, feature_id, container_filter)?;
            store.insert_assignments(kind, level, feature_id, container_ids)
        })?;

        Ok(before != container_ids)
    }

    /// Delete rows whose feature no longer exists or has lost its geometry.
    ///
    /// Restricted to `container_filter` and `feature_filter` when non-empty.
    pub fn purge_ungeolocated(
        &self,
        kind: FeatureKind,
        level: ContainerLevel,
        container_filter: &[i64],
        feature_filter: &[i64],
    ) -> Result<usize> {
        let mut sql = format!(
            "DELETE FROM {pivot} WHERE feature_id NOT IN (SELECT id FROM {table} WHERE {cond})",
            pivot = level.assignment_table(kind),
            table = kind.table(),
            cond = HAS_GEOMETRY
        );
        let mut values = Vec::new();
        if !container_filter.is_empty() {
            sql.push_str(&format!(
                " AND container_id IN ({})",
                placeholders(container_filter.len())
            ));
            values.extend(container_filter.iter().map(|id| Value::Integer(*id)));
        }
        if !feature_filter.is_empty() {
            sql.push_str(&format!(" AND feature_id IN ({})", placeholders(feature_filter.len())));
            values.extend(feature_filter.iter().map(|id| Value::Integer(*id)));
        }
        Ok(self.conn.execute(&sql, params_from_iter(values))?)
    }

    /// Containers a feature is assigned to at a level, ascending.
    pub fn assignments_for(
        &self,
        kind: FeatureKind,
        level: ContainerLevel,
        feature_id: i64,
    ) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT container_id FROM {} WHERE feature_id = ? ORDER BY container_id",
            level.assignment_table(kind)
        ))?;
        let ids = stmt
            .query_map([feature_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Every (feature, container) pair at a level, ordered.
    pub fn all_assignments(&self, kind: FeatureKind, level: ContainerLevel) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT feature_id, container_id FROM {} ORDER BY feature_id, container_id",
            level.assignment_table(kind)
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Features with a geometry and no assignment at `level`.
    pub fn missing_count(&self, kind: FeatureKind, level: ContainerLevel) -> Result<usize> {
        self.count_features(kind, &FeatureFilter::geolocated().missing_at(level))
    }

    // ========================================================================
    // Clubs and associations
    // ========================================================================

    pub fn save_club(&self, club: &Club) -> Result<()> {
        self.conn.execute(
            "INSERT INTO clubs (id, name, cai_code) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, cai_code = excluded.cai_code",
            params![club.id, club.name, club.cai_code],
        )?;
        Ok(())
    }

    /// Club ids carrying `cai_code`, ascending.
    pub fn clubs_by_code(&self, cai_code: &str) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM clubs WHERE cai_code = ? ORDER BY id")?;
        let ids = stmt
            .query_map([cai_code], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Link a route to a related record; returns false if already linked.
    pub fn insert_association(
        &self,
        assoc: Association,
        route_id: i64,
        related_id: i64,
        distance_meters: Option<f64>,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (hiking_route_id, related_id, distance_meters)
                 VALUES (?, ?, ?)",
                assoc.pivot_table()
            ),
            params![route_id, related_id, distance_meters],
        )?;
        Ok(inserted > 0)
    }

    /// Records linked to a route, ascending.
    pub fn associations_for(&self, assoc: Association, route_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT related_id FROM {} WHERE hiking_route_id = ? ORDER BY related_id",
            assoc.pivot_table()
        ))?;
        let ids = stmt
            .query_map([route_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // ========================================================================
    // Change notifications
    // ========================================================================

    fn notify(&self, entity: &str, record_id: i64, action: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO change_notifications (entity, record_id, action) VALUES (?, ?, ?)",
            params![entity, record_id, action],
        )?;
        Ok(())
    }

    /// Outbox rows not yet drained, oldest first.
    pub fn pending_notifications(&self) -> Result<Vec<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity, record_id, action, created_at FROM change_notifications ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Notification {
                    id: row.get(0)?,
                    entity: row.get(1)?,
                    record_id: row.get(2)?,
                    action: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Take every pending notification off the outbox.
    pub fn drain_notifications(&self) -> Result<Vec<Notification>> {
        self.in_transaction(|store| {
            let rows = store.pending_notifications()?;
            if let Some(last) = rows.last() {
                store
                    .conn
                    .execute("DELETE FROM change_notifications WHERE id <= ?", [last.id])?;
            }
            Ok(rows)
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn row_exists(&self, table: &str, id: i64) -> Result<bool> {
        let found = self
            .conn
            .query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

fn geometry_cond(filter: &FeatureFilter) -> GeometryCond {
    if filter.require_geometry {
        GeometryCond::Present
    } else {
        GeometryCond::Any
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn feature_from_row(kind: FeatureKind, row: &Row<'_>) -> rusqlite::Result<Feature> {
    Ok(Feature {
        id: row.get(0)?,
        kind,
        name: row.get(1)?,
        geometry_wkt: row.get(2)?,
        srid: row.get(3)?,
        osm2cai_status: row.get(4)?,
        source_ref: row.get(5)?,
    })
}

/// Bounds for the bbox columns; `None` for null or unparseable geometry.
fn feature_bounds(feature: &Feature) -> Option<Bounds> {
    let wkt = feature.geometry_wkt.as_deref()?;
    let geom = geometry::parse_wkt(wkt).ok()?;
    Bounds::from_geometry(&geom)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReconcileError;

    fn square(min_lng: f64, min_lat: f64, size: f64) -> String {
        format!(
            "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
            x0 = min_lng,
            y0 = min_lat,
            x1 = min_lng + size,
            y1 = min_lat + size
        )
    }

    fn route(id: i64) -> Feature {
        Feature::new(FeatureKind::HikingRoute, id, Some("LINESTRING(10.1 43.1, 10.2 43.2)"))
    }

    #[test]
    fn test_create_store() {
        let store = SpatialStore::in_memory().unwrap();
        assert_eq!(
            store
                .count_features(FeatureKind::HikingRoute, &FeatureFilter::default())
                .unwrap(),
            0
        );
        assert!(store.container_ids(ContainerLevel::Sector).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_get_feature() {
        let store = SpatialStore::in_memory().unwrap();
        let feature = route(1).with_status(2).with_source_ref("9225001;9225002");
        store.save_feature(&feature).unwrap();

        let loaded = store.get_feature(FeatureKind::HikingRoute, 1).unwrap().unwrap();
        assert_eq!(loaded, feature);
        assert!(store.get_feature(FeatureKind::HikingRoute, 2).unwrap().is_none());
    }

    #[test]
    fn test_save_vs_save_without_notification() {
        let store = SpatialStore::in_memory().unwrap();
        store.save_feature(&route(1)).unwrap();
        store.save_feature(&route(1).with_status(3)).unwrap();
        store.save_feature_without_notification(&route(2)).unwrap();

        let pending = store.pending_notifications().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].action, "created");
        assert_eq!(pending[1].action, "updated");
        assert!(pending.iter().all(|n| n.record_id == 1 && n.entity == "hiking_routes"));

        assert_eq!(store.drain_notifications().unwrap().len(), 2);
        assert!(store.pending_notifications().unwrap().is_empty());
    }

    #[test]
    fn test_assignment_writes_are_quiet_and_idempotent() {
        let store = SpatialStore::in_memory().unwrap();
        let (kind, level) = (FeatureKind::HikingRoute, ContainerLevel::Sector);

        assert_eq!(store.insert_assignments(kind, level, 1, &[5, 9]).unwrap(), 2);
        assert_eq!(store.insert_assignments(kind, level, 1, &[5, 9]).unwrap(), 0);
        assert_eq!(store.assignments_for(kind, level, 1).unwrap(), vec![5, 9]);
        assert!(store.pending_notifications().unwrap().is_empty());
    }

    #[test]
    fn test_savepoint_undoes_partial_feature_write() {
        let store = SpatialStore::in_memory().unwrap();
        let (kind, level) = (FeatureKind::HikingRoute, ContainerLevel::Sector);
        store.insert_assignments(kind, level, 1, &[5]).unwrap();

        let result: Result<()> = store.in_transaction(|store| {
            store.in_savepoint(|s| {
                s.insert_assignments(kind, level, 1, &[9])?;
                Err(ReconcileError::Config("write interrupted".into()))
            })?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.assignments_for(kind, level, 1).unwrap(), vec![5]);

        // A failed savepoint leaves the surrounding transaction usable
        store
            .in_transaction(|store| {
                let failed = store.in_savepoint(|s| {
                    s.insert_assignments(kind, level, 2, &[5])?;
                    Err::<(), _>(ReconcileError::Config("write interrupted".into()))
                });
                assert!(failed.is_err());
                store.in_savepoint(|s| s.insert_assignments(kind, level, 3, &[9]))
            })
            .unwrap();
        assert!(store.assignments_for(kind, level, 2).unwrap().is_empty());
        assert_eq!(store.assignments_for(kind, level, 3).unwrap(), vec![9]);
    }

    #[test]
    fn test_replace_assignments_scoped() {
        let store = SpatialStore::in_memory().unwrap();
        let (kind, level) = (FeatureKind::HikingRoute, ContainerLevel::Sector);
        store.insert_assignments(kind, level, 1, &[1, 2, 3]).unwrap();

        // Only container 2 is in scope; 1 and 3 must survive
        let changed = store.replace_assignments(kind, level, 1, &[2], &[]).unwrap();
        assert!(changed);
        assert_eq!(store.assignments_for(kind, level, 1).unwrap(), vec![1, 3]);

        let changed = store.replace_assignments(kind, level, 1, &[], &[1, 3]).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_feature_chunks_and_filters() {
        let store = SpatialStore::in_memory().unwrap();
        for id in 1..=5 {
            store.save_feature_without_notification(&route(id)).unwrap();
        }
        store
            .save_feature_without_notification(&route(6).with_status(4))
            .unwrap();
        store
            .save_feature_without_notification(&Feature::new(FeatureKind::HikingRoute, 7, None))
            .unwrap();

        let filter = FeatureFilter::geolocated().excluding_status(Some(4));
        assert_eq!(store.count_features(FeatureKind::HikingRoute, &filter).unwrap(), 5);
        assert_eq!(store.count_ungeolocated(FeatureKind::HikingRoute, &filter).unwrap(), 1);

        let first = store.feature_id_chunk(FeatureKind::HikingRoute, None, 2, &filter).unwrap();
        assert_eq!(first, vec![1, 2]);
        let next = store
            .feature_chunk(FeatureKind::HikingRoute, Some(2), 2, &filter)
            .unwrap();
        assert_eq!(next.iter().map(|f| f.id).collect::<Vec<_>>(), vec![3, 4]);

        // Targeting by id bypasses the status exclusion
        let targeted = filter.clone().with_ids(&[6]);
        assert_eq!(store.count_features(FeatureKind::HikingRoute, &targeted).unwrap(), 1);
    }

    #[test]
    fn test_missing_count_and_purge() {
        let store = SpatialStore::in_memory().unwrap();
        let (kind, level) = (FeatureKind::HikingRoute, ContainerLevel::Sector);
        store.save_feature_without_notification(&route(1)).unwrap();
        store.save_feature_without_notification(&route(2)).unwrap();
        store
            .save_feature_without_notification(&Feature::new(kind, 3, None))
            .unwrap();
        assert_eq!(store.missing_count(kind, level).unwrap(), 2);

        store.insert_assignments(kind, level, 1, &[5]).unwrap();
        // Stale rows: feature 3 has no geometry, feature 4 does not exist
        store.insert_assignments(kind, level, 3, &[5]).unwrap();
        store.insert_assignments(kind, level, 4, &[5]).unwrap();
        assert_eq!(store.missing_count(kind, level).unwrap(), 1);

        assert_eq!(store.purge_ungeolocated(kind, level, &[], &[]).unwrap(), 2);
        assert_eq!(store.all_assignments(kind, level).unwrap(), vec![(1, 5)]);
    }

    #[test]
    fn test_container_bounds_and_parent() {
        let store = SpatialStore::in_memory().unwrap();
        let generation = store.container_generation();
        store
            .save_container(&Container::new(ContainerLevel::Area, 3, "A3", &square(10.0, 43.0, 1.0)))
            .unwrap();
        assert!(store.container_generation() > generation);

        let bounds = store.container_bounds(ContainerLevel::Area).unwrap();
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds[0].bounds.min_lng, 10.0);
        assert_eq!(bounds[0].bounds.max_lat, 44.0);

        assert!(store.set_container_parent(ContainerLevel::Area, 3, Some(7)).unwrap());
        assert!(!store.set_container_parent(ContainerLevel::Area, 3, Some(7)).unwrap());
        let area = store.get_container(ContainerLevel::Area, 3).unwrap().unwrap();
        assert_eq!(area.parent_id, Some(7));

        assert_eq!(
            store.unknown_container_ids(ContainerLevel::Area, &[3, 4]).unwrap(),
            vec![4]
        );
    }

    #[test]
    fn test_features_in_bounds() {
        let store = SpatialStore::in_memory().unwrap();
        store
            .save_feature_without_notification(&Feature::new(FeatureKind::CaiHut, 1, Some("POINT(10.15 43.15)")))
            .unwrap();
        store
            .save_feature_without_notification(&Feature::new(FeatureKind::CaiHut, 2, Some("POINT(12 45)")))
            .unwrap();

        let near = store
            .features_in_bounds(
                FeatureKind::CaiHut,
                &Bounds {
                    min_lat: 43.0,
                    max_lat: 43.5,
                    min_lng: 10.0,
                    max_lng: 10.5,
                },
            )
            .unwrap();
        assert_eq!(near.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_clubs_and_associations() {
        let store = SpatialStore::in_memory().unwrap();
        store.save_club(&Club::new(10, "CAI Pisa", "9225001")).unwrap();
        assert_eq!(store.clubs_by_code("9225001").unwrap(), vec![10]);
        assert!(store.clubs_by_code("0000000").unwrap().is_empty());

        assert!(store.insert_association(Association::Club, 1, 10, None).unwrap());
        assert!(!store.insert_association(Association::Club, 1, 10, None).unwrap());
        assert_eq!(store.associations_for(Association::Club, 1).unwrap(), vec![10]);
    }

    #[test]
    fn test_persistence_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_str().unwrap();

        {
            let store = SpatialStore::open(path, 1000).unwrap();
            store.save_feature(&route(1)).unwrap();
        }

        let store = SpatialStore::open(path, 1000).unwrap();
        assert!(store.get_feature(FeatureKind::HikingRoute, 1).unwrap().is_some());
        assert_eq!(store.path(), path);
    }
}
