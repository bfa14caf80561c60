//! End-to-end reconciliation tests.
//!
//! Covers the full pipeline: store seeding -> hierarchy linking -> scope
//! reconciliation (sync and queued) -> gap metric.
//!
//! Run with: `cargo test --test reconcile_pipeline`

use tempfile::TempDir;
use territory_reconciler::{
    reconcile_scope, spawn_workers, ChunkMode, Container, ContainerLevel, Feature, FeatureKind,
    JobCounts, JobQueue, ReconcileConfig, ReconcileError, ReconciliationEngine, ScopeOptions,
    SqliteJobQueue, MAX_CHUNK_SIZE,
};

const ROUTE: FeatureKind = FeatureKind::HikingRoute;

fn square(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> String {
    format!(
        "POLYGON(({min_x} {min_y}, {max_x} {min_y}, {max_x} {max_y}, {min_x} {max_y}, {min_x} {min_y}))"
    )
}

/// Helper: one region > province > area holding two adjacent sectors
/// (5 west of lon 11, 9 east of it).
fn seed_containers(engine: &ReconciliationEngine) {
    let store = engine.store();
    store
        .save_container(&Container::new(ContainerLevel::Region, 1, "Lombardia", &square(8.0, 43.0, 14.0, 48.0)))
        .unwrap();
    store
        .save_container(&Container::new(ContainerLevel::Province, 10, "Bergamo", &square(9.0, 44.0, 13.0, 47.0)))
        .unwrap();
    store
        .save_container(&Container::new(ContainerLevel::Area, 20, "Orobie", &square(9.9, 44.9, 12.1, 46.1)))
        .unwrap();
    store
        .save_container(
            &Container::new(ContainerLevel::Sector, 5, "Ovest", &square(10.0, 45.0, 11.0, 46.0)).with_code("S5"),
        )
        .unwrap();
    store
        .save_container(
            &Container::new(ContainerLevel::Sector, 9, "Est", &square(11.0, 45.0, 12.0, 46.0)).with_code("S9"),
        )
        .unwrap();
}

/// Helper: route 1 crosses both sectors, 2 lies in sector 5, 3 in sector 9,
/// 4 has no geometry.
fn seed_routes(engine: &ReconciliationEngine) {
    let store = engine.store();
    let routes = [
        Feature::new(ROUTE, 1, Some("LINESTRING(10.5 45.5, 11.5 45.5)")),
        Feature::new(ROUTE, 2, Some("LINESTRING(10.2 45.2, 10.4 45.4)")),
        Feature::new(ROUTE, 3, Some("LINESTRING(11.6 45.6, 11.8 45.8)")),
        Feature::new(ROUTE, 4, None),
    ];
    for route in &routes {
        store.save_feature(route).unwrap();
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn seeded_engine() -> ReconciliationEngine {
    init_logging();
    let engine = ReconciliationEngine::in_memory(ReconcileConfig::default()).unwrap();
    seed_containers(&engine);
    seed_routes(&engine);
    engine
}

fn sync_options(mode: ChunkMode) -> ScopeOptions {
    ScopeOptions {
        sync: true,
        mode,
        ..Default::default()
    }
}

// ============================================================================
// Test: Assignment Semantics
// ============================================================================

#[test]
fn test_route_crossing_two_sectors_gets_both() {
    let mut engine = seeded_engine();
    let report = reconcile_scope(
        &mut engine,
        None,
        ROUTE,
        ContainerLevel::Sector,
        &sync_options(ChunkMode::Additive),
    )
    .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.processed, 3);
    assert!(report.failed.is_empty());
    assert_eq!(
        engine.store().assignments_for(ROUTE, ContainerLevel::Sector, 1).unwrap(),
        vec![5, 9]
    );
    assert_eq!(
        engine.store().assignments_for(ROUTE, ContainerLevel::Sector, 2).unwrap(),
        vec![5]
    );
}

#[test]
fn test_full_pass_is_idempotent() {
    let mut engine = seeded_engine();
    let options = sync_options(ChunkMode::Additive);

    let first = reconcile_scope(&mut engine, None, ROUTE, ContainerLevel::Sector, &options).unwrap();
    let rows = engine.store().all_assignments(ROUTE, ContainerLevel::Sector).unwrap();

    let second = reconcile_scope(&mut engine, None, ROUTE, ContainerLevel::Sector, &options).unwrap();
    assert_eq!(first.updated, 3);
    assert_eq!(second.updated, 0);
    assert_eq!(
        engine.store().all_assignments(ROUTE, ContainerLevel::Sector).unwrap(),
        rows
    );
}

#[test]
fn test_gap_closes_after_full_pass() {
    let mut engine = seeded_engine();
    for level in ContainerLevel::ALL {
        let report =
            reconcile_scope(&mut engine, None, ROUTE, level, &sync_options(ChunkMode::Additive)).unwrap();

        // Route 4 has no geometry: skipped, never counted as missing
        assert_eq!(report.missing_before, 3, "{}", level);
        assert_eq!(report.skipped, 1, "{}", level);
        assert_eq!(report.missing_after, 0, "{}", level);
    }
    assert!(engine
        .store()
        .assignments_for(ROUTE, ContainerLevel::Sector, 4)
        .unwrap()
        .is_empty());
}

#[test]
fn test_additive_subset_keeps_other_rows() {
    let mut engine = seeded_engine();
    // Hand-curated row the engine would never compute
    engine
        .store()
        .insert_assignments(ROUTE, ContainerLevel::Sector, 3, &[5])
        .unwrap();

    let options = ScopeOptions {
        feature_ids: vec![1],
        ..sync_options(ChunkMode::Additive)
    };
    let report = reconcile_scope(&mut engine, None, ROUTE, ContainerLevel::Sector, &options).unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(
        engine.store().assignments_for(ROUTE, ContainerLevel::Sector, 3).unwrap(),
        vec![5]
    );
}

#[test]
fn test_fix_missing_recomputes_only_its_level() {
    let mut engine = seeded_engine();
    reconcile_scope(
        &mut engine,
        None,
        ROUTE,
        ContainerLevel::Area,
        &sync_options(ChunkMode::Additive),
    )
    .unwrap();
    let areas = engine.store().all_assignments(ROUTE, ContainerLevel::Area).unwrap();

    // Stale sector row for route 2, and a row left by the ungeolocated route
    let store = engine.store();
    store.insert_assignments(ROUTE, ContainerLevel::Sector, 2, &[9]).unwrap();
    store.insert_assignments(ROUTE, ContainerLevel::Sector, 4, &[5]).unwrap();

    let report = reconcile_scope(
        &mut engine,
        None,
        ROUTE,
        ContainerLevel::Sector,
        &sync_options(ChunkMode::Replace),
    )
    .unwrap();

    assert_eq!(report.purged, 1);
    assert_eq!(
        engine.store().assignments_for(ROUTE, ContainerLevel::Sector, 2).unwrap(),
        vec![5]
    );
    assert!(engine
        .store()
        .assignments_for(ROUTE, ContainerLevel::Sector, 4)
        .unwrap()
        .is_empty());
    assert_eq!(
        engine.store().all_assignments(ROUTE, ContainerLevel::Area).unwrap(),
        areas
    );
}

#[test]
fn test_validated_routes_need_explicit_targeting() {
    let mut engine = seeded_engine();
    engine
        .store()
        .save_feature(
            &Feature::new(ROUTE, 7, Some("LINESTRING(10.1 45.1, 10.3 45.1)")).with_status(4),
        )
        .unwrap();

    let report = reconcile_scope(
        &mut engine,
        None,
        ROUTE,
        ContainerLevel::Sector,
        &sync_options(ChunkMode::Additive),
    )
    .unwrap();
    assert_eq!(report.total, 3);
    assert!(engine
        .store()
        .assignments_for(ROUTE, ContainerLevel::Sector, 7)
        .unwrap()
        .is_empty());

    let targeted = ScopeOptions {
        feature_ids: vec![7],
        ..sync_options(ChunkMode::Additive)
    };
    let report = reconcile_scope(&mut engine, None, ROUTE, ContainerLevel::Sector, &targeted).unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(
        engine.store().assignments_for(ROUTE, ContainerLevel::Sector, 7).unwrap(),
        vec![5]
    );
}

#[test]
fn test_invalid_route_is_skipped_not_failed() {
    let mut engine = seeded_engine();
    // Bow-tie polygon
    engine
        .store()
        .save_feature(&Feature::new(
            ROUTE,
            8,
            Some("POLYGON((10.1 45.1, 10.3 45.3, 10.3 45.1, 10.1 45.3, 10.1 45.1))"),
        ))
        .unwrap();

    let report = reconcile_scope(
        &mut engine,
        None,
        ROUTE,
        ContainerLevel::Sector,
        &sync_options(ChunkMode::Additive),
    )
    .unwrap();

    assert_eq!(report.invalid, vec![8]);
    assert!(report.failed.is_empty());
    assert!(!report.has_failures());
    assert_eq!(report.processed, 3);
}

#[test]
fn test_replace_clears_rows_of_invalid_route() {
    let mut engine = seeded_engine();
    // Route 1 is redrawn as a bow-tie while it still has rows
    engine
        .store()
        .save_feature(&Feature::new(
            ROUTE,
            1,
            Some("POLYGON((10.1 45.1, 10.3 45.3, 10.3 45.1, 10.1 45.3, 10.1 45.1))"),
        ))
        .unwrap();
    engine
        .store()
        .insert_assignments(ROUTE, ContainerLevel::Sector, 1, &[5, 77])
        .unwrap();

    let report = reconcile_scope(
        &mut engine,
        None,
        ROUTE,
        ContainerLevel::Sector,
        &sync_options(ChunkMode::Replace),
    )
    .unwrap();

    assert_eq!(report.invalid, vec![1]);
    assert!(!report.has_failures());
    assert!(engine
        .store()
        .assignments_for(ROUTE, ContainerLevel::Sector, 1)
        .unwrap()
        .is_empty());
    // Valid routes are recomputed as usual
    assert_eq!(
        engine.store().assignments_for(ROUTE, ContainerLevel::Sector, 2).unwrap(),
        vec![5]
    );
}

#[test]
fn test_oversized_chunk_is_config_error() {
    let mut engine = seeded_engine();
    let options = ScopeOptions {
        chunk_size: Some(MAX_CHUNK_SIZE + 1),
        ..sync_options(ChunkMode::Additive)
    };
    let result = reconcile_scope(&mut engine, None, ROUTE, ContainerLevel::Sector, &options);
    assert!(matches!(result, Err(ReconcileError::Config(_))));
}

// ============================================================================
// Test: Dry Run at 1000 Routes
// ============================================================================

#[test]
fn test_dry_run_reports_without_mutation() {
    let mut engine = ReconciliationEngine::in_memory(ReconcileConfig::default()).unwrap();
    seed_containers(&engine);
    engine
        .store()
        .in_transaction(|store| {
            for id in 1..=1000 {
                let x = 10.1 + (id % 80) as f64 * 0.01;
                let wkt = format!("LINESTRING({} 45.2, {} 45.3)", x, x);
                store.save_feature_without_notification(&Feature::new(ROUTE, id, Some(&wkt)))?;
            }
            Ok(())
        })
        .unwrap();

    let options = ScopeOptions {
        dry_run: true,
        chunk_size: Some(200),
        ..Default::default()
    };
    let report = reconcile_scope(&mut engine, None, ROUTE, ContainerLevel::Sector, &options).unwrap();

    assert_eq!(report.total, 1000);
    assert_eq!(report.chunks, 5);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.processed, 0);
    assert_eq!(report.preview, (1..=20).collect::<Vec<i64>>());
    assert_eq!(report.missing_before, 1000);
    assert_eq!(report.missing_after, 1000);
    assert!(engine
        .store()
        .all_assignments(ROUTE, ContainerLevel::Sector)
        .unwrap()
        .is_empty());
}

#[test]
fn test_unknown_container_is_config_error() {
    let mut engine = seeded_engine();
    let options = ScopeOptions {
        container_ids: vec![5, 404],
        ..sync_options(ChunkMode::Additive)
    };
    let err = reconcile_scope(&mut engine, None, ROUTE, ContainerLevel::Sector, &options).unwrap_err();
    assert!(matches!(err, ReconcileError::Config(_)));
}

// ============================================================================
// Test: Hierarchy and Notifications
// ============================================================================

#[test]
fn test_hierarchy_links_every_level() {
    let mut engine = seeded_engine();
    let reports = engine.link_hierarchy().unwrap();

    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.failed.is_empty() && r.orphaned.is_empty()));

    let store = engine.store();
    let parent = |level, id| store.get_container(level, id).unwrap().unwrap().parent_id;
    assert_eq!(parent(ContainerLevel::Province, 10), Some(1));
    assert_eq!(parent(ContainerLevel::Area, 20), Some(10));
    assert_eq!(parent(ContainerLevel::Sector, 5), Some(20));
    assert_eq!(parent(ContainerLevel::Sector, 9), Some(20));
    assert_eq!(parent(ContainerLevel::Region, 1), None);
}

#[test]
fn test_saves_notify_but_assignment_writes_do_not() {
    let mut engine = seeded_engine();
    // 5 containers and 4 routes
    let before = engine.store().pending_notifications().unwrap();
    assert_eq!(before.len(), 9);
    assert!(before.iter().all(|n| n.action == "created"));

    reconcile_scope(
        &mut engine,
        None,
        ROUTE,
        ContainerLevel::Sector,
        &sync_options(ChunkMode::Replace),
    )
    .unwrap();
    engine.link_containers(ContainerLevel::Sector).unwrap();

    assert_eq!(engine.store().drain_notifications().unwrap().len(), 9);
    assert!(engine.store().pending_notifications().unwrap().is_empty());
}

// ============================================================================
// Test: Queued Run with a Worker Pool on Disk
// ============================================================================

#[test]
fn test_queued_scope_drained_by_worker_pool() {
    init_logging();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp_dir.path().join("osm2cai.db");
    let db_path = db_path.to_str().unwrap();
    let config = ReconcileConfig::default();

    let mut engine = ReconciliationEngine::open(db_path, config.clone()).unwrap();
    seed_containers(&engine);
    seed_routes(&engine);

    let queue = SqliteJobQueue::open(db_path, config.busy_timeout_ms).unwrap();
    let options = ScopeOptions {
        chunk_size: Some(1),
        ..Default::default()
    };
    let report = reconcile_scope(
        &mut engine,
        Some(&queue as &dyn JobQueue),
        ROUTE,
        ContainerLevel::Sector,
        &options,
    )
    .unwrap();
    assert_eq!(report.dispatched, 3);
    assert_eq!(report.processed, 0);
    assert_eq!(queue.pending(&config.default_queue).unwrap(), 3);

    let totals = spawn_workers(db_path, &config, &config.default_queue, 2, None)
        .join()
        .unwrap();
    assert_eq!(totals.jobs_completed, 3);
    assert!(totals.jobs_failed.is_empty());
    assert_eq!(totals.features.processed, 3);

    assert_eq!(
        queue.counts(&config.default_queue).unwrap(),
        JobCounts {
            pending: 0,
            running: 0,
            done: 3,
            failed: 0,
        }
    );
    assert_eq!(engine.missing_count(ROUTE, ContainerLevel::Sector).unwrap(), 0);
    assert_eq!(
        engine.store().assignments_for(ROUTE, ContainerLevel::Sector, 1).unwrap(),
        vec![5, 9]
    );
}
