//! reconcile - operator CLI for the territory reconciler
//!
//! Usage:
//!   reconcile --db osm2cai.db link --model all
//!   reconcile --db osm2cai.db assign --model sectors --sync --chunk 200
//!   reconcile --db osm2cai.db fix-missing --model sectors --id 5 --dry-run
//!   reconcile --db osm2cai.db missing --model all
//!   reconcile --db osm2cai.db work --workers 4
//!
//! Exit code 0 on success, 1 if any feature or job failed, 2 on
//! configuration errors.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use territory_reconciler::{
    reconcile_scope, spawn_workers, Association, ChunkMode, ContainerLevel, FeatureKind, JobQueue,
    ReconcileConfig, ReconcileError, ReconciliationEngine, Result, ScopeOptions, ScopeReport,
    SqliteJobQueue,
};

#[derive(Parser)]
#[command(name = "reconcile")]
#[command(about = "Spatial reconciliation of OSM2CAI features and territorial units", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database holding features, containers and jobs
    #[arg(long, global = true, default_value = "osm2cai.db")]
    db: String,

    /// JSON configuration file (missing fields take defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Set parent_id on provinces, areas and sectors
    Link {
        /// provinces, areas, sectors or all
        #[arg(long)]
        model: String,
    },

    /// Add missing feature assignments (existing rows are kept)
    Assign(ScopeArgs),

    /// Recompute assignments of a scope, deleting stale rows first
    FixMissing(ScopeArgs),

    /// Print the number of geolocated features without assignment
    Missing {
        /// regions, provinces, areas, sectors or all
        #[arg(long)]
        model: String,

        #[arg(long, default_value = "hiking-routes")]
        feature_type: String,
    },

    /// Link hiking routes to clubs through their source_ref codes
    Clubs {
        /// Restrict to these routes (repeatable)
        #[arg(long = "feature-id")]
        feature_ids: Vec<i64>,
    },

    /// Link hiking routes to nearby huts or POIs
    Nearby {
        #[arg(long, value_enum)]
        target: NearbyTarget,

        /// Restrict to these routes (repeatable)
        #[arg(long = "feature-id")]
        feature_ids: Vec<i64>,

        /// Maximum distance in meters (default from configuration)
        #[arg(long)]
        distance: Option<f64>,
    },

    /// Run queued jobs
    Work {
        /// Queue to drain (default from configuration)
        #[arg(long)]
        queue: Option<String>,

        #[arg(long, default_value = "1")]
        workers: usize,

        /// Stop each worker after this many jobs
        #[arg(long)]
        max_jobs: Option<usize>,
    },
}

#[derive(Args)]
struct ScopeArgs {
    /// regions, provinces, areas, sectors or all
    #[arg(long)]
    model: String,

    /// hiking-routes, ec-pois, cai-huts or mountain-groups
    #[arg(long, default_value = "hiking-routes")]
    feature_type: String,

    /// Restrict to these containers of the model (repeatable)
    #[arg(long = "id")]
    ids: Vec<i64>,

    /// Restrict to these features (repeatable); bypasses the validated-status exclusion
    #[arg(long = "feature-id")]
    feature_ids: Vec<i64>,

    /// Run in-process instead of enqueueing
    #[arg(long)]
    sync: bool,

    /// Features per chunk / job
    #[arg(long)]
    chunk: Option<usize>,

    /// Report what would be processed without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Only features with no assignment at the model level
    #[arg(long)]
    only_missing: bool,

    /// Also process features with the validated status
    #[arg(long)]
    include_validated: bool,

    /// Queue for asynchronous runs
    #[arg(long)]
    queue: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum NearbyTarget {
    Huts,
    Pois,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e @ ReconcileError::Config(_)) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}

/// Returns whether everything succeeded.
fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => ReconcileConfig::from_json_file(path)?,
        None => ReconcileConfig::default(),
    };

    match cli.command {
        Commands::Link { model } => run_link(&cli.db, config, &model),
        Commands::Assign(args) => run_scope(&cli.db, config, &args, ChunkMode::Additive),
        Commands::FixMissing(args) => run_scope(&cli.db, config, &args, ChunkMode::Replace),
        Commands::Missing {
            model,
            feature_type,
        } => run_missing(&cli.db, config, &model, &feature_type),
        Commands::Clubs { feature_ids } => {
            let mut engine = ReconciliationEngine::open(&cli.db, config)?;
            let report = engine.associate_clubs(&feature_ids)?;
            print_header("Club association");
            println!("  Routes with codes: {}", report.processed);
            println!("  Routes without:    {}", report.skipped);
            println!("  New links:         {}", report.linked);
            if !report.unmatched_codes.is_empty() {
                println!("  Unmatched codes:   {}", report.unmatched_codes.join(", "));
            }
            print_failed(&report.failed);
            Ok(report.failed.is_empty())
        }
        Commands::Nearby {
            target,
            feature_ids,
            distance,
        } => {
            let association = match target {
                NearbyTarget::Huts => Association::CaiHut,
                NearbyTarget::Pois => Association::EcPoi,
            };
            let mut engine = ReconciliationEngine::open(&cli.db, config)?;
            let report = engine.associate_nearby(association, &feature_ids, distance)?;
            print_header(&format!("Proximity association ({})", association.pivot_table()));
            println!("  Routes:        {}", report.processed);
            println!("  New links:     {}", report.linked);
            println!("  Invalid:       {}", report.invalid.len());
            print_failed(&report.failed);
            Ok(report.failed.is_empty())
        }
        Commands::Work {
            queue,
            workers,
            max_jobs,
        } => {
            let queue = queue.unwrap_or_else(|| config.default_queue.clone());
            let report = spawn_workers(&cli.db, &config, &queue, workers, max_jobs).join()?;
            print_header(&format!("Workers on '{}'", queue));
            println!("  Completed:  {}", report.jobs_completed);
            println!("  Retried:    {}", report.jobs_retried);
            println!("  Failed:     {:?}", report.jobs_failed);
            println!(
                "  Features:   {} processed, {} updated",
                report.features.processed, report.features.updated
            );
            Ok(report.jobs_failed.is_empty())
        }
    }
}

fn parse_levels(model: &str) -> Result<Vec<ContainerLevel>> {
    if model.eq_ignore_ascii_case("all") {
        Ok(ContainerLevel::ALL.to_vec())
    } else {
        Ok(vec![model.parse()?])
    }
}

fn run_link(db: &str, config: ReconcileConfig, model: &str) -> Result<bool> {
    let mut engine = ReconciliationEngine::open(db, config)?;
    let reports = if model.eq_ignore_ascii_case("all") {
        engine.link_hierarchy()?
    } else {
        vec![engine.link_containers(model.parse()?)?]
    };

    let mut ok = true;
    for report in reports {
        print_header(&format!("Linking {}", report.level));
        println!("  Linked:     {}", report.linked);
        println!("  Changed:    {}", report.changed);
        println!("  Orphaned:   {:?}", report.orphaned);
        println!("  Ambiguous:  {:?}", report.ambiguous);
        println!("  Invalid:    {:?}", report.invalid);
        print_failed(&report.failed);
        ok &= report.failed.is_empty();
    }
    Ok(ok)
}

fn run_scope(
    db: &str,
    mut config: ReconcileConfig,
    args: &ScopeArgs,
    mode: ChunkMode,
) -> Result<bool> {
    let kind: FeatureKind = args.feature_type.parse()?;
    let levels = parse_levels(&args.model)?;
    if levels.len() > 1 && !args.ids.is_empty() {
        return Err(ReconcileError::Config("--id needs a single --model level".into()));
    }
    if let Some(chunk) = args.chunk {
        config.chunk_size = chunk;
        config.validate()?;
    }

    let queue = if args.sync || args.dry_run {
        None
    } else {
        Some(SqliteJobQueue::open(db, config.busy_timeout_ms)?)
    };
    let mut engine = ReconciliationEngine::open(db, config)?;
    let options = ScopeOptions {
        container_ids: args.ids.clone(),
        feature_ids: args.feature_ids.clone(),
        sync: args.sync,
        chunk_size: args.chunk,
        dry_run: args.dry_run,
        mode,
        only_missing: args.only_missing,
        include_validated: args.include_validated,
        queue_name: args.queue.clone(),
    };

    let mut ok = true;
    for level in levels {
        let report = reconcile_scope(
            &mut engine,
            queue.as_ref().map(|q| q as &dyn JobQueue),
            kind,
            level,
            &options,
        )?;
        print_scope_report(&report);
        ok &= !report.has_failures();
    }
    Ok(ok)
}

fn run_missing(db: &str, config: ReconcileConfig, model: &str, feature_type: &str) -> Result<bool> {
    let kind: FeatureKind = feature_type.parse()?;
    let levels = parse_levels(model)?;
    let engine = ReconciliationEngine::open(db, config)?;

    print_header(&format!("Missing assignments ({})", kind.cli_name()));
    for level in levels {
        println!("  {:<10} {}", level.table(), engine.missing_count(kind, level)?);
    }
    Ok(true)
}

fn print_header(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("{}", title);
    println!("{}", "=".repeat(60));
}

fn print_failed(failed: &[i64]) {
    if !failed.is_empty() {
        println!("  Failed ids: {:?}", failed);
    }
}

fn print_scope_report(report: &ScopeReport) {
    let verb = match (report.dry_run, report.mode) {
        (true, _) => "Dry run",
        (false, ChunkMode::Additive) => "Assign",
        (false, ChunkMode::Replace) => "Fix missing",
    };
    print_header(&format!("{}: {} -> {}", verb, report.kind.cli_name(), report.level));
    println!("  In scope:        {}", report.total);
    println!("  Chunks:          {}", report.chunks);
    println!("  Missing before:  {}", report.missing_before);

    if report.dry_run {
        println!("  Preview ids:     {:?}", report.preview);
        return;
    }

    if report.dispatched > 0 {
        println!("  Jobs queued:     {}", report.dispatched);
    }
    if report.purged > 0 {
        println!("  Stale rows:      {}", report.purged);
    }
    println!("  Processed:       {}", report.processed);
    println!("  Updated:         {}", report.updated);
    println!("  Unresolved:      {}", report.unresolved);
    println!("  Skipped:         {}", report.skipped);
    if !report.invalid.is_empty() {
        println!("  Invalid ids:     {:?}", report.invalid);
    }
    print_failed(&report.failed);
    println!("  Missing after:   {}", report.missing_after);
}
