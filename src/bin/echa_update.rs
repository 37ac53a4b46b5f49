//! ECHA Update Binary - One Change-Detection Cycle
//!
//! Loads every configured list, reconciles the aggregate table, appends the
//! detected changes to the history and prints a per-list summary.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin echa_update
//! cargo run --release --bin echa_update -- --backend json --force
//! cargo run --release --bin echa_update -- --prune-days 365 --recent 20
//! ```
//!
//! ## Flags
//!
//! - `--backend sqlite|json` - overrides ECHA_BACKEND
//! - `--force` - write the aggregate even if nothing changed
//! - `--prune-days N` - drop history older than N days (overrides ECHA_HISTORY_RETENTION_DAYS)
//! - `--recent N` - print the N most recent history entries after the cycle
//!
//! ## Environment Variables
//!
//! - ECHA_INPUT_DIR - Directory holding the list files (default: data/input)
//! - ECHA_LISTS_CONFIG - List definitions (default: config/lists.json)
//! - ECHA_BACKEND - `sqlite` or `json` (default: sqlite)
//! - ECHA_DB_PATH - SQLite database path (default: data/output/echa.db)
//! - ECHA_OUTPUT_DIR - JSON backend directory (default: data/output)
//! - ECHA_HISTORY_RETENTION_DAYS - History retention in days (optional)
//! - ECHA_ARCHIVE_DIR - Copy loaded list files here after each cycle (optional)
//! - RUST_LOG - Logging level (optional, default: info)

use echa_watch::config::{AppConfig, BackendType, ListsConfig};
use echa_watch::engine::{CycleOptions, CycleReport, UpdateCycle};
use echa_watch::source::FileSourceLoader;
use echa_watch::store::open_store;
use std::env;

#[derive(Debug, Default)]
struct CliArgs {
    backend: Option<BackendType>,
    force: bool,
    prune_days: Option<i64>,
    recent: Option<usize>,
}

impl CliArgs {
    fn parse() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = env::args().collect();
        let value_of = |flag: &str| {
            args.windows(2)
                .find(|w| w[0] == flag)
                .map(|w| w[1].clone())
        };

        let backend = match value_of("--backend") {
            Some(s) => Some(s.parse::<BackendType>()?),
            None => None,
        };
        let prune_days = match value_of("--prune-days") {
            Some(s) => Some(
                s.parse::<i64>()
                    .map_err(|_| format!("Invalid --prune-days '{}'", s))?,
            ),
            None => None,
        };
        let recent = match value_of("--recent") {
            Some(s) => Some(s.parse::<usize>().map_err(|_| format!("Invalid --recent '{}'", s))?),
            None => None,
        };

        Ok(Self {
            backend,
            force: args.iter().any(|a| a == "--force"),
            prune_days,
            recent,
        })
    }
}

fn print_report(report: &CycleReport) {
    println!("\n╔══════════════════════════════════════════════════════════╗");
    println!("║                  ECHA UPDATE - {}                  ║", report.started_at.format("%Y-%m-%d"));
    println!("╚══════════════════════════════════════════════════════════╝");
    println!(
        "Aggregate: {} row(s), {}",
        report.aggregate_rows,
        if report.written() { "written" } else { "unchanged, not written" }
    );
    println!(
        "Rows: {} new, {} modified, {} unchanged, {} dropped, {} carried over",
        report.stats.new_rows,
        report.stats.modified_rows,
        report.stats.unchanged_rows,
        report.stats.dropped_rows,
        report.stats.carried_over_rows
    );
    println!();
    println!("{:<32} {:>10} {:>10} {:>10}  {}", "LIST", "INSERTED", "MODIFIED", "DELETED", "STATUS");
    for summary in &report.summaries {
        println!(
            "{:<32} {:>10} {:>10} {:>10}  {}",
            summary.source_list,
            summary.insertions,
            summary.modifications,
            summary.deletions,
            summary.status()
        );
    }

    for failure in &report.failures {
        println!("FAILED {}: {}", failure.list, failure.error);
    }
    for (list, ids) in &report.unknown_cas_ids {
        println!("{}: {} CAS id(s) not in master reference", list, ids.len());
    }
    for path in &report.archived {
        println!("Archived {}", path.display());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let cli = CliArgs::parse()?;
    let mut config = AppConfig::from_env()?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    log::info!("🚀 Starting ECHA update");
    log::info!("   Input: {}", config.input_dir.display());
    log::info!("   Lists: {}", config.lists_config.display());
    match config.backend {
        BackendType::Sqlite => log::info!("   Backend: SQLite ({})", config.db_path.display()),
        BackendType::Json => log::info!("   Backend: JSON ({})", config.output_dir.display()),
    }

    let lists = ListsConfig::load(&config.lists_config)?;
    let loader = FileSourceLoader::new(&config.input_dir);
    let store = open_store(&config)?;

    let mut cycle = UpdateCycle::new(lists, Box::new(loader), store);
    if let Some(dir) = &config.archive_dir {
        log::info!("   Archive: {}", dir.display());
        cycle = cycle.with_archive_dir(dir);
    }
    let report = cycle.run(&CycleOptions { force_write: cli.force })?;
    print_report(&report);

    if let Some(days) = cli.prune_days.or(config.history_retention_days) {
        let removed = cycle.prune_history(days)?;
        println!("\nPruned {} history entr(ies) older than {} day(s)", removed, days);
    }

    if let Some(limit) = cli.recent {
        let history = cycle.history()?;
        println!("\nMost recent changes:");
        for change in history.recent(limit) {
            let fields = change.modified_field_names().join(", ");
            println!(
                "{}  {:<12} {:<24} {:<14} {}{}",
                change.timestamp.format("%Y-%m-%d %H:%M:%S"),
                change.change_type.as_str(),
                change.source_list,
                change.cas_id,
                change.cas_name,
                if fields.is_empty() { String::new() } else { format!(" [{}]", fields) }
            );
        }
    }

    Ok(())
}
