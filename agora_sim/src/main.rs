//! Agora DST Simulator CLI
//!
//! Run deterministic match validation scenarios.

use agora_core::{MatchConfig, SledMatchStore};
use agora_sim::scenarios::ScenarioId;
use agora_sim::{MatchExport, ScenarioResult, ScenarioRunner};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Agora Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "agora-sim")]
#[command(about = "Run deterministic match validation scenarios for Agora", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of replicas per match
    #[arg(short, long, default_value = "3")]
    replicas: usize,

    /// Scenario to run (baseline, decay_collapse, desync, silence, extinction_guard, late_reports, all_silent, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Generation limit override
    #[arg(short, long)]
    generations: Option<u64>,

    /// Match configuration file (JSON) replacing the built-in policy mix
    #[arg(short, long)]
    config: Option<String>,

    /// Persist finalized matches to a sled database at this path
    #[arg(long)]
    store: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the match history and events to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn export_result(result: &ScenarioResult, path: &str) {
    let mut export = MatchExport::new(result.scenario.name(), result.seed);
    if let Some(outcome) = &result.outcome {
        export.record_outcome(outcome);
    }
    export.events = result.events.clone();
    export.finalize(result.passed, result.failure_reason.clone());

    match export.write_to_file(path) {
        Ok(()) => info!("Exported {} frames to {}", export.frames.len(), path),
        Err(e) => error!("Failed to write export: {:?}", e),
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose {
        "debug"
    } else if args.json {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        eprintln!("Failed to set tracing subscriber");
    }

    if !args.json {
        info!("Agora DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(id) => vec![id],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    if args.export.is_some() && (scenarios.len() > 1 || args.seeds > 1) {
        eprintln!("Error: --export only supports a single scenario and seed");
        std::process::exit(1);
    }

    let base_config = match &args.config {
        Some(path) => match MatchConfig::load(path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("Error: cannot load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let store = match &args.store {
        Some(path) => match SledMatchStore::open(path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                eprintln!("Error: cannot open store {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let mut runner = ScenarioRunner::new(seed, args.replicas);
        if let Some(generations) = args.generations {
            runner = runner.with_generations(generations);
        }
        if let Some(config) = &base_config {
            runner = runner.with_config(config.clone());
        }
        if let Some(store) = &store {
            runner = runner.with_store(store.clone());
        }

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if let Some(path) = &args.export {
                export_result(&result, path);
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "generation": r.final_generation,
                    "status": r.status,
                    "network": r.metrics.network,
                    "authority": r.metrics.authority,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: cannot encode summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            // List failed seeds
            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
