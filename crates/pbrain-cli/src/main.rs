//! `pbrain` – Portable Brain command line interface.
//!
//! ```text
//! pbrain init [--force]             write ~/.pbrain/config.toml with defaults
//! pbrain replay <session.jsonl>     run the pipeline over a recorded session
//!        [--in-memory] [--realtime]
//! pbrain config                     print the effective configuration
//! ```
//!
//! Ctrl-C during a replay stops the driver after its current tick; the
//! queue is drained and one final consolidation pass runs before exit.

mod config;

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use pbrain_memory::{LongTermStore, OverflowLog, SqliteGraphStore};
use pbrain_runtime::{Pipeline, ReplaySource, ShutdownReport, init_tracing};
use tracing::warn;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let guard = init_tracing("pbrain");
    let code = run(&args);
    // `process::exit` skips destructors; flush spans first.
    drop(guard);
    std::process::exit(code);
}

fn run(args: &[String]) -> i32 {
    match args.first().map(String::as_str) {
        Some("init") => cmd_init(&args[1..]),
        Some("replay") => cmd_replay(&args[1..]),
        Some("config") => cmd_config(),
        None | Some("help") | Some("-h") | Some("--help") => {
            print_usage();
            0
        }
        Some(other) => {
            eprintln!("{}: unknown command `{}`", "error".red().bold(), other);
            print_usage();
            2
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// init / config
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_init(args: &[String]) -> i32 {
    let path = config::config_path();
    let force = args.iter().any(|a| a == "--force");
    if path.exists() && !force {
        println!(
            "  Config already exists at {} (use {} to overwrite)",
            path.display().to_string().bold(),
            "--force".bold()
        );
        return 0;
    }
    match config::save(&config::Config::default()) {
        Ok(()) => {
            println!(
                "  {} Config saved to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            0
        }
        Err(e) => {
            eprintln!("{}: {}", "Error saving config".red(), e);
            1
        }
    }
}

fn cmd_config() -> i32 {
    let path = config::config_path();
    let cfg = match config::load_or_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return 1;
        }
    };
    let source = if path.exists() { path.display().to_string() } else { "defaults".to_string() };
    println!("  {} {}", "Source:".bold(), source.dimmed());
    println!(
        "  {} {}",
        "Graph DB:".bold(),
        config::resolve_db_path(&cfg.graph_db, &path)
    );
    println!(
        "  {} {}",
        "Overflow DB:".bold(),
        config::resolve_db_path(&cfg.overflow_db, &path)
    );
    println!();
    match toml::to_string_pretty(&cfg) {
        Ok(raw) => {
            print!("{raw}");
            0
        }
        Err(e) => {
            eprintln!("{}: {}", "Failed to render config".red(), e);
            1
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// replay
// ─────────────────────────────────────────────────────────────────────────────

struct ReplayArgs {
    path: String,
    in_memory: bool,
    realtime: bool,
}

fn parse_replay_args(args: &[String]) -> Result<ReplayArgs, String> {
    let mut path = None;
    let mut in_memory = false;
    let mut realtime = false;
    for arg in args {
        match arg.as_str() {
            "--in-memory" => in_memory = true,
            "--realtime" => realtime = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag `{flag}`")),
            p if path.is_none() => path = Some(p.to_string()),
            extra => return Err(format!("unexpected argument `{extra}`")),
        }
    }
    let path = path.ok_or_else(|| "missing session file".to_string())?;
    Ok(ReplayArgs {
        path,
        in_memory,
        realtime,
    })
}

fn open_stores(cfg: &config::Config, in_memory: bool) -> Result<(Arc<SqliteGraphStore>, Arc<OverflowLog>), String> {
    let cfg_path = config::config_path();
    let graph_path = if in_memory {
        config::IN_MEMORY.to_string()
    } else {
        config::resolve_db_path(&cfg.graph_db, &cfg_path)
    };
    let overflow_path = if in_memory {
        config::IN_MEMORY.to_string()
    } else {
        config::resolve_db_path(&cfg.overflow_db, &cfg_path)
    };

    for p in [&graph_path, &overflow_path] {
        if p != config::IN_MEMORY
            && let Some(parent) = std::path::Path::new(p).parent()
            && !parent.as_os_str().is_empty()
        {
            config::ensure_private_dir(parent)?;
        }
    }

    let graph = if graph_path == config::IN_MEMORY {
        SqliteGraphStore::open_in_memory()
    } else {
        SqliteGraphStore::open(&graph_path)
    }
    .map_err(|e| format!("Failed to open graph store {graph_path}: {e}"))?;
    let overflow = if overflow_path == config::IN_MEMORY {
        OverflowLog::open_in_memory()
    } else {
        OverflowLog::open(&overflow_path)
    }
    .map_err(|e| format!("Failed to open overflow log {overflow_path}: {e}"))?;
    Ok((Arc::new(graph), Arc::new(overflow)))
}

fn cmd_replay(args: &[String]) -> i32 {
    let replay = match parse_replay_args(args) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            print_usage();
            return 2;
        }
    };
    let cfg = match config::load_or_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return 1;
        }
    };
    let source = match ReplaySource::from_path(&replay.path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}: {}", "Failed to read session".red(), replay.path, e);
            return 1;
        }
    };
    let (graph, overflow) = match open_stores(&cfg, replay.in_memory) {
        Ok(stores) => stores,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            return 1;
        }
    };

    let mut pipeline_cfg = cfg.pipeline();
    if !replay.realtime {
        // Recorded snapshots carry their own timestamps; no need to wait.
        pipeline_cfg.poll_interval = Duration::from_millis(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start tokio runtime".red(), e);
            return 1;
        }
    };

    println!(
        "  Replaying {} ({} event(s))",
        replay.path.bold(),
        source.remaining()
    );
    let store: Arc<dyn LongTermStore> = graph.clone();
    let pipeline = Pipeline::new(pipeline_cfg, store, overflow);
    let result = runtime.block_on(async {
        let handle = pipeline.spawn(Box::new(source));
        let cancel = handle.cancel_token();
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – stopping after the current tick …".yellow().bold());
            cancel.cancel();
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will abort immediately");
        }
        handle.join().await
    });

    match result {
        Ok(report) => {
            print_short_term(&pipeline);
            print_long_term(&graph);
            print_report(&report);
            0
        }
        Err(e) => {
            eprintln!("{}: {}", "Pipeline failed".red(), e);
            1
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summaries
// ─────────────────────────────────────────────────────────────────────────────

const SUMMARY_ROWS: usize = 15;

fn print_short_term(pipeline: &Pipeline) {
    let entries = pipeline.short_term().snapshot();
    println!();
    println!("{}", format!("  Short-term memory ({} entries)", entries.len()).bold().cyan());
    for entry in entries.iter().take(SUMMARY_ROWS) {
        let action = entry.observation.action();
        let consumed = if entry.is_consumed() { "promoted".green() } else { "".normal() };
        println!(
            "    {} {:<10} {:<32} ×{:<3} {}",
            entry.fingerprint.to_string().dimmed(),
            action.kind().label(),
            entry.observation.app_context(),
            entry.recurrence_count,
            consumed
        );
    }
    if entries.len() > SUMMARY_ROWS {
        println!("    … {} more", entries.len() - SUMMARY_ROWS);
    }
}

fn print_long_term(graph: &SqliteGraphStore) {
    let nodes = match graph.nodes(None) {
        Ok(nodes) => nodes,
        Err(e) => {
            eprintln!("{}: {}", "Failed to read long-term graph".red(), e);
            return;
        }
    };
    println!();
    println!("{}", format!("  Long-term memory ({} nodes)", nodes.len()).bold().cyan());
    for node in nodes.iter().take(SUMMARY_ROWS) {
        let attrs: Vec<String> = node
            .attributes
            .iter()
            .map(|(name, state)| format!("{name}={}", state.current.value))
            .collect();
        println!(
            "    {:<40} conf {:.2}  {}",
            node.id.to_string().bold(),
            node.confidence,
            attrs.join(", ").dimmed()
        );
        if let Ok(edges) = graph.edges_from(&node.id) {
            for edge in edges {
                println!("      └─ {} → {}", edge.relation_type, edge.target_node_id);
            }
        }
    }
    if nodes.len() > SUMMARY_ROWS {
        println!("    … {} more", nodes.len() - SUMMARY_ROWS);
    }
}

fn print_report(report: &ShutdownReport) {
    let o = &report.overview;
    println!();
    println!("{}", "  Run summary".bold().cyan());
    println!("    observations recorded  {}", report.recorded);
    println!("    dropped (queue full)   {}", o.driver.dropped);
    println!("    marker observations    {}", o.driver.markers);
    println!("    promotions             {}", o.consolidation.promoted);
    println!("    dead-lettered          {}", o.consolidation.dead_lettered);
    let backlog = if o.overflow_backlog == 0 {
        "0".green()
    } else {
        o.overflow_backlog.to_string().yellow()
    };
    println!("    overflow backlog       {}", backlog);
    println!();
}

fn print_usage() {
    println!();
    println!("  {} {}", "pbrain".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Portable Brain observation pipeline");
    println!();
    println!("  {}", "Usage:".bold());
    println!("    pbrain init [--force]");
    println!("    pbrain replay <session.jsonl> [--in-memory] [--realtime]");
    println!("    pbrain config");
    println!();
}
