//! toolguard - Entry Point
//!
//! Modes:
//! - --fingerprint <json>: print the canonical parameter fingerprint
//! - --classify <text>: classify an error message
//! - --cleanup: remove expired cache entries from the configured database

use anyhow::Context;
use serde_json::json;
use toolguard::{
    classify_error, classify_recovery, determine_strategy, fingerprint_json, GuardConfig, ToolGuard,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn flag_value<'a>(args: &'a [String], names: &[&str]) -> Option<&'a str> {
    args.iter()
        .position(|a| names.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn print_help() {
    println!("toolguard v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: toolguard [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --fingerprint, -f <json>  Print the parameter fingerprint");
    println!("  --classify, -c <text>     Classify an error message");
    println!("  --cleanup                 Remove expired cache entries");
    println!("  --pretty                  Human-readable logs instead of JSON");
    println!("  --help, -h                Show this help");
    println!();
    println!("Environment variables:");
    println!("  TOOLGUARD_DB_PATH               SQLite database path");
    println!("  TOOLGUARD_LOOKBACK_MINUTES      Redundancy window (default: 10)");
    println!("  TOOLGUARD_CACHE_TTL_MINUTES     Cache TTL (default: 30)");
    println!("  TOOLGUARD_HISTORY_LIMIT         Reflections per prompt (default: 5)");
    println!("  TOOLGUARD_CONFIDENCE_THRESHOLD  Minimum retry confidence (default: 0.30)");
    println!("  TOOLGUARD_MODEL                 haiku, sonnet or opus (default: sonnet)");
    println!("  ANTHROPIC_API_KEY               Claude API key");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let pretty = args.iter().any(|a| a == "--pretty");
    let cleanup_mode = args.iter().any(|a| a == "--cleanup");
    let fingerprint_input = flag_value(&args, &["--fingerprint", "-f"]);
    let classify_input = flag_value(&args, &["--classify", "-c"]);

    if help_mode || (!cleanup_mode && fingerprint_input.is_none() && classify_input.is_none()) {
        print_help();
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::WARN);

    if pretty {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // stdout carries results, logs go to stderr as JSON
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    if let Some(raw) = fingerprint_input {
        let params: serde_json::Value =
            serde_json::from_str(raw).context("--fingerprint expects a JSON value")?;
        println!("{}", fingerprint_json(Some(&params)));
    }

    if let Some(text) = classify_input {
        let category = classify_error(Some(text), None);
        let recovery = classify_recovery(Some(text), None);
        let report = json!({
            "error_category": category.as_str(),
            "strategy": determine_strategy(Some(category)).as_str(),
            "recovery_category": recovery.as_str(),
            "recoverable": recovery.is_recoverable(),
            "hint": recovery.hint(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if cleanup_mode {
        let config = GuardConfig::from_env()?;
        info!("toolguard v{} cleanup: {}", env!("CARGO_PKG_VERSION"), config.db_path.display());

        let guard = ToolGuard::open(&config)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?;
        let removed = guard.redundancy.cleanup_expired_cache().await?;
        println!("Removed {} expired cache entries", removed);
    }

    Ok(())
}
