//! # Resilience Configuration Validator
//!
//! Command-line tool for checking a configuration file before deploying it. Loads the file
//! with environment overrides applied, runs validation, and optionally prints the
//! effective configuration or pings every key-value instance.

use clap::{Parser, Subcommand};
use resilience_core::config::ConfigManager;
use resilience_core::kv::{KvProvider, KvStore};
use resilience_core::ResilienceConfig;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate resilience configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (environment variables only when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and print a summary
    Validate,

    /// Print the effective configuration
    Show {
        /// Output format (table, json)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Ping every configured key-value instance
    Ping,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let manager = match ConfigManager::load_from_path(cli.config.as_deref()) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("❌ Configuration invalid: {e}");
            error!("Configuration validation failed: {}", e);
            process::exit(1);
        }
    };
    let config = manager.config();

    let result = match &cli.command {
        Some(Commands::Show { format }) => show_config(&config, format),
        Some(Commands::Ping) => ping_instances(&config).await,
        Some(Commands::Validate) | None => {
            print_summary(&manager, &config);
            Ok(())
        }
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(1);
        }
    }
}

fn print_summary(manager: &ConfigManager, config: &ResilienceConfig) {
    println!("✅ Configuration valid");
    println!("Environment: {}", manager.environment());
    if let Some(path) = manager.source_path() {
        println!("Source: {}", path.display());
    }
    println!();

    let instances = config.kv.instances.len();
    println!("KV instances ({instances}):");
    for instance in &config.kv.instances {
        println!("  {:<12} {}", instance.name, instance.url);
    }
    println!(
        "Lock quorum: {} of {} (memory fallback: {})",
        config.lock.quorum_for(instances),
        instances,
        config.lock.fallback_to_memory
    );
    println!(
        "Cache: enabled={} memory={} remote={} disk={} default_ttl={}s jitter={}",
        config.cache.enabled,
        config.cache.memory.enabled,
        config.cache.remote.enabled,
        config.cache.disk.enabled,
        config.cache.default_ttl_secs,
        config.cache.ttl_jitter_factor
    );
    println!(
        "Scheduler: concurrency={} queue={} retries={} timeout={}ms persistence={}",
        config.scheduler.concurrency,
        config.scheduler.max_queue_length,
        config.scheduler.max_retries,
        config.scheduler.task_timeout_ms,
        config.scheduler.persistence.enabled
    );
    println!(
        "Degradation: enabled={} interval={}ms recovery_threshold={}",
        config.degradation.enabled,
        config.degradation.check_interval_ms,
        config.degradation.recovery_threshold
    );
}

fn show_config(config: &ResilienceConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(config)?),
        "table" => {
            let value = serde_json::to_value(config)?;
            let mut rows = Vec::new();
            flatten("", &value, &mut rows);
            let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
            for (key, value) in rows {
                println!("{key:<width$}  {value}");
            }
        }
        other => return Err(format!("Unknown output format '{other}'").into()),
    }
    Ok(())
}

fn flatten(prefix: &str, value: &serde_json::Value, rows: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, rows);
            }
        }
        other => rows.push((prefix.to_string(), other.to_string())),
    }
}

async fn ping_instances(config: &ResilienceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let providers = KvProvider::from_kv_config(&config.kv)?;
    let timeout = config.kv.command_timeout();
    let mut reachable = 0;

    for provider in &providers {
        match tokio::time::timeout(timeout, provider.ping()).await {
            Ok(Ok(())) => {
                reachable += 1;
                println!("  ✅ {}", provider.name());
            }
            Ok(Err(e)) => println!("  ❌ {} ({e})", provider.name()),
            Err(_) => println!("  ❌ {} (no reply within {:?})", provider.name(), timeout),
        }
    }

    let quorum = config.lock.quorum_for(providers.len());
    println!("{reachable}/{} reachable, quorum {quorum}", providers.len());
    if reachable < quorum {
        return Err(format!("Only {reachable} instances reachable, quorum needs {quorum}").into());
    }
    Ok(())
}
