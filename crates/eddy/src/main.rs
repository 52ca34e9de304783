//! Eddy: gateway entity cache tools
//!
//! Subcommands:
//! - `replay`: Feed a recorded dispatch log through the cache and print the
//!   resulting domain events
//! - `kinds`: List the update kinds the cache handles

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eddy_cache::{CacheConfig, DispatchKind, EntityCache};
use miette::{IntoDiagnostic, Result, WrapErr};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod replay;

use replay::{LoggingRequester, OutputFormat, ReplayOptions};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "eddy")]
#[command(about = "Gateway entity cache tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded dispatch log (JSON lines of {"t", "d"} frames)
    Replay {
        /// Dispatch log to replay
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Cache configuration file (JSON). Flags below override it.
        #[arg(long, env = "EDDY_CONFIG")]
        config: Option<PathBuf>,

        /// Hold guild joins until member chunking completes
        #[arg(long, env = "EDDY_FETCH_MEMBERS", value_parser = parse_bool_env, default_value = "false")]
        fetch_members: bool,

        /// Also print every raw update
        #[arg(long, env = "EDDY_DISPATCH_RAW", value_parser = parse_bool_env, default_value = "false")]
        raw: bool,

        /// Output format for events and the summary
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Stop at the first line that is not valid JSON
        #[arg(long)]
        strict: bool,
    },

    /// List the update kinds the cache processes
    Kinds,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "eddy=info,eddy_cache=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            file,
            config,
            fetch_members,
            raw,
            format,
            strict,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => CacheConfig::default(),
            };
            config.fetch_members |= fetch_members;
            config.dispatch_raw |= raw;
            run_replay(&file, config, ReplayOptions { format, strict }).await
        }

        Commands::Kinds => {
            for kind in DispatchKind::ALL {
                println!("{kind}");
            }
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<CacheConfig> {
    let contents = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&contents)
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid config {}", path.display()))
}

async fn run_replay(file: &Path, config: CacheConfig, options: ReplayOptions) -> Result<()> {
    info!(?config, "starting replay");
    let cache = EntityCache::builder()
        .config(config)
        .member_requester(Arc::new(LoggingRequester))
        .build();

    // Ctrl-C stops the processing loop; whatever was applied is still summarized.
    let signal_cache = Arc::clone(&cache);
    let signal_task = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        signal_cache.shutdown();
    });

    let mut stdout = std::io::stdout().lock();
    let summary = replay::replay_file(&cache, file, options, &mut stdout)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    signal_task.abort();

    replay::write_summary(&mut stdout, &summary, options.format)
        .map_err(|e| miette::miette!("{}", e))?;
    cache.shutdown();
    Ok(())
}
