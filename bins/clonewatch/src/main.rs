use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clonewatch_core::config::{AppConfig, ObservabilityConfig};
use clonewatch_core::utils::parse_address;
use clonewatch_explorer::SourceFetcher;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "config/clonewatch.toml";
const LOG_FILE_PREFIX: &str = "clonewatch.log";

#[derive(Parser)]
#[command(name = "clonewatch", version, about = "Flags new contracts that copy a reference source")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Scores a candidate source file against a reference file offline.
    Score {
        #[arg(long)]
        reference: String,
        #[arg(long)]
        candidate: String,
    },
    /// Prints the normalized verified source of a contract.
    FetchSource {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
        #[arg(long)]
        address: String,
    },
    PrintConfig {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => {
            let cfg = AppConfig::load(&config)?;
            let _guard = init_tracing(&cfg.observability)?;
            info!(config = %config, chain_id = cfg.chain.chain_id, "starting clonewatch");
            clonewatch_bot::launch(&cfg).await?;
        }
        Commands::Score {
            reference,
            candidate,
        } => {
            let reference = std::fs::read_to_string(&reference)
                .with_context(|| format!("reading {reference}"))?;
            let candidate = std::fs::read_to_string(&candidate)
                .with_context(|| format!("reading {candidate}"))?;
            let result = clonewatch_similarity::score(&reference, &candidate)?;
            println!(
                "similarity: {:.2}% ({}/{} reference lines)",
                result.percent, result.matched, result.total
            );
        }
        Commands::FetchSource { config, address } => {
            let cfg = AppConfig::load(&config)?;
            let _guard = init_tracing(&cfg.observability)?;
            let address = parse_address(&address)?;
            let fetcher = SourceFetcher::new(&cfg.explorer, cfg.chain.chain_id)?;
            let bundle = fetcher.fetch_now(address).await?;
            println!("{}", bundle.text);
        }
        Commands::PrintConfig { config } => {
            let cfg = AppConfig::load(&config)?;
            let json = serde_json::to_string_pretty(&cfg)?;
            println!("{json}");
        }
    }
    Ok(())
}

/// Console output always; a daily-rotated file too when `log_dir` is set.
fn init_tracing(cfg: &ObservabilityConfig) -> Result<Option<WorkerGuard>> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(value) => EnvFilter::try_new(value).unwrap_or_else(|_| EnvFilter::new("info")),
        Err(_) => EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());
    match &cfg.log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(dir, cfg.log_max_files)?);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

fn file_appender(dir: &str, max_files: usize) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(max_files.max(1))
        .build(dir)
        .with_context(|| format!("opening log directory {dir}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_files_carry_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        let mut appender = file_appender(path.to_str().unwrap(), 14).unwrap();
        writeln!(appender, "hello").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(&path)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(LOG_FILE_PREFIX));
    }
}
