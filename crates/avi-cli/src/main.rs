use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use avi_core::{CheckStatus, DateRange, SourceId};
use avi_storage::ManifestStore;
use avi_sync::config::DEFAULT_CONFIG_PATH;
use avi_sync::{IngestConfig, IngestOutcome, IngestPipeline, IngestRequest};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "avi")]
#[command(about = "Aviation dataset ingestion and validation")]
struct Cli {
    /// YAML config; defaults to $AVI_CONFIG, then config/ingest.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, validate and persist one source for a date range.
    Ingest {
        #[arg(long)]
        source: SourceId,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Station or airport code; repeatable.
        #[arg(long = "station")]
        stations: Vec<String>,
        /// Re-run even if the same request already succeeded.
        #[arg(long)]
        force: bool,
    },
    /// Print manifest entries, oldest first.
    History {
        #[arg(long)]
        source: Option<SourceId>,
    },
    /// Report which credentials are configured.
    Doctor,
}

fn load_config(path: Option<PathBuf>) -> Result<IngestConfig> {
    let path = path
        .or_else(|| std::env::var("AVI_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    debug!(path = %path.display(), "loading config");
    let mut config = IngestConfig::load(&path)?;
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avi=info,avi_sync=info,avi_storage=info,avi_adapters=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Ingest {
            source,
            start,
            end,
            stations,
            force,
        } => {
            let range = DateRange::new(start, end)?;
            let mut request = IngestRequest::new(source, range).with_stations(stations);
            request.force = force;
            let pipeline = IngestPipeline::new(config)?;
            let outcome = pipeline.trigger_ingest(request).await?;
            print_outcome(&outcome);
            if matches!(outcome, IngestOutcome::Rejected { .. }) {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::History { source } => {
            let store = ManifestStore::new(config.manifest_path());
            let entries = store
                .history(source)
                .await
                .with_context(|| format!("reading {}", store.path().display()))?;
            if entries.is_empty() {
                println!("no ingestion attempts recorded in {}", store.path().display());
            }
            for entry in entries {
                println!(
                    "{} {} {} accepted={} rows={} dropped={} path={} :: {}",
                    entry.attempted_at.to_rfc3339(),
                    entry.source_id,
                    entry.request_params.range,
                    entry.accepted,
                    entry.row_count,
                    entry.dropped_rows,
                    entry.output_path.as_deref().unwrap_or("-"),
                    entry
                        .failure
                        .as_ref()
                        .map(|f| f.message.clone())
                        .unwrap_or_else(|| entry.validation_summary.clone()),
                );
            }
        }
        Commands::Doctor => {
            for line in doctor_report(&config) {
                println!("{line}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_outcome(outcome: &IngestOutcome) {
    let entry = outcome.entry();
    println!(
        "{} {} {}: {}",
        outcome.label(),
        entry.source_id,
        entry.request_params.range,
        entry.validation_summary
    );
    if let Some(report) = outcome.report() {
        for result in &report.results {
            let marker = match result.status {
                CheckStatus::Pass => "PASS",
                CheckStatus::Warn => "WARN",
                CheckStatus::Fail if result.blocking => "FAIL",
                CheckStatus::Fail => "fail",
            };
            println!("  [{marker}] {:<28} {}", result.rule_name, result.detail);
        }
    }
    if let IngestOutcome::Ingested { output, derived, .. } = outcome {
        println!(
            "  wrote {} rows, {} bytes -> {} (sha256 {})",
            output.rows,
            output.bytes,
            output.absolute_path.display(),
            output.sha256
        );
        for daily in derived {
            println!("  daily rollup {} rows -> {}", daily.rows, daily.absolute_path.display());
        }
    }
}

/// The weather service asks callers to identify themselves with a contact address.
fn looks_like_contact(agent: &str) -> bool {
    agent
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',' || c == ';')
        .any(|part| match part.split_once('@') {
            Some((user, domain)) => !user.is_empty() && domain.contains('.') && !domain.ends_with('.'),
            None => false,
        })
}

fn doctor_report(config: &IngestConfig) -> Vec<String> {
    let otp = match &config.otp_api_key {
        Some(_) => "otp: DATA_GOV_API_KEY present".to_string(),
        None => "otp: DATA_GOV_API_KEY missing (required for flight records)".to_string(),
    };
    let metar = match config.noaa_user_agent.as_deref() {
        Some(agent) if looks_like_contact(agent) => format!("metar: NOAA_USER_AGENT ok ({agent})"),
        Some(agent) => format!("metar: NOAA_USER_AGENT `{agent}` should include a contact email"),
        None => "metar: NOAA_USER_AGENT missing (set a contact email)".to_string(),
    };
    vec![
        otp,
        metar,
        "tsa: public download, no credentials needed".to_string(),
        format!("data dir: {}", config.data_dir.display()),
    ]
}
