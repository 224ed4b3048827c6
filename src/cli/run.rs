//! Run command implementation

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::output::{output_human, output_json};
use super::{CliError, StatusArgs};
use crate::checkpoint::{CheckpointBackend, CheckpointStore, FileBackend};
use crate::dispatcher::config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_CONCURRENCY, DEFAULT_COST_CEILING, DEFAULT_COUNT_CEILING,
    DEFAULT_ESTIMATED_COST, DEFAULT_WINDOW, FLUSH_INTERVAL, MAX_CONCURRENCY, MAX_RETRIES,
};
use crate::dispatcher::{DispatchConfig, DispatchSummary, Dispatcher};
use crate::invoker::{ApiCredentials, HttpInvoker};
use crate::report;
use crate::shutdown::SharedShutdown;
use crate::source::{self, SourceOptions, WorkBatch, DEFAULT_ID_FIELD};

/// Default checkpoint location
pub const DEFAULT_CHECKPOINT_PATH: &str = ".checkpoint/dispatch.json";

/// Exit status when every item succeeded
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status for a fatal error
pub const EXIT_FATAL: i32 = 1;
/// Exit status when some items ended failed
pub const EXIT_PARTIAL: i32 = 3;
/// Exit status after Ctrl+C (128 + SIGINT)
pub const EXIT_INTERRUPTED: i32 = 130;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Parse a headroom fraction in `0.0..=0.5`
fn parse_headroom(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid fraction"))?;
    if !(0.0..=0.5).contains(&value) {
        return Err(format!("headroom must be between 0.0 and 0.5, got {value}"));
    }
    Ok(value)
}

/// Parse a `KEY=VALUE` header pair
fn parse_header(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Resume modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Ignore any checkpoint and start a new one
    Off,
    /// Skip items that already succeeded, retry the rest
    On,
    /// Delete the checkpoint, then start fresh
    Reset,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(ResumeMode::Off),
            "on" => Ok(ResumeMode::On),
            "reset" => Ok(ResumeMode::Reset),
            _ => Err(format!(
                "Invalid resume mode: {s}. Valid options: on, off, reset"
            )),
        }
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// API key taken from the command line or `ANALYSIS_API_KEY`.
/// Never printed, not even by `Debug`.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    /// The secret itself
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl FromStr for ApiKey {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Analysis dispatch CLI
#[derive(Parser, Debug)]
#[command(name = "analysis-dispatch")]
#[command(
    about = "Send a batch of work items to a rate-limited analysis service",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process a batch of work items
    Run(RunArgs),

    /// Summarise a checkpoint without calling the service
    Status(StatusArgs),
}

/// Arguments of the `run` command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input file (.jsonl, .ndjson, .json or .csv)
    pub input: PathBuf,

    /// Field holding each record's stable id
    #[arg(long, default_value = DEFAULT_ID_FIELD)]
    pub id_field: String,

    /// Field holding the payload sent to the service (whole record if omitted)
    #[arg(long)]
    pub payload_field: Option<String>,

    /// Process at most this many records
    #[arg(long)]
    pub limit: Option<usize>,

    /// Checkpoint file
    #[arg(long, default_value = DEFAULT_CHECKPOINT_PATH)]
    pub checkpoint: PathBuf,

    /// Resume mode: on, off, or reset
    #[arg(long, default_value = "on")]
    pub resume: ResumeMode,

    /// Number of concurrent workers (max: 256)
    ///
    /// Admission control keeps every worker inside the service quota, so
    /// extra workers only help while calls are slow relative to the quota.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY, value_parser = parse_concurrency)]
    pub concurrency: usize,

    /// Maximum calls per window
    #[arg(long, default_value_t = DEFAULT_COUNT_CEILING)]
    pub count_ceiling: u64,

    /// Maximum cost units per window
    #[arg(long, default_value_t = DEFAULT_COST_CEILING)]
    pub cost_ceiling: u64,

    /// Quota window length in seconds
    #[arg(long, default_value_t = DEFAULT_WINDOW.as_secs(), value_parser = clap::value_parser!(u64).range(1..))]
    pub window_secs: u64,

    /// Fraction of both ceilings kept in reserve (0.0 - 0.5)
    #[arg(long, default_value = "0.0", value_parser = parse_headroom)]
    pub headroom: f64,

    /// Maximum number of retries per item (range: 0-20)
    #[arg(long, default_value_t = MAX_RETRIES, value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_retries: u32,

    /// Flush the checkpoint every N finished items
    #[arg(long, default_value_t = FLUSH_INTERVAL)]
    pub flush_interval: usize,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.as_secs(), value_parser = clap::value_parser!(u64).range(1..))]
    pub call_timeout_secs: u64,

    /// Cost units reserved per call before the real cost is known
    #[arg(long, default_value_t = DEFAULT_ESTIMATED_COST)]
    pub estimated_cost: u64,

    /// Analysis service endpoint
    #[arg(long, env = "ANALYSIS_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key for the analysis service
    #[arg(long, env = "ANALYSIS_API_KEY", hide_env_values = true)]
    pub api_key: Option<ApiKey>,

    /// Header carrying the API key
    #[arg(long, default_value = "x-api-key")]
    pub api_key_header: String,

    /// JSON pointer to the cost field in responses
    #[arg(long)]
    pub cost_pointer: Option<String>,

    /// Extra request header (KEY=VALUE, repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Keep the checkpoint in place after a fully successful run
    #[arg(long, default_value_t = false)]
    pub no_archive: bool,
}

impl RunArgs {
    /// Dispatch configuration described by these arguments
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            concurrency: self.concurrency,
            count_ceiling: self.count_ceiling,
            cost_ceiling: self.cost_ceiling,
            window: Duration::from_secs(self.window_secs),
            headroom: self.headroom,
            max_retries: self.max_retries,
            flush_interval: self.flush_interval,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            estimated_cost: self.estimated_cost,
            archive_on_success: !self.no_archive,
            ..DispatchConfig::default()
        }
    }

    /// Dispatch configuration for a loaded batch. A batch cut short by
    /// `--limit` never archives the checkpoint, so a later full run still
    /// skips what this one finished.
    pub fn dispatch_config_for(&self, batch: &WorkBatch) -> DispatchConfig {
        let mut config = self.dispatch_config();
        if batch.truncated && config.archive_on_success {
            info!(
                limit = self.limit,
                "Input truncated by --limit, checkpoint will be kept"
            );
            config.archive_on_success = false;
        }
        config
    }

    /// Work source options described by these arguments
    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            id_field: self.id_field.clone(),
            payload_field: self.payload_field.clone(),
            limit: self.limit,
        }
    }

    fn build_invoker(&self) -> Result<HttpInvoker, CliError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            CliError::ConfigurationError(
                "no endpoint configured; pass --endpoint or set ANALYSIS_ENDPOINT".to_string(),
            )
        })?;
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            CliError::ConfigurationError(
                "no API key configured; pass --api-key or set ANALYSIS_API_KEY".to_string(),
            )
        })?;

        let credentials = ApiCredentials::new(&self.api_key_header, api_key.expose())?;
        let mut builder = HttpInvoker::builder(endpoint, credentials)
            .timeout(Duration::from_secs(self.call_timeout_secs))
            .estimated_cost(self.estimated_cost);
        if let Some(pointer) = &self.cost_pointer {
            builder = builder.cost_pointer(pointer.clone());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        Ok(builder.build()?)
    }

    fn open_store(&self) -> Result<CheckpointStore, CliError> {
        let backend = FileBackend::new(&self.checkpoint);
        match self.resume {
            ResumeMode::On => Ok(CheckpointStore::load(Box::new(backend))?),
            ResumeMode::Off => {
                info!(checkpoint = %self.checkpoint.display(), "Resume disabled, starting fresh");
                Ok(CheckpointStore::fresh(Box::new(backend)))
            }
            ResumeMode::Reset => {
                info!(checkpoint = %self.checkpoint.display(), "Reset mode: deleting checkpoint");
                backend.remove()?;
                Ok(CheckpointStore::fresh(Box::new(backend)))
            }
        }
    }

    /// Execute the run and return the process exit status
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<i32, CliError> {
        self.dispatch_config().validate()?;

        let batch = source::load_batch(&self.input, &self.source_options())?;
        let config = self.dispatch_config_for(&batch);
        let items = batch.items;
        let invoker = Arc::new(self.build_invoker()?);
        let store = Arc::new(self.open_store()?);

        if let Some(addr) = self.metrics_addr {
            if let Err(e) = crate::metrics::init_metrics(addr).await {
                warn!(addr = %addr, error = %e, "Metrics endpoint unavailable, continuing without it");
            }
        }

        info!(
            input = %self.input.display(),
            items = items.len(),
            endpoint = %invoker.endpoint(),
            "Starting run"
        );

        let progress = create_progress_bar(cli.output_format);
        let dispatcher = Dispatcher::new(invoker, store.clone(), config)?
            .with_shutdown(shutdown)
            .with_progress_bar(progress.clone());

        let summary = dispatcher.run(items).await?;
        progress.finish_and_clear();

        let snapshot = store.snapshot();
        let aggregate = report::aggregate(snapshot.results());
        match cli.output_format {
            OutputFormat::Json => output_json(&summary, &aggregate),
            OutputFormat::Human => output_human(&summary, &aggregate),
        }

        Ok(exit_status(&summary, aggregate.summary.failed))
    }
}

/// Exit status for a finished run
pub fn exit_status(summary: &DispatchSummary, failed_in_checkpoint: usize) -> i32 {
    if summary.interrupted || summary.cancelled > 0 {
        EXIT_INTERRUPTED
    } else if failed_in_checkpoint > 0 {
        EXIT_PARTIAL
    } else {
        EXIT_SUCCESS
    }
}

/// Progress bar for human output; hidden in JSON mode
fn create_progress_bar(format: OutputFormat) -> ProgressBar {
    if format == OutputFormat::Json {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}
