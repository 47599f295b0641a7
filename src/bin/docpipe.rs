//! CLI binary for docpipe.
//!
//! A thin shim over the library crate that maps flags and environment
//! variables to `PipelineConfig`, wires up the backends, and prints reports.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use docpipe::auth::AdcTokenProvider;
use docpipe::cloud_service::AdobeExtractService;
use docpipe::hub::HfDatasetHub;
use docpipe::pdf::PdfiumBackend;
use docpipe::storage::{FsObjectStore, GcsObjectStore, ObjectStore};
use docpipe::warehouse::{BigQueryWarehouse, SqliteWarehouse, Warehouse};
use docpipe::{
    fetch_extracted, list_questions, ExtractionMethod, Pipeline, PipelineConfig, PipelineContext,
    PipelineProgressCallback, PipelineReport, RepoKind, Stage, StageReport, TableNames,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Stage-level progress bar with a live message for the current item.
struct CliProgressCallback {
    bar: ProgressBar,
    failures: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:30.green/238}] {pos}/{len} stages  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failures: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_pipeline_start(&self, total_stages: usize) {
        self.bar.set_length(total_stages as u64);
    }

    fn on_stage_start(&self, stage: &str, _index: usize, _total_stages: usize) {
        self.bar.set_prefix(stage.to_string());
        self.bar.set_message("");
    }

    fn on_item(&self, _stage: &str, name: &str) {
        self.bar.set_message(dim(name));
    }

    fn on_stage_complete(&self, report: &StageReport) {
        let failed = report.failed.len();
        self.failures.fetch_add(failed, Ordering::Relaxed);
        let mark = if failed == 0 { green("✓") } else { yellow("!") };
        self.bar.println(format!(
            "  {} {:<20} {}",
            mark,
            report.stage,
            dim(&format!(
                "{} processed, {} skipped, {} rejected, {} failed, {:.1}s",
                report.processed,
                report.skipped,
                report.rejected,
                failed,
                report.duration_ms as f64 / 1000.0
            )),
        ));
        self.bar.inc(1);
    }

    fn on_stage_error(&self, stage: &str, error: &str) {
        self.bar
            .println(format!("  {} {:<20} {}", red("✗"), stage, red(error)));
    }

    fn on_pipeline_complete(&self, completed_stages: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} stages completed, {} per-file failures",
            bold("◆"),
            completed_stages,
            self.failures.load(Ordering::Relaxed)
        );
    }
}

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageBackend {
    /// Google Cloud Storage JSON API.
    Gcs,
    /// A local directory standing in for the bucket.
    Fs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WarehouseBackend {
    /// BigQuery REST API.
    Bigquery,
    /// A local SQLite database.
    Sqlite,
}

/// Ingest a benchmark's documents into an analytical warehouse.
#[derive(Parser, Debug)]
#[command(
    name = "docpipe",
    version,
    about = "Benchmark document ingestion: staging, dual PDF extraction, warehouse load",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    backends: BackendArgs,

    /// Verbose logging (debug level).
    #[arg(short, long, global = true, env = "DOCPIPE_VERBOSE")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, global = true, env = "DOCPIPE_QUIET")]
    quiet: bool,

    /// Also append warnings and errors to this file.
    #[arg(long, global = true, env = "DOCPIPE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline (all stages, from a stage, or one stage).
    Run(RunArgs),
    /// List the stages in execution order.
    Stages,
    /// Print the extracted data for one task.
    Fetch {
        #[arg(long)]
        task_id: String,
        /// `opensource` (pdfium) or `cloud`.
        #[arg(long, default_value = "opensource")]
        method: String,
    },
    /// List questions that have a PDF attachment.
    Questions,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Start at this stage and run the rest.
    #[arg(long, conflicts_with = "stage")]
    from: Option<String>,

    /// Run only this stage.
    #[arg(long)]
    stage: Option<String>,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Hide the progress bar.
    #[arg(long, env = "DOCPIPE_NO_PROGRESS")]
    no_progress: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Bucket holding staged files and artifacts.
    #[arg(long, env = "BUCKET_NAME")]
    bucket: Option<String>,

    #[arg(long, env = "HUGGINGFACE_TOKEN", hide_env_values = true)]
    hub_token: Option<String>,

    #[arg(long, env = "REPO_ID")]
    repo_id: Option<String>,

    #[arg(long, env = "REPO_TYPE", default_value = "dataset")]
    repo_type: String,

    /// Hub path prefix of the files to stage.
    #[arg(long, env = "FILE_PATH", default_value = "2023/")]
    dataset_prefix: String,

    /// Local directory for cloud result archives.
    #[arg(long, env = "OUTPUT_DIRECTORY")]
    output_dir: Option<PathBuf>,

    /// Bucket folder for published cloud results.
    #[arg(long, env = "GCS_EXTRACTED_FOLDER")]
    cloud_folder: Option<String>,

    /// Cloud extraction service credentials JSON.
    #[arg(long, env = "ADOBE_CREDENTIALS_PATH", default_value = "Adobe_Credentials.json")]
    credentials: PathBuf,

    /// Local directory for downloaded PDFs.
    #[arg(long, env = "DOCPIPE_SCRATCH_DIR", default_value = "downloaded_pdfs")]
    scratch_dir: PathBuf,

    /// Directory containing libpdfium.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    #[arg(long, env = "DOCPIPE_POLL_TIMEOUT", default_value_t = 600)]
    poll_timeout_secs: u64,

    #[arg(long, env = "DOCPIPE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
}

#[derive(Args, Debug)]
struct BackendArgs {
    #[arg(long, global = true, value_enum, env = "DOCPIPE_STORAGE", default_value = "gcs")]
    storage: StorageBackend,

    /// Root directory for `--storage fs`.
    #[arg(long, global = true, env = "DOCPIPE_STORAGE_ROOT", default_value = "bucket")]
    storage_root: PathBuf,

    #[arg(long, global = true, value_enum, env = "DOCPIPE_WAREHOUSE", default_value = "bigquery")]
    warehouse: WarehouseBackend,

    /// Database file for `--warehouse sqlite`.
    #[arg(long, global = true, env = "DOCPIPE_SQLITE_PATH", default_value = "docpipe.db")]
    sqlite_path: PathBuf,

    #[arg(long, global = true, env = "PROJECT_ID")]
    project_id: Option<String>,

    #[arg(long, global = true, env = "DATASET_ID")]
    dataset_id: Option<String>,
}

impl PipelineArgs {
    fn to_config(&self) -> Result<PipelineConfig> {
        let repo_type: RepoKind = self.repo_type.parse()?;
        let mut builder = PipelineConfig::builder()
            .bucket(self.bucket.clone().unwrap_or_default())
            .repo_type(repo_type)
            .dataset_prefix(&self.dataset_prefix)
            .output_dir(self.output_dir.clone().unwrap_or_default())
            .cloud_extracted_folder(self.cloud_folder.clone().unwrap_or_default())
            .cloud_credentials_path(&self.credentials)
            .scratch_dir(&self.scratch_dir)
            .poll_timeout_secs(self.poll_timeout_secs)
            .max_retries(self.max_retries);
        if let Some(token) = &self.hub_token {
            builder = builder.hub_token(token);
        }
        if let Some(repo) = &self.repo_id {
            builder = builder.repo_id(repo);
        }
        Ok(builder.build()?)
    }
}

impl BackendArgs {
    async fn store(&self, config: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> {
        Ok(match self.storage {
            StorageBackend::Gcs => Arc::new(
                GcsObjectStore::new(config)
                    .await
                    .context("connecting to Google Cloud Storage")?,
            ),
            StorageBackend::Fs => Arc::new(FsObjectStore::new(&self.storage_root, &config.bucket)),
        })
    }

    async fn warehouse(&self, config: &PipelineConfig) -> Result<Arc<dyn Warehouse>> {
        Ok(match self.warehouse {
            WarehouseBackend::Bigquery => {
                let auth = AdcTokenProvider::new()
                    .await
                    .context("loading Google Cloud credentials for BigQuery")?;
                Arc::new(BigQueryWarehouse::new(
                    config,
                    self.project_id.clone().unwrap_or_default(),
                    self.dataset_id.clone().unwrap_or_default(),
                    Some(Arc::new(auth)),
                )?)
            }
            WarehouseBackend::Sqlite => Arc::new(
                SqliteWarehouse::open(&self.sqlite_path)
                    .with_context(|| format!("opening {}", self.sqlite_path.display()))?,
            ),
        })
    }
}

// ── Logging ──────────────────────────────────────────────────────────────────

fn init_logging(cli: &Cli, show_progress: bool) -> Result<()> {
    // The progress bar covers INFO-level feedback while it is visible.
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
    );

    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::WARN),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────────────

fn print_report(report: &PipelineReport) {
    println!(
        "{:<20} {:>9} {:>8} {:>9} {:>7} {:>6} {:>9}",
        "stage", "processed", "skipped", "rejected", "failed", "rows", "time"
    );
    for s in &report.stages {
        println!(
            "{:<20} {:>9} {:>8} {:>9} {:>7} {:>6} {:>8.1}s",
            s.stage,
            s.processed,
            s.skipped,
            s.rejected,
            s.failed.len(),
            s.rows_loaded.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            s.duration_ms as f64 / 1000.0
        );
        for failure in &s.failed {
            println!("    {} {}", red("✗"), failure);
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !cli.verbose && !args.no_progress && !args.json,
        _ => false,
    };
    init_logging(&cli, show_progress)?;

    match &cli.command {
        Command::Stages => {
            for (idx, stage) in Stage::ALL.iter().enumerate() {
                println!("{:>2}. {:<20} {}", idx + 1, stage.name(), dim(stage.description()));
            }
        }

        Command::Run(args) => {
            let config = args.pipeline.to_config()?;
            let store = cli.backends.store(&config).await?;
            let warehouse = cli.backends.warehouse(&config).await?;
            let hub = Arc::new(HfDatasetHub::new(config.hub_token.clone().unwrap_or_default()));
            let pdf = Arc::new(PdfiumBackend::new(args.pipeline.pdfium_lib_path.clone()));
            let extractor = Arc::new(AdobeExtractService::new(&config)?);

            let mut ctx = PipelineContext::new(config, store, warehouse, hub, pdf, extractor);
            if show_progress {
                ctx = ctx.with_progress(CliProgressCallback::new());
            }
            let pipeline = Pipeline::new(ctx);

            let report = match (&args.stage, &args.from) {
                (Some(stage), _) => {
                    let stage: Stage = stage.parse()?;
                    let stage_report = pipeline.run_stage(stage).await?;
                    PipelineReport {
                        duration_ms: stage_report.duration_ms,
                        stages: vec![stage_report],
                    }
                }
                (None, Some(from)) => pipeline.run_from(from.parse()?).await?,
                (None, None) => pipeline.run().await?,
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }

        Command::Fetch { task_id, method } => {
            let method: ExtractionMethod = method.parse()?;
            let warehouse = cli.backends.warehouse(&PipelineConfig::default()).await?;
            match fetch_extracted(warehouse.as_ref(), &TableNames::default(), task_id, method).await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => println!("No extracted data found."),
            }
        }

        Command::Questions => {
            let warehouse = cli.backends.warehouse(&PipelineConfig::default()).await?;
            let questions = list_questions(warehouse.as_ref(), &TableNames::default()).await?;
            if questions.is_empty() {
                bail!("no questions with a PDF attachment found");
            }
            for q in questions {
                println!("{}\t{}", q.task_id, q.question);
            }
        }
    }

    Ok(())
}
