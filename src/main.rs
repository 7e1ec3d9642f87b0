use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use music_etl::config::{EtlConfig, SkipPolicy};
use music_etl::pipeline::ingestion::checkpoint::ResumeMode;
use music_etl::pipeline::storage::SqliteSink;
use music_etl::pipeline::{check_source, Orchestrator, PassSelection, RunOptions, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "music_etl")]
#[command(about = "Load music streaming session extracts into the analytics store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the songs pass, then the facts pass
    Run(LoadArgs),
    /// Run the songs pass only
    Songs(LoadArgs),
    /// Run the facts pass only (songs must already be loaded)
    Facts(LoadArgs),
    /// Validate the source header and report the resolved skip rule
    Check(SourceArgs),
}

impl Commands {
    fn source_args(&self) -> &SourceArgs {
        match self {
            Commands::Run(args) | Commands::Songs(args) | Commands::Facts(args) => &args.source,
            Commands::Check(args) => args,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SourceArgs {
    /// TOML config file; values are overridden by ETL_* env vars and flags
    #[arg(long)]
    config: Option<PathBuf>,
    /// Source CSV extract
    #[arg(long)]
    source: Option<PathBuf>,
    /// Rows per chunk read from the source
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Which skip encoding wins when both are present
    #[arg(long, value_enum)]
    skip_policy: Option<SkipPolicy>,
    /// Directory for JSON log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

impl SourceArgs {
    fn resolve(&self) -> anyhow::Result<EtlConfig> {
        let mut config = EtlConfig::load(self.config.as_deref())?;
        config.apply_env()?;
        if let Some(source) = &self.source {
            config.source = source.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(policy) = self.skip_policy {
            config.skip_policy = policy;
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
struct LoadArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Target SQLite database (schema must already exist)
    #[arg(long)]
    database: Option<PathBuf>,
    /// Rows per write transaction
    #[arg(long)]
    batch_size: Option<usize>,
    /// Maximum concurrent store connections
    #[arg(long)]
    max_connections: Option<usize>,
    /// Continue an interrupted facts pass from its checkpoint
    #[arg(long, conflicts_with = "force_restart")]
    resume: bool,
    /// Discard the facts checkpoint and append again (duplicates committed listens)
    #[arg(long)]
    force_restart: bool,
    /// Print the run summary as JSON on success
    #[arg(long)]
    summary_json: bool,
}

impl LoadArgs {
    fn resolve(&self) -> anyhow::Result<EtlConfig> {
        let mut config = self.source.resolve()?;
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        config.validate()?;
        Ok(config)
    }

    fn resume_mode(&self) -> ResumeMode {
        if self.resume {
            ResumeMode::Resume
        } else if self.force_restart {
            ResumeMode::ForceRestart
        } else {
            ResumeMode::Fresh
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = music_etl::logging::init_logging(&cli.command.source_args().log_dir);

    match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("❌ {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn execute(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Check(args) => check(&args),
        Commands::Run(args) => load(&args, PassSelection::Both).await,
        Commands::Songs(args) => load(&args, PassSelection::SongsOnly).await,
        Commands::Facts(args) => load(&args, PassSelection::FactsOnly).await,
    }
}

fn check(args: &SourceArgs) -> anyhow::Result<ExitCode> {
    let config = args.resolve()?;
    let report = check_source(&config)
        .with_context(|| format!("checking source {}", config.source.display()))?;
    println!("📋 Source OK: {}", report.source.display());
    println!("   Columns: {}", report.columns.len());
    println!("   Skip rule: {}", report.skip_rule);
    println!("   Fingerprint: {}", report.fingerprint);
    Ok(ExitCode::SUCCESS)
}

async fn load(args: &LoadArgs, passes: PassSelection) -> anyhow::Result<ExitCode> {
    let config = args.resolve()?;
    if let Err(e) = music_etl::observability::init() {
        warn!("Metrics exporter not started: {}", e);
    }

    let sink = SqliteSink::open(&config.database, config.max_connections, config.write_timeout())
        .await
        .with_context(|| format!("opening target database {}", config.database.display()))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n🛑 Cancelling at the next chunk boundary...");
                warn!("Cancellation requested by operator");
                cancel.cancel();
            }
        }
    });

    let mut orchestrator = Orchestrator::new(config, Arc::new(sink));
    let options = RunOptions {
        passes,
        resume: args.resume_mode(),
        cancel,
    };

    match orchestrator.run(options).await {
        Ok(summary) => {
            print_summary(&summary);
            if args.summary_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            info!(run_id = %summary.run_id, "Load finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) if failure.is_cancelled() => {
            eprintln!("🛑 {} pass cancelled; committed batches are kept", failure.pass);
            Ok(ExitCode::from(130))
        }
        Err(failure) => {
            eprintln!("❌ {} pass failed: {}", failure.pass, failure.error);
            Ok(ExitCode::from(1))
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\n📊 Load Results ({}):", summary.run_id);
    for pass in [&summary.songs, &summary.facts].into_iter().flatten() {
        println!("   [{}] rows read: {}", pass.pass, pass.rows_read);
        for (reason, count) in &pass.rows_dropped {
            println!("   [{}] dropped ({}): {}", pass.pass, reason, count);
        }
        for (table, totals) in &pass.tables {
            println!(
                "   [{}] {}: {} batches, {} discovered, {} inserted, {} already present",
                pass.pass, table, totals.batches, totals.attempted, totals.inserted, totals.ignored
            );
        }
    }
    println!("   Elapsed: {:.1}s", summary.elapsed_secs);
}
