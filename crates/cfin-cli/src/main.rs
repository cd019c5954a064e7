use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cfin_adapters::{FixturePageSource, OpenFecSource, PageSource};
use cfin_core::{schedule_a_source, RollupKind};
use cfin_storage::{
    CheckpointStore, HttpFetcher, MemoryStore, PageArchive, PgDocumentStore, PgStore,
    RelationalStore,
};
use cfin_sync::{
    maybe_build_scheduler, AggregationEngine, DocumentUpserter, IngestSettings,
    IngestionOrchestrator, SyncConfig,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cfin")]
#[command(about = "Campaign finance ingestion and rollups")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Page Schedule A receipts into the relational store, resuming from the checkpoint
    Ingest(IngestArgs),
    /// Recompute rollup documents for a cycle
    Aggregate(AggregateArgs),
    /// Create tables in the relational and document databases
    InitDb,
    /// Run scheduled aggregation until interrupted
    Schedule,
}

#[derive(Debug, Default, Args)]
struct IngestArgs {
    /// Reporting cycle; defaults to the first of CFIN_CYCLES
    #[arg(long)]
    cycle: Option<i32>,
    /// Stop after this many page fetches
    #[arg(long)]
    max_pages: Option<usize>,
    /// Serve pages from captured JSON files instead of the live API
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Write into in-memory stores; nothing touches Postgres
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AggregateArgs {
    #[arg(long)]
    cycle: Option<i32>,
    /// Run a single pass: by_contributor, by_candidate or by_region
    #[arg(long, value_parser = parse_kind)]
    kind: Option<RollupKind>,
}

fn parse_kind(value: &str) -> Result<RollupKind, String> {
    RollupKind::parse(value).ok_or_else(|| format!("unknown rollup kind: {value}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest(IngestArgs::default())) {
        Commands::Ingest(args) => ingest(&config, args).await?,
        Commands::Aggregate(args) => aggregate(&config, args).await?,
        Commands::InitDb => init_db(&config).await?,
        Commands::Schedule => schedule(config).await?,
    }

    Ok(())
}

async fn ingest(config: &SyncConfig, args: IngestArgs) -> Result<()> {
    let cycle = args.cycle.unwrap_or_else(|| config.default_cycle());

    let source: Arc<dyn PageSource> = match &args.fixtures {
        Some(dir) => Arc::new(FixturePageSource::from_dir(dir)?),
        None => {
            let http = HttpFetcher::new(config.http_config())?;
            Arc::new(OpenFecSource::new(
                http,
                config.openfec_base_url.clone(),
                config.openfec_api_key.clone(),
            ))
        }
    };

    let (relational, checkpoints): (Arc<dyn RelationalStore>, Arc<dyn CheckpointStore>) =
        if args.dry_run {
            let memory = Arc::new(MemoryStore::new());
            (
                memory.clone() as Arc<dyn RelationalStore>,
                memory as Arc<dyn CheckpointStore>,
            )
        } else {
            let pg = Arc::new(
                PgStore::connect(&config.database_url, config.db_max_connections)
                    .await
                    .context("connecting relational store")?,
            );
            (
                pg.clone() as Arc<dyn RelationalStore>,
                pg as Arc<dyn CheckpointStore>,
            )
        };

    let mut orchestrator =
        IngestionOrchestrator::new(source, relational, checkpoints, IngestSettings::from(config));
    if let Some(dir) = &config.archive_dir {
        orchestrator = orchestrator.with_archive(PageArchive::new(dir));
    }

    let summary = orchestrator
        .run(&schedule_a_source(cycle), cycle, args.max_pages)
        .await?;
    println!(
        "ingest complete: run_id={} source={} pages={} records={} dropped={} failed={} reached_end={}",
        summary.run_id,
        summary.source,
        summary.pages,
        summary.records_processed,
        summary.records_dropped,
        summary.records_failed,
        summary.reached_end
    );
    Ok(())
}

async fn build_engine(config: &SyncConfig) -> Result<AggregationEngine> {
    let relational = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting relational store")?;
    let documents = PgDocumentStore::connect(&config.document_database_url, config.db_max_connections)
        .await
        .context("connecting document store")?;
    Ok(AggregationEngine::new(
        Arc::new(relational),
        DocumentUpserter::new(Arc::new(documents), config.write_policy()),
        config.top_n,
    ))
}

async fn aggregate(config: &SyncConfig, args: AggregateArgs) -> Result<()> {
    let cycle = args.cycle.unwrap_or_else(|| config.default_cycle());
    let engine = build_engine(config).await?;

    match args.kind {
        Some(kind) => {
            let pass = engine.aggregate_kind(kind, cycle).await?;
            println!(
                "aggregate complete: cycle={cycle} kind={kind} documents={} degraded={}",
                pass.documents, pass.degraded
            );
        }
        None => {
            let summary = engine.aggregate(cycle).await?;
            println!(
                "aggregate complete: cycle={} contributors={} candidates={} regions={} degraded={}",
                summary.cycle,
                summary.contributors,
                summary.candidates,
                summary.regions,
                summary.degraded_subjects
            );
        }
    }
    Ok(())
}

async fn init_db(config: &SyncConfig) -> Result<()> {
    let relational = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting relational store")?;
    relational.apply_schema().await.context("applying relational schema")?;

    let documents = PgDocumentStore::connect(&config.document_database_url, config.db_max_connections)
        .await
        .context("connecting document store")?;
    documents.apply_schema().await.context("applying document schema")?;

    println!("schema applied");
    Ok(())
}

async fn schedule(mut config: SyncConfig) -> Result<()> {
    config.scheduler_enabled = true;
    let engine = Arc::new(build_engine(&config).await?);
    let Some(mut sched) = maybe_build_scheduler(&config, engine).await? else {
        return Ok(());
    };

    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.aggregate_cron, cycles = ?config.cycles, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
