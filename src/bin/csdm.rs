use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use cloudsat_data_manager::archive::{ArchiveClient, CachedArchive};
use cloudsat_data_manager::config::{ConfigLoader, ResolvedConfig};
use cloudsat_data_manager::decoder::CommandDecoder;
use cloudsat_data_manager::error::CsdmError;
use cloudsat_data_manager::filter::{FilterSpec, QueryEngine};
use cloudsat_data_manager::fleet::{FleetManager, FleetStatus};
use cloudsat_data_manager::output::{
    JsonOutput, QueryResult, RefreshResult, SubmitResult, job_status_view, reference_dataset,
};
use cloudsat_data_manager::request::JobRequest;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "csdm")]
#[command(about = "CloudSat data job orchestrator: download, parse and filter archive granules")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the fleet manager (intake and supervision)")]
    Run(RunArgs),
    #[command(about = "Validate a request document and place it in the inbox")]
    Submit(SubmitArgs),
    #[command(about = "Show a job's parse progress")]
    Status(StatusArgs),
    #[command(about = "Show the fleet status document")]
    Fleet,
    #[command(about = "Filter a job's parsed data")]
    Query(QueryArgs),
    #[command(about = "Print the static reference dataset")]
    Reference,
    #[command(about = "Re-list an archive directory and replace its cached listing")]
    Refresh(RefreshArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Admit the inbox once, supervise until nothing is left to run, then exit.
    #[arg(long)]
    until_idle: bool,
}

#[derive(Args)]
struct SubmitArgs {
    file: PathBuf,
}

#[derive(Args)]
struct RefreshArgs {
    /// Remote directory, e.g. /Data/2B-GEOPROF.P1_R05/2012
    dir: String,
}

#[derive(Args)]
struct StatusArgs {
    job_id: String,
}

#[derive(Args)]
struct QueryArgs {
    job_id: String,

    #[arg(long)]
    criteria: String,

    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    materialize: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CsdmError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CsdmError) -> u8 {
    match error {
        CsdmError::JobNotFound(_) | CsdmError::ConfigRead(_) => 2,
        CsdmError::ArchiveHttp(_)
        | CsdmError::ArchiveSession(_)
        | CsdmError::ArchiveStatus { .. }
        | CsdmError::ProductNotFound(_)
        | CsdmError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_fleet(config, args),
        Commands::Submit(args) => {
            let workspace = config.workspace();
            workspace.ensure_layout()?;
            let (request, path) =
                JobRequest::submit(&args.file, workspace.inbox_dir().as_std_path())?;
            JsonOutput::print_submit(&SubmitResult {
                job_id: request.job_id,
                inbox_path: path.display().to_string(),
            })
            .into_diagnostic()
        }
        Commands::Status(args) => {
            let view = job_status_view(&config.workspace(), &args.job_id)?;
            JsonOutput::print_status(&view).into_diagnostic()
        }
        Commands::Fleet => {
            let status = FleetStatus::load(config.workspace().fleet_status_path().as_std_path())?;
            JsonOutput::print_fleet(&status).into_diagnostic()
        }
        Commands::Query(args) => run_query(&config, args),
        Commands::Reference => {
            let content = reference_dataset(config.reference_geometry.as_deref())?;
            JsonOutput::print_raw(&content).into_diagnostic()
        }
        Commands::Refresh(args) => {
            config.workspace().ensure_layout()?;
            let files = open_archive(&config)?.refresh(&args.dir)?;
            tracing::info!(dir = %args.dir, files = files.len(), "listing refreshed");
            JsonOutput::print_refresh(&RefreshResult {
                files: files.len(),
                dir: args.dir,
            })
            .into_diagnostic()
        }
    }
}

fn open_archive(config: &ResolvedConfig) -> Result<CachedArchive<ArchiveClient>, CsdmError> {
    Ok(CachedArchive::new(
        ArchiveClient::connect(&config.archive)?,
        config.workspace().listing_cache_path().as_std_path(),
    )
    .with_ttl(config.archive.listing_ttl))
}

fn run_fleet(config: ResolvedConfig, args: RunArgs) -> miette::Result<()> {
    let workspace = config.workspace();
    workspace.ensure_layout()?;
    let decoder_settings = config
        .decoder
        .clone()
        .ok_or_else(|| CsdmError::MissingTool("decoder program (set `decoder` in csdm.json)".to_string()))?;
    let decoder = CommandDecoder::new(&decoder_settings)?;
    let archive = open_archive(&config)?;
    let settle_timeout = config.pipeline.download_timeout;
    let poll = config.intake_interval.max(Duration::from_millis(200));

    let fleet = FleetManager::new(config, Arc::new(archive), Arc::new(decoder))?;
    fleet.recover()?;

    if args.until_idle {
        let admitted = fleet.intake_once()?;
        tracing::info!(admitted = admitted.len(), "inbox admitted");
        let status = fleet.settle(poll, settle_timeout)?;
        return JsonOutput::print_fleet(&status).into_diagnostic();
    }

    ctrlc::set_handler(|| {
        tracing::info!("interrupt received; stopping after the current pass");
        SHUTDOWN.store(true, Ordering::SeqCst);
    })
    .into_diagnostic()?;
    tracing::info!(root = %fleet.workspace().root(), "fleet manager running");
    fleet.run(&SHUTDOWN)?;
    tracing::info!("fleet manager stopped; running jobs resume on next start");
    Ok(())
}

fn run_query(config: &ResolvedConfig, args: QueryArgs) -> miette::Result<()> {
    let workspace = config.workspace();
    let store = cloudsat_data_manager::storage::SwathStore::new(
        workspace.storage_path(&args.job_id).as_std_path(),
    );
    if !store.exists() {
        return Err(CsdmError::JobNotFound(args.job_id).into());
    }
    let criteria: serde_json::Value = serde_json::from_str(&args.criteria)
        .map_err(|err| CsdmError::InvalidFilter(err.to_string()))?;
    let spec = FilterSpec::from_value(&criteria)?;
    let engine = QueryEngine::new(config.pipeline.key_columns.clone());
    let columns = if args.columns.is_empty() {
        vec!["*".to_string()]
    } else {
        args.columns
    };

    if let Some(table) = args.materialize {
        FleetStatus::load(workspace.fleet_status_path().as_std_path())?
            .ensure_completed(&args.job_id)?;
        let rows = engine.materialize(&store, &spec, &columns, Some(&table))?;
        return JsonOutput::print_query(&QueryResult {
            job_id: args.job_id,
            rows,
            materialized: Some(table),
            dataset: None,
        })
        .into_diagnostic();
    }

    let dataset = match args.limit {
        Some(rows) => engine.preview(&store, &spec, &columns, rows)?,
        None => engine.filter(&store, &spec, &columns)?,
    };
    JsonOutput::print_query(&QueryResult {
        job_id: args.job_id,
        rows: dataset.len(),
        materialized: None,
        dataset: Some(dataset),
    })
    .into_diagnostic()
}
