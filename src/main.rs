use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Import modules from the library crate
use soulfetch::collaborators::{
    load_requests, spawn_projection_adapter, Collaborators, HttpNetworkClient, LoggingTagWriter,
    NetworkCollaborator, ProjectionStore, SqliteProjectionStore,
};
use soulfetch::config::{AppConfig, CliConfig, FileConfig};
use soulfetch::journal::{RecoveryJournal, SqliteRecoveryJournal};
use soulfetch::orchestrator::{create_orchestrator, QueueOutcome};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory for the recovery journal and track projection databases.
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_path)]
    pub data_dir: Option<PathBuf>,

    /// Directory where finished downloads are placed. Defaults to
    /// data_dir/downloads.
    #[clap(long, value_parser = parse_path)]
    pub downloads_dir: Option<PathBuf>,

    /// Base URL of the peer network daemon.
    #[clap(long)]
    pub daemon_url: Option<String>,

    /// API token for the peer network daemon, if it requires one.
    #[clap(long)]
    pub daemon_token: Option<String>,

    /// Maximum number of tracks transferring at the same time.
    #[clap(long, default_value_t = 3)]
    pub max_concurrent_downloads: usize,

    /// Seconds to collect search responses before ranking candidates.
    #[clap(long, default_value_t = 30)]
    pub search_timeout_secs: u64,

    /// Seconds without transfer progress before a download counts as stalled.
    #[clap(long, default_value_t = 60)]
    pub stall_timeout_secs: u64,

    /// Hours after which an untouched journal checkpoint is skipped on replay.
    #[clap(long, default_value_t = 24)]
    pub journal_staleness_hours: u64,

    /// Milliseconds to wait between consecutive worker dispatches.
    #[clap(long, default_value_t = 200)]
    pub dispatch_delay_ms: u64,

    /// Seconds to wait for in-flight downloads when shutting down.
    #[clap(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Ranking profile for candidate selection.
    #[clap(long, default_value = "balanced")]
    pub weight_profile: String,

    /// Path to a JSON file of track requests to queue at startup.
    #[clap(long, value_parser = parse_path)]
    pub requests: Option<PathBuf>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            data_dir: args.data_dir.clone(),
            downloads_dir: args.downloads_dir.clone(),
            daemon_url: args.daemon_url.clone(),
            daemon_token: args.daemon_token.clone(),
            max_concurrent_downloads: args.max_concurrent_downloads,
            search_timeout_secs: args.search_timeout_secs,
            stall_timeout_secs: args.stall_timeout_secs,
            journal_staleness_hours: args.journal_staleness_hours,
            dispatch_delay_ms: args.dispatch_delay_ms,
            shutdown_grace_secs: args.shutdown_grace_secs,
            weight_profile: args.weight_profile.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  data_dir: {:?}", app_config.data_dir);
    info!("  downloads_dir: {:?}", app_config.downloads_dir);
    info!("  daemon_url: {}", app_config.daemon_url);
    info!("  transfer slots: {}", app_config.max_concurrent_downloads);
    info!("  weight_profile: {}", app_config.weight_profile);

    std::fs::create_dir_all(&app_config.data_dir)
        .with_context(|| format!("Failed to create data dir {:?}", app_config.data_dir))?;
    std::fs::create_dir_all(&app_config.downloads_dir).with_context(|| {
        format!(
            "Failed to create downloads dir {:?}",
            app_config.downloads_dir
        )
    })?;

    // Parse the requests file before anything is spawned so a malformed file
    // fails fast.
    let startup_requests = match &cli_args.requests {
        Some(path) => {
            info!("Loading track requests from {:?}", path);
            load_requests(path)?
        }
        None => Vec::new(),
    };

    info!(
        "Opening recovery journal at {:?}",
        app_config.journal_db_path()
    );
    let journal = Arc::new(SqliteRecoveryJournal::new(
        app_config.journal_db_path(),
        app_config.staleness_window(),
    )?);

    info!(
        "Opening track projection store at {:?}",
        app_config.projection_db_path()
    );
    let projections = Arc::new(SqliteProjectionStore::new(app_config.projection_db_path())?);

    let network = Arc::new(HttpNetworkClient::new(
        app_config.daemon_url.clone(),
        app_config.daemon_token.clone(),
    ));
    match network.health_check().await {
        Ok(true) => info!("Peer network daemon is reachable"),
        Ok(false) => warn!(
            "Peer network daemon at {} reports unhealthy, downloads will retry",
            app_config.daemon_url
        ),
        Err(e) => warn!(
            "Peer network daemon at {} is not responding: {:#}",
            app_config.daemon_url, e
        ),
    }

    let collaborators = Collaborators {
        network: network.clone() as Arc<dyn NetworkCollaborator>,
        journal: journal.clone() as Arc<dyn RecoveryJournal>,
        projections: projections.clone() as Arc<dyn ProjectionStore>,
        tags: Arc::new(LoggingTagWriter),
    };

    let shutdown_token = CancellationToken::new();
    let sigint_token = shutdown_token.clone();
    let mut already_interrupted = false;
    ctrlc::set_handler(move || {
        if already_interrupted {
            warn!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
        already_interrupted = true;
        info!("Received interrupt, draining in-flight downloads (interrupt again to force exit)");
        sigint_token.cancel();
    })
    .context("Failed to install interrupt handler")?;

    let (mut orchestrator, handle) = create_orchestrator(
        collaborators,
        app_config.orchestrator_settings(),
        shutdown_token.clone(),
    );

    // Projection rows follow the orchestrator's event stream.
    let projection_task = spawn_projection_adapter(
        projections.clone() as Arc<dyn ProjectionStore>,
        handle.subscribe(),
    );

    let orchestrator_task = tokio::spawn(async move { orchestrator.run().await });

    if !startup_requests.is_empty() {
        match handle.queue_tracks(startup_requests).await {
            Ok(outcomes) => {
                let queued = outcomes
                    .iter()
                    .filter(|o| matches!(o, QueueOutcome::Queued { .. }))
                    .count();
                let duplicates = outcomes
                    .iter()
                    .filter(|o| matches!(o, QueueOutcome::DuplicateActive { .. }))
                    .count();
                let in_library = outcomes.len() - queued - duplicates;
                info!(
                    "Queued {} tracks ({} already active, {} already in library)",
                    queued, duplicates, in_library
                );
            }
            Err(e) => error!("Failed to queue track requests: {}", e),
        }
    }

    info!("Running until interrupted, downloads land in {:?}", app_config.downloads_dir);

    if let Err(e) = orchestrator_task.await {
        error!("Orchestrator task panicked: {}", e);
    }
    projection_task.abort();

    info!("Shutdown complete");
    Ok(())
}
