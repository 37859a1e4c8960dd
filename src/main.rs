//! RaidMesh command line
//!
//! Runs the backup engine against the loopback `DirectoryTransport`, which
//! keeps every peer's fragments under `<root>/peers/<peerID>`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            raidmesh                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Settings ──▶ Engine ──▶ DirectoryTransport / StaticDht          │
//! │                 │                                                │
//! │                 └──▶ LoggingEventPublisher                        │
//! │  --metrics-addr ──▶ /metrics, /healthz                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use raidmesh::adapters::{DirectoryTransport, LoggingEventPublisher, StaticDht};
use raidmesh::domain::{BackupId, PeerId};
use raidmesh::error::{Error, Result};
use raidmesh::placement::DEFAULT_SCOPE;
use raidmesh::{Engine, EngineConfig, MasterKey, Settings};

// =============================================================================
// CLI Arguments
// =============================================================================

/// RaidMesh - encrypted, erasure-coded backups across a family of peers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (YAML)
    #[arg(long, short, env = "RAIDMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Local state directory, overrides the settings file
    #[arg(long, env = "RAIDMESH_ROOT")]
    root: Option<PathBuf>,

    /// ECC scheme for new backups, overrides the settings file
    #[arg(long, env = "RAIDMESH_ECC_MAP")]
    ecc_map: Option<String>,

    /// Serve /metrics and /healthz on this address while the command runs
    #[arg(long, env = "RAIDMESH_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the state directory and a master key
    Init {
        /// Replace an existing key; backups sealed with it become unreadable
        #[arg(long)]
        force: bool,
    },
    /// Back up a file
    Backup {
        source: PathBuf,
        /// Logical path to file the backup under; defaults to SOURCE
        #[arg(long)]
        path: Option<String>,
    },
    /// Restore a backup into a file
    Restore { backup_id: String, dest: PathBuf },
    /// List backups, optionally for one logical path
    List { path: Option<String> },
    /// Fetch every fragment of a backup and report its health
    Verify { backup_id: String },
    /// Regenerate lost fragments and send them to the current family
    Rebuild { backup_id: String },
    /// Delete a backup from its suppliers and the index
    Forget { backup_id: String },
    /// Re-encode a backup under the configured scheme
    Migrate { backup_id: String },
    /// Inspect or change the supplier family
    Family {
        #[command(subcommand)]
        command: FamilyCommand,
    },
}

#[derive(Subcommand, Debug)]
enum FamilyCommand {
    /// Print every family
    Show,
    /// Replace the supplier at a position with a fresh peer
    Replace {
        position: usize,
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
    /// Put a specific peer at a position
    Switch { position: usize, peer: String },
    /// Follow identity rotations published in the DHT
    Refresh,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let settings = load_settings(&args)?;

    if let Some(addr) = args.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    if let Command::Init { force } = args.command {
        return init(&settings, force);
    }

    let key = MasterKey::load(&settings.key_path())?;
    let transport = Arc::new(DirectoryTransport::new(&settings.root));
    let dht = Arc::new(StaticDht::new(
        settings
            .placement
            .known_peers
            .iter()
            .map(|p| PeerId::from(p.as_str()))
            .collect(),
    ));
    let engine = Engine::open(
        EngineConfig::from_settings(&settings)?,
        &key,
        transport,
        dht,
        Arc::new(LoggingEventPublisher::new()),
    )
    .await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let result = dispatch(&engine, args.command, &cancel).await;
    if let Err(e) = engine.close().await {
        warn!(error = %e, "Failed to close the index cleanly");
    }
    result
}

async fn dispatch(engine: &Engine, command: Command, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Init { .. } => Ok(()),
        Command::Backup { source, path } => {
            let path = path.unwrap_or_else(|| source.display().to_string());
            let file = tokio::fs::File::open(&source).await?;
            let outcome = engine.backup(file, &path, cancel).await?;
            print_json(&outcome)
        }
        Command::Restore { backup_id, dest } => {
            let file = tokio::fs::File::create(&dest).await?;
            let outcome = engine
                .restore(&BackupId::from(backup_id), file, cancel)
                .await?;
            print_json(&outcome)
        }
        Command::List { path } => print_json(&engine.list_backups(path.as_deref()).await?),
        Command::Verify { backup_id } => {
            let id = BackupId::from(backup_id);
            let report = engine.verify_backup(&id, cancel).await?;
            print_json(&report)?;
            match report.unrecoverable.first() {
                Some(&block_number) => Err(Error::unrecoverable(
                    id.as_str(),
                    block_number,
                    Vec::new(),
                )),
                None => Ok(()),
            }
        }
        Command::Rebuild { backup_id } => {
            let id = BackupId::from(backup_id);
            engine.ensure_family().await?;
            let report = engine.rebuild_backup(&id, cancel).await?;
            print_json(&report)?;
            match report.unrecoverable.first() {
                Some(&block_number) => Err(Error::unrecoverable(
                    id.as_str(),
                    block_number,
                    Vec::new(),
                )),
                None => Ok(()),
            }
        }
        Command::Forget { backup_id } => {
            let deleted = engine.forget_backup(&BackupId::from(backup_id)).await?;
            info!(deleted, "Fragments deleted");
            Ok(())
        }
        Command::Migrate { backup_id } => {
            let new_id = engine
                .migrate_backup(&BackupId::from(backup_id), cancel)
                .await?;
            println!("{}", new_id);
            Ok(())
        }
        Command::Family { command } => family(engine, command).await,
    }
}

async fn family(engine: &Engine, command: FamilyCommand) -> Result<()> {
    let families = engine.families();
    match command {
        FamilyCommand::Show => print_json(&families.families()),
        FamilyCommand::Replace { position, reason } => {
            let peer = families.replace(DEFAULT_SCOPE, position, &reason).await?;
            println!("{}", peer);
            Ok(())
        }
        FamilyCommand::Switch { position, peer } => {
            let old = families
                .switch(DEFAULT_SCOPE, position, PeerId::from(peer.as_str()))
                .await?;
            println!("{}", old);
            Ok(())
        }
        FamilyCommand::Refresh => {
            let rotated = families.refresh_identities().await?;
            info!(rotated, "Identities refreshed");
            Ok(())
        }
    }
}

fn init(settings: &Settings, force: bool) -> Result<()> {
    let key_path = settings.key_path();
    if key_path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        )));
    }
    std::fs::create_dir_all(&settings.root)?;
    MasterKey::generate().store(&key_path)?;
    info!(root = %settings.root.display(), key = %key_path.display(), "Initialized");
    Ok(())
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(root) = &args.root {
        settings.root = root.clone();
    }
    if let Some(map) = &args.ecc_map {
        settings.ecc_map = map.clone();
    }
    settings.validate()?;
    Ok(settings)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                // Touch the lazy registry so the families exist before the first backup
                let _ = &*raidmesh::metrics::METRICS;
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&prometheus::gather(), &mut buffer) {
                    Ok(()) => respond(StatusCode::OK, buffer),
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
            "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
