use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use encored::{
    config::HostConfig,
    credentials::CredentialManager,
    devices::DeviceRegistry,
    events::EventBroadcaster,
    http,
    identity::IdentityStore,
    media::MediaBridge,
    pairing::PairingCoordinator,
    relay::{self, crypto::hash_room_password, inject::RouterInjector},
    sessions::SessionManager,
    storage::Storage,
    AppContext,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "encored",
    about = "Encore Host — personal-server bridge for the Encore desktop player",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP/WebSocket server port
    #[arg(long, env = "ENCORED_PORT")]
    port: Option<u16>,

    /// Bind address (default 0.0.0.0)
    #[arg(long, env = "ENCORED_BIND")]
    bind: Option<String>,

    /// Data directory for identity, credentials, and the device database
    #[arg(long, env = "ENCORED_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ENCORED_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "ENCORED_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Relay WebSocket URL
    #[arg(long, env = "ENCORE_RELAY_URL")]
    relay_url: Option<String>,

    /// Disable the outbound relay connection (local network only)
    #[arg(long)]
    no_relay: bool,

    /// Suppress the startup pairing banner. Errors still go to stderr.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default when no subcommand given).
    ///
    /// Logs the local URL, the pairing code, and the remote room code.
    ///
    /// Examples:
    ///   encored serve
    ///   encored
    Serve,
    /// Print this host's identity (server id, name, relay room id).
    ///
    /// Reads the data directory without starting the server.
    ///
    /// Examples:
    ///   encored identity
    Identity,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let config = Arc::new(HostConfig::new(
        args.port,
        args.bind.clone(),
        args.data_dir.clone(),
        args.log.clone(),
        args.relay_url.clone(),
    ));

    init_tracing(&config.log, args.log_file.as_deref())?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, args.no_relay, args.quiet).await,
        Command::Identity => identity(config).await,
    }
}

async fn identity(config: Arc<HostConfig>) -> Result<()> {
    let store = IdentityStore::load_or_create(&config.data_dir)?;
    let public = store.get_public_identity().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "serverId": public.server_id,
            "serverName": public.server_name,
            "publicKey": public.public_key,
            "relayRoomId": store.get_relay_room_id().await,
        }))?
    );
    Ok(())
}

async fn serve(config: Arc<HostConfig>, no_relay: bool, quiet: bool) -> Result<()> {
    // Unrecoverable startup failures (identity I/O, credential I/O, database,
    // port binding) propagate out of main as a non-zero exit.
    let identity = Arc::new(
        IdentityStore::load_or_create(&config.data_dir).context("loading server identity")?,
    );
    let credentials = Arc::new(
        CredentialManager::load_or_create(&config.data_dir).context("loading credentials")?,
    );
    let storage = Storage::new(&config.data_dir)
        .await
        .context("opening device database")?;
    let devices = Arc::new(DeviceRegistry::new(storage.pool()));
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(
        config.session_ttl_secs,
    )));
    let broadcaster = Arc::new(EventBroadcaster::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind before building the pairing URL so the QR carries the real port.
    let (listener, port) = http::bind_with_retry(&config.bind, config.port)
        .await
        .context("binding front door")?;
    let local_url = format!("http://{}:{}", local_ip(), port);

    let pairing = Arc::new(PairingCoordinator::new(
        Arc::clone(&devices),
        Arc::clone(&broadcaster),
        local_url.clone(),
        identity.get_relay_room_id().await,
        config.require_approval,
        shutdown_rx.clone(),
    ));

    let ctx = Arc::new(AppContext {
        rate_limiter: AppContext::new_rate_limiter(config.rate_limit_per_min),
        internal_marker: AppContext::generate_marker(),
        config: Arc::clone(&config),
        identity: Arc::clone(&identity),
        credentials: Arc::clone(&credentials),
        devices,
        pairing: Arc::clone(&pairing),
        sessions: Arc::clone(&sessions),
        broadcaster: Arc::clone(&broadcaster),
        media: MediaBridge::default(),
        started_at: std::time::Instant::now(),
    });

    let router = http::build_router(Arc::clone(&ctx));

    // The relay injects tunneled requests into a clone of the same router,
    // so remote calls run the full handler chain.
    if no_relay {
        info!("relay disabled — local network only");
    } else {
        let injector = Arc::new(RouterInjector::new(
            router.clone(),
            ctx.internal_marker.clone(),
        ));
        relay::spawn(
            relay::RelayDeps {
                identity: Arc::clone(&identity),
                injector,
                token_source: Arc::clone(&credentials) as _,
                broadcaster: Arc::clone(&broadcaster),
                playback: ctx.media.playback.clone(),
                relay_url: config.relay_url.clone(),
                local_url: local_url.clone(),
                room_password_hash: config
                    .relay_room_password
                    .as_deref()
                    .map(hash_room_password),
            },
            shutdown_rx.clone(),
        );
    }

    sessions.spawn_sweeper(
        Duration::from_secs(config.sweep_interval_secs),
        shutdown_rx.clone(),
    );

    let code_info = pairing.current_code().await;
    let room_id = identity.get_relay_room_id().await;
    info!(url = %local_url, "local URL");
    info!(code = %code_info.code, "pairing code");
    info!(room = %room_id, "remote room code");
    if !quiet {
        println!("Encore Host is up.");
        println!("  Local URL:    {local_url}");
        println!("  Pairing code: {}", code_info.code);
        println!("  Remote code:  {room_id}");
        if let Some(qr) = &code_info.qr_text {
            println!("\n{qr}");
        }
    }

    let server = tokio::spawn(http::serve(listener, router, shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received — stopping");
    let _ = shutdown_tx.send(true);

    // Relay loop, sweeper, and pending approval waits observe the signal;
    // the listener drains and closes last.
    match server.await {
        Ok(result) => result?,
        Err(e) => warn!(err = %e, "server task panicked"),
    }
    info!("stopped");
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

fn local_ip() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

fn init_tracing(filter: &str, log_file: Option<&std::path::Path>) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer());

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "encored.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(appender))
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}
