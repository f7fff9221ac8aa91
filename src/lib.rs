pub mod config;
pub mod credentials;
pub mod devices;
pub mod events;
pub mod http;
pub mod identity;
pub mod media;
pub mod pairing;
pub mod relay;
pub mod sessions;
pub mod storage;
pub mod tunnel;

use std::sync::Arc;
use tokio::sync::Mutex;

pub mod shutdown {
    use tokio::sync::watch;

    /// Resolves when the shutdown flag flips to true. A dropped sender is
    /// NOT a shutdown — the future parks forever, so `select!` arms guarded
    /// by this never fire spuriously in tests or partial teardown.
    pub async fn triggered(mut rx: watch::Receiver<bool>) {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

use config::HostConfig;
use credentials::CredentialManager;
use devices::DeviceRegistry;
use events::EventBroadcaster;
use http::auth::{ApiRateLimiter, SharedRateLimiter};
use identity::IdentityStore;
use media::MediaBridge;
use pairing::PairingCoordinator;
use sessions::SessionManager;

/// Shared application state passed to every route handler and background
/// task. Created once at process start; components never reach for module
/// globals.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<HostConfig>,
    pub identity: Arc<IdentityStore>,
    pub credentials: Arc<CredentialManager>,
    pub devices: Arc<DeviceRegistry>,
    pub pairing: Arc<PairingCoordinator>,
    pub sessions: Arc<SessionManager>,
    pub broadcaster: Arc<EventBroadcaster>,
    /// Orchestrator capabilities wired in by the desktop shell.
    pub media: MediaBridge,
    pub started_at: std::time::Instant,
    /// Per-process secret carried by the internal marker header. Requests
    /// bearing it bypass token checks — only the relay injector knows it.
    pub internal_marker: String,
    pub rate_limiter: SharedRateLimiter,
}

impl AppContext {
    /// Mint the per-process marker secret (32 hex chars, never persisted).
    pub fn generate_marker() -> String {
        uuid::Uuid::new_v4().to_string().replace('-', "")
    }

    pub fn new_rate_limiter(max_per_min: u32) -> SharedRateLimiter {
        Arc::new(Mutex::new(ApiRateLimiter::new(max_per_min)))
    }
}
