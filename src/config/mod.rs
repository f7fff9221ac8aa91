use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 5720;
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_RELAY_URL: &str = "wss://relay.encore.fm/ws";
const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 120;
const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP/WebSocket server port (default: 5720).
    port: Option<u16>,
    /// Bind address (default: 0.0.0.0 so LAN clients can reach us).
    bind: Option<String>,
    /// Log level filter string, e.g. "debug", "info,encored=trace" (default: "info").
    log: Option<String>,
    /// Override the relay WebSocket URL (default: wss://relay.encore.fm/ws).
    relay_url: Option<String>,
    /// Max authenticated API requests per client IP per minute (default: 120).
    rate_limit_per_min: Option<u32>,
    /// Idle session lifetime in seconds before the sweeper removes it (default: 1800).
    session_ttl_secs: Option<u64>,
    /// Session sweeper period in seconds (default: 60).
    sweep_interval_secs: Option<u64>,
    /// Directory holding the built web UI; unknown GETs fall back to its index.html.
    web_root: Option<PathBuf>,
    /// Require host-side approval before a pairing code mints a device token.
    require_approval: Option<bool>,
    /// Optional password protecting relay-room joins (clients send its hash).
    relay_room_password: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── HostConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub log: String,
    /// Relay WebSocket URL (ENCORE_RELAY_URL env var).
    pub relay_url: String,
    pub rate_limit_per_min: u32,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Static web UI root. None disables the SPA fallback.
    pub web_root: Option<PathBuf>,
    pub require_approval: bool,
    /// Optional relay-room password; joins must present its hash.
    pub relay_room_password: Option<String>,
}

impl HostConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        bind: Option<String>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        relay_url: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let bind = bind.or(toml.bind).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let relay_url = relay_url
            .or_else(|| std::env::var("ENCORE_RELAY_URL").ok().filter(|s| !s.is_empty()))
            .or(toml.relay_url)
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let rate_limit_per_min = toml
            .rate_limit_per_min
            .unwrap_or(DEFAULT_RATE_LIMIT_PER_MIN);
        let session_ttl_secs = toml.session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS);
        let sweep_interval_secs = toml
            .sweep_interval_secs
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
        let web_root = toml.web_root;
        let require_approval = toml.require_approval.unwrap_or(false);
        let relay_room_password = toml.relay_room_password.filter(|s| !s.is_empty());

        Self {
            port,
            bind,
            data_dir,
            log,
            relay_url,
            rate_limit_per_min,
            session_ttl_secs,
            sweep_interval_secs,
            web_root,
            require_approval,
            relay_room_password,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/encored
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("encored");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/encored or ~/.local/share/encored
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("encored");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("encored");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\encored
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("encored");
        }
    }
    // Fallback
    PathBuf::from(".encored")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_configured() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = HostConfig::new(None, None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.session_ttl_secs, DEFAULT_SESSION_TTL_SECS);
        assert_eq!(cfg.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
        assert!(!cfg.require_approval);
    }

    #[test]
    fn toml_overrides_defaults_but_not_cli() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 6000\nrate_limit_per_min = 30\n",
        )
        .unwrap();
        let cfg = HostConfig::new(
            Some(7000),
            None,
            Some(dir.path().to_path_buf()),
            None,
            None,
        );
        assert_eq!(cfg.port, 7000); // CLI wins
        assert_eq!(cfg.rate_limit_per_min, 30); // TOML wins over default
    }
}
