use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Directory holding the per-app SQLite database file.
    /// `None` stores everything in memory (tests, ephemeral clients).
    #[serde(default)]
    pub persistence_dir: Option<PathBuf>,
    /// Enable the sync engine (offline-only clients set this false)
    #[serde(default = "default_sync_enabled")]
    pub sync_enabled: bool,
    /// Sync endpoint base URL, e.g. wss://sync.example.com
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Soft cap on the materialized query cache, in bytes
    #[serde(default = "default_max_cache_size_bytes")]
    pub max_cache_size_bytes: u64,
    /// Maximum number of cached query shapes
    #[serde(default = "default_max_cached_queries")]
    pub max_cached_queries: usize,
    /// Initial reconnect delay; backs off exponentially from here
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound for the reconnect backoff
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Verbose (debug-level) logging
    #[serde(default)]
    pub verbose_logging: bool,
    /// Bound on the outbound transaction queue; `transact` awaits when full
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// Coalescing window for query invalidation
    #[serde(default = "default_invalidation_debounce_ms")]
    pub invalidation_debounce_ms: u64,
    /// Bound on the locally-sent event-id set used for echo suppression
    #[serde(default = "default_echo_cache_size")]
    pub echo_cache_size: usize,
    /// Keepalive ping interval over the session transport
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Consecutive decode failures tolerated before the session is torn down
    #[serde(default = "default_decode_error_threshold")]
    pub decode_error_threshold: u32,
    /// Attribute-inference hints for servers that omit attributes from
    /// session init: `{namespace -> {value_type -> attribute_name}}`
    #[serde(default)]
    pub attr_hints: HashMap<String, HashMap<String, String>>,
    /// Refresh token handed to session init, when the auth collaborator
    /// provided one
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_sync_enabled() -> bool {
    true
}

fn default_base_url() -> String {
    "wss://sync.tripledb.dev".to_string()
}

fn default_max_cache_size_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_max_cached_queries() -> usize {
    100
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    60_000
}

fn default_outbound_queue_size() -> usize {
    256
}

fn default_invalidation_debounce_ms() -> u64 {
    50
}

fn default_echo_cache_size() -> usize {
    1000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_decode_error_threshold() -> u32 {
    20
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            persistence_dir: None,
            sync_enabled: default_sync_enabled(),
            base_url: default_base_url(),
            max_cache_size_bytes: default_max_cache_size_bytes(),
            max_cached_queries: default_max_cached_queries(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            verbose_logging: false,
            outbound_queue_size: default_outbound_queue_size(),
            invalidation_debounce_ms: default_invalidation_debounce_ms(),
            echo_cache_size: default_echo_cache_size(),
            ping_interval_secs: default_ping_interval_secs(),
            decode_error_threshold: default_decode_error_threshold(),
            attr_hints: HashMap::new(),
            refresh_token: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from `tripledb.toml` in the working directory
    /// (if present) and `TRIPLEDB_`-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("tripledb.toml")
    }

    /// Load configuration from a specific TOML file plus environment
    /// variables (`TRIPLEDB_BASE_URL`, `TRIPLEDB_SYNC_ENABLED`, ...).
    pub fn load_from<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(config_path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("TRIPLEDB")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate config invariants. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.reconnect_delay_ms == 0 {
            errors.push("reconnect_delay_ms must be > 0".to_string());
        }
        if self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            errors.push(format!(
                "max_reconnect_delay_ms ({}) must be >= reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms, self.reconnect_delay_ms
            ));
        }
        if self.outbound_queue_size == 0 {
            errors.push("outbound_queue_size must be > 0".to_string());
        }
        if self.echo_cache_size == 0 {
            errors.push("echo_cache_size must be > 0".to_string());
        }
        if self.max_cached_queries == 0 {
            errors.push("max_cached_queries must be > 0".to_string());
        }
        if !self.base_url.starts_with("ws://") && !self.base_url.starts_with("wss://") {
            errors.push(format!(
                "base_url must be a ws:// or wss:// URL, got \"{}\"",
                self.base_url
            ));
        }
        errors
    }

    /// Session endpoint for a given app: `{base_url}/runtime/session?app_id={id}`.
    pub fn session_url(&self, app_id: &str) -> String {
        format!(
            "{}/runtime/session?app_id={}",
            self.base_url.trim_end_matches('/'),
            app_id
        )
    }

    /// Database file for a given app, or `None` for in-memory storage.
    pub fn database_path(&self, app_id: &str) -> Option<PathBuf> {
        self.persistence_dir
            .as_ref()
            .map(|dir| dir.join(format!("{app_id}.db")))
    }
}
