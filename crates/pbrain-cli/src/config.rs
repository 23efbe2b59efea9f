//! Configuration Vault – reads/writes `~/.pbrain/config.toml`.

use pbrain_runtime::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database path value that selects an in-memory SQLite store.
pub const IN_MEMORY: &str = ":memory:";

/// Persisted user configuration stored in `~/.pbrain/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Milliseconds between device polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Seconds a short-term entry lives after it was last seen.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of short-term entries.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Occurrences within the TTL before an entry is promoted.
    #[serde(default = "default_recurrence_threshold")]
    pub recurrence_threshold: u32,

    /// Bounded observation queue depth.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Retries for device pulls and long-term writes.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_consolidation_interval_ms")]
    pub consolidation_interval_ms: u64,

    /// Long-term graph database. Relative paths live under `~/.pbrain/`;
    /// `:memory:` keeps the graph in memory.
    #[serde(default = "default_graph_db")]
    pub graph_db: String,

    /// Overflow log for promotions that could not be written.
    #[serde(default = "default_overflow_db")]
    pub overflow_db: String,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_ttl_secs() -> u64 {
    30 * 60
}
fn default_capacity() -> usize {
    512
}
fn default_recurrence_threshold() -> u32 {
    3
}
fn default_queue_depth() -> usize {
    256
}
fn default_max_retries() -> u32 {
    3
}
fn default_enqueue_timeout_ms() -> u64 {
    500
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_retry_max_delay_ms() -> u64 {
    5_000
}
fn default_consolidation_interval_ms() -> u64 {
    10_000
}
fn default_graph_db() -> String {
    "graph.db".to_string()
}
fn default_overflow_db() -> String {
    "overflow.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            ttl_secs: default_ttl_secs(),
            capacity: default_capacity(),
            recurrence_threshold: default_recurrence_threshold(),
            queue_depth: default_queue_depth(),
            max_retries: default_max_retries(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            consolidation_interval_ms: default_consolidation_interval_ms(),
            graph_db: default_graph_db(),
            overflow_db: default_overflow_db(),
        }
    }
}

impl Config {
    /// Runtime configuration. Zero intervals are raised to 1 ms since tokio
    /// intervals cannot be empty.
    pub fn pipeline(&self) -> PipelineConfig {
        let ms = |v: u64| Duration::from_millis(v.max(1));
        PipelineConfig {
            poll_interval: ms(self.poll_interval_ms),
            ttl: Duration::from_secs(self.ttl_secs),
            capacity: self.capacity,
            recurrence_threshold: self.recurrence_threshold,
            queue_depth: self.queue_depth,
            max_retries: self.max_retries,
            enqueue_timeout: ms(self.enqueue_timeout_ms),
            retry_base_delay: ms(self.retry_base_delay_ms),
            retry_max_delay: ms(self.retry_max_delay_ms),
            consolidation_interval: ms(self.consolidation_interval_ms),
            ..PipelineConfig::default()
        }
    }
}

/// Return the current user's home directory, or `.` if unknown.
fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// Return the path to `~/.pbrain/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pbrain").join("config.toml")
}

/// Resolve a database setting: absolute paths and `:memory:` are kept,
/// anything else is placed next to the config file.
pub fn resolve_db_path(value: &str, config_file: &Path) -> String {
    if value == IN_MEMORY || Path::new(value).is_absolute() {
        return value.to_string();
    }
    let dir = config_file.parent().unwrap_or_else(|| Path::new("."));
    dir.join(value).to_string_lossy().into_owned()
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config, falling back to defaults when no file exists. Env
/// overrides apply either way.
pub fn load_or_default() -> Result<Config, String> {
    match load()? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

fn override_parsed<T: std::str::FromStr>(var: &str, field: &mut T) {
    if let Ok(v) = std::env::var(var)
        && let Ok(parsed) = v.trim().parse::<T>()
    {
        *field = parsed;
    }
}

/// Apply `PBRAIN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PBRAIN_POLL_INTERVAL_MS` | `poll_interval_ms` |
/// | `PBRAIN_TTL_SECS` | `ttl_secs` |
/// | `PBRAIN_CAPACITY` | `capacity` |
/// | `PBRAIN_RECURRENCE_THRESHOLD` | `recurrence_threshold` |
/// | `PBRAIN_QUEUE_DEPTH` | `queue_depth` |
/// | `PBRAIN_MAX_RETRIES` | `max_retries` |
/// | `PBRAIN_GRAPH_DB` | `graph_db` |
/// | `PBRAIN_OVERFLOW_DB` | `overflow_db` |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    override_parsed("PBRAIN_POLL_INTERVAL_MS", &mut cfg.poll_interval_ms);
    override_parsed("PBRAIN_TTL_SECS", &mut cfg.ttl_secs);
    override_parsed("PBRAIN_CAPACITY", &mut cfg.capacity);
    override_parsed("PBRAIN_RECURRENCE_THRESHOLD", &mut cfg.recurrence_threshold);
    override_parsed("PBRAIN_QUEUE_DEPTH", &mut cfg.queue_depth);
    override_parsed("PBRAIN_MAX_RETRIES", &mut cfg.max_retries);
    if let Ok(v) = std::env::var("PBRAIN_GRAPH_DB") {
        cfg.graph_db = v;
    }
    if let Ok(v) = std::env::var("PBRAIN_OVERFLOW_DB") {
        cfg.overflow_db = v;
    }
}

/// Save the config to disk, creating `~/.pbrain/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Create `dir` restricted to the owner (rwx------ on Unix).
pub fn ensure_private_dir(dir: &Path) -> Result<(), String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create config directory: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
    }
    Ok(())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
