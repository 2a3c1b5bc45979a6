use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYNC_EVERY_SECS: u64 = 60;
pub const DEFAULT_MAX_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 4;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
pub const DEFAULT_BOOKKEEPING_RETRIES: u32 = 3;
pub const DEFAULT_HTTP_PORT: u16 = 8765;
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1";
pub const DEFAULT_REDIS_KEY: &str = "cadence:jobs";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Process identity, attached to every log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_environment(),
        }
    }
}

/// Timing knobs for the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the in-memory cache is rebuilt from the schedule store.
    #[serde(default = "default_sync_every")]
    pub sync_every_seconds: u64,
    /// Upper bound on a single sleep, even when nothing is due.
    #[serde(default = "default_max_interval")]
    pub max_interval_seconds: u64,
    /// How many hand-offs of one wake may be in flight at once.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
    /// Minimum gap between two hand-off attempts of the same failing entry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Attempts per bookkeeping write before it is given up and logged.
    #[serde(default = "default_bookkeeping_retries")]
    pub bookkeeping_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_every_seconds: DEFAULT_SYNC_EVERY_SECS,
            max_interval_seconds: DEFAULT_MAX_INTERVAL_SECS,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECS,
            bookkeeping_retries: DEFAULT_BOOKKEEPING_RETRIES,
        }
    }
}

impl SchedulerConfig {
    /// Reject values the loop cannot work with (zero periods, zero workers).
    pub fn validate(&self) -> crate::error::Result<()> {
        let checks = [
            ("sync_every_seconds", self.sync_every_seconds == 0),
            ("max_interval_seconds", self.max_interval_seconds == 0),
            ("dispatch_concurrency", self.dispatch_concurrency == 0),
            ("retry_delay_seconds", self.retry_delay_seconds == 0),
            ("bookkeeping_retries", self.bookkeeping_retries == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, bad)| *bad) {
            return Err(crate::error::CoreError::Config(format!(
                "scheduler.{field} must be greater than zero"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Create the directory the database file lives in, if missing.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Where dispatched jobs are handed off to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueueBackend {
    /// LPUSH onto a Redis list consumed by the workers.
    Redis,
    /// In-process channel whose consumer only logs the job.
    #[default]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,
    pub redis_password: Option<String>,
    #[serde(default)]
    pub redis_db: u32,
    /// Redis list the job messages are pushed onto.
    #[serde(default = "default_redis_key")]
    pub redis_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_password: None,
            redis_db: 0,
            redis_key: default_redis_key(),
        }
    }
}

impl QueueConfig {
    /// Assemble `redis://[:password@]host:port/db` from the individual settings.
    pub fn redis_url(&self) -> String {
        let auth = self
            .redis_password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!(
            "redis://{}{}:{}/{}",
            auth, self.redis_host, self.redis_port, self.redis_db
        )
    }
}

/// Read-only health and introspection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit one JSON object per line instead of the human format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_app_name() -> String {
    "cadence".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_sync_every() -> u64 {
    DEFAULT_SYNC_EVERY_SECS
}
fn default_max_interval() -> u64 {
    DEFAULT_MAX_INTERVAL_SECS
}
fn default_dispatch_concurrency() -> usize {
    DEFAULT_DISPATCH_CONCURRENCY
}
fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_bookkeeping_retries() -> u32 {
    DEFAULT_BOOKKEEPING_RETRIES
}
fn default_redis_host() -> String {
    "localhost".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_redis_key() -> String {
    DEFAULT_REDIS_KEY.to_string()
}
fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}
fn default_bind() -> String {
    DEFAULT_HTTP_BIND.to_string()
}
fn default_log_filter() -> String {
    "cadence_beat=info,cadence_scheduler=info".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `CADENCE_SCHEDULER__SYNC_EVERY_SECONDS=30`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error. Values are not validated here; call
    /// [`CadenceConfig::validate`] once the final config is settled.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        self.scheduler.validate()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
