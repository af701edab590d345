//! Configuration loading and management.
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//!
//! 1. Environment variables
//! 2. TOML file passed via `--config`
//! 3. `pg-nlq.toml` in the current directory
//! 4. Default values
//!
//! # Configuration File Format
//!
//! ```toml
//! [[databases]]
//! host = "localhost"
//! port = 5432
//! name = "app"
//! user = "readonly"
//! password = "secret"
//! max_pool_size = 10
//!
//! [security]
//! explain_policy = "explain_only"
//! blocked_tables = ["secrets"]
//! blocked_columns = ["users.password_hash"]
//! max_rows = 1000
//! max_execution_time = 30
//!
//! [openai]
//! model = "gpt-4o-mini"
//! base_url = "https://api.openai.com/v1"
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `DATABASE_HOST` .. `DATABASE_PASSWORD` | Primary database connection |
//! | `DATABASE2_NAME` etc. | Optional second database; unset fields fall back to the primary's |
//! | `OPENAI_API_KEY` | LLM API key |
//! | `OPENAI_BASE_URL` | OpenAI-compatible endpoint override |

use std::{env, fs, path::Path};

use serde::Deserialize;

use crate::error::InitError;

/// Policy for `EXPLAIN` statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainPolicy {
    /// All explains rejected.
    #[default]
    Disabled,
    /// Plain `EXPLAIN` permitted; `EXPLAIN ANALYZE` rejected.
    ExplainOnly,
    /// Both `EXPLAIN` and `EXPLAIN ANALYZE` permitted.
    ExplainAnalyze
}

/// One database connection entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host:     String,
    #[serde(default = "default_port")]
    pub port:     u16,
    pub name:     String,
    pub user:     String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_min_pool")]
    pub min_pool_size: usize,
    #[serde(default = "default_max_pool")]
    pub max_pool_size: usize
}

fn default_port() -> u16 {
    5432
}

fn default_min_pool() -> usize {
    2
}

fn default_max_pool() -> usize {
    10
}

/// Security policy applied to every generated statement.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Role to assume for execution, when configured.
    pub readonly_role:    Option<String>,
    /// `search_path` pinned per transaction, when configured.
    pub safe_search_path: Option<String>,
    #[serde(default)]
    pub explain_policy:   ExplainPolicy,
    #[serde(default)]
    pub blocked_tables:   Vec<String>,
    #[serde(default)]
    pub blocked_columns:  Vec<String>,
    #[serde(default = "default_blocked_functions")]
    pub blocked_functions: Vec<String>,
    #[serde(default = "default_max_rows")]
    pub max_rows:          usize,
    /// Per-statement execution limit in seconds.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64
}

fn default_max_rows() -> usize {
    1000
}

fn default_max_execution_time() -> u64 {
    30
}

fn default_blocked_functions() -> Vec<String> {
    [
        "pg_sleep",
        "pg_sleep_for",
        "pg_sleep_until",
        "pg_read_file",
        "pg_read_binary_file",
        "pg_ls_dir",
        "pg_stat_file",
        "copy_file",
        "lo_import",
        "lo_export",
        "dblink",
        "dblink_exec",
        "pg_reload_conf",
        "pg_terminate_backend",
        "pg_cancel_backend",
        "set_config"
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            readonly_role:      None,
            safe_search_path:   None,
            explain_policy:     ExplainPolicy::Disabled,
            blocked_tables:     Vec::new(),
            blocked_columns:    Vec::new(),
            blocked_functions:  default_blocked_functions(),
            max_rows:           default_max_rows(),
            max_execution_time: default_max_execution_time()
        }
    }
}

/// Result scoring thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Scores below this mark an attempt as a soft failure (0..=100).
    pub min_confidence_score: u8,
    /// How many rows are shown to the scoring model.
    pub sample_rows:          usize,
    /// Whether result scoring runs at all.
    #[serde(default = "default_true")]
    pub enabled:              bool
}

fn default_true() -> bool {
    true
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_confidence_score: 60,
            sample_rows:          5,
            enabled:              true
        }
    }
}

/// Schema cache behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled:    bool,
    /// Seconds between background refreshes.
    #[serde(default = "default_schema_ttl")]
    pub schema_ttl: u64
}

fn default_schema_ttl() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled:    true,
            schema_ttl: default_schema_ttl()
        }
    }
}

/// Retry and breaker policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    pub circuit_breaker_threshold: u32,
    /// Seconds the breaker stays open before probing.
    pub circuit_breaker_timeout:   u64,
    pub max_retries:               u32,
    /// Regenerate after a security rejection instead of failing.
    #[serde(default = "default_true")]
    pub retry_on_security:         bool,
    /// Concurrent request admissions per scope.
    #[serde(default = "default_query_limit")]
    pub query_limit:               usize,
    #[serde(default = "default_llm_limit")]
    pub llm_limit:                 usize
}

fn default_query_limit() -> usize {
    10
}

fn default_llm_limit() -> usize {
    5
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout:   60,
            max_retries:               2,
            retry_on_security:         true,
            query_limit:               default_query_limit(),
            llm_limit:                 default_llm_limit()
        }
    }
}

/// OpenAI-compatible endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key:  String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model:    String,
    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout:  u64
}

fn default_base_url() -> String {
    String::from("https://api.openai.com/v1")
}

fn default_model() -> String {
    String::from("gpt-4o-mini")
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key:  String::new(),
            base_url: default_base_url(),
            model:    default_model(),
            timeout:  default_llm_timeout()
        }
    }
}

/// Logging and metrics surface.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level:       String,
    /// `"text"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format:      String,
    #[serde(default)]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port:    u16
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("text")
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level:       default_log_level(),
            log_format:      default_log_format(),
            metrics_enabled: false,
            metrics_port:    default_metrics_port()
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub databases:     Vec<DatabaseConfig>,
    #[serde(default)]
    pub security:      SecurityConfig,
    #[serde(default)]
    pub validation:    ValidationConfig,
    #[serde(default)]
    pub cache:         CacheConfig,
    #[serde(default)]
    pub resilience:    ResilienceConfig,
    #[serde(default)]
    pub openai:        OpenAIConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig
}

impl Settings {
    /// Load configuration from file and environment.
    ///
    /// # Arguments
    ///
    /// * `path` - Explicit config file; falls back to `pg-nlq.toml` in the
    ///   current directory when absent.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::Config`] for unreadable or invalid files and
    /// for settings that fail [`Settings::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, InitError> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let local = Path::new("pg-nlq.toml");
                if local.exists() {
                    Self::from_file(local)?
                } else {
                    Self::default()
                }
            }
        };

        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Self, InitError> {
        let content = fs::read_to_string(path).map_err(|e| {
            InitError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| InitError::Config(format!("Invalid config file: {}", e)))
    }

    /// Overlay environment variables onto the loaded file.
    fn apply_env(&mut self) {
        if let Some(primary) = database_from_env("DATABASE", None) {
            // Env-configured databases replace any same-named file entry.
            self.databases.retain(|db| db.name != primary.name);
            let fallback = primary.clone();
            self.databases.push(primary);
            if let Some(secondary) = database_from_env("DATABASE2", Some(&fallback)) {
                self.databases.retain(|db| db.name != secondary.name);
                self.databases.push(secondary);
            }
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            self.openai.api_key = key;
        }
        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            self.openai.base_url = url;
        }
        if let Ok(model) = env::var("OPENAI_MODEL") {
            self.openai.model = model;
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.databases.is_empty() {
            return Err(InitError::Config(String::from(
                "No databases configured; set DATABASE_NAME or add a [[databases]] entry"
            )));
        }
        for db in &self.databases {
            if db.name.is_empty() {
                return Err(InitError::Config(String::from("Database name is empty")));
            }
            if db.max_pool_size == 0 || db.min_pool_size > db.max_pool_size {
                return Err(InitError::Config(format!(
                    "Invalid pool bounds for '{}': min {} / max {}",
                    db.name, db.min_pool_size, db.max_pool_size
                )));
            }
        }
        if self.validation.min_confidence_score > 100 {
            return Err(InitError::Config(String::from(
                "min_confidence_score must be within 0..=100"
            )));
        }
        if self.security.max_rows == 0 {
            return Err(InitError::Config(String::from("max_rows must be positive")));
        }
        if self.security.max_execution_time == 0 {
            return Err(InitError::Config(String::from(
                "max_execution_time must be positive"
            )));
        }
        Ok(())
    }
}

/// Read one `PREFIX_{HOST,PORT,NAME,USER,PASSWORD}` database entry.
///
/// The entry exists only when `PREFIX_NAME` is set. Fields other than the
/// name fall back to `fallback` (the primary database) when provided,
/// otherwise to local-development defaults.
fn database_from_env(prefix: &str, fallback: Option<&DatabaseConfig>) -> Option<DatabaseConfig> {
    let name = env::var(format!("{}_NAME", prefix)).ok()?;

    let host = env::var(format!("{}_HOST", prefix))
        .ok()
        .or_else(|| fallback.map(|f| f.host.clone()))
        .unwrap_or_else(|| String::from("localhost"));
    let port = env::var(format!("{}_PORT", prefix))
        .ok()
        .and_then(|p| p.parse().ok())
        .or_else(|| fallback.map(|f| f.port))
        .unwrap_or(5432);
    let user = env::var(format!("{}_USER", prefix))
        .ok()
        .or_else(|| fallback.map(|f| f.user.clone()))
        .unwrap_or_else(|| String::from("postgres"));
    let password = env::var(format!("{}_PASSWORD", prefix))
        .ok()
        .or_else(|| fallback.map(|f| f.password.clone()))
        .unwrap_or_default();

    Some(DatabaseConfig {
        host,
        port,
        name,
        user,
        password,
        min_pool_size: fallback.map(|f| f.min_pool_size).unwrap_or_else(default_min_pool),
        max_pool_size: fallback.map(|f| f.max_pool_size).unwrap_or_else(default_max_pool)
    })
}
