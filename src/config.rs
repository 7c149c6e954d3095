use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::security::denylist::DEFAULT_PATTERNS;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Embedded database file, always opened as the fallback backend
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    /// Supports ${ENV_VAR} substitution. Empty means "not configured".
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_ttl_minutes")]
    pub default_ttl_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum accepted snippet length, in characters
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,
    /// Output budget returned to the caller, in characters
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_code_rate_limit")]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
    /// Where wrapped scripts are written; the system temp dir when unset
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub limit: usize,
    pub window_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("cache.db")
}

fn default_ttl_minutes() -> i64 {
    60
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_code_length() -> usize {
    10_000
}

fn default_max_output_chars() -> usize {
    2_000
}

fn default_code_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        limit: 5,
        window_secs: 300,
    }
}

fn default_denylist() -> Vec<String> {
    DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            database_url: None,
            default_ttl_minutes: default_ttl_minutes(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_timeout_secs(),
            max_code_length: default_max_code_length(),
            max_output_chars: default_max_output_chars(),
            rate_limit: default_code_rate_limit(),
            denylist: default_denylist(),
            scratch_dir: None,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StorageConfig {
    /// The relational connection string, if one is actually set.
    /// An unexpanded or blank value counts as absent.
    pub fn database_url(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty() && !url.starts_with("${"))
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads `path` if it exists, otherwise starts from defaults and picks up
    /// `DATABASE_URL` / `DEBUG_MODE` straight from the environment.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(
            std::env::var("DATABASE_URL").ok(),
            std::env::var("DEBUG_MODE").ok(),
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${DATABASE_URL}; unset ones expand to ""
        let expanded = shellexpand::env_with_context_no_errors(content, |var| {
            Some(std::env::var(var).unwrap_or_default())
        });
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    fn apply_env(&mut self, database_url: Option<String>, debug_mode: Option<String>) {
        if self.storage.database_url().is_none() {
            self.storage.database_url = database_url.filter(|url| !url.trim().is_empty());
        }
        if let Some(flag) = debug_mode {
            if flag.eq_ignore_ascii_case("true") {
                self.debug.enabled = true;
            }
        }
    }

    /// Default tracing filter: chatty only in debug mode.
    pub fn log_filter(&self) -> &'static str {
        if self.debug.enabled {
            "runbox=info"
        } else {
            "runbox=warn"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.storage.sqlite_path, PathBuf::from("cache.db"));
        assert_eq!(config.storage.default_ttl_minutes, 60);
        assert_eq!(config.sandbox.interpreter, "python3");
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(30));
        assert_eq!(config.sandbox.max_code_length, 10_000);
        assert_eq!(config.sandbox.max_output_chars, 2_000);
        assert_eq!(config.sandbox.rate_limit.limit, 5);
        assert_eq!(config.sandbox.rate_limit.window(), Duration::from_secs(300));
        assert_eq!(config.sandbox.denylist.len(), DEFAULT_PATTERNS.len());
        assert!(!config.debug.enabled);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [sandbox]
            timeout_secs = 5
            rate_limit = { limit = 2, window_secs = 10 }

            [debug]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.timeout_secs, 5);
        assert_eq!(
            config.sandbox.rate_limit,
            RateLimitConfig {
                limit: 2,
                window_secs: 10
            }
        );
        // Untouched fields keep their defaults
        assert_eq!(config.sandbox.max_code_length, 10_000);
        assert!(config.debug.enabled);
        assert_eq!(config.log_filter(), "runbox=info");
    }

    #[test]
    fn test_custom_denylist_replaces_default() {
        let config = Config::parse(
            r#"
            [sandbox]
            denylist = ["forbidden"]
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.denylist, vec!["forbidden".to_string()]);
    }

    #[test]
    fn test_blank_database_url_is_absent() {
        let mut storage = StorageConfig::default();
        assert_eq!(storage.database_url(), None);

        storage.database_url = Some("   ".to_string());
        assert_eq!(storage.database_url(), None);

        storage.database_url = Some("postgres://localhost/runbox".to_string());
        assert_eq!(storage.database_url(), Some("postgres://localhost/runbox"));
    }

    #[test]
    fn test_unset_env_var_expands_to_empty() {
        let config = Config::parse(
            r#"
            [storage]
            database_url = "${RUNBOX_TEST_SURELY_UNSET_VAR}"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.database_url(), None);
    }

    #[test]
    fn test_apply_env_fills_missing_url_and_debug() {
        let mut config = Config::default();
        config.apply_env(
            Some("postgres://db/cache".to_string()),
            Some("TRUE".to_string()),
        );
        assert_eq!(config.storage.database_url(), Some("postgres://db/cache"));
        assert!(config.debug.enabled);
    }

    #[test]
    fn test_apply_env_keeps_file_url() {
        let mut config = Config::parse(
            r#"
            [storage]
            database_url = "postgres://from-file/db"
            "#,
        )
        .unwrap();
        config.apply_env(Some("postgres://from-env/db".to_string()), Some("false".to_string()));
        assert_eq!(config.storage.database_url(), Some("postgres://from-file/db"));
        assert!(!config.debug.enabled);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = Config::load_or_default(path.to_str().unwrap()).unwrap();
        assert_eq!(config.sandbox.interpreter, "python3");
    }
}
