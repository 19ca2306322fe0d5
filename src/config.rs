//! Configuration for orderflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ORDERFLOW_HOME)
//! 2. Config file (.orderflow/config.yaml)
//! 3. Defaults (~/.orderflow, built-in automation and breaker settings)
//!
//! Config file discovery:
//! - Searches current directory and parents for .orderflow/config.yaml
//! - Paths in config file are relative to the .orderflow/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{CircuitBreakerConfig, RetryPolicy};
use crate::error::AutomationError;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Settings accepted by `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Retries allowed per order without an operator reset (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 1000ms)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Backoff multiplier between retries (default: 2.0)
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Upper bound for a retry delay (default: 30s)
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Optional ± jitter fraction applied to retry delays
    #[serde(default)]
    pub retry_jitter: Option<f64>,

    /// Stage executors allowed to run at once across all orders (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Use the built-in mock POS client and validator
    #[serde(default)]
    pub mock_mode: bool,

    /// Timeout for every external call (default: 10s)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Retry insufficient-inventory failures automatically (default: false)
    #[serde(default)]
    pub auto_retry_validation: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    1000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_max_retry_delay() -> u64 {
    30_000
}
fn default_batch_size() -> usize {
    10
}
fn default_call_timeout() -> u64 {
    10_000
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_multiplier: default_retry_multiplier(),
            max_retry_delay_ms: default_max_retry_delay(),
            retry_jitter: None,
            batch_size: default_batch_size(),
            mock_mode: false,
            call_timeout_ms: default_call_timeout(),
            auto_retry_validation: false,
        }
    }
}

impl AutomationConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), AutomationError> {
        let invalid = |msg: &str| Err(AutomationError::InvalidConfiguration(msg.to_string()));

        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.retry_multiplier.is_nan() || self.retry_multiplier < 1.0 {
            return invalid("retry_multiplier must be >= 1.0");
        }
        if self.retry_base_delay_ms > self.max_retry_delay_ms {
            return invalid("retry_base_delay_ms must not exceed max_retry_delay_ms");
        }
        if let Some(jitter) = self.retry_jitter {
            if !(0.0..1.0).contains(&jitter) {
                return invalid("retry_jitter must be in [0, 1)");
            }
        }
        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.retry_base_delay_ms,
            multiplier: self.retry_multiplier,
            max_delay_ms: self.max_retry_delay_ms,
            jitter: self.retry_jitter,
            auto_retry_validation: self.auto_retry_validation,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub automation: Option<AutomationConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .orderflow/)
    pub home: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to orderflow home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Defaults for `start`
    pub automation: AutomationConfig,
    /// POS circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".orderflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = serde_yaml::from_str(content)?;

    if let Some(ref automation) = config.automation {
        automation.validate()?;
    }
    if let Some(ref breaker) = config.circuit_breaker {
        breaker
            .validate()
            .map_err(|msg| anyhow::anyhow!("circuit_breaker: {}", msg))?;
    }

    Ok(config)
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".orderflow");

    let config_file = find_config_file();
    let env_home = std::env::var("ORDERFLOW_HOME").ok().map(PathBuf::from);

    let (home, automation, circuit_breaker) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let dot_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = match (env_home, config.paths.home) {
            (Some(env), _) => env,
            (None, Some(ref home_path)) => resolve_path(dot_dir, home_path),
            (None, None) => default_home,
        };

        (
            home,
            config.automation.unwrap_or_default(),
            config.circuit_breaker.unwrap_or_default(),
        )
    } else {
        (
            env_home.unwrap_or(default_home),
            AutomationConfig::default(),
            CircuitBreakerConfig::default(),
        )
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        automation,
        circuit_breaker,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (bypasses the cache)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the orderflow home directory (engine state)
pub fn orderflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the orders directory ($ORDERFLOW_HOME/orders)
pub fn orders_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("orders"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_default_automation_config() {
        let config = AutomationConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.batch_size, 10);
        assert!(!config.mock_mode);
        assert!(config.validate().is_ok());

        let policy = config.retry_policy();
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn test_invalid_automation_config() {
        let zero_batch = AutomationConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_batch.validate(),
            Err(AutomationError::InvalidConfiguration(_))
        ));

        let shrinking = AutomationConfig {
            retry_multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());

        let inverted = AutomationConfig {
            retry_base_delay_ms: 60_000,
            max_retry_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let wild_jitter = AutomationConfig {
            retry_jitter: Some(1.5),
            ..Default::default()
        };
        assert!(wild_jitter.validate().is_err());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dot_dir = temp.path().join(".orderflow");
        std::fs::create_dir_all(&dot_dir).unwrap();

        let config_path = dot_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
automation:
  max_retries: 5
  batch_size: 4
  mock_mode: true
circuit_breaker:
  failure_threshold: 2
  reset_timeout_ms: 5000
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));

        let automation = config.automation.unwrap();
        assert_eq!(automation.max_retries, 5);
        assert_eq!(automation.batch_size, 4);
        assert!(automation.mock_mode);
        // unspecified fields fall back to defaults
        assert_eq!(automation.retry_base_delay_ms, 1000);

        let breaker = config.circuit_breaker.unwrap();
        assert_eq!(breaker.failure_threshold, 2);
        assert_eq!(breaker.reset_timeout_ms, 5000);
    }

    #[test]
    fn test_config_file_rejects_invalid_values() {
        let yaml = r#"
automation:
  batch_size: 0
"#;
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
