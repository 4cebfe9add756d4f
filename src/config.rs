use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::checker::pipeline::OrchestratorSettings;
use crate::checker::runtime::memory_bytes;
use crate::checker::sandbox::{SandboxConfig, SandboxSection};

pub const CONFIG_FILE: &str = "labcheck.toml";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckerSettings {
    pub db_path: PathBuf,
    /// Root under which staging directories are created.
    pub temp_dir: PathBuf,
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// Leave staging directories in place for inspection.
    pub keep_staging: bool,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".labcheck/labcheck.db"),
            temp_dir: std::env::temp_dir().join("labcheck"),
            workers: 2,
            poll_interval_ms: 1000,
            keep_staging: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Directory for daily rolling log files; stderr only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            dir: None,
        }
    }
}

/// Raw TOML structure for `labcheck.toml`
#[derive(Debug, Default, Deserialize)]
struct LabcheckToml {
    checker: Option<CheckerSection>,
    sandbox: Option<SandboxSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
struct CheckerSection {
    db_path: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    keep_staging: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    level: Option<String>,
    format: Option<LogFormat>,
    dir: Option<PathBuf>,
}

/// Fully resolved configuration: defaults, then `labcheck.toml`, then the
/// environment. Command line flags are applied by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabcheckConfig {
    pub checker: CheckerSettings,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

impl LabcheckConfig {
    /// Load `path`, or `./labcheck.toml` when no path is given and it
    /// exists. Returns defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let toml: LabcheckToml = toml::from_str(content).context("Invalid labcheck.toml")?;

        let mut config = Self::default();
        if let Some(section) = toml.checker {
            if let Some(db_path) = section.db_path {
                config.checker.db_path = db_path;
            }
            if let Some(temp_dir) = section.temp_dir {
                config.checker.temp_dir = temp_dir;
            }
            if let Some(workers) = section.workers {
                config.checker.workers = workers;
            }
            if let Some(ms) = section.poll_interval_ms {
                config.checker.poll_interval_ms = ms;
            }
            if let Some(keep) = section.keep_staging {
                config.checker.keep_staging = keep;
            }
        }
        if let Some(section) = toml.sandbox {
            config.sandbox.apply(section);
        }
        if let Some(section) = toml.logging {
            if let Some(level) = section.level {
                config.logging.level = level;
            }
            if let Some(format) = section.format {
                config.logging.format = format;
            }
            if section.dir.is_some() {
                config.logging.dir = section.dir;
            }
        }
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`: `LABCHECK_DB`, `TEMP_REPORT_DIR`,
    /// `AMOUNT_DOCKER_RUN` and `LABCHECK_LOG`.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(db) = lookup("LABCHECK_DB") {
            self.checker.db_path = PathBuf::from(db);
        }
        if let Some(dir) = lookup("TEMP_REPORT_DIR") {
            self.checker.temp_dir = PathBuf::from(dir);
        }
        if let Some(amount) = lookup("AMOUNT_DOCKER_RUN") {
            self.checker.workers = amount
                .trim()
                .parse()
                .with_context(|| format!("AMOUNT_DOCKER_RUN is not a number: {}", amount))?;
        }
        if let Some(level) = lookup("LABCHECK_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Problems that would make the checker misbehave.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.checker.workers == 0 {
            warnings.push("checker.workers is 0; one worker will be used".to_string());
        }
        if self.sandbox.run_timeout == 0 {
            warnings.push("sandbox.run_timeout is 0; every run will time out".to_string());
        }
        if self.sandbox.network != "none" {
            warnings.push(format!(
                "sandbox.network is '{}'; student code will have network access",
                self.sandbox.network
            ));
        }
        if let Err(e) = memory_bytes(&self.sandbox.memory) {
            warnings.push(format!("sandbox.memory: {:#}", e));
        }
        warnings
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            workers: self.checker.workers.max(1),
            poll_interval: Duration::from_millis(self.checker.poll_interval_ms),
            keep_staging: self.checker.keep_staging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn defaults_are_safe() {
        let config = LabcheckConfig::default();
        assert_eq!(config.sandbox.network, "none");
        assert_eq!(config.sandbox.run_timeout, 120);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn parse_full_file() {
        let config = LabcheckConfig::parse(
            r#"
[checker]
db_path = "/var/lib/labcheck/db.sqlite"
temp_dir = "/tmp/staging"
workers = 4
poll_interval_ms = 250
keep_staging = true

[sandbox]
base_image = "python:3.12-slim"
run_timeout = 60

[logging]
level = "debug"
format = "json"
dir = "/var/log/labcheck"
"#,
        )
        .unwrap();
        assert_eq!(config.checker.db_path, PathBuf::from("/var/lib/labcheck/db.sqlite"));
        assert_eq!(config.checker.workers, 4);
        assert!(config.checker.keep_staging);
        assert_eq!(config.sandbox.base_image, "python:3.12-slim");
        assert_eq!(config.sandbox.run_timeout, 60);
        assert_eq!(config.sandbox.memory, "256m");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.dir, Some(PathBuf::from("/var/log/labcheck")));

        let settings = config.orchestrator_settings();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[checker]\nworkers = 7\n").unwrap();
        let config = LabcheckConfig::load(Some(&path)).unwrap();
        assert_eq!(config.checker.workers, 7);
    }

    #[test]
    fn load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LabcheckConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(LabcheckConfig::parse("[checker\nworkers = ").is_err());
        assert!(LabcheckConfig::parse("[logging]\nformat = \"xml\"").is_err());
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = LabcheckConfig::parse("[checker]\nworkers = 4\n").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("AMOUNT_DOCKER_RUN", "8"),
            ("TEMP_REPORT_DIR", "/srv/tmp"),
            ("LABCHECK_DB", "/srv/db.sqlite"),
            ("LABCHECK_LOG", "warn"),
        ]);
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.checker.workers, 8);
        assert_eq!(config.checker.temp_dir, PathBuf::from("/srv/tmp"));
        assert_eq!(config.checker.db_path, PathBuf::from("/srv/db.sqlite"));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn bad_worker_count_in_environment() {
        let mut config = LabcheckConfig::default();
        let err = config
            .apply_env_from(|k| (k == "AMOUNT_DOCKER_RUN").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("AMOUNT_DOCKER_RUN"));
    }

    #[test]
    fn validate_flags_risky_settings() {
        let mut config = LabcheckConfig::default();
        config.checker.workers = 0;
        config.sandbox.network = "bridge".to_string();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert_eq!(config.orchestrator_settings().workers, 1);
    }

    #[test]
    fn validate_flags_unparseable_memory() {
        let mut config = LabcheckConfig::default();
        assert!(config.validate().is_empty());
        config.sandbox.memory = "plenty".to_string();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("sandbox.memory"));
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
