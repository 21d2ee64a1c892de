// Worker configuration: broker, toolchain and report layout
use crate::report::ReportLayout;
use anyhow::{bail, Context, Result};
use kiln_common::config::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config/worker.json";
pub const CONFIG_PATH_ENV: &str = "KILN_CONFIG";

/// External compiler, runtime and test-runner invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub compiler: String,
    pub runtime: String,
    /// Program and leading arguments of the test-runner tool
    pub test_runner: Vec<String>,
    /// Appended after the combined class path, e.g. the auto-discovery flag
    pub test_runner_args: Vec<String>,
    /// Extra entries needed to compile tests (test framework API)
    pub test_support_classpath: Vec<PathBuf>,
    pub source_version: Option<String>,
    pub target_version: Option<String>,
    /// File name of the entry point inside the main source tree
    pub entry_point: String,
    pub source_extension: String,
    pub class_extension: String,
    pub archive_extension: String,
    /// Deadline applied to every subprocess
    pub timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        let junit = "/opt/junit/junit-platform-console-standalone.jar";
        Self {
            compiler: "javac".to_string(),
            runtime: "java".to_string(),
            test_runner: vec!["java".to_string(), "-jar".to_string(), junit.to_string()],
            test_runner_args: vec!["--scan-class-path".to_string()],
            test_support_classpath: vec![PathBuf::from(junit)],
            source_version: Some("17".to_string()),
            target_version: Some("17".to_string()),
            entry_point: "Main.java".to_string(),
            source_extension: "java".to_string(),
            class_extension: "class".to_string(),
            archive_extension: "jar".to_string(),
            timeout_secs: 300,
        }
    }
}

impl ToolchainConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.compiler.trim().is_empty() {
            bail!("toolchain.compiler must not be empty");
        }
        if self.runtime.trim().is_empty() {
            bail!("toolchain.runtime must not be empty");
        }
        if self.test_runner.first().map_or(true, |p| p.trim().is_empty()) {
            bail!("toolchain.test_runner must name a program");
        }
        if self.entry_point.trim().is_empty() {
            bail!("toolchain.entry_point must not be empty");
        }
        if self.timeout_secs == 0 {
            bail!("toolchain.timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub toolchain: ToolchainConfig,
    pub report: ReportLayout,
}

impl WorkerConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Worker config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: WorkerConfig = serde_json::from_str(content)?;
        config.toolchain.validate()?;
        Ok(config)
    }

    /// `$KILN_CONFIG`, then `config/worker.json`, then built-in defaults.
    /// `REDIS_URL` and `KILN_WORKER_ID` override the broker section in every case.
    pub fn load_default() -> Result<Self> {
        let config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => {
                info!("No worker config file found, using defaults");
                Self::default()
            }
        };

        Ok(Self {
            broker: config.broker.with_env_overrides(),
            ..config
        })
    }
}
