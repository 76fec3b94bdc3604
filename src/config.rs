//! Configuration management for prodsys
//!
//! Configuration is loaded from TOML files in priority order (system, then
//! user, then local directory), with later files overriding earlier ones.
//! The monitoring daemon additionally lets CLI arguments override file
//! values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::grid::GridType;
use crate::models::LocalStatus;

/// Locations probed for configuration files, lowest priority first.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// System-wide configuration
    pub system: PathBuf,
    /// Per-user configuration
    pub user: Option<PathBuf>,
    /// Configuration in the current working directory
    pub local: PathBuf,
}

impl ConfigPaths {
    pub fn new() -> Self {
        let user = std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config/prodsys/config.toml"));

        Self {
            system: PathBuf::from("/etc/prodsys/config.toml"),
            user,
            local: PathBuf::from("prodsys.toml"),
        }
    }

    /// Paths that exist on disk, lowest priority first.
    pub fn existing_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if self.system.is_file() {
            paths.push(self.system.clone());
        }
        if let Some(user) = &self.user
            && user.is_file()
        {
            paths.push(user.clone());
        }
        if self.local.is_file() {
            paths.push(self.local.clone());
        }
        paths
    }

    /// Directory holding the per-user configuration file, if resolvable.
    pub fn user_config_dir(&self) -> Option<&Path> {
        self.user.as_deref().and_then(Path::parent)
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level prodsys configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProdsysConfig {
    pub monitoring: MonitoringConfig,
    pub grid: GridConfig,
    pub parametricjobs: ParametricJobsConfig,
}

/// Configuration for the monitoring daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// Path to the SQLite database file. If not specified, uses the
    /// DATABASE_URL environment variable
    pub database: Option<String>,

    /// Minutes between monitoring cycles
    pub interval_mins: f64,

    /// Request statuses picked up for reconciliation each cycle. FAILED
    /// requests with a pending manual reschedule are fetched separately and
    /// need not be listed here.
    pub active_statuses: Vec<LocalStatus>,

    /// Logging configuration
    pub logging: MonitorLoggingConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            database: None,
            interval_mins: 5.0,
            active_statuses: vec![
                LocalStatus::Approved,
                LocalStatus::Submitting,
                LocalStatus::Submitted,
                LocalStatus::Running,
                LocalStatus::Removing,
            ],
            logging: MonitorLoggingConfig::default(),
        }
    }
}

/// Logging configuration for the monitoring daemon
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitorLoggingConfig {
    /// Directory for log files (enables file logging with rotation)
    pub log_dir: Option<PathBuf>,

    /// Use JSON format for log files
    pub json_logs: bool,
}

/// Grid gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Which backend implementation to construct
    pub backend: GridType,

    /// Base URL of the grid gateway
    pub url: String,

    /// Per-call timeout in seconds. A hung backend call is abandoned after
    /// this long so it cannot stall the monitoring loop indefinitely.
    pub timeout_secs: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            backend: GridType::Rest,
            url: "http://localhost:8443/grid-gateway/v1".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Parametric job submission and reschedule policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParametricJobsConfig {
    /// Maximum automatic reschedule attempts per sub-job
    pub reschedules: i32,

    /// Executable invoked for every sub-job
    pub executable: String,

    /// Runscript body staged alongside each submission
    pub script: String,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Sub-job count used when a parametric job does not specify one
    pub default_num_jobs: i64,

    /// A parametric job larger than this is split across several grid job
    /// definitions so a single submission call cannot time out
    pub max_jobs_per_definition: usize,
}

impl Default for ParametricJobsConfig {
    fn default() -> Self {
        Self {
            reschedules: 2,
            executable: "/bin/bash".to_string(),
            script: "#!/bin/bash\necho HelloWorld\n".to_string(),
            args: vec!["runscript.sh".to_string()],
            default_num_jobs: 1,
            max_jobs_per_definition: 1000,
        }
    }
}

impl ProdsysConfig {
    /// Load configuration from the standard file locations.
    pub fn load() -> Result<Self, String> {
        Self::load_with_paths(&ConfigPaths::new())
    }

    /// Load configuration from the given locations.
    pub fn load_with_paths(paths: &ConfigPaths) -> Result<Self, String> {
        Self::load_from_files(&paths.existing_paths())
    }

    /// Load and merge configuration files, later files taking precedence.
    /// Missing sections fall back to defaults.
    pub fn load_from_files(paths: &[PathBuf]) -> Result<Self, String> {
        let mut merged = toml::Table::new();

        for path in paths {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            let table: toml::Table = toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
            merge_tables(&mut merged, table);
        }

        merged
            .try_into()
            .map_err(|e| format!("Invalid configuration: {}", e))
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.monitoring.interval_mins <= 0.0 {
            errors.push(format!(
                "monitoring.interval_mins must be positive, got {}",
                self.monitoring.interval_mins
            ));
        }
        if self.monitoring.active_statuses.is_empty() {
            errors.push("monitoring.active_statuses must not be empty".to_string());
        }
        if self.grid.url.is_empty() {
            errors.push("grid.url must not be empty".to_string());
        }
        if self.grid.timeout_secs == 0 {
            errors.push("grid.timeout_secs must be positive".to_string());
        }
        if self.parametricjobs.reschedules < 0 {
            errors.push(format!(
                "parametricjobs.reschedules must not be negative, got {}",
                self.parametricjobs.reschedules
            ));
        }
        if self.parametricjobs.default_num_jobs <= 0 {
            errors.push(format!(
                "parametricjobs.default_num_jobs must be positive, got {}",
                self.parametricjobs.default_num_jobs
            ));
        }
        if self.parametricjobs.max_jobs_per_definition == 0 {
            errors.push("parametricjobs.max_jobs_per_definition must be positive".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Recursively merge `overlay` into `base`; overlay values win, nested tables
/// merge key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge_tables(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
