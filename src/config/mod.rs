//! # Orchestrator Configuration
//!
//! YAML-backed configuration for the export orchestration engine. All
//! operational knobs live here: admission caps and estimator grace, task
//! time limits, finalization backoff, run retention, cache TTLs, and
//! staging layout. Every section has an explicit `Default` so the engine
//! can run without a config file, and explicit validation so a bad file
//! fails loudly instead of corrupting behavior at runtime.
//!
//! Environment is detected from `GEOEXPORT_ENV` (development/test/production)
//! and selects an optional override file next to the base file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;

/// Root configuration structure mirroring `geoexport.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Admission control against the size/time estimator
    pub admission: AdmissionConfig,

    /// Worker pool and task execution limits
    pub execution: ExecutionConfig,

    /// Finalization barrier retry behavior
    pub finalize: FinalizeConfig,

    /// Run retention and expiration policy
    pub retention: RetentionConfig,

    /// Progress cache TTLs
    pub cache: CacheConfig,

    /// Area-limit recovery bounds
    pub area: AreaConfig,

    /// Staging directory layout
    pub staging: StagingConfig,

    /// Notification addressing
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// How long to wait on the estimator before admitting as "unknown".
    /// Estimator unavailability must never block run creation.
    pub estimate_timeout_ms: u64,

    /// Cap applied when a provider carries no explicit size cap.
    pub default_max_data_size_mb: f64,

    /// Cap applied when a provider carries no explicit duration cap.
    pub default_max_duration_secs: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            estimate_timeout_ms: 2_000,
            default_max_data_size_mb: 5_000.0,
            default_max_duration_secs: 60.0 * 60.0 * 12.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Provider chains executing concurrently per substrate.
    pub max_concurrent_chains: usize,

    /// Hard per-task execution time limit.
    pub task_time_limit_secs: u64,

    /// Grace period between a soft cancel and a hard process kill.
    pub cancel_grace_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chains: 8,
            task_time_limit_secs: 60 * 60 * 4,
            cancel_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    /// Base interval between barrier re-checks.
    pub retry_interval_secs: u64,

    /// Exponential backoff multiplier between re-checks.
    pub backoff_multiplier: f64,

    /// Ceiling on a single backoff interval.
    pub max_interval_secs: u64,

    /// Re-check attempts before degrading the run to INCOMPLETE.
    pub max_retries: u32,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 4,
            backoff_multiplier: 2.0,
            max_interval_secs: 60,
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Runs kept per job; the oldest beyond this are soft-deleted.
    pub max_runs_per_job: usize,

    /// Days until a run's artifacts expire.
    pub run_expiration_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_runs_per_job: 3,
            run_expiration_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for progress/ETA/status entries.
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60 * 60 * 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    /// Maximum quadrant-split recursion depth for AreaLimitExceeded recovery.
    pub max_split_depth: u32,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self { max_split_depth: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Root directory for per-run staging.
    pub root: PathBuf,

    /// Keep staging directories after finalization (debugging aid).
    pub keep_stage: bool,
}

impl StagingConfig {
    /// Staging directory for one run.
    pub fn run_dir(&self, run_id: uuid::Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Staging directory for one provider within a run.
    pub fn provider_dir(&self, run_id: uuid::Uuid, provider_slug: &str) -> PathBuf {
        self.run_dir(run_id).join(provider_slug)
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("stage"),
            keep_stage: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// From-address on run outcome mail.
    pub from_address: String,

    /// Additional recipient for run failures.
    pub error_address: String,

    /// Base URL for status links embedded in notifications.
    pub site_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            from_address: "Export Team <exports@localhost>".to_string(),
            error_address: "export-errors@localhost".to_string(),
            site_url: "http://localhost".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a YAML file, applying the environment
    /// override file (`<stem>.<env>.yaml`) when present.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let base: OrchestratorConfig = read_yaml(path)?;
        let config = match environment_override_path(path) {
            Some(override_path) if override_path.exists() => {
                debug!(path = %override_path.display(), "Applying environment config override");
                read_yaml(&override_path)?
            }
            _ => base,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from the conventional location, falling back to defaults when no
    /// file exists. Defaults are always valid.
    pub fn load_default() -> ConfigResult<Self> {
        let path = PathBuf::from("config").join("geoexport.yaml");
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Explicit validation. A bad value fails loudly here instead of
    /// producing surprising behavior mid-run.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.execution.max_concurrent_chains == 0 {
            return Err(ConfigurationError::Invalid(
                "execution.max_concurrent_chains must be greater than 0".into(),
            ));
        }
        if self.execution.task_time_limit_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "execution.task_time_limit_secs must be greater than 0".into(),
            ));
        }
        if self.finalize.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::Invalid(
                "finalize.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.finalize.max_retries == 0 {
            return Err(ConfigurationError::Invalid(
                "finalize.max_retries must be greater than 0".into(),
            ));
        }
        if self.retention.max_runs_per_job == 0 {
            return Err(ConfigurationError::Invalid(
                "retention.max_runs_per_job must be greater than 0".into(),
            ));
        }
        if self.admission.default_max_data_size_mb <= 0.0 {
            return Err(ConfigurationError::Invalid(
                "admission.default_max_data_size_mb must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn task_time_limit(&self) -> Duration {
        Duration::from_secs(self.execution.task_time_limit_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.execution.cancel_grace_ms)
    }

    pub fn estimate_timeout(&self) -> Duration {
        Duration::from_millis(self.admission.estimate_timeout_ms)
    }
}

fn read_yaml(path: &Path) -> ConfigResult<OrchestratorConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigurationError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn environment_override_path(path: &Path) -> Option<PathBuf> {
    let environment = std::env::var("GEOEXPORT_ENV").ok()?;
    let stem = path.file_stem()?.to_str()?;
    Some(path.with_file_name(format!("{stem}.{environment}.yaml")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.finalize.max_retries, 10);
        assert_eq!(config.retention.run_expiration_days, 14);
    }

    #[test]
    fn test_load_from_yaml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "finalize:\n  max_retries: 5\nretention:\n  max_runs_per_job: 7\n"
        )
        .unwrap();
        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.finalize.max_retries, 5);
        assert_eq!(config.retention.max_runs_per_job, 7);
        // Unspecified sections keep defaults.
        assert_eq!(config.cache.ttl_secs, 60 * 60 * 24);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "execution:\n  max_concurrent_chains: 0\n").unwrap();
        let result = OrchestratorConfig::load(file.path());
        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn test_staging_layout() {
        let config = OrchestratorConfig::default();
        let run_id = uuid::Uuid::new_v4();
        let provider_dir = config.staging.provider_dir(run_id, "osm");
        assert!(provider_dir.ends_with(format!("{run_id}/osm")));
    }
}
