//! Forge configuration
//!
//! Loaded from TOML. Unknown keys are rejected and [`ForgeConfig::validate`]
//! reports every invalid value at once.
//!
//! ```toml
//! producer_timeout_ms = 30000
//!
//! [queues.backend]
//! concurrency = 4
//! max_attempts = 5
//!
//! [coordination]
//! cycle_policy = "reject"
//!
//! [governance]
//! enforcement = "report"
//! purity_cache_capacity = 1024
//!
//! [telemetry]
//! filter = "forge=debug"
//! json = true
//! ```

use crate::telemetry::TelemetryConfig;
use forge_coordination::CyclePolicy;
use forge_governance::EnforcementMode;
use forge_model::WorkerClass;
use forge_queue::QueuePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PRODUCER_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_PURITY_CACHE_CAPACITY: u64 = 1_024;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// TOML did not parse into the schema
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values out of range
    #[error("invalid configuration: {}", problems.join("; "))]
    Invalid {
        /// Every problem found
        problems: Vec<String>,
    },
}

/// Dependency coordination settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationConfig {
    /// What to do with a dependency cycle
    pub cycle_policy: CyclePolicy,
}

/// Validation pipeline settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernanceConfig {
    /// How hard invariant violations surface
    pub enforcement: EnforcementMode,
    /// Entries in the content-addressed purity cache
    pub purity_cache_capacity: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            enforcement: EnforcementMode::default(),
            purity_cache_capacity: DEFAULT_PURITY_CACHE_CAPACITY,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForgeConfig {
    /// Per-class queue policy; classes not listed keep their default
    pub queues: BTreeMap<WorkerClass, QueuePolicy>,
    /// Coordination settings
    pub coordination: CoordinationConfig,
    /// Governance settings
    pub governance: GovernanceConfig,
    /// Bound on every producer call
    pub producer_timeout_ms: u64,
    /// Log output
    pub telemetry: TelemetryConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            queues: WorkerClass::ALL
                .iter()
                .map(|class| (*class, QueuePolicy::for_class(*class)))
                .collect(),
            coordination: CoordinationConfig::default(),
            governance: GovernanceConfig::default(),
            producer_timeout_ms: DEFAULT_PRODUCER_TIMEOUT_MS,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// `Parse` on malformed TOML or unknown keys; `Invalid` on bad values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// `Io` if the file cannot be read, otherwise as [`Self::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check every value
    ///
    /// # Errors
    /// `Invalid` listing every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems: Vec<String> = self
            .queues
            .iter()
            .flat_map(|(class, policy)| {
                policy
                    .problems()
                    .into_iter()
                    .map(move |p| format!("queues.{class}: {p}"))
            })
            .collect();
        if self.producer_timeout_ms == 0 {
            problems.push("producer_timeout_ms must be at least 1".to_string());
        }
        if self.governance.purity_cache_capacity == 0 {
            problems.push("governance.purity_cache_capacity must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// With queue policy for one class
    #[inline]
    #[must_use]
    pub fn with_queue_policy(mut self, class: WorkerClass, policy: QueuePolicy) -> Self {
        self.queues.insert(class, policy);
        self
    }

    /// With the same policy for every class
    #[must_use]
    pub fn with_policy_for_all(mut self, policy: &QueuePolicy) -> Self {
        for class in WorkerClass::ALL {
            self.queues.insert(class, policy.clone());
        }
        self
    }

    /// With cycle policy
    #[inline]
    #[must_use]
    pub fn with_cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.coordination.cycle_policy = policy;
        self
    }

    /// With invariant enforcement mode
    #[inline]
    #[must_use]
    pub fn with_enforcement(mut self, mode: EnforcementMode) -> Self {
        self.governance.enforcement = mode;
        self
    }

    /// With producer timeout
    #[inline]
    #[must_use]
    pub fn with_producer_timeout(mut self, timeout: Duration) -> Self {
        self.producer_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With telemetry settings
    #[inline]
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Producer timeout as a duration
    #[inline]
    #[must_use]
    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_class() {
        let config = ForgeConfig::default();
        assert_eq!(config.queues.len(), 5);
        assert_eq!(config.queues[&WorkerClass::Infrastructure].concurrency, 2);
        assert_eq!(config.queues[&WorkerClass::Frontend].max_attempts, 3);
        assert_eq!(config.coordination.cycle_policy, CyclePolicy::Reject);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_selected_values() {
        let config = ForgeConfig::from_toml_str(
            r#"
            producer_timeout_ms = 500

            [queues.backend]
            concurrency = 4
            max_attempts = 5

            [coordination]
            cycle_policy = "warn_and_continue"

            [governance]
            enforcement = "fail_fast"
            "#,
        )
        .unwrap();

        assert_eq!(config.producer_timeout(), Duration::from_millis(500));
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[&WorkerClass::Backend].concurrency, 4);
        assert_eq!(config.queues[&WorkerClass::Backend].backoff_initial_ms, 2_000);
        assert_eq!(config.coordination.cycle_policy, CyclePolicy::WarnAndContinue);
        assert_eq!(config.governance.enforcement, EnforcementMode::FailFast);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ForgeConfig::from_toml_str("[queues.backend]\nworkers = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(matches!(
            ForgeConfig::from_toml_str("verbose = true\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn every_invalid_value_is_reported() {
        let err = ForgeConfig::from_toml_str(
            r"
            producer_timeout_ms = 0

            [queues.security]
            concurrency = 0
            max_attempts = 0
            ",
        )
        .unwrap_err();
        let ConfigError::Invalid { problems } = err else {
            panic!("expected an invalid configuration");
        };
        assert_eq!(problems.len(), 3);
        assert!(problems[0].starts_with("queues.security"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[telemetry]\njson = true\nfilter = \"debug\"").unwrap();

        let config = ForgeConfig::from_file(file.path()).unwrap();
        assert!(config.telemetry.json);
        assert_eq!(config.telemetry.filter, "debug");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ForgeConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
