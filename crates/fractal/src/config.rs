use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Automatic error-reset policy: when a manager returns a failure, the
/// record is reset to waiting (instead of being left in error) while the
/// number of prior failures of the same error type stays below the
/// configured maximum. Error types without an entry are never auto-reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoResetPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// error_type -> maximum attempts, flattened so config keys read
    /// `auto_reset.<error_type> = <n>`.
    #[serde(flatten)]
    pub max_attempts: BTreeMap<String, u32>,
}

impl AutoResetPolicy {
    /// Should a record with `prior_failures` earlier failures of this error
    /// type be reset to waiting?
    pub fn should_reset(&self, error_type: &str, prior_failures: u32) -> bool {
        if !self.enabled {
            return false;
        }
        match self.max_attempts.get(error_type) {
            Some(&max) => prior_failures < max,
            None => false,
        }
    }
}

/// Request-size caps applied by the server facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiLimits {
    pub get_records: usize,
    pub add_records: usize,
    pub get_dataset_entries: usize,
}

impl Default for ApiLimits {
    fn default() -> Self {
        Self {
            get_records: 1000,
            add_records: 500,
            get_dataset_entries: 2000,
        }
    }
}

/// Server configuration. All keys have serde defaults so partial files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FractalConfig {
    /// Managers whose last heartbeat is older than this are deactivated and
    /// their claimed tasks returned to the queue.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// How often the service tick runs.
    #[serde(with = "humantime_serde")]
    pub service_iteration_interval: Duration,
    /// How often the internal-job runner polls for due jobs.
    #[serde(with = "humantime_serde")]
    pub internal_job_poll_interval: Duration,
    /// Maximum services iterated per tick.
    pub service_max_active: usize,
    pub auto_reset: AutoResetPolicy,
    pub api_limits: ApiLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporary_dir: Option<std::path::PathBuf>,
}

impl Default for FractalConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(1800),
            service_iteration_interval: Duration::from_secs(60),
            internal_job_poll_interval: Duration::from_secs(5),
            service_max_active: 20,
            auto_reset: AutoResetPolicy::default(),
            api_limits: ApiLimits::default(),
            temporary_dir: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn auto_reset_consults_per_error_counters() {
        let policy: AutoResetPolicy = serde_json::from_str(
            r#"{"enabled": true, "random_error": 2, "unknown_error": 1}"#,
        )
        .unwrap();

        assert!(policy.should_reset("random_error", 0));
        assert!(policy.should_reset("random_error", 1));
        assert!(!policy.should_reset("random_error", 2));
        assert!(policy.should_reset("unknown_error", 0));
        assert!(!policy.should_reset("unknown_error", 1));
        // No entry for this error type: never reset.
        assert!(!policy.should_reset("mystery_error", 0));

        let disabled = AutoResetPolicy {
            enabled: false,
            max_attempts: [("random_error".to_string(), 5)].into_iter().collect(),
        };
        assert!(!disabled.should_reset("random_error", 0));
    }

    #[test]
    fn config_defaults_and_partial_files() {
        let config: FractalConfig = serde_json::from_str(
            r#"{"heartbeat_timeout": "90s", "auto_reset": {"enabled": true, "random_error": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(90));
        assert!(config.auto_reset.enabled);
        assert_eq!(config.api_limits.get_records, 1000);
    }
}
