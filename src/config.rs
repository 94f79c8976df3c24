//! Controller configuration
//!
//! Read once from the environment by the embedding process:
//! - `KULTA_SELECTOR_LABELS` - comma separated selector label candidates
//! - `KULTA_STATUS_RETRY_ATTEMPTS` - status write attempts (3-5)
//! - `KULTA_STATUS_RETRY_BACKOFF_MS` - pause between conflicting status writes

use std::time::Duration;

/// Selector label candidates, tried in order against the target's labels
pub const DEFAULT_SELECTOR_LABELS: &[&str] = &["app", "name", "app.kubernetes.io/name"];

pub const MIN_STATUS_RETRY_ATTEMPTS: usize = 3;
pub const MAX_STATUS_RETRY_ATTEMPTS: usize = 5;

const DEFAULT_STATUS_RETRY_BACKOFF_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub selector_labels: Vec<String>,
    pub status_retry_attempts: usize,
    pub status_retry_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            selector_labels: DEFAULT_SELECTOR_LABELS
                .iter()
                .map(|l| l.to_string())
                .collect(),
            status_retry_attempts: MAX_STATUS_RETRY_ATTEMPTS,
            status_retry_backoff: Duration::from_millis(DEFAULT_STATUS_RETRY_BACKOFF_MS),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; invalid values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ControllerConfig::default();

        let selector_labels = lookup("KULTA_SELECTOR_LABELS")
            .map(|raw| parse_label_list(&raw))
            .filter(|labels| !labels.is_empty())
            .unwrap_or(defaults.selector_labels);

        let status_retry_attempts = lookup("KULTA_STATUS_RETRY_ATTEMPTS")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .map(|n| n.clamp(MIN_STATUS_RETRY_ATTEMPTS, MAX_STATUS_RETRY_ATTEMPTS))
            .unwrap_or(defaults.status_retry_attempts);

        let status_retry_backoff = lookup("KULTA_STATUS_RETRY_BACKOFF_MS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.status_retry_backoff);

        ControllerConfig {
            selector_labels,
            status_retry_attempts,
            status_retry_backoff,
        }
    }
}

fn parse_label_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}
