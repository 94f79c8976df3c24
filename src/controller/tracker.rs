//! Config Tracker boundary
//!
//! The tracker reports ConfigMaps/Secrets referenced by the target so their
//! changes can restart a rollout. Targets it cannot inspect (e.g. a bare
//! Service) answer with an "invalid kind" error, which callers treat as
//! "nothing to track".

use crate::crd::canary::Canary;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Message prefix that marks the invalid-kind condition
///
/// External trackers only surface free text, so the prefix stays the
/// compatibility contract.
pub const TARGET_KIND_INVALID: &str = "TargetRef.Kind invalid:";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("TargetRef.Kind invalid: {0}")]
    InvalidTargetKind(String),

    #[error("{0}")]
    Other(String),
}

impl TrackerError {
    /// True for the typed variant and for free text carrying the sentinel
    pub fn is_kind_invalid(&self) -> bool {
        match self {
            TrackerError::InvalidTargetKind(_) => true,
            TrackerError::Other(msg) => msg.contains(TARGET_KIND_INVALID),
        }
    }
}

/// A tracked ConfigMap or Secret and the checksum of its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRef {
    pub name: String,
    pub checksum: String,
}

#[async_trait]
pub trait ConfigTracker: Send + Sync {
    async fn get_config_refs(&self, canary: &Canary) -> Result<Vec<ConfigRef>, TrackerError>;

    async fn has_config_changed(&self, canary: &Canary) -> Result<bool, TrackerError>;
}

/// Tracker for deployments that opt out of config tracking
pub struct NoopConfigTracker;

#[async_trait]
impl ConfigTracker for NoopConfigTracker {
    async fn get_config_refs(&self, _canary: &Canary) -> Result<Vec<ConfigRef>, TrackerError> {
        Ok(Vec::new())
    }

    async fn has_config_changed(&self, _canary: &Canary) -> Result<bool, TrackerError> {
        Ok(false)
    }
}

/// Name -> checksum map as stored in `status.trackedConfigs`
pub fn tracked_configs(refs: &[ConfigRef]) -> BTreeMap<String, String> {
    refs.iter()
        .map(|r| (r.name.clone(), r.checksum.clone()))
        .collect()
}
