use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default progress deadline when `spec.progressDeadlineSeconds` is unset
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: i32 = 600;

/// Canary is a Custom Resource describing one progressive rollout
///
/// The target is the new version, the source (or resolved baseline) is the
/// version currently serving stable traffic.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kulta.io",
    version = "v1beta1",
    kind = "Canary",
    namespaced,
    status = "CanaryStatus",
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.targetRef.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.canaryWeight"}"#,
    printcolumn = r#"{"name":"FailedChecks", "type":"integer", "jsonPath":".status.failedChecks"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct CanarySpec {
    /// Reference to the new-version workload
    #[serde(rename = "targetRef")]
    pub target_ref: CrossNamespaceObjectReference,

    /// Explicit reference to the baseline workload.
    /// When unset the baseline is resolved from revision history or naming convention.
    #[serde(rename = "sourceRef", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<CrossNamespaceObjectReference>,

    /// Controller kind tag overriding `targetRef.kind` (e.g. "rolling", "swap")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Seconds a workload may stay unavailable before it is considered stalled
    #[serde(
        rename = "progressDeadlineSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_deadline_seconds: Option<i32>,

    /// Skip readiness gating and analysis entirely
    #[serde(rename = "skipAnalysis", default)]
    pub skip_analysis: bool,

    /// Service exposed in front of baseline and canary
    #[serde(default)]
    pub service: CanaryService,

    /// Rollout step parameters
    #[serde(default)]
    pub analysis: CanaryAnalysis,
}

/// Reference to a workload that may live in another namespace
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct CrossNamespaceObjectReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub name: String,

    /// Defaults to the Canary's namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryService {
    /// Port exposed by the apex/primary/canary services
    #[serde(default)]
    pub port: i32,

    /// Discover additional named ports from the workload pod template
    #[serde(rename = "portDiscovery", default)]
    pub port_discovery: bool,

    /// Name of the service port (default: "http")
    #[serde(rename = "portName", skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,

    /// HTTPRoute carrying the weighted backends (default: target name)
    #[serde(rename = "httpRoute", skip_serializing_if = "Option::is_none")]
    pub http_route: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryAnalysis {
    /// Interval between steps (e.g. "1m"); scheduling is owned by the outer loop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Failed checks tolerated before the rollout is rolled back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i32>,

    /// Traffic weight added per step
    #[serde(rename = "stepWeight", default)]
    pub step_weight: i32,

    /// Traffic weight at which promotion starts
    #[serde(rename = "maxWeight", default)]
    pub max_weight: i32,

    /// Replicas added per step for replica-driven rolling updates
    #[serde(rename = "stepReplicas", default)]
    pub step_replicas: i32,

    /// Replica count of a fully scaled workload
    #[serde(rename = "maxReplicas", default)]
    pub max_replicas: i32,

    /// Explicit canary replica count; wins over the weight-derived count
    #[serde(rename = "canaryReplicas", default)]
    pub canary_replicas: i32,

    /// Fixed iteration count (A/B style rollouts)
    #[serde(default)]
    pub iterations: i32,
}

/// Phase of a Canary
///
/// An absent phase is treated the same as `Initializing`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum CanaryPhase {
    #[default]
    Initializing,
    Initialized,
    Waiting,
    Progressing,
    Promoting,
    Finalising,
    Succeeded,
    Failed,
    Terminating,
    Terminated,
}

/// Status of the Canary
///
/// Written only through the merge-and-retry routine in
/// `controller::status`, never overwritten wholesale.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<CanaryPhase>,

    /// Traffic weight routed to the canary (0-100)
    #[serde(rename = "canaryWeight", default)]
    pub canary_weight: i32,

    #[serde(rename = "failedChecks", default)]
    pub failed_checks: i32,

    #[serde(default)]
    pub iterations: i32,

    /// ConfigMaps/Secrets referenced by the target, keyed by name
    #[serde(rename = "trackedConfigs", skip_serializing_if = "Option::is_none")]
    pub tracked_configs: Option<BTreeMap<String, String>>,

    /// Hash of the target spec last synced
    #[serde(rename = "lastAppliedSpec", skip_serializing_if = "Option::is_none")]
    pub last_applied_spec: Option<String>,

    /// Hash of the target spec at the last successful promotion
    #[serde(rename = "lastPromotedSpec", skip_serializing_if = "Option::is_none")]
    pub last_promoted_spec: Option<String>,

    /// RFC3339 timestamp of the last phase change
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Canary {
    /// Current phase, `Initializing` when no status was written yet
    pub fn phase(&self) -> CanaryPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn canary_weight(&self) -> i32 {
        self.status.as_ref().map(|s| s.canary_weight).unwrap_or(0)
    }

    pub fn failed_checks(&self) -> i32 {
        self.status.as_ref().map(|s| s.failed_checks).unwrap_or(0)
    }

    pub fn skip_analysis(&self) -> bool {
        self.spec.skip_analysis
    }

    pub fn progress_deadline_seconds(&self) -> i32 {
        self.spec
            .progress_deadline_seconds
            .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS)
    }

    /// Failed-check threshold, at least 1
    pub fn analysis_threshold(&self) -> i32 {
        self.spec.analysis.threshold.unwrap_or(1).max(1)
    }

    pub fn max_replicas(&self) -> i32 {
        self.spec.analysis.max_replicas
    }

    /// Tag used by the controller factory: `spec.strategy`, else `targetRef.kind`
    pub fn controller_kind(&self) -> &str {
        self.spec
            .strategy
            .as_deref()
            .unwrap_or(&self.spec.target_ref.kind)
    }

    /// Namespace of the target, falling back to the Canary's own namespace
    pub fn target_namespace(&self) -> Option<String> {
        self.spec
            .target_ref
            .namespace
            .clone()
            .or_else(|| self.metadata.namespace.clone())
    }

    /// All traffic is committed to the new version
    pub fn is_promoted(&self) -> bool {
        matches!(
            self.phase(),
            CanaryPhase::Promoting | CanaryPhase::Finalising | CanaryPhase::Succeeded
        )
    }

    /// The rollout must be rolled back
    pub fn is_failed(&self) -> bool {
        self.phase() == CanaryPhase::Failed || self.failed_checks() >= self.analysis_threshold()
    }

    pub fn is_finished(&self) -> bool {
        self.is_promoted()
            || matches!(
                self.phase(),
                CanaryPhase::Failed | CanaryPhase::Terminating | CanaryPhase::Terminated
            )
    }

    pub fn is_initializing(&self) -> bool {
        self.phase() == CanaryPhase::Initializing
    }

    pub fn is_initialized(&self) -> bool {
        self.phase() == CanaryPhase::Initialized
    }

    /// Replica-driven rolling update instead of weight-driven steps
    pub fn is_rolling_update(&self) -> bool {
        self.spec.analysis.step_replicas != 0
    }

    /// Apex, primary and canary service names
    pub fn service_names(&self) -> (String, String, String) {
        let apex = self.spec.target_ref.name.clone();
        let primary = format!("{}-primary", apex);
        let canary = format!("{}-canary", apex);
        (apex, primary, canary)
    }
}

#[cfg(test)]
#[path = "canary_test.rs"]
mod tests;
