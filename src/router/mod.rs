//! Traffic routing
//!
//! - `MeshRouter`: the mesh/ingress specific traffic split (inner router)
//! - `GatewayApiRouter`: inner router over a Gateway API HTTPRoute
//! - `ReplicaRouter`: wraps an inner router and keeps replica counts of the
//!   baseline and canary workloads in step with the traffic split

pub mod gateway;
pub mod replica;

use crate::controller::kinds::ControllerError;
use crate::controller::workload::WorkloadRef;
use crate::crd::canary::Canary;
use async_trait::async_trait;
use thiserror::Error;

pub use gateway::GatewayApiRouter;
pub use replica::{compute_replica_split, ReplicaRouter};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("routing {name}.{namespace} to primary={primary_weight} canary={canary_weight} failed: {message}")]
    Route {
        name: String,
        namespace: String,
        primary_weight: i32,
        canary_weight: i32,
        message: String,
    },

    #[error("scaling {role:?} workload {name}.{namespace} to {replicas} replicas failed: {source}")]
    Scale {
        role: ScaleTarget,
        name: String,
        namespace: String,
        replicas: i32,
        #[source]
        source: ControllerError,
    },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl RouterError {
    /// Scale failures keep the classification of the controller error
    pub fn is_retriable(&self) -> bool {
        match self {
            RouterError::Route { .. } | RouterError::KubeError(_) => true,
            RouterError::Scale { source, .. } => source.is_retriable(),
            RouterError::Controller(e) => e.is_retriable(),
        }
    }
}

/// Weights currently applied by an inner router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteWeights {
    pub primary: i32,
    pub canary: i32,
    pub mirrored: bool,
}

impl RouteWeights {
    /// All traffic on the baseline
    pub const PRIMARY_ONLY: RouteWeights = RouteWeights {
        primary: 100,
        canary: 0,
        mirrored: false,
    };
}

#[async_trait]
pub trait MeshRouter: Send + Sync {
    /// Bring the routing resource to a usable state
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError>;

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<(), RouterError>;

    async fn get_routes(&self, canary: &Canary) -> Result<RouteWeights, RouterError>;

    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError>;
}

/// Which of the two workloads a scale call addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTarget {
    /// The baseline serving stable traffic
    Primary,
    /// The new version
    Canary,
}

/// Scaling capability a controller lends to the route coordinator
#[async_trait]
pub trait Scaler: Send + Sync {
    async fn workload_for(
        &self,
        canary: &Canary,
        target: ScaleTarget,
    ) -> Result<WorkloadRef, ControllerError>;

    async fn scale(
        &self,
        canary: &Canary,
        target: ScaleTarget,
        replicas: i32,
    ) -> Result<(), ControllerError>;
}
