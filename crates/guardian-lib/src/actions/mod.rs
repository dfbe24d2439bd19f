//! Action controller and the cluster orchestration capability
//!
//! The controller turns recommendations into at most one cluster mutation
//! each, guarded by the per-workload [`PolicyState`](crate::models::PolicyState).
//! Every attempt, accepted or not, lands in the [`ActionLog`].

mod action_log;
mod controller;
mod kube;
mod policy;

pub use action_log::ActionLog;
pub use controller::ActionController;
pub use kube::{KubeClusterApi, HIBERNATED_ANNOTATION, REPLICAS_BEFORE_HIBERNATION_ANNOTATION};
pub use policy::{admit, plan_replicas, plan_resources, Plan, PolicyRejection};

use crate::error::ClusterApiError;
use crate::models::{ActionValues, WorkloadIdentity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resource requests of a workload's primary container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millicores: Option<u32>,
    pub memory_bytes: Option<u64>,
}

impl ResourceRequest {
    pub fn as_values(&self) -> ActionValues {
        ActionValues {
            replicas: None,
            cpu_millicores: self.cpu_millicores,
            memory_bytes: self.memory_bytes,
        }
    }
}

/// Cluster orchestration capability.
///
/// Every call is idempotent and may be retried individually.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_replica_count(&self, workload: &WorkloadIdentity) -> Result<u32, ClusterApiError>;

    async fn set_replica_count(
        &self,
        workload: &WorkloadIdentity,
        replicas: u32,
    ) -> Result<(), ClusterApiError>;

    async fn get_resource_request(
        &self,
        workload: &WorkloadIdentity,
    ) -> Result<ResourceRequest, ClusterApiError>;

    async fn set_resource_request(
        &self,
        workload: &WorkloadIdentity,
        request: &ResourceRequest,
    ) -> Result<(), ClusterApiError>;

    /// Scale to zero and mark the workload hibernated, or restore it
    async fn set_hibernation_state(
        &self,
        workload: &WorkloadIdentity,
        hibernated: bool,
    ) -> Result<(), ClusterApiError>;
}
