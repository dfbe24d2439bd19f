//! Cluster API backed by the Kubernetes Deployment resource
//!
//! Workload identities map to Deployments of the same name. Hibernation is
//! a scale to zero plus two annotations recording the previous replica
//! count, so waking restores the exact size.

use super::{ClusterApi, ResourceRequest};
use crate::collector::{parse_cpu_cores, parse_memory_bytes};
use crate::error::ClusterApiError;
use crate::models::WorkloadIdentity;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info};

pub const HIBERNATED_ANNOTATION: &str = "greenguardian.io/hibernated";
pub const REPLICAS_BEFORE_HIBERNATION_ANNOTATION: &str =
    "greenguardian.io/replicas-before-hibernation";

pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, workload: &WorkloadIdentity) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &workload.namespace)
    }

    async fn deployment(&self, workload: &WorkloadIdentity) -> Result<Deployment, ClusterApiError> {
        self.deployments(workload)
            .get(&workload.name)
            .await
            .map_err(|e| map_kube_error(workload, e))
    }
}

fn map_kube_error(workload: &WorkloadIdentity, error: kube::Error) -> ClusterApiError {
    match &error {
        kube::Error::Api(response) if response.code == 404 => {
            ClusterApiError::NotFound(workload.to_string())
        }
        _ => ClusterApiError::Kube(error),
    }
}

fn primary_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
}

fn replicas_of(deployment: &Deployment) -> u32 {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .map(|r| r.max(0) as u32)
        .unwrap_or(1)
}

fn as_replicas(replicas: u32) -> Result<i32, ClusterApiError> {
    i32::try_from(replicas)
        .map_err(|_| ClusterApiError::InvalidResource(format!("replica count {} too large", replicas)))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_replica_count(&self, workload: &WorkloadIdentity) -> Result<u32, ClusterApiError> {
        let scale = self
            .deployments(workload)
            .get_scale(&workload.name)
            .await
            .map_err(|e| map_kube_error(workload, e))?;
        let replicas = scale.spec.and_then(|spec| spec.replicas).unwrap_or(0);
        Ok(replicas.max(0) as u32)
    }

    async fn set_replica_count(
        &self,
        workload: &WorkloadIdentity,
        replicas: u32,
    ) -> Result<(), ClusterApiError> {
        let patch = json!({ "spec": { "replicas": as_replicas(replicas)? } });
        self.deployments(workload)
            .patch_scale(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(workload, e))?;
        debug!(workload = %workload, replicas, "Scaled deployment");
        Ok(())
    }

    async fn get_resource_request(
        &self,
        workload: &WorkloadIdentity,
    ) -> Result<ResourceRequest, ClusterApiError> {
        let deployment = self.deployment(workload).await?;
        let container = primary_container(&deployment).ok_or_else(|| {
            ClusterApiError::InvalidResource(format!("{} has no containers", workload))
        })?;

        let requests = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref());
        let cpu_millicores = requests
            .and_then(|r| r.get("cpu"))
            .and_then(|q| parse_cpu_cores(&q.0).ok())
            .map(|cores| (cores * 1000.0).round() as u32);
        let memory_bytes = requests
            .and_then(|r| r.get("memory"))
            .and_then(|q| parse_memory_bytes(&q.0).ok());

        Ok(ResourceRequest {
            cpu_millicores,
            memory_bytes,
        })
    }

    async fn set_resource_request(
        &self,
        workload: &WorkloadIdentity,
        request: &ResourceRequest,
    ) -> Result<(), ClusterApiError> {
        let deployment = self.deployment(workload).await?;
        let container = primary_container(&deployment).ok_or_else(|| {
            ClusterApiError::InvalidResource(format!("{} has no containers", workload))
        })?;

        let mut requests = serde_json::Map::new();
        if let Some(cpu) = request.cpu_millicores {
            requests.insert("cpu".to_string(), json!(format!("{}m", cpu)));
        }
        if let Some(memory) = request.memory_bytes {
            requests.insert("memory".to_string(), json!(memory.to_string()));
        }
        if requests.is_empty() {
            return Ok(());
        }

        let patch = json!({
            "spec": { "template": { "spec": { "containers": [{
                "name": container.name,
                "resources": { "requests": requests }
            }]}}}
        });
        self.deployments(workload)
            .patch(&workload.name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| map_kube_error(workload, e))?;
        debug!(workload = %workload, request = ?request, "Updated resource requests");
        Ok(())
    }

    async fn set_hibernation_state(
        &self,
        workload: &WorkloadIdentity,
        hibernated: bool,
    ) -> Result<(), ClusterApiError> {
        let deployment = self.deployment(workload).await?;
        let annotations = deployment.metadata.annotations.clone().unwrap_or_default();
        let already = annotations
            .get(HIBERNATED_ANNOTATION)
            .is_some_and(|v| v == "true");

        if hibernated {
            if already {
                return Ok(());
            }
            let before = replicas_of(&deployment);
            let patch = json!({
                "metadata": { "annotations": {
                    HIBERNATED_ANNOTATION: "true",
                    REPLICAS_BEFORE_HIBERNATION_ANNOTATION: before.to_string()
                }},
                "spec": { "replicas": 0 }
            });
            self.deployments(workload)
                .patch(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| map_kube_error(workload, e))?;
            info!(workload = %workload, replicas_before = before, "Hibernated workload");
            return Ok(());
        }

        if !already {
            return Ok(());
        }
        let restore = annotations
            .get(REPLICAS_BEFORE_HIBERNATION_ANNOTATION)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);
        let patch = json!({
            "metadata": { "annotations": {
                HIBERNATED_ANNOTATION: null,
                REPLICAS_BEFORE_HIBERNATION_ANNOTATION: null
            }},
            "spec": { "replicas": as_replicas(restore)? }
        });
        self.deployments(workload)
            .patch(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(workload, e))?;
        info!(workload = %workload, replicas = restore, "Woke hibernated workload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    #[test]
    fn test_replicas_default_to_one() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec::default()),
            ..Default::default()
        };
        assert_eq!(replicas_of(&deployment), 1);

        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(replicas_of(&deployment), 4);
    }

    #[test]
    fn test_primary_container_missing_template_spec() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec::default(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(primary_container(&deployment).is_none());
    }

    #[test]
    fn test_replica_count_overflow_is_invalid() {
        assert!(as_replicas(3).is_ok());
        assert!(matches!(
            as_replicas(u32::MAX),
            Err(ClusterApiError::InvalidResource(_))
        ));
    }
}
