//! Metrics source backed by the Kubernetes resource-metrics API
//!
//! Usage comes from `metrics.k8s.io/v1beta1` PodMetrics, allocations from the
//! pod spec's container requests (limits when no request is set). Pods are
//! folded into their owning workload so replicas of one Deployment share a
//! single identity.

use super::{parse_cpu_cores, parse_memory_bytes, MetricsSource, RawUsage, SampleQuery, SourceBatch};
use crate::config::SampleScope;
use crate::error::SourceError;
use crate::models::WorkloadIdentity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Reads pod usage from metrics-server
pub struct KubeMetricsSource {
    client: Client,
    node_name: String,
    scope: SampleScope,
}

/// Usage of one pod as (cores, bytes), or why it could not be read
type PodUsage = Result<(f64, f64), SourceError>;

#[derive(Default)]
struct Totals {
    cpu_used: f64,
    cpu_allocated: f64,
    memory_used: f64,
    memory_allocated: f64,
}

impl KubeMetricsSource {
    pub fn new(client: Client, node_name: impl Into<String>, scope: SampleScope) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            scope,
        }
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, SourceError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if self.scope == SampleScope::Node {
            params = params.fields(&format!("spec.nodeName={}", self.node_name));
        }
        let list = pods
            .list(&params)
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        Ok(list.items)
    }

    async fn pod_metrics(&self) -> Result<Vec<DynamicObject>, SourceError> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        Ok(list.items)
    }
}

#[async_trait]
impl MetricsSource for KubeMetricsSource {
    async fn query(&self, query: &SampleQuery) -> Result<SourceBatch, SourceError> {
        let pods = self.list_pods().await?;
        let usage = usage_by_pod(self.pod_metrics().await?);
        Ok(aggregate(&pods, &usage, &self.node_name, query.end))
    }
}

/// Usage per pod keyed by (namespace, pod name).
///
/// A PodMetrics object that cannot be decoded is kept as an error for its
/// pod only.
fn usage_by_pod(objects: Vec<DynamicObject>) -> HashMap<(String, String), PodUsage> {
    let mut usage = HashMap::with_capacity(objects.len());
    for object in objects {
        let (Some(namespace), Some(name)) = (object.metadata.namespace, object.metadata.name)
        else {
            continue;
        };
        usage.insert((namespace, name), container_usage(&object.data));
    }
    usage
}

/// Fold running pods into one reading per workload.
///
/// Every reading is attributed to `node_name`, the agent that owns the
/// workload's state, so a Deployment spread over several nodes keeps one
/// identity whatever order its pods are listed in.
fn aggregate(
    pods: &[Pod],
    usage: &HashMap<(String, String), PodUsage>,
    node_name: &str,
    timestamp: DateTime<Utc>,
) -> SourceBatch {
    let mut totals: BTreeMap<(String, String), Totals> = BTreeMap::new();
    let mut failed: BTreeMap<(String, String), String> = BTreeMap::new();

    for pod in pods {
        let Some(phase) = pod.status.as_ref().and_then(|s| s.phase.as_deref()) else {
            continue;
        };
        if phase != "Running" {
            continue;
        }
        let (Some(namespace), Some(pod_name)) =
            (pod.metadata.namespace.clone(), pod.metadata.name.clone())
        else {
            continue;
        };
        let workload = workload_name_for_pod(pod);
        let key = (namespace.clone(), workload);

        let (cpu_used, memory_used) = match usage.get(&(namespace.clone(), pod_name.clone())) {
            Some(Ok(reading)) => *reading,
            Some(Err(e)) => {
                warn!(pod = %pod_name, namespace = %namespace, error = %e, "Undecodable pod metrics");
                failed.entry(key).or_insert_with(|| e.to_string());
                continue;
            }
            None => {
                debug!(pod = %pod_name, namespace = %namespace, "No usage reported for pod");
                failed
                    .entry(key)
                    .or_insert_with(|| format!("no metrics reported for pod {}", pod_name));
                continue;
            }
        };

        let (cpu_allocated, memory_allocated) = match pod_allocation(pod) {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "Unparseable resource allocation");
                failed.entry(key).or_insert_with(|| e.to_string());
                continue;
            }
        };

        let entry = totals.entry(key).or_default();
        entry.cpu_used += cpu_used;
        entry.memory_used += memory_used;
        entry.cpu_allocated += cpu_allocated;
        entry.memory_allocated += memory_allocated;
    }

    let mut batch = SourceBatch::default();
    for ((namespace, name), reason) in failed {
        // A partial sum would understate the workload
        totals.remove(&(namespace.clone(), name.clone()));
        batch
            .errors
            .push((WorkloadIdentity::new(namespace, name, node_name), reason));
    }
    for ((namespace, name), t) in totals {
        batch.readings.push(RawUsage {
            workload: WorkloadIdentity::new(namespace, name, node_name),
            timestamp,
            cpu_cores_used: t.cpu_used,
            cpu_cores_allocated: t.cpu_allocated,
            memory_bytes_used: t.memory_used,
            memory_bytes_allocated: t.memory_allocated,
        });
    }
    batch
}

/// Sum of container usage in a PodMetrics object as (cores, bytes)
fn container_usage(data: &serde_json::Value) -> Result<(f64, f64), SourceError> {
    let containers = data
        .get("containers")
        .and_then(|c| c.as_array())
        .ok_or_else(|| SourceError::Decode("PodMetrics without containers".to_string()))?;

    let mut cpu = 0.0;
    let mut memory = 0.0;
    for container in containers {
        let usage = &container["usage"];
        if let Some(q) = usage.get("cpu").and_then(|v| v.as_str()) {
            cpu += parse_cpu_cores(q).map_err(|e| SourceError::Decode(e.to_string()))?;
        }
        if let Some(q) = usage.get("memory").and_then(|v| v.as_str()) {
            memory += parse_memory_bytes(q).map_err(|e| SourceError::Decode(e.to_string()))? as f64;
        }
    }
    Ok((cpu, memory))
}

/// Requested (or limited) CPU cores and memory bytes across a pod's containers
fn pod_allocation(pod: &Pod) -> Result<(f64, f64), crate::error::QuantityError> {
    let mut cpu = 0.0;
    let mut memory = 0.0;
    let Some(spec) = pod.spec.as_ref() else {
        return Ok((cpu, memory));
    };

    for container in &spec.containers {
        let Some(resources) = container.resources.as_ref() else {
            continue;
        };
        let lookup = |key: &str| {
            resources
                .requests
                .as_ref()
                .and_then(|r| r.get(key))
                .or_else(|| resources.limits.as_ref().and_then(|l| l.get(key)))
                .map(|q| q.0.clone())
        };
        if let Some(q) = lookup("cpu") {
            cpu += parse_cpu_cores(&q)?;
        }
        if let Some(q) = lookup("memory") {
            memory += parse_memory_bytes(&q)? as f64;
        }
    }
    Ok((cpu, memory))
}

/// Name of the workload that owns a pod.
///
/// ReplicaSet owners are mapped back to their Deployment by stripping the
/// pod-template hash; other controllers keep their own name; bare pods are
/// their own workload.
pub fn workload_name_for_pod(pod: &Pod) -> String {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let Some(owner) = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller.unwrap_or(false)).or(refs.first()))
    else {
        return pod_name;
    };

    if owner.kind != "ReplicaSet" {
        return owner.name.clone();
    }

    let hash = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(POD_TEMPLATE_HASH_LABEL));
    match hash.and_then(|h| owner.name.strip_suffix(&format!("-{}", h))) {
        Some(deployment) => deployment.to_string(),
        None => owner
            .name
            .rsplit_once('-')
            .map(|(prefix, _)| prefix.to_string())
            .unwrap_or_else(|| owner.name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn pod_owned_by(kind: &str, owner: &str, hash: Option<&str>) -> Pod {
        let labels = hash.map(|h| {
            [(POD_TEMPLATE_HASH_LABEL.to_string(), h.to_string())]
                .into_iter()
                .collect()
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-abcde", owner)),
                namespace: Some("shop".to_string()),
                labels,
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: kind.to_string(),
                    name: owner.to_string(),
                    uid: "uid-1".to_string(),
                    controller: Some(true),
                    block_owner_deletion: None,
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_replicaset_owner_maps_to_deployment() {
        let pod = pod_owned_by("ReplicaSet", "checkout-7d9f8b6c5", Some("7d9f8b6c5"));
        assert_eq!(workload_name_for_pod(&pod), "checkout");
    }

    #[test]
    fn test_replicaset_without_hash_label() {
        let pod = pod_owned_by("ReplicaSet", "checkout-api-66b5d", None);
        assert_eq!(workload_name_for_pod(&pod), "checkout-api");
    }

    #[test]
    fn test_statefulset_owner_kept() {
        let pod = pod_owned_by("StatefulSet", "postgres", None);
        assert_eq!(workload_name_for_pod(&pod), "postgres");
    }

    #[test]
    fn test_bare_pod_is_its_own_workload() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("debug-shell".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(workload_name_for_pod(&pod), "debug-shell");
    }

    #[test]
    fn test_pod_allocation_prefers_requests() {
        let requests = [
            ("cpu".to_string(), Quantity("500m".to_string())),
            ("memory".to_string(), Quantity("256Mi".to_string())),
        ]
        .into_iter()
        .collect();
        let limits = [("cpu".to_string(), Quantity("2".to_string()))]
            .into_iter()
            .collect();
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        limits: Some(limits),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let (cpu, memory) = pod_allocation(&pod).unwrap();
        assert!((cpu - 0.5).abs() < 1e-12);
        assert_eq!(memory, (256 * 1024 * 1024) as f64);
    }

    #[test]
    fn test_container_usage_sums_containers() {
        let data = serde_json::json!({
            "timestamp": "2024-01-01T00:00:00Z",
            "window": "15s",
            "containers": [
                {"name": "app", "usage": {"cpu": "250000000n", "memory": "100Mi"}},
                {"name": "sidecar", "usage": {"cpu": "50m", "memory": "20Mi"}}
            ]
        });
        let (cpu, memory) = container_usage(&data).unwrap();
        assert!((cpu - 0.3).abs() < 1e-9);
        assert_eq!(memory, (120 * 1024 * 1024) as f64);
    }

    /// Running pod of the `checkout` Deployment on `node` requesting 500m
    fn checkout_pod(name: &str, node: &str) -> Pod {
        let mut pod = pod_owned_by("ReplicaSet", "checkout-7d9f8b6c5", Some("7d9f8b6c5"));
        pod.metadata.name = Some(name.to_string());
        let requests = [("cpu".to_string(), Quantity("500m".to_string()))]
            .into_iter()
            .collect();
        pod.spec = Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        pod
    }

    fn pod_metrics(name: &str, data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            data,
        }
    }

    fn using(cpu: &str) -> serde_json::Value {
        serde_json::json!({
            "containers": [{"name": "app", "usage": {"cpu": cpu, "memory": "10Mi"}}]
        })
    }

    fn checkout_on(node: &str) -> WorkloadIdentity {
        WorkloadIdentity::new("shop", "checkout", node)
    }

    #[test]
    fn test_pods_on_two_nodes_keep_one_identity() {
        let now = Utc::now();
        let usage = usage_by_pod(vec![
            pod_metrics("checkout-a", using("100m")),
            pod_metrics("checkout-b", using("200m")),
            pod_metrics("checkout-c", using("300m")),
        ]);

        let first = aggregate(
            &[checkout_pod("checkout-a", "n1"), checkout_pod("checkout-b", "n2")],
            &usage,
            "agent-node",
            now,
        );
        let second = aggregate(
            &[checkout_pod("checkout-b", "n2"), checkout_pod("checkout-c", "n1")],
            &usage,
            "agent-node",
            now,
        );

        assert_eq!(first.readings.len(), 1);
        assert_eq!(second.readings.len(), 1);
        assert_eq!(first.readings[0].workload, checkout_on("agent-node"));
        assert_eq!(second.readings[0].workload, first.readings[0].workload);
        assert!((first.readings[0].cpu_cores_used - 0.3).abs() < 1e-9);
        assert!((first.readings[0].cpu_cores_allocated - 1.0).abs() < 1e-9);
        assert!((second.readings[0].cpu_cores_used - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_undecodable_pod_metrics_only_affect_their_workload() {
        let mut other = checkout_pod("cart-xyz", "n1");
        other.metadata.owner_references = None;

        let usage = usage_by_pod(vec![
            pod_metrics("checkout-a", serde_json::json!({"window": "15s"})),
            pod_metrics("checkout-b", using("bogus")),
            pod_metrics("cart-xyz", using("250m")),
        ]);
        let batch = aggregate(
            &[checkout_pod("checkout-a", "n1"), checkout_pod("checkout-b", "n1"), other],
            &usage,
            "n1",
            Utc::now(),
        );

        assert_eq!(batch.readings.len(), 1);
        assert_eq!(batch.readings[0].workload.name, "cart-xyz");
        assert!((batch.readings[0].cpu_cores_used - 0.25).abs() < 1e-9);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].0, checkout_on("n1"));
    }

    #[test]
    fn test_pod_without_metrics_is_reported() {
        let batch = aggregate(
            &[checkout_pod("checkout-a", "n1")],
            &HashMap::new(),
            "n1",
            Utc::now(),
        );
        assert!(batch.readings.is_empty());
        assert_eq!(batch.errors.len(), 1);
        assert!(batch.errors[0].1.contains("checkout-a"));
    }

    #[test]
    fn test_container_usage_rejects_missing_containers() {
        assert!(container_usage(&serde_json::json!({})).is_err());
    }
}
