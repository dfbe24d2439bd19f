//! Action controller
//!
//! Each workload's [`PolicyState`] sits behind its own async mutex, held
//! from the policy decision through the cluster call, so two in-flight
//! decisions can never update the same workload. Distinct workloads run
//! in parallel.

use super::policy::{admit, plan_replicas, plan_resources, Plan, PolicyRejection};
use super::{ActionLog, ClusterApi, ResourceRequest};
use crate::config::PolicyConfig;
use crate::error::ClusterApiError;
use crate::models::{
    ActionKind, ActionRecord, ActionValues, Decision, PolicyState, Recommendation,
    WorkloadIdentity,
};
use crate::observability::{error_kinds, AgentMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

type SharedState = Arc<Mutex<PolicyState>>;

/// Applies recommendations under the configured safety policy
#[derive(Clone)]
pub struct ActionController {
    cluster: Arc<dyn ClusterApi>,
    config: PolicyConfig,
    states: Arc<DashMap<WorkloadIdentity, SharedState>>,
    log: Arc<ActionLog>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

enum Outcome {
    Applied(Plan),
    Rejected(PolicyRejection, ActionValues),
    Failed(ClusterApiError, ActionValues),
}

impl ActionController {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: PolicyConfig,
        log: Arc<ActionLog>,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cluster,
            config,
            states: Arc::new(DashMap::new()),
            log,
            metrics,
            logger,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn action_log(&self) -> &Arc<ActionLog> {
        &self.log
    }

    fn state_for(&self, workload: &WorkloadIdentity) -> SharedState {
        self.states
            .entry(workload.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PolicyState::default())))
            .clone()
    }

    /// Decide on and possibly apply one recommendation.
    ///
    /// The attempt is always appended to the action log.
    pub async fn handle(&self, recommendation: Recommendation, now: DateTime<Utc>) -> ActionRecord {
        let workload = recommendation.workload.clone();
        let state = self.state_for(&workload);
        let mut state = state.lock().await;

        let outcome = match admit(&self.config, &state, &recommendation, now) {
            Err(rejection) => Outcome::Rejected(rejection, ActionValues::default()),
            Ok(()) => self.plan_and_apply(&recommendation).await,
        };

        let (decision, reason, pre, post) = match outcome {
            Outcome::Applied(plan) => {
                state.last_action_at = Some(now);
                state.cooldown_until = Some(now + self.config.cooldown());
                state.consecutive_failures = 0;
                (Decision::Accepted, None, plan.pre(), plan.post())
            }
            Outcome::Rejected(rejection, current) => (
                Decision::RejectedByPolicy,
                Some(rejection.to_string()),
                current.clone(),
                current,
            ),
            Outcome::Failed(error, current) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                self.metrics.inc_error(error_kinds::CLUSTER_APPLY);
                if state.consecutive_failures == self.config.consecutive_failure_limit {
                    self.logger
                        .log_failure_limit_reached(&workload, state.consecutive_failures);
                }
                (
                    Decision::FailedOnApply,
                    Some(error.to_string()),
                    current.clone(),
                    current,
                )
            }
        };

        let record = ActionRecord {
            recommendation,
            decision,
            reason,
            applied_at: now,
            pre,
            post,
        };

        if let Err(e) = self.log.append(&record).await {
            warn!(workload = %workload, error = %e, "Failed to persist action record");
        }
        self.metrics.inc_action(decision);
        self.logger.log_action(&record);

        record
    }

    async fn plan_and_apply(&self, recommendation: &Recommendation) -> Outcome {
        let workload = &recommendation.workload;

        if recommendation.action == ActionKind::ResizeRequest {
            let current = match self
                .bounded(self.cluster.get_resource_request(workload))
                .await
            {
                Ok(current) => current,
                Err(e) => return Outcome::Failed(e, ActionValues::default()),
            };
            let plan = match plan_resources(&self.config, recommendation, &current) {
                Ok(plan) => plan,
                Err(rejection) => return Outcome::Rejected(rejection, current.as_values()),
            };
            return self.apply(workload, plan).await;
        }

        let current = match self.bounded(self.cluster.get_replica_count(workload)).await {
            Ok(current) => current,
            Err(e) => return Outcome::Failed(e, ActionValues::default()),
        };
        match plan_replicas(&self.config, recommendation, current) {
            Ok(plan) => self.apply(workload, plan).await,
            Err(rejection) => Outcome::Rejected(
                rejection,
                ActionValues {
                    replicas: Some(current),
                    ..Default::default()
                },
            ),
        }
    }

    async fn apply(&self, workload: &WorkloadIdentity, plan: Plan) -> Outcome {
        debug!(workload = %workload, plan = ?plan, "Applying action");
        let result = match &plan {
            Plan::SetReplicas { to, .. } => {
                self.bounded(self.cluster.set_replica_count(workload, *to))
                    .await
            }
            Plan::SetResources { to, .. } => {
                self.bounded(self.cluster.set_resource_request(workload, to))
                    .await
            }
            Plan::Hibernate { .. } => {
                self.bounded(self.cluster.set_hibernation_state(workload, true))
                    .await
            }
        };

        match result {
            Ok(()) => Outcome::Applied(plan),
            Err(e) => Outcome::Failed(e, plan.pre()),
        }
    }

    /// Cluster call bounded by the configured timeout
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ClusterApiError>>,
    ) -> Result<T, ClusterApiError> {
        tokio::time::timeout(self.config.cluster_timeout(), call)
            .await
            .map_err(|_| ClusterApiError::Timeout(self.config.cluster_timeout_ms))?
    }

    /// Handle recommendations for distinct workloads concurrently.
    ///
    /// Records come back in completion order.
    pub async fn handle_all(
        &self,
        recommendations: Vec<Recommendation>,
        now: DateTime<Utc>,
    ) -> Vec<ActionRecord> {
        let mut tasks = JoinSet::new();
        for recommendation in recommendations {
            let controller = self.clone();
            tasks.spawn(async move { controller.handle(recommendation, now).await });
        }

        let mut records = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Action task failed"),
            }
        }
        records
    }

    pub async fn policy_state(&self, workload: &WorkloadIdentity) -> Option<PolicyState> {
        let state = self.states.get(workload).map(|s| s.value().clone())?;
        let state = state.lock().await;
        Some(state.clone())
    }

    /// Policy state of every node-local identity of a namespace/workload pair
    pub async fn policy_states_for(
        &self,
        namespace: &str,
        name: &str,
    ) -> Vec<(WorkloadIdentity, PolicyState)> {
        let matching: Vec<(WorkloadIdentity, SharedState)> = self
            .states
            .iter()
            .filter(|entry| entry.key().matches(namespace, name))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut states = Vec::with_capacity(matching.len());
        for (workload, state) in matching {
            let state = state.lock().await;
            states.push((workload, state.clone()));
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Clear the consecutive-failure counter of a namespace/workload pair.
    ///
    /// Returns `None` if the controller has never seen the workload.
    pub async fn reset_failures(&self, namespace: &str, name: &str) -> Option<u32> {
        let matching: Vec<(WorkloadIdentity, SharedState)> = self
            .states
            .iter()
            .filter(|entry| entry.key().matches(namespace, name))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if matching.is_empty() {
            return None;
        }

        let mut cleared = 0;
        for (workload, state) in matching {
            let mut state = state.lock().await;
            let previous = state.consecutive_failures;
            state.consecutive_failures = 0;
            cleared += previous;
            self.logger.log_failure_counter_reset(&workload, previous);
        }
        Some(cleared)
    }

    pub fn is_known(&self, workload: &WorkloadIdentity) -> bool {
        self.states.contains_key(workload)
    }

    /// Drop the policy state of a garbage-collected workload
    pub fn remove(&self, workload: &WorkloadIdentity) -> bool {
        self.states.remove(workload).is_some()
    }

    pub fn workloads(&self) -> Vec<WorkloadIdentity> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetParameters;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Deployment with a replica count and call counters
    struct FakeCluster {
        replicas: AtomicU32,
        cpu_millicores: AtomicU32,
        fail_writes: AtomicBool,
        reads: AtomicU32,
        writes: AtomicU32,
    }

    impl FakeCluster {
        fn with_replicas(replicas: u32) -> Self {
            Self {
                replicas: AtomicU32::new(replicas),
                cpu_millicores: AtomicU32::new(500),
                fail_writes: AtomicBool::new(false),
                reads: AtomicU32::new(0),
                writes: AtomicU32::new(0),
            }
        }

        fn write_result(&self) -> Result<(), ClusterApiError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(ClusterApiError::Other("admission webhook denied".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn get_replica_count(&self, _w: &WorkloadIdentity) -> Result<u32, ClusterApiError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.replicas.load(Ordering::SeqCst))
        }

        async fn set_replica_count(
            &self,
            _w: &WorkloadIdentity,
            replicas: u32,
        ) -> Result<(), ClusterApiError> {
            self.write_result()?;
            self.replicas.store(replicas, Ordering::SeqCst);
            Ok(())
        }

        async fn get_resource_request(
            &self,
            _w: &WorkloadIdentity,
        ) -> Result<ResourceRequest, ClusterApiError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(ResourceRequest {
                cpu_millicores: Some(self.cpu_millicores.load(Ordering::SeqCst)),
                memory_bytes: Some(256 * 1024 * 1024),
            })
        }

        async fn set_resource_request(
            &self,
            _w: &WorkloadIdentity,
            request: &ResourceRequest,
        ) -> Result<(), ClusterApiError> {
            self.write_result()?;
            if let Some(cpu) = request.cpu_millicores {
                self.cpu_millicores.store(cpu, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn set_hibernation_state(
            &self,
            _w: &WorkloadIdentity,
            hibernated: bool,
        ) -> Result<(), ClusterApiError> {
            self.write_result()?;
            if hibernated {
                self.replicas.store(0, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn controller(cluster: Arc<FakeCluster>, config: PolicyConfig) -> (ActionController, AgentMetrics) {
        let metrics = AgentMetrics::new().unwrap();
        let controller = ActionController::new(
            cluster,
            config,
            Arc::new(ActionLog::in_memory(100)),
            metrics.clone(),
            StructuredLogger::new("node-1"),
        );
        (controller, metrics)
    }

    fn recommendation(action: ActionKind, confidence: f64, now: DateTime<Utc>) -> Recommendation {
        Recommendation {
            workload: WorkloadIdentity::new("shop", "checkout", "node-1"),
            action,
            parameters: TargetParameters::default(),
            confidence,
            rationale: "test".to_string(),
            estimated_savings_kwh: None,
            created_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_accepted_scale_down_sets_cooldown() {
        let cluster = Arc::new(FakeCluster::with_replicas(3));
        let (controller, metrics) = controller(cluster.clone(), PolicyConfig::default());
        let now = Utc::now();

        let record = controller
            .handle(recommendation(ActionKind::ScaleDown, 0.9, now), now)
            .await;

        assert_eq!(record.decision, Decision::Accepted);
        assert_eq!(record.pre.replicas, Some(3));
        assert_eq!(record.post.replicas, Some(2));
        assert_eq!(cluster.replicas.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.action_count(Decision::Accepted), 1);

        let state = controller.policy_state(&record.recommendation.workload).await.unwrap();
        assert_eq!(state.cooldown_until, Some(now + Duration::seconds(900)));
        assert_eq!(state.last_action_at, Some(now));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_action() {
        let cluster = Arc::new(FakeCluster::with_replicas(5));
        let (controller, _) = controller(cluster.clone(), PolicyConfig::default());
        let now = Utc::now();

        controller
            .handle(recommendation(ActionKind::ScaleDown, 0.9, now), now)
            .await;
        let later = now + Duration::seconds(60);
        let second = controller
            .handle(recommendation(ActionKind::ScaleDown, 0.9, later), later)
            .await;

        assert_eq!(second.decision, Decision::RejectedByPolicy);
        assert_eq!(second.reason.as_deref(), Some("cooldown"));
        assert_eq!(cluster.replicas.load(Ordering::SeqCst), 4);

        let after = now + Duration::seconds(900);
        let third = controller
            .handle(recommendation(ActionKind::ScaleDown, 0.9, after), after)
            .await;
        assert_eq!(third.decision, Decision::Accepted);
    }

    #[tokio::test]
    async fn test_floor_rejects_without_write() {
        let cluster = Arc::new(FakeCluster::with_replicas(1));
        let (controller, _) = controller(cluster.clone(), PolicyConfig::default());
        let now = Utc::now();

        let record = controller
            .handle(recommendation(ActionKind::ScaleDown, 0.9, now), now)
            .await;

        assert_eq!(record.decision, Decision::RejectedByPolicy);
        assert_eq!(record.reason.as_deref(), Some("below_replica_floor"));
        assert_eq!(record.pre.replicas, Some(1));
        assert_eq!(cluster.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resize_applies_new_requests() {
        let cluster = Arc::new(FakeCluster::with_replicas(2));
        let (controller, _) = controller(cluster.clone(), PolicyConfig::default());
        let now = Utc::now();
        let mut rec = recommendation(ActionKind::ResizeRequest, 0.9, now);
        rec.parameters.cpu_millicores = Some(200);

        let record = controller.handle(rec, now).await;
        assert_eq!(record.decision, Decision::Accepted);
        assert_eq!(record.pre.cpu_millicores, Some(500));
        assert_eq!(record.post.cpu_millicores, Some(200));
        assert_eq!(cluster.cpu_millicores.load(Ordering::SeqCst), 200);
    }

    #[tokio::test]
    async fn test_hibernate_ignores_replica_floor() {
        let cluster = Arc::new(FakeCluster::with_replicas(1));
        let config = PolicyConfig {
            hibernation_enabled: true,
            ..Default::default()
        };
        let (controller, _) = controller(cluster.clone(), config);
        let now = Utc::now();

        let record = controller
            .handle(recommendation(ActionKind::Hibernate, 0.95, now), now)
            .await;
        assert_eq!(record.decision, Decision::Accepted);
        assert_eq!(record.post.replicas, Some(0));
        assert_eq!(cluster.replicas.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_apply_counts_and_success_resets() {
        let cluster = Arc::new(FakeCluster::with_replicas(4));
        cluster.fail_writes.store(true, Ordering::SeqCst);
        let (controller, metrics) = controller(cluster.clone(), PolicyConfig::default());
        let now = Utc::now();

        let record = controller
            .handle(recommendation(ActionKind::ScaleDown, 0.9, now), now)
            .await;
        assert_eq!(record.decision, Decision::FailedOnApply);
        assert_eq!(record.pre.replicas, Some(4));
        assert_eq!(metrics.error_count(error_kinds::CLUSTER_APPLY), 1);

        cluster.fail_writes.store(false, Ordering::SeqCst);
        let record = controller
            .handle(recommendation(ActionKind::ScaleDown, 0.9, now), now)
            .await;
        assert_eq!(record.decision, Decision::Accepted);
        let state = controller.policy_state(record.workload()).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_reset_unknown_workload() {
        let cluster = Arc::new(FakeCluster::with_replicas(2));
        let (controller, _) = controller(cluster, PolicyConfig::default());
        assert_eq!(controller.reset_failures("shop", "nope").await, None);
    }

    #[tokio::test]
    async fn test_handle_all_across_workloads() {
        let cluster = Arc::new(FakeCluster::with_replicas(10));
        let (controller, _) = controller(cluster.clone(), PolicyConfig::default());
        let now = Utc::now();

        let recs = ["a", "b", "c"]
            .iter()
            .map(|name| Recommendation {
                workload: WorkloadIdentity::new("shop", *name, "node-1"),
                ..recommendation(ActionKind::ScaleDown, 0.9, now)
            })
            .collect();

        let records = controller.handle_all(recs, now).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.decision == Decision::Accepted));
        assert_eq!(controller.action_log().len().await, 3);
        assert_eq!(controller.workloads().len(), 3);
    }

    #[tokio::test]
    async fn test_same_workload_decisions_are_serialized() {
        let cluster = Arc::new(FakeCluster::with_replicas(5));
        let (controller, _) = controller(cluster.clone(), PolicyConfig::default());
        let now = Utc::now();

        let recs = vec![
            recommendation(ActionKind::ScaleDown, 0.9, now),
            recommendation(ActionKind::ScaleDown, 0.9, now),
        ];
        let records = controller.handle_all(recs, now).await;

        assert_eq!(records.len(), 2);
        let accepted = records
            .iter()
            .filter(|r| r.decision == Decision::Accepted)
            .count();
        assert_eq!(accepted, 1);
        let rejected: Vec<_> = records
            .iter()
            .filter(|r| r.decision == Decision::RejectedByPolicy)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason.as_deref(), Some("cooldown"));

        assert_eq!(cluster.replicas.load(Ordering::SeqCst), 4);
        assert_eq!(cluster.writes.load(Ordering::SeqCst), 1);
    }
}
