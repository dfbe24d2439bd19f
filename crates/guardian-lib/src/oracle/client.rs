//! Recommendation client
//!
//! Turns pending flags into oracle queries. Calls for distinct workloads run
//! concurrently on a `JoinSet`, bounded by a semaphore so a burst of flags
//! cannot overwhelm the oracle. A timeout or transport failure yields no
//! recommendation and leaves the caller's flags pending; a reply that fails
//! validation becomes `no_action` with confidence 0.

use super::{parse_reply, Oracle, OracleRequest};
use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::models::{EfficiencyFlag, EnergyEstimate, Recommendation, WorkloadIdentity};
use crate::observability::{error_kinds, AgentMetrics};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Inputs for one workload's oracle query
#[derive(Debug, Clone)]
pub struct OracleJob {
    pub workload: WorkloadIdentity,
    pub flags: Vec<EfficiencyFlag>,
    pub history: Vec<EnergyEstimate>,
}

/// Queries the oracle for flagged workloads
#[derive(Clone)]
pub struct RecommendationClient {
    oracle: Arc<dyn Oracle>,
    config: OracleConfig,
    metrics: AgentMetrics,
    permits: Arc<Semaphore>,
}

impl RecommendationClient {
    pub fn new(oracle: Arc<dyn Oracle>, config: OracleConfig, metrics: AgentMetrics) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency_cap.max(1)));
        Self {
            oracle,
            config,
            metrics,
            permits,
        }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn build_request(&self, job: &OracleJob) -> OracleRequest {
        OracleRequest::new(
            job.workload.clone(),
            &job.flags,
            &job.history,
            self.config.max_estimates_per_request,
        )
    }

    /// Query the oracle for one workload.
    ///
    /// `None` means the call failed and the flags should stay pending.
    pub async fn recommend(&self, job: &OracleJob, now: DateTime<Utc>) -> Option<Recommendation> {
        let request = self.build_request(job);

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout(), self.oracle.query(&request)).await;
        self.metrics
            .observe_oracle_latency(started.elapsed().as_secs_f64());

        let ttl = chrono::Duration::seconds(self.config.recommendation_ttl_secs as i64);
        let reply = match outcome {
            Err(_) => Err(OracleError::Timeout(self.config.timeout_ms)),
            Ok(result) => result,
        };

        let parsed = reply.and_then(|value| parse_reply(&value, &job.workload, now, ttl));
        match parsed {
            Ok(recommendation) => {
                self.metrics.inc_recommendation(recommendation.action);
                Some(recommendation)
            }
            Err(e @ OracleError::Malformed(_)) => {
                warn!(workload = %job.workload, error = %e, "Treating oracle reply as no_action");
                self.metrics.inc_error(error_kinds::ORACLE_MALFORMED);
                let recommendation = Recommendation::no_action(
                    job.workload.clone(),
                    format!("rejected oracle reply: {}", e),
                    now,
                    now + ttl,
                );
                self.metrics.inc_recommendation(recommendation.action);
                Some(recommendation)
            }
            Err(e) => {
                warn!(workload = %job.workload, error = %e, "Oracle call failed; flags stay pending");
                self.metrics.inc_error(e.metric_kind());
                None
            }
        }
    }

    /// Query the oracle for every job concurrently, at most
    /// `concurrency_cap` calls in flight.
    ///
    /// Results come back in completion order.
    pub async fn recommend_all(
        &self,
        jobs: Vec<OracleJob>,
        now: DateTime<Utc>,
    ) -> Vec<(WorkloadIdentity, Option<Recommendation>)> {
        let mut tasks = JoinSet::new();
        for job in jobs {
            let client = self.clone();
            tasks.spawn(async move {
                let recommendation = client.recommend(&job, now).await;
                (job.workload, recommendation)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Oracle task failed"),
            }
        }
        debug!(results = results.len(), "Oracle round completed");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, EvidenceWindow, FlagKind, Severity};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedOracle {
        reply: Result<serde_json::Value, fn() -> OracleError>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn replying(reply: serde_json::Value) -> Self {
            Self::new(Ok(reply), Duration::ZERO)
        }

        fn new(reply: Result<serde_json::Value, fn() -> OracleError>, delay: Duration) -> Self {
            Self {
                reply,
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn query(&self, _request: &OracleRequest) -> Result<serde_json::Value, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match &self.reply {
                Ok(v) => Ok(v.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn job(name: &str) -> OracleJob {
        let workload = WorkloadIdentity::new("shop", name, "node-1");
        let now = Utc::now();
        OracleJob {
            workload: workload.clone(),
            flags: vec![EfficiencyFlag {
                workload,
                kind: FlagKind::SustainedUnderutilization,
                severity: Severity::High,
                evidence: EvidenceWindow {
                    start: now,
                    end: now,
                    samples: 10,
                    observed: 0.02,
                    expected: 0.1,
                    score: 10.0,
                },
            }],
            history: Vec::new(),
        }
    }

    fn client(oracle: Arc<dyn Oracle>, config: OracleConfig) -> (RecommendationClient, AgentMetrics) {
        let metrics = AgentMetrics::new().unwrap();
        (RecommendationClient::new(oracle, config, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_valid_reply_becomes_recommendation() {
        let oracle = Arc::new(ScriptedOracle::replying(json!({
            "action": "scale_down",
            "parameters": {"replicas": 1},
            "confidence": 0.9,
            "rationale": "idle"
        })));
        let (client, metrics) = client(oracle, OracleConfig::default());

        let rec = client.recommend(&job("checkout"), Utc::now()).await.unwrap();
        assert_eq!(rec.action, ActionKind::ScaleDown);
        assert_eq!(metrics.recommendation_count(ActionKind::ScaleDown), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_becomes_no_action() {
        let oracle = Arc::new(ScriptedOracle::replying(json!({"action": "explode", "confidence": 1.0})));
        let (client, metrics) = client(oracle, OracleConfig::default());

        let rec = client.recommend(&job("checkout"), Utc::now()).await.unwrap();
        assert_eq!(rec.action, ActionKind::NoAction);
        assert_eq!(rec.confidence, 0.0);
        assert_eq!(metrics.error_count(error_kinds::ORACLE_MALFORMED), 1);
    }

    #[tokio::test]
    async fn test_timeout_yields_nothing_and_counts_error() {
        let oracle = Arc::new(ScriptedOracle::new(
            Ok(json!({"action": "no_action", "confidence": 1.0})),
            Duration::from_secs(5),
        ));
        let config = OracleConfig {
            timeout_ms: 50,
            ..Default::default()
        };
        let (client, metrics) = client(oracle, config);

        assert!(client.recommend(&job("checkout"), Utc::now()).await.is_none());
        assert_eq!(metrics.error_count(error_kinds::ORACLE_TIMEOUT), 1);
    }

    #[tokio::test]
    async fn test_transport_error_yields_nothing() {
        let oracle = Arc::new(ScriptedOracle::new(
            Err(|| OracleError::Transport("connection reset".to_string())),
            Duration::ZERO,
        ));
        let (client, metrics) = client(oracle, OracleConfig::default());

        assert!(client.recommend(&job("checkout"), Utc::now()).await.is_none());
        assert_eq!(metrics.error_count(error_kinds::ORACLE_TRANSPORT), 1);
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let oracle = Arc::new(ScriptedOracle::new(
            Ok(json!({"action": "no_action", "confidence": 0.5})),
            Duration::from_millis(50),
        ));
        let config = OracleConfig {
            concurrency_cap: 2,
            ..Default::default()
        };
        let (client, _metrics) = client(oracle.clone(), config);

        let jobs = (0..6).map(|i| job(&format!("w{}", i))).collect();
        let results = client.recommend_all(jobs, Utc::now()).await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|(_, r)| r.is_some()));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 6);
        assert!(oracle.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
