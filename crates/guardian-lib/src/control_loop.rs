//! Control loop
//!
//! One tick: sample, estimate, evaluate, query the oracle for workloads
//! with pending flags, hand the answers to the controller and feed the
//! ledger. A failure for one workload never aborts the others.

use crate::actions::{ActionController, ActionLog, ClusterApi};
use crate::anomaly::Evaluator;
use crate::collector::{MetricsSource, Sampler};
use crate::config::GuardianConfig;
use crate::estimator::EnergyEstimator;
use crate::health::{components, HealthRegistry};
use crate::ledger::Ledger;
use crate::models::{ActionKind, ActionRecord, Decision, EfficiencyFlag, Recommendation, WorkloadIdentity};
use crate::observability::{error_kinds, AgentMetrics, StructuredLogger};
use crate::oracle::{Oracle, OracleJob, RecommendationClient};
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What one tick did
#[derive(Debug, Default)]
pub struct TickReport {
    pub samples: usize,
    pub rejected_samples: usize,
    /// Samples not newer than the last one applied for their workload
    pub duplicate_samples: usize,
    pub source_failed: bool,
    pub flags: Vec<EfficiencyFlag>,
    pub expired_flags: usize,
    pub recommendations: Vec<Recommendation>,
    pub actions: Vec<ActionRecord>,
    /// Accepted actions the ledger could not credit for lack of an estimate
    pub uncredited_actions: usize,
    pub collected: Vec<WorkloadIdentity>,
}

pub struct ControlLoop {
    config: GuardianConfig,
    sampler: Sampler,
    estimator: EnergyEstimator,
    evaluator: Evaluator,
    client: RecommendationClient,
    controller: ActionController,
    ledger: Ledger,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    last_seen: DashMap<WorkloadIdentity, DateTime<Utc>>,
}

impl ControlLoop {
    pub fn controller(&self) -> &ActionController {
        &self.controller
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Tick until shutdown is signaled. A tick in progress completes.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.sampler.sample_interval_secs,
            node = %self.config.node_name,
            "Starting control loop"
        );

        let mut ticker = interval(self.config.sampler.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down control loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }

    /// Run one tick for the interval ending at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        self.sample_and_evaluate(now, &mut report).await;

        report.expired_flags = self.evaluator.expire_flags(now);
        if report.expired_flags > 0 {
            debug!(expired = report.expired_flags, "Expired unanswered flags");
        }

        self.recommend(now, &mut report).await;
        self.act(now, &mut report).await;
        self.report_ledger_health(&report).await;

        report.collected = self.collect_garbage(now);
        self.metrics.set_workloads_monitored(self.last_seen.len());

        self.health.record_tick(now).await;
        self.metrics
            .observe_tick_duration(started.elapsed().as_secs_f64());
        self.logger.log_tick(
            report.samples,
            report.flags.len(),
            report.recommendations.len(),
            report.actions.len(),
        );
        report
    }

    async fn sample_and_evaluate(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let set = match self.sampler.sample(now).await {
            Ok(set) => set,
            Err(e) => {
                report.source_failed = true;
                self.metrics.inc_error(error_kinds::SOURCE);
                self.logger.log_tick_failed("sample", &e.to_string());
                self.health
                    .set_degraded(components::SAMPLER, e.to_string())
                    .await;
                return;
            }
        };

        if set.errors.is_empty() {
            self.health.set_healthy(components::SAMPLER).await;
        } else {
            self.health
                .set_degraded(
                    components::SAMPLER,
                    format!("{} workloads without a usable reading", set.errors.len()),
                )
                .await;
        }
        for (workload, error) in &set.errors {
            self.metrics.inc_error(error_kinds::SAMPLE_REJECTED);
            warn!(workload = %workload, error = %error, "No usable sample this tick");
        }
        report.rejected_samples = set.errors.len();
        report.samples = set.samples.len();

        let interval = self.config.sampler.interval();
        for sample in &set.samples {
            self.last_seen.insert(sample.workload.clone(), now);

            let estimate = self.estimator.estimate(sample, interval);
            let Some(flags) = self.evaluator.observe(sample, &estimate) else {
                report.duplicate_samples += 1;
                continue;
            };
            self.metrics.set_workload_estimate(&estimate);
            self.ledger.record_estimate(&estimate);

            for flag in flags {
                self.metrics.inc_flag(flag.kind);
                self.logger.log_flag(&flag);
                report.flags.push(flag);
            }
        }
    }

    async fn recommend(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let jobs: Vec<OracleJob> = self
            .evaluator
            .workloads_with_pending_flags()
            .into_iter()
            .map(|workload| OracleJob {
                flags: self.evaluator.pending_flags(&workload),
                history: self.evaluator.history(&workload),
                workload,
            })
            .collect();
        if jobs.is_empty() {
            return;
        }

        let requested = jobs.len();
        let mut unanswered = 0;
        for (workload, recommendation) in self.client.recommend_all(jobs, now).await {
            match recommendation {
                Some(recommendation) => {
                    self.evaluator.consume_flags(&workload);
                    self.logger.log_recommendation(&recommendation);
                    report.recommendations.push(recommendation);
                }
                None => unanswered += 1,
            }
        }

        if unanswered == 0 {
            self.health.set_healthy(components::ORACLE).await;
        } else {
            self.health
                .set_degraded(
                    components::ORACLE,
                    format!("{} of {} oracle calls failed", unanswered, requested),
                )
                .await;
        }
    }

    async fn act(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let actionable: Vec<Recommendation> = report
            .recommendations
            .iter()
            .filter(|r| r.action != ActionKind::NoAction)
            .cloned()
            .collect();
        if actionable.is_empty() {
            return;
        }

        let records = self.controller.handle_all(actionable, now).await;
        let failed = records
            .iter()
            .filter(|r| r.decision == Decision::FailedOnApply)
            .count();
        for record in &records {
            if record.decision == Decision::Accepted && self.ledger.record_action(record).is_none() {
                warn!(workload = %record.workload(), "Accepted action could not be credited");
                report.uncredited_actions += 1;
            }
        }

        if failed == 0 {
            self.health.set_healthy(components::CONTROLLER).await;
        } else {
            self.health
                .set_degraded(
                    components::CONTROLLER,
                    format!("{} cluster mutations failed", failed),
                )
                .await;
        }
        report.actions = records;
    }

    async fn report_ledger_health(&self, report: &TickReport) {
        if self.ledger.uses_fallback_intensity() {
            self.health
                .set_degraded(
                    components::LEDGER,
                    format!(
                        "no carbon intensity for region {}; using global average",
                        self.config.region
                    ),
                )
                .await;
        } else if report.uncredited_actions > 0 {
            self.health
                .set_degraded(
                    components::LEDGER,
                    format!("{} accepted actions without savings credit", report.uncredited_actions),
                )
                .await;
        } else {
            self.health.set_healthy(components::LEDGER).await;
        }
    }

    /// Forget workloads not sampled within the grace period
    fn collect_garbage(&self, now: DateTime<Utc>) -> Vec<WorkloadIdentity> {
        let grace = chrono::Duration::seconds(self.config.sampler.gc_grace_secs as i64);
        let stale: Vec<WorkloadIdentity> = self
            .last_seen
            .iter()
            .filter(|entry| now - *entry.value() > grace)
            .map(|entry| entry.key().clone())
            .collect();

        for workload in &stale {
            self.last_seen.remove(workload);
            self.evaluator.remove(workload);
            self.controller.remove(workload);
            self.metrics.remove_workload(workload);
            self.ledger.forget_estimate(workload);
            debug!(workload = %workload, "Garbage-collected vanished workload");
        }
        stale
    }
}

/// Builder wiring the capabilities into a control loop
pub struct ControlLoopBuilder {
    config: GuardianConfig,
    source: Option<Arc<dyn MetricsSource>>,
    oracle: Option<Arc<dyn Oracle>>,
    cluster: Option<Arc<dyn ClusterApi>>,
    action_log: Option<Arc<ActionLog>>,
    metrics: Option<AgentMetrics>,
    health: Option<HealthRegistry>,
}

impl ControlLoopBuilder {
    pub fn new(config: GuardianConfig) -> Self {
        Self {
            config,
            source: None,
            oracle: None,
            cluster: None,
            action_log: None,
            metrics: None,
            health: None,
        }
    }

    /// Set the metrics source
    pub fn source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the recommendation oracle
    pub fn oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Set the cluster orchestration API
    pub fn cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Use an existing audit log (memory-only otherwise)
    pub fn action_log(mut self, log: Arc<ActionLog>) -> Self {
        self.action_log = Some(log);
        self
    }

    /// Share a metrics handle with the HTTP surface
    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share a health registry with the HTTP surface
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<ControlLoop> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Metrics source is required"))?;
        let oracle = self
            .oracle
            .ok_or_else(|| anyhow::anyhow!("Oracle is required"))?;
        let cluster = self
            .cluster
            .ok_or_else(|| anyhow::anyhow!("Cluster API is required"))?;

        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => AgentMetrics::new()?,
        };
        let health = self.health.unwrap_or_default();
        let action_log = self.action_log.unwrap_or_else(|| {
            Arc::new(ActionLog::in_memory(self.config.ledger.audit_log_capacity))
        });
        let logger = StructuredLogger::new(self.config.node_name.clone());

        let controller = ActionController::new(
            cluster,
            self.config.policy.clone(),
            action_log,
            metrics.clone(),
            logger.clone(),
        );
        let client =
            RecommendationClient::new(oracle, self.config.oracle.clone(), metrics.clone());
        let ledger = Ledger::new(&self.config.ledger, &self.config.region, metrics.clone());

        Ok(ControlLoop {
            sampler: Sampler::new(source, self.config.sampler.clone()),
            estimator: EnergyEstimator::new(self.config.estimator.clone()),
            evaluator: Evaluator::new(self.config.evaluator.clone()),
            client,
            controller,
            ledger,
            health,
            metrics,
            logger,
            last_seen: DashMap::new(),
            config: self.config,
        })
    }
}
