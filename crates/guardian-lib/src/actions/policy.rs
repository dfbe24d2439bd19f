//! Safety policy applied before any cluster mutation

use super::ResourceRequest;
use crate::config::PolicyConfig;
use crate::models::{ActionKind, ActionValues, PolicyState, Recommendation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a recommendation was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRejection {
    Cooldown,
    BelowReplicaFloor,
    AboveReplicaCeiling,
    BelowResourceMinimum,
    LowConfidence,
    Expired,
    FailureLimitReached,
    HibernationDisabled,
    /// Target equals the current state
    NoChange,
}

impl PolicyRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyRejection::Cooldown => "cooldown",
            PolicyRejection::BelowReplicaFloor => "below_replica_floor",
            PolicyRejection::AboveReplicaCeiling => "above_replica_ceiling",
            PolicyRejection::BelowResourceMinimum => "below_resource_minimum",
            PolicyRejection::LowConfidence => "low_confidence",
            PolicyRejection::Expired => "expired",
            PolicyRejection::FailureLimitReached => "failure_limit_reached",
            PolicyRejection::HibernationDisabled => "hibernation_disabled",
            PolicyRejection::NoChange => "no_change",
        }
    }
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster mutation the controller is about to issue
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    SetReplicas { from: u32, to: u32 },
    SetResources { from: ResourceRequest, to: ResourceRequest },
    Hibernate { from: u32 },
}

impl Plan {
    pub fn pre(&self) -> ActionValues {
        match self {
            Plan::SetReplicas { from, .. } | Plan::Hibernate { from } => ActionValues {
                replicas: Some(*from),
                ..Default::default()
            },
            Plan::SetResources { from, .. } => from.as_values(),
        }
    }

    pub fn post(&self) -> ActionValues {
        match self {
            Plan::SetReplicas { to, .. } => ActionValues {
                replicas: Some(*to),
                ..Default::default()
            },
            Plan::Hibernate { .. } => ActionValues {
                replicas: Some(0),
                ..Default::default()
            },
            Plan::SetResources { to, .. } => to.as_values(),
        }
    }
}

/// Checks that need no cluster state: failure limit, expiry, cooldown and
/// confidence, in that order
pub fn admit(
    config: &PolicyConfig,
    state: &PolicyState,
    recommendation: &Recommendation,
    now: DateTime<Utc>,
) -> Result<(), PolicyRejection> {
    if state.consecutive_failures >= config.consecutive_failure_limit {
        return Err(PolicyRejection::FailureLimitReached);
    }
    if recommendation.is_expired(now) {
        return Err(PolicyRejection::Expired);
    }
    if state.in_cooldown(now) {
        return Err(PolicyRejection::Cooldown);
    }
    if recommendation.confidence < config.acceptance_confidence_threshold {
        return Err(PolicyRejection::LowConfidence);
    }
    if recommendation.action == ActionKind::Hibernate && !config.hibernation_enabled {
        return Err(PolicyRejection::HibernationDisabled);
    }
    if recommendation.action == ActionKind::NoAction {
        return Err(PolicyRejection::NoChange);
    }
    Ok(())
}

/// Replica change for a scale action given the current count
pub fn plan_replicas(
    config: &PolicyConfig,
    recommendation: &Recommendation,
    current: u32,
) -> Result<Plan, PolicyRejection> {
    match recommendation.action {
        ActionKind::ScaleDown => {
            let target = recommendation
                .parameters
                .replicas
                .unwrap_or_else(|| current.saturating_sub(1));
            if target < config.replica_floor {
                return Err(PolicyRejection::BelowReplicaFloor);
            }
            if target >= current {
                return Err(PolicyRejection::NoChange);
            }
            Ok(Plan::SetReplicas {
                from: current,
                to: target,
            })
        }
        ActionKind::ScaleUp => {
            let target = recommendation
                .parameters
                .replicas
                .unwrap_or_else(|| current.saturating_add(1));
            if config.replica_ceiling.is_some_and(|ceiling| target > ceiling) {
                return Err(PolicyRejection::AboveReplicaCeiling);
            }
            if target <= current {
                return Err(PolicyRejection::NoChange);
            }
            Ok(Plan::SetReplicas {
                from: current,
                to: target,
            })
        }
        ActionKind::Hibernate => {
            if current == 0 {
                return Err(PolicyRejection::NoChange);
            }
            Ok(Plan::Hibernate { from: current })
        }
        ActionKind::ResizeRequest | ActionKind::NoAction => Err(PolicyRejection::NoChange),
    }
}

/// Resource request change for a resize given the current requests
pub fn plan_resources(
    config: &PolicyConfig,
    recommendation: &Recommendation,
    current: &ResourceRequest,
) -> Result<Plan, PolicyRejection> {
    let params = &recommendation.parameters;
    if params
        .cpu_millicores
        .is_some_and(|cpu| cpu < config.min_cpu_millicores)
        || params
            .memory_bytes
            .is_some_and(|mem| mem < config.min_memory_bytes)
    {
        return Err(PolicyRejection::BelowResourceMinimum);
    }

    let target = ResourceRequest {
        cpu_millicores: params.cpu_millicores.or(current.cpu_millicores),
        memory_bytes: params.memory_bytes.or(current.memory_bytes),
    };
    if &target == current {
        return Err(PolicyRejection::NoChange);
    }

    Ok(Plan::SetResources {
        from: current.clone(),
        to: target,
    })
}
