//! Oracle reply validation
//!
//! Expected shape:
//!
//! ```json
//! {
//!   "action": "scale_down",
//!   "parameters": {"replicas": 2, "cpu_millicores": 250, "memory_bytes": 268435456},
//!   "confidence": 0.85,
//!   "rationale": "sustained 2% utilization",
//!   "estimated_savings_kwh": 0.4
//! }
//! ```

use crate::error::OracleError;
use crate::models::{ActionKind, Recommendation, TargetParameters, WorkloadIdentity};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

fn malformed(reason: impl Into<String>) -> OracleError {
    OracleError::Malformed(reason.into())
}

/// Validate a raw reply and turn it into a recommendation that expires
/// `ttl` after `now`
pub fn parse_reply(
    reply: &Value,
    workload: &WorkloadIdentity,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<Recommendation, OracleError> {
    let object = reply
        .as_object()
        .ok_or_else(|| malformed("reply is not a JSON object"))?;

    let action_name = object
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing string field 'action'"))?;
    let action = ActionKind::parse(action_name)
        .ok_or_else(|| malformed(format!("unknown action '{}'", action_name)))?;

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| malformed("missing numeric field 'confidence'"))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(malformed(format!("confidence {} outside [0, 1]", confidence)));
    }

    let parameters = match object.get("parameters") {
        None | Some(Value::Null) => TargetParameters::default(),
        Some(Value::Object(map)) => parse_parameters(map)?,
        Some(_) => return Err(malformed("'parameters' is not an object")),
    };

    if action == ActionKind::ResizeRequest
        && parameters.cpu_millicores.is_none()
        && parameters.memory_bytes.is_none()
    {
        return Err(malformed("resize_request without cpu_millicores or memory_bytes"));
    }

    let rationale = match object.get("rationale") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(malformed("'rationale' is not a string")),
    };

    let estimated_savings_kwh = match object.get("estimated_savings_kwh") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_f64()
                .filter(|f| f.is_finite())
                .ok_or_else(|| malformed("'estimated_savings_kwh' is not a number"))?,
        ),
    };

    Ok(Recommendation {
        workload: workload.clone(),
        action,
        parameters,
        confidence,
        rationale,
        estimated_savings_kwh,
        created_at: now,
        expires_at: now + ttl,
    })
}

fn parse_parameters(map: &Map<String, Value>) -> Result<TargetParameters, OracleError> {
    let replicas = optional_u64(map, "replicas")?
        .map(|r| u32::try_from(r).map_err(|_| malformed("'replicas' out of range")))
        .transpose()?;
    let cpu_millicores = optional_u64(map, "cpu_millicores")?
        .map(|c| u32::try_from(c).map_err(|_| malformed("'cpu_millicores' out of range")))
        .transpose()?;
    let memory_bytes = optional_u64(map, "memory_bytes")?;

    Ok(TargetParameters {
        replicas,
        cpu_millicores,
        memory_bytes,
    })
}

fn optional_u64(map: &Map<String, Value>, key: &str) -> Result<Option<u64>, OracleError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| malformed(format!("'{}' is not a non-negative integer", key))),
    }
}
