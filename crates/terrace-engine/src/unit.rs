//! Execution units: stage labels and state classification
//!
//! An execution unit is a Kubernetes Job created for one (resource, stage,
//! generation). The engine only ever writes its correlation labels and reads
//! back `status.{active,succeeded,failed,conditions}`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use kube::api::ObjectMeta;
use terrace_common::{
    Error, COMPONENT_EXECUTOR, LABEL_COMPONENT, LABEL_GENERATION, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_TERRACE, LABEL_OWNER_NAME, LABEL_OWNER_NAMESPACE, LABEL_OWNER_UID,
    LABEL_RETRY, LABEL_STAGE,
};

/// Workflow stage an execution unit runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// terraform plan
    Plan,
    /// terraform apply
    Apply,
    /// terraform destroy
    Destroy,
    /// Policy check against the plan
    Verify,
}

impl Stage {
    /// Label value for this stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            "destroy" => Ok(Self::Destroy),
            "verify" => Ok(Self::Verify),
            other => Err(Error::validation(format!("unknown stage label: {other}"))),
        }
    }
}

/// State of a unit as seen by the stage workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// At least one pod succeeded
    Complete,
    /// The unit failed
    Failed,
    /// Anything else
    Active,
}

/// Classify a unit, checking completion first, then failure
pub fn classify(unit: &Job) -> UnitState {
    if is_complete(unit) {
        UnitState::Complete
    } else if is_failed(unit) {
        UnitState::Failed
    } else {
        UnitState::Active
    }
}

fn counts(unit: &Job) -> (i32, i32, i32) {
    let status = unit.status.as_ref();
    (
        status.and_then(|s| s.active).unwrap_or(0),
        status.and_then(|s| s.succeeded).unwrap_or(0),
        status.and_then(|s| s.failed).unwrap_or(0),
    )
}

fn has_true_condition(status: Option<&JobStatus>, type_: &str) -> bool {
    status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
        .unwrap_or(false)
}

/// True once any pod of the unit succeeded
pub fn is_complete(unit: &Job) -> bool {
    let (_, succeeded, _) = counts(unit);
    succeeded > 0
}

/// True when a pod failed or the Job carries a `Failed=True` condition
pub fn is_failed(unit: &Job) -> bool {
    let (_, _, failed) = counts(unit);
    failed > 0 || has_true_condition(unit.status.as_ref(), "Failed")
}

/// Permissive activity check
///
/// True when anything is running, or nothing has succeeded, or nothing has
/// failed, or no conditions were recorded. This overlaps with both
/// [`is_complete`] and [`is_failed`]; callers should go through [`classify`].
pub fn is_active(unit: &Job) -> bool {
    let (active, succeeded, failed) = counts(unit);
    let no_conditions = unit
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(true, |c| c.is_empty());
    active > 0 || succeeded == 0 || failed == 0 || no_conditions
}

/// Strict activity check: running, or neither succeeded nor failed yet
pub fn is_active_strict(unit: &Job) -> bool {
    let (active, succeeded, failed) = counts(unit);
    active > 0 || (succeeded == 0 && failed == 0)
}

/// Message of the `Failed=True` condition, if any
pub fn failure_message(unit: &Job) -> Option<String> {
    unit.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .and_then(|c| c.message.clone())
        })
}

/// Stage label of a unit, if present and valid
pub fn stage_of(unit: &Job) -> Option<Stage> {
    label(unit, LABEL_STAGE).and_then(|v| v.parse().ok())
}

/// Generation label of a unit, if present and numeric
pub fn generation_of(unit: &Job) -> Option<i64> {
    label(unit, LABEL_GENERATION).and_then(|v| v.parse().ok())
}

/// Retry marker a unit was created for, in unix seconds
pub fn retry_of(unit: &Job) -> Option<i64> {
    label(unit, LABEL_RETRY).and_then(|v| v.parse().ok())
}

/// Owner UID label of a unit
pub fn owner_uid_of(unit: &Job) -> Option<&str> {
    label(unit, LABEL_OWNER_UID)
}

/// Creation timestamp of a unit
pub fn created_at(unit: &Job) -> Option<DateTime<Utc>> {
    unit.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

fn label<'a>(unit: &'a Job, key: &str) -> Option<&'a str> {
    unit.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Correlation labels for a unit owned by `owner`
///
/// A unit created in answer to a retry marker carries the marker's whole
/// seconds, so it stays correlated however its creation time is rounded.
pub fn unit_labels(
    stage: Stage,
    generation: i64,
    retry: Option<DateTime<Utc>>,
    owner: &ObjectMeta,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_TERRACE.to_string(),
    );
    labels.insert(LABEL_COMPONENT.to_string(), COMPONENT_EXECUTOR.to_string());
    labels.insert(LABEL_STAGE.to_string(), stage.to_string());
    labels.insert(LABEL_GENERATION.to_string(), generation.to_string());
    if let Some(marker) = retry {
        labels.insert(LABEL_RETRY.to_string(), marker.timestamp().to_string());
    }
    if let Some(uid) = &owner.uid {
        labels.insert(LABEL_OWNER_UID.to_string(), uid.clone());
    }
    if let Some(name) = &owner.name {
        labels.insert(LABEL_OWNER_NAME.to_string(), name.clone());
    }
    if let Some(namespace) = &owner.namespace {
        labels.insert(LABEL_OWNER_NAMESPACE.to_string(), namespace.clone());
    }
    labels
}

/// Parse a retry marker: RFC 3339 or unix seconds
pub fn parse_retry_marker(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
