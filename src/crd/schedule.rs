//! Schedule Custom Resource Definition

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Backend, Condition, RetentionPolicy};

/// Schedule resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.appuio.ch",
    version = "v1alpha1",
    kind = "Schedule",
    plural = "schedules",
    singular = "schedule",
    namespaced,
    status = "ScheduleStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Repository used by every scheduled run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<ScheduledRun>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<ScheduledRun>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<ScheduledRun>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune: Option<ScheduledPrune>,
}

/// One recurring run
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRun {
    /// Cron expression (5, 6 or 7 fields)
    pub schedule: String,
}

/// Recurring prune with its retention rules
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledPrune {
    /// Cron expression (5, 6 or 7 fields)
    pub schedule: String,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

/// Schedule status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    /// Current phase (Ready, Failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Next fire time per scheduled run
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub next_runs: BTreeMap<String, DateTime<Utc>>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
