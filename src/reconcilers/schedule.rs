//! Schedule reconciler
//!
//! Validates the cron expressions of a Schedule and publishes the next fire
//! time of every scheduled run in its status.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use kube::{
    api::{Patch, PatchParams},
    Api, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::job::FIELD_MANAGER;
use super::{prune, validate_backend};
use crate::controller::Handler;
use crate::crd::Schedule;
use crate::error::{Error, Result};
use crate::observe::CommonObjects;

const PHASE_READY: &str = "Ready";
const PHASE_FAILED: &str = "Failed";

/// Parse a cron expression, accepting the standard 5-field form
pub fn parse_cron(expression: &str) -> Result<CronSchedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };

    CronSchedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("Invalid cron schedule '{}': {}", expression, e)))
}

/// Cron expression of every configured run, keyed by run name
fn runs(schedule: &Schedule) -> Vec<(&'static str, &str)> {
    let spec = &schedule.spec;
    let mut runs = Vec::new();
    if let Some(run) = &spec.backup {
        runs.push(("backup", run.schedule.as_str()));
    }
    if let Some(run) = &spec.check {
        runs.push(("check", run.schedule.as_str()));
    }
    if let Some(run) = &spec.archive {
        runs.push(("archive", run.schedule.as_str()));
    }
    if let Some(run) = &spec.prune {
        runs.push(("prune", run.schedule.as_str()));
    }
    runs
}

/// Validate the Schedule spec
pub fn validate(schedule: &Schedule) -> Result<()> {
    let runs = runs(schedule);
    if runs.is_empty() {
        return Err(Error::validation(
            "Schedule must configure at least one of backup, check, archive or prune",
        ));
    }

    if let Some(backend) = &schedule.spec.backend {
        validate_backend(backend)?;
    }

    for (_, expression) in runs {
        parse_cron(expression)?;
    }

    if let Some(prune) = &schedule.spec.prune {
        prune::validate_retention(&prune.retention)?;
    }

    Ok(())
}

/// Next fire time after `now` of every configured run
pub fn next_runs(schedule: &Schedule, now: DateTime<Utc>) -> Result<BTreeMap<String, DateTime<Utc>>> {
    let mut next = BTreeMap::new();
    for (name, expression) in runs(schedule) {
        if let Some(time) = parse_cron(expression)?.after(&now).next() {
            next.insert(name.to_string(), time);
        }
    }
    Ok(next)
}

/// Handler of the schedule controller
pub struct ScheduleHandler {
    common: CommonObjects,
}

impl ScheduleHandler {
    pub fn new(common: CommonObjects) -> Self {
        Self { common }
    }

    async fn patch_status(&self, schedule: &Schedule, namespace: &str, status: serde_json::Value) -> Result<()> {
        let api: Api<Schedule> = Api::namespaced(self.common.client.clone(), namespace);
        api.patch_status(
            &schedule.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Handler<Schedule> for ScheduleHandler {
    #[instrument(skip(self, schedule), fields(name = %schedule.name_any(), namespace = schedule.namespace()))]
    async fn reconcile(&self, schedule: Arc<Schedule>) -> Result<()> {
        let namespace = schedule.namespace().unwrap_or_else(|| "default".to_string());
        let generation = schedule.metadata.generation;

        if let Err(e) = validate(&schedule) {
            warn!(error = %e, "Validation failed");
            let already_failed = schedule.status.as_ref().is_some_and(|s| {
                s.phase.as_deref() == Some(PHASE_FAILED) && s.observed_generation == generation
            });
            if !already_failed {
                self.patch_status(
                    &schedule,
                    &namespace,
                    json!({
                        "phase": PHASE_FAILED,
                        "message": e.to_string(),
                        "observedGeneration": generation,
                        "conditions": [{
                            "type": "Ready",
                            "status": "False",
                            "lastTransitionTime": Utc::now(),
                            "reason": "ValidationFailed",
                            "message": e.to_string()
                        }]
                    }),
                )
                .await?;
            }
            return Ok(());
        }

        let next = next_runs(&schedule, Utc::now())?;
        let unchanged = schedule.status.as_ref().is_some_and(|s| {
            s.phase.as_deref() == Some(PHASE_READY)
                && s.observed_generation == generation
                && s.next_runs == next
        });
        if unchanged {
            debug!("Schedule status up to date");
            return Ok(());
        }

        info!(runs = next.len(), "Schedule is active");
        self.patch_status(
            &schedule,
            &namespace,
            json!({
                "phase": PHASE_READY,
                "message": "Schedule is active",
                "nextRuns": next,
                "observedGeneration": generation,
                "conditions": [{
                    "type": "Ready",
                    "status": "True",
                    "lastTransitionTime": Utc::now(),
                    "reason": "ScheduleActive",
                    "message": "Schedule is configured and active"
                }]
            }),
        )
        .await
    }
}
