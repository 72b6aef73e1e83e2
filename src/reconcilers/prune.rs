//! Prune reconciler

use crate::crd::{Backend, Prune, RetentionPolicy, RunStatus};
use crate::error::{Error, Result};

use super::{validate_backend, JobBacked};

/// Validate the Prune spec
pub fn validate(prune: &Prune) -> Result<()> {
    validate_backend(&prune.spec.backend)?;
    validate_retention(&prune.spec.retention)
}

/// A retention policy must keep something
pub fn validate_retention(retention: &RetentionPolicy) -> Result<()> {
    let keeps = [
        retention.keep_last,
        retention.keep_hourly,
        retention.keep_daily,
        retention.keep_weekly,
        retention.keep_monthly,
        retention.keep_yearly,
    ];

    if keeps.iter().all(Option::is_none) && retention.keep_tags.is_empty() {
        return Err(Error::validation(
            "Retention policy must set at least one keep rule",
        ));
    }

    if keeps.iter().any(|keep| *keep == Some(0)) {
        return Err(Error::validation("Retention keep counts must be greater than zero"));
    }

    Ok(())
}

/// Environment understood by the prune job
pub fn retention_env(retention: &RetentionPolicy) -> Vec<(String, String)> {
    let rules = [
        ("KEEP_LAST", retention.keep_last),
        ("KEEP_HOURLY", retention.keep_hourly),
        ("KEEP_DAILY", retention.keep_daily),
        ("KEEP_WEEKLY", retention.keep_weekly),
        ("KEEP_MONTHLY", retention.keep_monthly),
        ("KEEP_YEARLY", retention.keep_yearly),
    ];

    let mut env: Vec<(String, String)> = rules
        .into_iter()
        .filter_map(|(name, keep)| keep.map(|n| (name.to_string(), n.to_string())))
        .collect();

    if !retention.keep_tags.is_empty() {
        env.push(("KEEP_TAGS".to_string(), retention.keep_tags.join(",")));
    }

    env
}

impl JobBacked for Prune {
    const ACTION: &'static str = "prune";

    fn backend(&self) -> &Backend {
        &self.spec.backend
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    fn validate(&self) -> Result<()> {
        validate(self)
    }

    fn extra_env(&self) -> Vec<(String, String)> {
        retention_env(&self.spec.retention)
    }
}
