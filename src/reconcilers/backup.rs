//! Backup reconciler

use crate::crd::{Backend, Backup, RunStatus};
use crate::error::{Error, Result};

use super::{validate_backend, JobBacked};

/// Validate the Backup spec
pub fn validate(backup: &Backup) -> Result<()> {
    validate_backend(&backup.spec.backend)?;

    if let Some(keep_jobs) = backup.spec.keep_jobs {
        if keep_jobs < 0 {
            return Err(Error::validation(format!(
                "Invalid keepJobs {}: must not be negative",
                keep_jobs
            )));
        }
    }

    if backup.spec.tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(Error::validation("Backup tags must not be empty"));
    }

    Ok(())
}

impl JobBacked for Backup {
    const ACTION: &'static str = "backup";

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
        if self.spec.tags.is_empty() {
            Vec::new()
        } else {
            vec![("TAGS".to_string(), self.spec.tags.join(","))]
        }
    }
}
