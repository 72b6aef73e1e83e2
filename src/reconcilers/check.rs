//! Check reconciler

use crate::crd::{Backend, Check, RunStatus};
use crate::error::Result;

use super::{validate_backend, JobBacked};

/// Validate the Check spec
pub fn validate(check: &Check) -> Result<()> {
    validate_backend(&check.spec.backend)
}

impl JobBacked for Check {
    const ACTION: &'static str = "check";

    fn backend(&self) -> &Backend {
        &self.spec.backend
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    fn validate(&self) -> Result<()> {
        validate(self)
    }
}
