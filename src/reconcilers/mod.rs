//! Reconcilers for the K8up CRDs
//!
//! Job-backed kinds (backup, restore, archive, check, prune) share
//! [`JobHandler`]: it validates the resource, spawns one job for it and
//! mirrors the job's observed phase into the resource status. Each kind's
//! module holds its validation and the parts of the job specific to it.

pub mod archive;
pub mod backup;
pub mod check;
pub mod job;
pub mod prune;
pub mod restore;
pub mod schedule;

pub use job::{build_job, JobBacked, JobHandler};
pub use schedule::ScheduleHandler;

use crate::crd::Backend;
use crate::error::{Error, Result};

/// Validate a restic repository location
pub fn validate_backend(backend: &Backend) -> Result<()> {
    match (&backend.s3, &backend.local) {
        (None, None) => {
            return Err(Error::validation(
                "Backend must configure either s3 or local storage",
            ))
        }
        (Some(_), Some(_)) => {
            return Err(Error::validation(
                "Backend must configure only one of s3 or local storage",
            ))
        }
        (Some(s3), None) => {
            if s3.endpoint.is_empty() {
                return Err(Error::validation("S3 backend endpoint must not be empty"));
            }
            if s3.bucket.is_empty() {
                return Err(Error::validation("S3 backend bucket must not be empty"));
            }
        }
        (None, Some(path)) => {
            if path.is_empty() {
                return Err(Error::validation("Local backend path must not be empty"));
            }
        }
    }

    if backend.repo_password_secret_ref.is_none() {
        return Err(Error::validation(
            "Backend must reference the repository password secret",
        ));
    }

    Ok(())
}
