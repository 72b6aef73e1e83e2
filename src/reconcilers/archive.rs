//! Archive reconciler

use crate::crd::{Archive, Backend, RunStatus};
use crate::error::{Error, Result};

use super::{validate_backend, JobBacked};

/// Validate the Archive spec
pub fn validate(archive: &Archive) -> Result<()> {
    validate_backend(&archive.spec.backend)?;

    let s3 = archive
        .spec
        .restore_method
        .as_ref()
        .and_then(|m| m.s3.as_ref())
        .ok_or_else(|| Error::validation("Archive needs an s3 restore method"))?;

    if s3.endpoint.is_empty() || s3.bucket.is_empty() {
        return Err(Error::validation(
            "Archive s3 target needs endpoint and bucket",
        ));
    }

    Ok(())
}

impl JobBacked for Archive {
    const ACTION: &'static str = "archive";

    fn backend(&self) -> &Backend {
        &self.spec.backend
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    fn validate(&self) -> Result<()> {
        validate(self)
    }

    fn extra_args(&self) -> Vec<String> {
        vec!["-restoreType".to_string(), "s3".to_string()]
    }

    fn extra_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(s3) = self.spec.restore_method.as_ref().and_then(|m| m.s3.as_ref()) {
            env.push(("RESTORE_S3ENDPOINT".to_string(), format!("{}/{}", s3.endpoint.trim_end_matches('/'), s3.bucket)));
        }
        if !self.spec.tags.is_empty() {
            env.push(("TAGS".to_string(), self.spec.tags.join(",")));
        }
        env
    }
}
