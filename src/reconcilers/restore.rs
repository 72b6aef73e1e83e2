//! Restore reconciler

use crate::crd::{Backend, Restore, RunStatus};
use crate::error::{Error, Result};

use super::job::VolumeClaim;
use super::{validate_backend, JobBacked};

/// Mount point of a folder restore target
pub const RESTORE_DIR: &str = "/restore";

/// Validate the Restore spec
pub fn validate(restore: &Restore) -> Result<()> {
    validate_backend(&restore.spec.backend)?;

    let Some(method) = &restore.spec.restore_method else {
        return Err(Error::validation("Restore method must be specified"));
    };

    match (&method.folder, &method.s3) {
        (None, None) => Err(Error::validation(
            "Restore method must configure either folder or s3",
        )),
        (Some(_), Some(_)) => Err(Error::validation(
            "Restore method must configure only one of folder or s3",
        )),
        (Some(folder), None) if folder.claim_name.is_empty() => Err(Error::validation(
            "Folder restore claimName must not be empty",
        )),
        (None, Some(s3)) if s3.endpoint.is_empty() || s3.bucket.is_empty() => Err(
            Error::validation("S3 restore target needs endpoint and bucket"),
        ),
        _ => Ok(()),
    }
}

impl JobBacked for Restore {
    const ACTION: &'static str = "restore";

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
        let mut args = Vec::new();

        let method = self.spec.restore_method.as_ref();
        if method.and_then(|m| m.folder.as_ref()).is_some() {
            args.extend(["-restoreType".to_string(), "folder".to_string()]);
        } else if method.and_then(|m| m.s3.as_ref()).is_some() {
            args.extend(["-restoreType".to_string(), "s3".to_string()]);
        }

        if let Some(snapshot) = &self.spec.snapshot {
            args.extend(["-restoreSnap".to_string(), snapshot.clone()]);
        }

        args
    }

    fn extra_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let method = self.spec.restore_method.as_ref();

        if method.and_then(|m| m.folder.as_ref()).is_some() {
            env.push(("RESTORE_DIR".to_string(), RESTORE_DIR.to_string()));
        }
        if let Some(s3) = method.and_then(|m| m.s3.as_ref()) {
            env.push(("RESTORE_S3ENDPOINT".to_string(), format!("{}/{}", s3.endpoint.trim_end_matches('/'), s3.bucket)));
        }
        if !self.spec.tags.is_empty() {
            env.push(("TAGS".to_string(), self.spec.tags.join(",")));
        }

        env
    }

    fn volumes(&self) -> Vec<VolumeClaim> {
        self.spec
            .restore_method
            .as_ref()
            .and_then(|m| m.folder.as_ref())
            .map(|folder| VolumeClaim {
                claim_name: folder.claim_name.clone(),
                mount_path: RESTORE_DIR.to_string(),
            })
            .into_iter()
            .collect()
    }
}
