//! Archive Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Backend, RestoreMethod, RunStatus};

/// Archive resource specification
///
/// Exports the latest snapshot of every host as tarballs.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.appuio.ch",
    version = "v1alpha1",
    kind = "Archive",
    plural = "archives",
    singular = "archive",
    namespaced,
    status = "RunStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSpec {
    /// Repository to archive
    pub backend: Backend,

    /// Archive destination, must be S3
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_method: Option<RestoreMethod>,

    /// Only archive snapshots carrying these tags
    #[serde(default)]
    pub tags: Vec<String>,
}
