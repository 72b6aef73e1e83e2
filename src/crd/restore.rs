//! Restore Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Backend, RunStatus, S3Spec};

/// Restore resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.appuio.ch",
    version = "v1alpha1",
    kind = "Restore",
    plural = "restores",
    singular = "restore",
    namespaced,
    status = "RunStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Repository to restore from
    pub backend: Backend,

    /// Where restored files are written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_method: Option<RestoreMethod>,

    /// Snapshot ID (latest if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    /// Only restore snapshots carrying these tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Restore target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreMethod {
    /// Restore into a persistent volume claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderRestore>,

    /// Restore as tarballs into an S3 bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Spec>,
}

/// Persistent volume claim target
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FolderRestore {
    /// Claim name
    pub claim_name: String,
}
