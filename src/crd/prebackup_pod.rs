//! PreBackupPod Custom Resource Definition
//!
//! Registered at startup but not reconciled by this operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PreBackupPod resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.appuio.ch",
    version = "v1alpha1",
    kind = "PreBackupPod",
    plural = "prebackuppods",
    singular = "prebackuppod",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PreBackupPodSpec {
    /// Command whose stdout is backed up
    pub backup_command: String,

    /// File extension of the backed up stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,

    /// Pod started before the backup
    pub pod: PreBackupPodTemplate,
}

/// Minimal pod template for a pre-backup pod
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreBackupPodTemplate {
    /// Container image
    pub image: String,

    /// Container command
    #[serde(default)]
    pub command: Vec<String>,
}
