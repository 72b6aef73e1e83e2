//! Custom Resource Definitions for the K8up operator

mod archive;
mod backup;
mod check;
mod prebackup_pod;
mod prune;
mod restore;
mod schedule;

pub use archive::*;
pub use backup::*;
pub use check::*;
pub use prebackup_pod::*;
pub use prune::*;
pub use restore::*;
pub use schedule::*;

use kube::CustomResourceExt;

/// API group of every K8up resource
pub const API_GROUP: &str = "backup.appuio.ch";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![
        serde_yaml::to_string(&Backup::crd()).unwrap(),
        serde_yaml::to_string(&Restore::crd()).unwrap(),
        serde_yaml::to_string(&Archive::crd()).unwrap(),
        serde_yaml::to_string(&Check::crd()).unwrap(),
        serde_yaml::to_string(&Prune::crd()).unwrap(),
        serde_yaml::to_string(&Schedule::crd()).unwrap(),
        serde_yaml::to_string(&PreBackupPod::crd()).unwrap(),
    ]
}
