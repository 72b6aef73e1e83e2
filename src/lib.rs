//! K8up Kubernetes Operator
//!
//! Runs one reconciliation loop per K8up resource kind (backup, restore,
//! archive, schedule, check, prune) plus the job and pod observers, sharing a
//! metrics registry and a child-workload observer across all of them.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod observe;
pub mod operator;
pub mod reconcilers;
pub mod runtime;

pub use error::{Error, Result};
