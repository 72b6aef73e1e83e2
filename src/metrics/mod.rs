//! Prometheus metrics for the K8up operator
//!
//! Metric families live in the process-wide default registry and are labelled
//! by controller name. [`MetricsRegistry`] owns the endpoint serving them.

mod registry;
mod server;

pub use registry::{parse_bind_address, MetricsRegistry};

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "k8up_operator_reconciliations_total",
        "Total number of reconciliations",
        &["controller"]
    ).unwrap();

    /// Total number of failed reconciliations
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "k8up_operator_reconciliation_errors_total",
        "Total number of failed reconciliations",
        &["controller"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "k8up_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["controller"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Work items re-queued after a failure
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "k8up_operator_retries_total",
        "Total number of work items re-queued after a failed reconcile",
        &["controller"]
    ).unwrap();

    /// Work items dropped after exhausting their retries
    pub static ref PERMANENT_FAILURES: CounterVec = register_counter_vec!(
        "k8up_operator_permanent_failures_total",
        "Total number of work items dropped as permanently failed",
        &["controller"]
    ).unwrap();

    /// Handler panics caught at the worker boundary
    pub static ref HANDLER_PANICS: CounterVec = register_counter_vec!(
        "k8up_operator_handler_panics_total",
        "Total number of handler panics caught by workers",
        &["controller"]
    ).unwrap();

    /// Resync ticks
    pub static ref RESYNCS: CounterVec = register_counter_vec!(
        "k8up_operator_resyncs_total",
        "Total number of full resyncs",
        &["controller"]
    ).unwrap();

    /// Pending work items
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "k8up_operator_queue_depth",
        "Number of work items waiting for a worker",
        &["controller"]
    ).unwrap();

    /// Records known to each controller
    pub static ref KNOWN_RECORDS: GaugeVec = register_gauge_vec!(
        "k8up_operator_known_records",
        "Number of resources known to a controller",
        &["controller"]
    ).unwrap();

    /// Controllers that terminated with an error
    pub static ref CONTROLLER_FAILURES: CounterVec = register_counter_vec!(
        "k8up_operator_controller_failures_total",
        "Total number of controllers that terminated with an error",
        &["controller"]
    ).unwrap();

    /// Child workload events correlated to a parent
    pub static ref CHILD_EVENTS: CounterVec = register_counter_vec!(
        "k8up_operator_child_events_total",
        "Child workload events correlated to an owning resource",
        &["child", "phase"]
    ).unwrap();

    /// Child workload events without a resolvable owner
    pub static ref CORRELATION_MISSES: CounterVec = register_counter_vec!(
        "k8up_operator_correlation_misses_total",
        "Child workload events dropped because no owner could be resolved",
        &["child"]
    ).unwrap();

    /// Jobs created for job-backed resources
    pub static ref JOBS_CREATED: CounterVec = register_counter_vec!(
        "k8up_operator_jobs_created_total",
        "Total number of jobs created by kind",
        &["kind"]
    ).unwrap();
}
