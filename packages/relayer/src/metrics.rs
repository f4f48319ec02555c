//! Prometheus metrics for the hub chain relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Shadow ledger metrics
    pub static ref RELAY_CYCLES: CounterVec = register_counter_vec!(
        "relayer_relay_cycles_total",
        "Relay cycles run, by result",
        &["result"]
    ).unwrap();

    pub static ref RELAY_STEPS: CounterVec = register_counter_vec!(
        "relayer_relay_steps_total",
        "Shadow ledger extension attempts, by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref SHADOW_TOP_HEIGHT: Gauge = register_gauge!(
        "relayer_shadow_top_height",
        "Source height of the shadow ledger top seen in the last cycle"
    ).unwrap();

    pub static ref SOURCE_TOP_HEIGHT: GaugeVec = register_gauge_vec!(
        "relayer_source_top_height",
        "Best height reported by the source chain",
        &["chain"]
    ).unwrap();

    // Transport metrics
    pub static ref TASK_VERDICTS: CounterVec = register_counter_vec!(
        "relayer_task_verdicts_total",
        "Transport task workers finished, by verdict",
        &["verdict"]
    ).unwrap();

    pub static ref TASK_ACTIONS: CounterVec = register_counter_vec!(
        "relayer_task_actions_total",
        "Transport contract writes, by action and outcome",
        &["action", "outcome"]
    ).unwrap();

    pub static ref ACTIVE_TASK_WORKERS: Gauge = register_gauge!(
        "relayer_active_task_workers",
        "Task workers currently holding a pool slot"
    ).unwrap();

    pub static ref KNOWN_TASKS: Gauge = register_gauge!(
        "relayer_known_tasks",
        "Task count reported by the transport contract"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).unwrap();
}
