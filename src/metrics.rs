//! Prometheus metrics for the agent runtime
//!
//! All metrics live in the default registry and are exported in text
//! exposition format by [`encode_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished agent tasks by terminal status.
    ///
    /// Labels:
    /// - status: "completed", "error", "halted", "incomplete"
    pub static ref AGENT_TASKS: CounterVec = register_counter_vec!(
        "neurosurf_agent_tasks_total",
        "Agent tasks by terminal status",
        &["status"]
    ).expect("failed to register AGENT_TASKS metric");

    /// Tool-dispatch iterations per task.
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "neurosurf_agent_iterations",
        "Tool-dispatch iterations per agent task",
        vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]
    ).expect("failed to register AGENT_ITERATIONS metric");

    /// Generation calls by role.
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "neurosurf_llm_call_duration_seconds",
        "Duration of generation service calls",
        &["role"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Tool Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tool calls by tool and outcome.
    ///
    /// Labels:
    /// - tool: registered tool name ("unknown" for unregistered names)
    /// - status: "success", "validation", "execution", "timeout", "unknown_tool"
    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "neurosurf_tool_calls_total",
        "Tool calls by tool and outcome",
        &["tool", "status"]
    ).expect("failed to register TOOL_CALLS metric");

    pub static ref TOOL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "neurosurf_tool_call_duration_seconds",
        "Duration of tool handler execution",
        &["tool"]
    ).expect("failed to register TOOL_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Scheduler Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Capacity currently held by loaded roles.
    pub static ref SCHEDULER_USAGE: Gauge = register_gauge!(
        "neurosurf_scheduler_usage",
        "Capacity held by loaded model roles"
    ).expect("failed to register SCHEDULER_USAGE metric");

    pub static ref SCHEDULER_BUDGET: Gauge = register_gauge!(
        "neurosurf_scheduler_budget",
        "Configured model capacity budget"
    ).expect("failed to register SCHEDULER_BUDGET metric");

    pub static ref MODEL_LOADS: CounterVec = register_counter_vec!(
        "neurosurf_model_loads_total",
        "Model admissions by role",
        &["role"]
    ).expect("failed to register MODEL_LOADS metric");

    pub static ref MODEL_EVICTIONS: CounterVec = register_counter_vec!(
        "neurosurf_model_evictions_total",
        "Model evictions by role",
        &["role"]
    ).expect("failed to register MODEL_EVICTIONS metric");

    /// Requests rejected because the role cannot fit the budget.
    pub static ref SCHEDULER_EXHAUSTED: CounterVec = register_counter_vec!(
        "neurosurf_scheduler_exhausted_total",
        "Model requests rejected for lack of capacity",
        &["role"]
    ).expect("failed to register SCHEDULER_EXHAUSTED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Output Stream Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Events dropped because the consumer was slow or gone.
    pub static ref SINK_DROPPED: Counter = register_counter!(
        "neurosurf_sink_dropped_total",
        "Output events dropped by the best-effort sink"
    ).expect("failed to register SINK_DROPPED metric");
}

/// Render every registered metric in Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
