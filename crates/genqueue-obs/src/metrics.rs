use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, TextEncoder};

pub static TASKS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("genqueue_tasks_submitted_total", "Tasks accepted by the queue").unwrap()
});

pub static TASKS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("genqueue_tasks_rejected_total", "Tasks refused because the queue was full").unwrap()
});

pub static TASKS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("genqueue_tasks_finished_total", "Tasks that reached a terminal status"),
        &["status"]
    )
    .unwrap()
});

/// Tasks held by the store per status, refreshed on scrape.
pub static TASKS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(Opts::new("genqueue_tasks", "Tasks known to the store"), &["status"]).unwrap()
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("genqueue_queue_depth", "Tasks waiting for a worker").unwrap()
});

pub static RUNNING_TASKS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("genqueue_running_tasks", "Tasks currently generating").unwrap()
});

pub static GENERATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    prometheus::register_histogram!(HistogramOpts::new(
        "genqueue_generation_seconds",
        "Wall time of one generation, model load excluded"
    )
    .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]))
    .unwrap()
});

pub static MODEL_LOAD_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    prometheus::register_histogram!(HistogramOpts::new("genqueue_model_load_seconds", "Checkpoint load time")
        .buckets(vec![0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]))
    .unwrap()
});

pub static TOKENS_GENERATED: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("genqueue_tokens_generated_total", "New tokens produced by the decoder").unwrap()
});

pub(crate) fn touch() {
    let _ = &*TASKS_SUBMITTED;
    let _ = &*TASKS_REJECTED;
    let _ = &*TASKS_FINISHED;
    let _ = &*TASKS_BY_STATUS;
    let _ = &*QUEUE_DEPTH;
    let _ = &*RUNNING_TASKS;
    let _ = &*GENERATION_SECONDS;
    let _ = &*MODEL_LOAD_SECONDS;
    let _ = &*TOKENS_GENERATED;
}

/// Renders the default registry in the prometheus text format.
pub fn render() -> (String, Vec<u8>) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = prometheus::Encoder::encode(&encoder, &prometheus::gather(), &mut buffer) {
        tracing::warn!("encoding metrics failed: {e}");
    }
    (prometheus::Encoder::format_type(&encoder).to_string(), buffer)
}
