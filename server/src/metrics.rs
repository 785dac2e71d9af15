use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "plts_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref MESSAGES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "plts_messages_dropped_total",
        "Messages dropped (unknown topic, scheduling failure, or timeout)"
    ))
    .unwrap();
    pub static ref READINGS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "plts_readings_persisted_total",
        "Readings written to the time-series store"
    ))
    .unwrap();
    pub static ref PERSIST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "plts_persist_failures_total",
        "Reading writes that failed after connection retries"
    ))
    .unwrap();
    pub static ref ALERTS_FIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "plts_alerts_fired_total",
        "Threshold alerts produced by the evaluator"
    ))
    .unwrap();
    pub static ref PIPELINE_TIMEOUTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "plts_pipeline_timeouts_total",
        "Messages whose pipeline completion wait expired"
    ))
    .unwrap();
    pub static ref WS_CLIENTS: Gauge = Gauge::with_opts(Opts::new(
        "plts_ws_clients",
        "Currently connected live feed subscribers"
    ))
    .unwrap();
    pub static ref PIPELINE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "plts_pipeline_latency_seconds",
            "Time to persist, evaluate and broadcast one reading"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(MESSAGES_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(READINGS_PERSISTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PERSIST_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_FIRED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PIPELINE_TIMEOUTS_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(WS_CLIENTS.clone())).unwrap();
    REGISTRY
        .register(Box::new(PIPELINE_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
