// Prometheus metrics for the API process

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Run requests by admission result: accepted, rejected, invalid, error
    pub static ref RUN_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "runroom_run_requests_total",
        "Run requests received, by admission result",
        &["result"]
    )
    .expect("run request counter can be registered");

    pub static ref OPEN_CONNECTIONS: IntGauge = register_int_gauge!(
        "runroom_ws_connections",
        "Realtime connections currently open on this instance"
    )
    .expect("connection gauge can be registered");
}

pub fn record_run(result: &str) {
    RUN_REQUESTS.with_label_values(&[result]).inc();
}

/// Everything in the default registry, in the text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
