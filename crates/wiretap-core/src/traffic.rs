//! Seam between the relay engine and whatever consumes its per-message log
//! lines. The default sink forwards to `tracing`; tests swap in a collector.

use chrono::Local;

/// Receives one formatted line per logged proxy event.
pub trait TrafficLog: Send + Sync {
    fn line(&self, text: &str);
}

/// Default sink: emits each line through `tracing` under the `traffic`
/// target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTrafficLog;

impl TrafficLog for TracingTrafficLog {
    fn line(&self, text: &str) {
        tracing::info!(target: "traffic", "{text}");
    }
}

/// Timestamp in the traffic-line format, `yyyyMMdd-HHmmss.SSS`.
pub fn timestamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S%.3f").to_string()
}
