use metrics::{counter, gauge, histogram};

use crate::labels;

/// Metric names under: {ns}_hbrp_*, {ns}_ob_*, {ns}_call_*
#[derive(Clone, Copy)]
pub struct HubMetrics {
    ns: &'static str,
}

impl HubMetrics {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn hbrp_rx(&self, bytes: usize) {
        counter!(format!("{}_hbrp_rx_packets_total", self.ns)).increment(1);
        counter!(format!("{}_hbrp_rx_bytes_total", self.ns)).increment(bytes as u64);
    }

    #[inline]
    pub fn hbrp_tx(&self, bytes: usize) {
        counter!(format!("{}_hbrp_tx_packets_total", self.ns)).increment(1);
        counter!(format!("{}_hbrp_tx_bytes_total", self.ns)).increment(bytes as u64);
    }

    #[inline]
    pub fn hbrp_drop(&self, reason: &'static str) {
        counter!(format!("{}_hbrp_drops_total", self.ns), "reason" => labels::drop_reason(reason))
            .increment(1);
    }

    #[inline]
    pub fn ob_rx(&self, bytes: usize) {
        counter!(format!("{}_ob_rx_packets_total", self.ns)).increment(1);
        counter!(format!("{}_ob_rx_bytes_total", self.ns)).increment(bytes as u64);
    }

    #[inline]
    pub fn ob_tx(&self, fanout: usize) {
        counter!(format!("{}_ob_tx_packets_total", self.ns)).increment(fanout as u64);
    }

    #[inline]
    pub fn ob_drop(&self, reason: &'static str) {
        counter!(format!("{}_ob_drops_total", self.ns), "reason" => labels::drop_reason(reason))
            .increment(1);
    }

    #[inline]
    pub fn call_started(&self) {
        counter!(format!("{}_call_started_total", self.ns)).increment(1);
        gauge!(format!("{}_call_active", self.ns)).increment(1.0);
    }

    #[inline]
    pub fn call_ended(&self, loss: f64, duration_s: f64) {
        gauge!(format!("{}_call_active", self.ns)).decrement(1.0);
        histogram!(format!("{}_call_loss", self.ns)).record(loss);
        histogram!(format!("{}_call_duration_seconds", self.ns)).record(duration_s);
    }

    #[inline]
    pub fn subscription_workers(&self, n: usize) {
        gauge!(format!("{}_subscription_workers", self.ns)).set(n as f64);
    }
}
