//! `node.operation_mode` gauge (spec.md §6).
//!
//! Shaped after the teacher's `Event`/`EventSink` pair (`ec_interface.rs`):
//! a typed value plus a pluggable sink, so production can wire a real
//! metrics registry in and tests can assert against a recorded value
//! without pulling in a metrics crate this crate doesn't otherwise need.

use crate::mode::Mode;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait MetricsSink: Send + Sync {
    fn set_operation_mode(&self, code: i64);
}

pub struct AtomicGauge(AtomicI64);

impl AtomicGauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for AtomicGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for AtomicGauge {
    fn set_operation_mode(&self, code: i64) {
        self.0.store(code, Ordering::SeqCst);
    }
}

pub fn record_mode(sink: &dyn MetricsSink, mode: Mode) {
    sink.set_operation_mode(mode.metric_code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_the_coded_value_for_each_mode() {
        let gauge = AtomicGauge::new();
        record_mode(&gauge, Mode::Normal);
        assert_eq!(gauge.get(), 3);
        record_mode(&gauge, Mode::Decommissioned);
        assert_eq!(gauge.get(), 5);
    }
}
