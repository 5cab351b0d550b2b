//! Injected metrics recording
//!
//! The engine, lanes, and buses record counters through this narrow
//! interface. Recorders are passed in at construction; there is no
//! process-wide registry. The default recorder does nothing.

use std::time::Duration;

/// Narrow metrics sink
pub trait MetricsRecorder: Send + Sync {
    /// Increment a named counter
    fn incr_counter(&self, name: &'static str, value: u64);

    /// Record a gauge reading
    fn record_gauge(&self, name: &'static str, value: f64);

    /// Record an operation duration
    fn observe_duration(&self, name: &'static str, duration: Duration);
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}
    fn record_gauge(&self, _name: &'static str, _value: f64) {}
    fn observe_duration(&self, _name: &'static str, _duration: Duration) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Recorder capturing counters for assertions
    #[derive(Default)]
    pub struct CapturingMetrics {
        pub counters: Mutex<HashMap<&'static str, u64>>,
    }

    impl MetricsRecorder for CapturingMetrics {
        fn incr_counter(&self, name: &'static str, value: u64) {
            *self.counters.lock().entry(name).or_insert(0) += value;
        }

        fn record_gauge(&self, _name: &'static str, _value: f64) {}
        fn observe_duration(&self, _name: &'static str, _duration: Duration) {}
    }

    #[test]
    fn test_capturing_counter() {
        let metrics = CapturingMetrics::default();
        metrics.incr_counter("lane.submitted", 1);
        metrics.incr_counter("lane.submitted", 2);
        assert_eq!(metrics.counters.lock().get("lane.submitted"), Some(&3));
    }
}
