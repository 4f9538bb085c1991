//! Thin `prometheus` wrapper: `register_*!` macros for lazily-registered
//! collectors plus a `StatusTimer` that tags its histogram observation
//! with an outcome label on finish.

use std::time::Instant;

use prometheus::{
    Encoder,
    HistogramVec,
    IntCounterVec,
    IntGaugeVec,
    TextEncoder,
};

pub use prometheus::register_histogram_vec as __register_histogram_vec;
pub use prometheus::register_int_counter_vec as __register_int_counter_vec;
pub use prometheus::register_int_gauge_vec as __register_int_gauge_vec;

/// Registers a lazily-initialized `HistogramVec` behind a `LazyLock`.
#[macro_export]
macro_rules! register_histogram {
    ($name:ident, $help:expr, $labels:expr) => {
        static $name: std::sync::LazyLock<prometheus::HistogramVec> = std::sync::LazyLock::new(
            || {
                $crate::__register_histogram_vec!(stringify!($name), $help, $labels)
                    .expect("failed to register histogram")
            },
        );
    };
}

#[macro_export]
macro_rules! register_counter {
    ($name:ident, $help:expr, $labels:expr) => {
        static $name: std::sync::LazyLock<prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::__register_int_counter_vec!(stringify!($name), $help, $labels)
                    .expect("failed to register counter")
            });
    };
}

#[macro_export]
macro_rules! register_gauge {
    ($name:ident, $help:expr, $labels:expr) => {
        static $name: std::sync::LazyLock<prometheus::IntGaugeVec> = std::sync::LazyLock::new(
            || {
                $crate::__register_int_gauge_vec!(stringify!($name), $help, $labels)
                    .expect("failed to register gauge")
            },
        );
    };
}

pub fn log_counter(counter: &IntCounterVec, labels: &[&str], value: i64) {
    counter.with_label_values(labels).inc_by(value.max(0) as u64);
}

pub fn log_gauge(gauge: &IntGaugeVec, labels: &[&str], value: i64) {
    gauge.with_label_values(labels).set(value);
}

/// A timer that records its elapsed duration into a histogram on
/// `finish()`, tagged with an outcome label.
pub struct StatusTimer<'a> {
    histogram: &'a HistogramVec,
    start: Instant,
    status: &'static str,
}

impl<'a> StatusTimer<'a> {
    pub fn new(histogram: &'a HistogramVec) -> Self {
        Self {
            histogram,
            start: Instant::now(),
            status: "success",
        }
    }

    pub fn set_status(&mut self, status: &'static str) {
        self.status = status;
    }

    pub fn finish(self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.histogram
            .with_label_values(&[self.status])
            .observe(elapsed);
    }
}

pub fn render_text() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .expect("failed to encode metrics");
    String::from_utf8(buffer).expect("metrics output must be utf8")
}

#[cfg(test)]
mod tests {
    use super::*;

    register_histogram!(TEST_TIMER_SECONDS, "test timer", &["status"]);
    register_counter!(TEST_EVICTIONS_TOTAL, "test counter", &["reason"]);

    #[test]
    fn timer_records_an_observation() {
        let timer = StatusTimer::new(&TEST_TIMER_SECONDS);
        timer.finish();
        assert_eq!(
            TEST_TIMER_SECONDS
                .with_label_values(&["success"])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn counter_increments() {
        log_counter(&TEST_EVICTIONS_TOTAL, &["ttl"], 1);
        assert_eq!(TEST_EVICTIONS_TOTAL.with_label_values(&["ttl"]).get(), 1);
    }
}
