//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; the host process registers a plain callback that
//! receives name/value pairs for every sample.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = fn(name: &str, value: u64);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register the process-wide stats callback. Only the first call wins;
/// returns whether this one was installed.
pub fn register_stats_callback(cb: StatsCallback) -> bool {
    init();
    CALLBACK.set(cb).is_ok()
}

#[inline]
fn emit(key: &Key, value: u64) {
    if let Some(cb) = CALLBACK.get() {
        cb(key.name(), value);
    }
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct CallbackRecorder;

#[derive(Clone)]
struct CallbackCounter {
    key: Key,
}
#[derive(Clone)]
struct CallbackGauge {
    key: Key,
}
#[derive(Clone)]
struct CallbackHistogram {
    key: Key,
}

impl Recorder for CallbackRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CallbackCounter { key: key.clone() }))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(CallbackGauge { key: key.clone() }))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(CallbackHistogram { key: key.clone() }))
    }
}

impl metrics::CounterFn for CallbackCounter {
    fn increment(&self, value: u64) {
        emit(&self.key, value);
    }
    fn absolute(&self, value: u64) {
        emit(&self.key, value);
    }
}

// gauges and histograms are truncated to whole numbers
impl metrics::GaugeFn for CallbackGauge {
    fn set(&self, value: f64) {
        emit(&self.key, value as u64);
    }
    fn increment(&self, value: f64) {
        emit(&self.key, value as u64);
    }
    fn decrement(&self, value: f64) {
        emit(&self.key, value as u64);
    }
}

impl metrics::HistogramFn for CallbackHistogram {
    fn record(&self, value: f64) {
        emit(&self.key, value as u64);
    }
}

/// Install exactly **once**; called whenever a pool is opened.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(CallbackRecorder);
    });
}
