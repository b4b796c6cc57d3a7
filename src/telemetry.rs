//! Bounded in-memory telemetry. No exporter is wired (no dashboard/scrape
//! surface in scope), so this module keeps only the in-process recording
//! surface (ring-buffered, capped) and the `metrics` crate's counter/gauge
//! macros for call-site ergonomics.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TelemetryConfig;

#[derive(Debug, Clone)]
pub struct HistogramSample {
    pub value: f64,
    pub at_millis: i64,
}

struct Inner {
    counters: std::collections::HashMap<String, u64>,
    gauges: std::collections::HashMap<String, f64>,
    histograms: std::collections::HashMap<String, VecDeque<HistogramSample>>,
    series_order: VecDeque<String>,
    cfg: TelemetryConfig,
}

/// In-process metrics recorder. Caps every map so long-running sessions
/// can't leak memory through unbounded label cardinality.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Mutex<Inner>>,
}

impl Telemetry {
    pub fn new(cfg: TelemetryConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                counters: std::collections::HashMap::new(),
                gauges: std::collections::HashMap::new(),
                histograms: std::collections::HashMap::new(),
                series_order: VecDeque::new(),
                cfg,
            })),
        }
    }

    fn touch_series(inner: &mut Inner, key: &str) {
        if !inner.series_order.contains(&key.to_string()) {
            if inner.series_order.len() >= inner.cfg.max_series {
                inner.series_order.pop_front();
            }
            inner.series_order.push_back(key.to_string());
        }
    }

    pub fn incr_counter(&self, key: &str, delta: u64) {
        let mut inner = self.inner.lock();
        if inner.counters.len() >= inner.cfg.max_counters && !inner.counters.contains_key(key) {
            return;
        }
        *inner.counters.entry(key.to_string()).or_insert(0) += delta;
        metrics::counter!(key.to_string()).increment(delta);
    }

    pub fn set_gauge(&self, key: &str, value: f64) {
        let mut inner = self.inner.lock();
        if inner.gauges.len() >= inner.cfg.max_gauges && !inner.gauges.contains_key(key) {
            return;
        }
        inner.gauges.insert(key.to_string(), value);
        metrics::gauge!(key.to_string()).set(value);
    }

    pub fn record_histogram(&self, key: &str, value: f64, at_millis: i64) {
        let mut inner = self.inner.lock();
        if inner.histograms.len() >= inner.cfg.max_histograms
            && !inner.histograms.contains_key(key)
        {
            return;
        }
        Self::touch_series(&mut inner, key);
        let cap = inner.cfg.max_histogram_samples;
        let entry = inner.histograms.entry(key.to_string()).or_default();
        if entry.len() >= cap {
            entry.pop_front();
        }
        entry.push_back(HistogramSample { value, at_millis });
        metrics::histogram!(key.to_string()).record(value);
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.inner.lock().counters.get(key).copied().unwrap_or(0)
    }

    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.inner.lock().gauges.get(key).copied()
    }

    pub fn histogram_len(&self, key: &str) -> usize {
        self.inner
            .lock()
            .histograms
            .get(key)
            .map(|h| h.len())
            .unwrap_or(0)
    }
}
