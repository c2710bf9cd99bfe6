//! In-process validation metrics.
//!
//! Keeps a bounded window of recent samples, enough to compute latency
//! percentiles and rule_count distributions per mode without an external
//! collector.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use editorial_common::ValidationMode;

const DEFAULT_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Sample {
    mode: ValidationMode,
    latency_ms: f64,
    rule_count: usize,
    cache_hit: bool,
}

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<Sample>,
    errors: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ModeSummary {
    pub count: usize,
    pub cache_hits: usize,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub max_latency_ms: f64,
    pub rule_count_histogram: BTreeMap<usize, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub window: usize,
    pub modes: BTreeMap<String, ModeSummary>,
    pub errors: BTreeMap<String, u64>,
}

pub struct ValidationMetrics {
    capacity: usize,
    inner: Mutex<Window>,
}

impl Default for ValidationMetrics {
    fn default() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }
}

impl ValidationMetrics {
    pub fn with_window(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Window::default()),
        }
    }

    pub fn record(
        &self,
        mode: ValidationMode,
        latency_ms: f64,
        rule_count: usize,
        cache_hit: bool,
    ) {
        info!(
            mode = %mode,
            latency_ms,
            rule_count,
            cache_hit,
            "validation completed"
        );
        let Ok(mut window) = self.inner.lock() else {
            return;
        };
        if window.samples.len() == self.capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(Sample {
            mode,
            latency_ms,
            rule_count,
            cache_hit,
        });
    }

    pub fn record_error(&self, mode: ValidationMode, kind: &str) {
        info!(mode = %mode, error_kind = kind, "validation failed");
        if let Ok(mut window) = self.inner.lock() {
            *window.errors.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let Ok(window) = self.inner.lock() else {
            return MetricsSummary::default();
        };
        let mut modes = BTreeMap::new();
        for mode in [ValidationMode::Comprehensive, ValidationMode::Selective] {
            let samples: Vec<&Sample> = window.samples.iter().filter(|s| s.mode == mode).collect();
            if samples.is_empty() {
                continue;
            }
            let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
            latencies.sort_by(f64::total_cmp);
            let mut histogram = BTreeMap::new();
            for sample in &samples {
                *histogram.entry(sample.rule_count).or_insert(0) += 1;
            }
            modes.insert(
                mode.to_string(),
                ModeSummary {
                    count: samples.len(),
                    cache_hits: samples.iter().filter(|s| s.cache_hit).count(),
                    p50_latency_ms: percentile(&latencies, 50.0),
                    p95_latency_ms: percentile(&latencies, 95.0),
                    max_latency_ms: latencies.last().copied().unwrap_or(0.0),
                    rule_count_histogram: histogram,
                },
            );
        }
        MetricsSummary {
            window: self.capacity,
            modes,
            errors: window.errors.clone(),
        }
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
