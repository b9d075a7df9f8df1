// crates/server/src/metrics.rs
//! In-process latency recorder backing `performance_metrics`.
//!
//! The surface is RPC-over-stdio, not an HTTP scrape endpoint, so this
//! keeps a bounded sample ring per method and aggregates on demand.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Samples retained per method.
const RING_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    micros: u64,
    ok: bool,
}

/// Aggregated view of one method over a window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MethodMetrics {
    pub method: String,
    pub count: u64,
    pub errors: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

#[derive(Default)]
pub struct MetricsRecorder {
    rings: Mutex<HashMap<String, std::collections::VecDeque<Sample>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request.
    pub fn record(&self, method: &str, duration: Duration, ok: bool) {
        let Ok(mut rings) = self.rings.lock() else {
            return;
        };
        let ring = rings.entry(method.to_string()).or_default();
        if ring.len() >= RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(Sample {
            at: Instant::now(),
            micros: duration.as_micros() as u64,
            ok,
        });
    }

    /// Aggregate per-method metrics, optionally restricted to the trailing
    /// `window`.
    pub fn snapshot(&self, window: Option<Duration>) -> Vec<MethodMetrics> {
        let Ok(rings) = self.rings.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut out: Vec<MethodMetrics> = rings
            .iter()
            .filter_map(|(method, ring)| {
                let samples: Vec<&Sample> = ring
                    .iter()
                    .filter(|s| {
                        window
                            .map(|w| now.duration_since(s.at) <= w)
                            .unwrap_or(true)
                    })
                    .collect();
                if samples.is_empty() {
                    return None;
                }
                let count = samples.len() as u64;
                let errors = samples.iter().filter(|s| !s.ok).count() as u64;
                let total: u64 = samples.iter().map(|s| s.micros).sum();
                let max = samples.iter().map(|s| s.micros).max().unwrap_or(0);
                Some(MethodMetrics {
                    method: method.clone(),
                    count,
                    errors,
                    avg_ms: total as f64 / count as f64 / 1000.0,
                    max_ms: max as f64 / 1000.0,
                })
            })
            .collect();
        out.sort_by(|a, b| a.method.cmp(&b.method));
        out
    }
}
