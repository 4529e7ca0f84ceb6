//! Latency and throughput statistics for one I/O call site.

/// Latencies retained per key for quantile estimation.
pub const MAX_LATENCY_SAMPLES: usize = 1500;

/// Running totals for traces sharing `(trace_ctx, source, trace_type)`.
#[derive(Debug, Clone, Default)]
pub struct IoTracingProps {
    samples: u64,
    latency_sum_ns: u64,
    bytes: u64,
    timeouts: u64,
    latencies: Vec<u64>,
}

/// Finalized statistics. Quantiles are exact while `dropped` is false.
#[derive(Debug, Clone, PartialEq)]
pub struct IoTraceStats {
    pub samples: u64,
    pub bytes: u64,
    pub timeouts: u64,
    pub latency_sum_ns: u64,
    pub mean_ns: f64,
    pub p95_ns: f64,
    pub p99_ns: f64,
    pub dropped: bool,
}

impl IoTracingProps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one trace. Returns false once the latency buffer is full; the
    /// sample still counts towards mean, bytes and timeouts.
    pub fn add_sample(&mut self, latency_ns: u64, bytes: i32, timeout: bool) -> bool {
        self.samples += 1;
        self.latency_sum_ns = self.latency_sum_ns.saturating_add(latency_ns);
        if let Ok(bytes) = u64::try_from(bytes) {
            self.bytes += bytes;
        }
        if timeout {
            self.timeouts += 1;
        }
        if self.latencies.len() >= MAX_LATENCY_SAMPLES {
            return false;
        }
        self.latencies.push(latency_ns);
        true
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn finalize(mut self) -> IoTraceStats {
        self.latencies.sort_unstable();
        let mean_ns = if self.samples == 0 {
            0.0
        } else {
            self.latency_sum_ns as f64 / self.samples as f64
        };
        IoTraceStats {
            samples: self.samples,
            bytes: self.bytes,
            timeouts: self.timeouts,
            latency_sum_ns: self.latency_sum_ns,
            mean_ns,
            p95_ns: quantile(0.95, &self.latencies),
            p99_ns: quantile(0.99, &self.latencies),
            dropped: self.samples > MAX_LATENCY_SAMPLES as u64,
        }
    }
}

/// Interpolated quantile of sorted values, positioned at `q * (n + 1)`.
/// Returns 0 for an empty input.
fn quantile(q: f64, sorted: &[u64]) -> f64 {
    let (Some(&first), Some(&last)) = (sorted.first(), sorted.last()) else {
        return 0.0;
    };
    let n = sorted.len();
    let pos = q * (n as f64 + 1.0);
    if pos < 1.0 {
        return first as f64;
    }
    if pos >= n as f64 {
        return last as f64;
    }
    let floor = pos.floor();
    let idx = floor as usize;
    match (sorted.get(idx - 1), sorted.get(idx)) {
        (Some(&lower), Some(&upper)) => {
            lower as f64 + (pos - floor) * (upper as f64 - lower as f64)
        }
        _ => last as f64,
    }
}
