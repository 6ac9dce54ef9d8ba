//! Asynchronous collection of latency samples and report derivation.
//!
//! Agents hand completed [`Sample`] batches to a [`SampleSender`]; a bounded
//! channel decouples them from the single consumer task that appends
//! everything to the shared sample log under a mutex. The channel is the
//! backpressure mechanism: when the buffer is saturated, producers block
//! until the consumer drains, and nothing is ever dropped.
//!
//! Closing the recorder consumes it into a [`ClosedRecorder`], which is the
//! only type that can produce a [`Report`]. Asking for statistics before all
//! producers have finished is therefore impossible by construction.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use sketches_ddsketch::DDSketch;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::task::TaskOptions;
use crate::workload::WorkloadConfig;

/// One observation of a single statement's round-trip time.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    /// Wall-clock time at which the statement was issued.
    pub timestamp: SystemTime,
    /// Round-trip time of the statement.
    pub latency: Duration,
}

#[derive(Debug, Default)]
struct Shared {
    samples: Mutex<Vec<Sample>>,
}

/// Producer-side handle for submitting sample batches.
///
/// Cloned once per agent. Submitting blocks only when the recorder's buffer
/// is saturated.
#[derive(Clone, Debug)]
pub struct SampleSender {
    tx: mpsc::Sender<Vec<Sample>>,
}

impl SampleSender {
    /// Hands a batch over to the recorder.
    pub async fn add(&self, batch: Vec<Sample>) {
        if batch.is_empty() {
            return;
        }

        // Only fails once the recorder is closed, which the orchestrator
        // guarantees not to do while producers are alive.
        if self.tx.send(batch).await.is_err() {
            tracing::warn!("sample batch dropped: recorder already closed");
        }
    }
}

/// Live view of the number of samples recorded so far.
///
/// Used by the progress reporter; reads are a single lock acquisition.
#[derive(Clone, Debug)]
pub struct SampleCounter {
    shared: Arc<Shared>,
}

impl SampleCounter {
    /// Total samples appended so far.
    pub fn get(&self) -> usize {
        self.shared.samples.lock().unwrap().len()
    }
}

/// Concurrency-safe collector of samples from all agents.
#[derive(Debug)]
pub struct Recorder {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Vec<Sample>>,
    consumer: JoinHandle<()>,
    started_at: SystemTime,
}

impl Recorder {
    /// Starts the recorder with the given hand-off buffer capacity.
    ///
    /// The capacity should absorb simultaneous flushes from all agents;
    /// the orchestrator uses three slots per agent. The run start timestamp
    /// is taken here.
    pub fn start(buffer_capacity: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let (tx, mut rx) = mpsc::channel::<Vec<Sample>>(buffer_capacity);

        let consumer_shared = Arc::clone(&shared);
        let consumer = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                consumer_shared.samples.lock().unwrap().extend(batch);
            }
        });

        Self {
            shared,
            tx,
            consumer,
            started_at: SystemTime::now(),
        }
    }

    /// Creates a new producer handle.
    pub fn sender(&self) -> SampleSender {
        SampleSender {
            tx: self.tx.clone(),
        }
    }

    /// Creates a live sample counter for progress reporting.
    pub fn counter(&self) -> SampleCounter {
        SampleCounter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Total samples appended so far.
    pub fn count(&self) -> usize {
        self.shared.samples.lock().unwrap().len()
    }

    /// Seals the recorder: drains the channel and takes the finish timestamp.
    ///
    /// Must be called exactly once, after every [`SampleSender`] has been
    /// dropped; the consumer only exits once the channel is fully closed.
    pub async fn close(self) -> ClosedRecorder {
        drop(self.tx);
        if self.consumer.await.is_err() {
            tracing::error!("recorder consumer task panicked");
        }

        let samples = std::mem::take(&mut *self.shared.samples.lock().unwrap());

        ClosedRecorder {
            samples,
            started_at: self.started_at,
            finished_at: SystemTime::now(),
        }
    }
}

/// A sealed recorder; no further samples can be appended.
#[derive(Debug)]
pub struct ClosedRecorder {
    samples: Vec<Sample>,
    started_at: SystemTime,
    finished_at: SystemTime,
}

impl ClosedRecorder {
    /// Total number of recorded samples.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Reduces the recorded samples into the final report.
    pub fn report(
        mut self,
        token: &str,
        target: &str,
        options: &TaskOptions,
        workload: &WorkloadConfig,
    ) -> Report {
        self.samples.sort_by_key(|sample| sample.timestamp);

        let elapsed = self
            .finished_at
            .duration_since(self.started_at)
            .unwrap_or_default();

        let query_count = self.samples.len();
        let avg_qps = if elapsed.is_zero() {
            0.0
        } else {
            query_count as f64 / elapsed.as_secs_f64()
        };

        let mut histogram = qps_histogram(&self.samples);
        histogram.sort_by(f64::total_cmp);
        let (min_qps, max_qps, median_qps) = qps_extrema(&histogram);

        Report {
            token: token.to_owned(),
            target: target.to_owned(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            elapsed_time_secs: elapsed.as_secs(),
            options: options.clone(),
            workload: workload.clone(),
            query_count,
            expected_qps: u64::from(options.agents) * u64::from(options.rate),
            avg_qps,
            min_qps,
            max_qps,
            median_qps,
            response: LatencySummary::from_samples(&self.samples),
        }
    }
}

/// Buckets samples into consecutive 1-second windows anchored at the first
/// sample's timestamp; each bucket's count is its QPS.
///
/// Windows are half-open and advanced one at a time until the sample falls
/// inside the current one, so gaps produce empty buckets. The input must be
/// sorted by timestamp.
///
/// The bucket count is `floor(last - first) + 1` whole windows; only for
/// whole-second spans does this coincide with `ceil(last - first) + 1`.
fn qps_histogram(samples: &[Sample]) -> Vec<f64> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };

    let mut window_start = first.timestamp;
    let mut histogram = vec![0u64];

    for sample in samples {
        while sample.timestamp >= window_start + Duration::from_secs(1) {
            window_start += Duration::from_secs(1);
            histogram.push(0);
        }

        *histogram.last_mut().unwrap() += 1;
    }

    histogram.into_iter().map(|count| count as f64).collect()
}

/// Min, max and median of a histogram sorted in ascending order.
///
/// For odd counts above two the median is the element one past the middle
/// index rather than the true median. That behavior is part of the report's
/// contract and must not be corrected.
fn qps_extrema(sorted: &[f64]) -> (f64, f64, f64) {
    match sorted {
        [] => (0.0, 0.0, 0.0),
        [only] => (*only, *only, *only),
        [first, second] => (*first, *second, (first + second) / 2.0),
        _ => {
            let min = sorted[0];
            let max = sorted[sorted.len() - 1];
            let middle = sorted.len() / 2;

            let median = if sorted.len() % 2 == 0 {
                (sorted[middle] + sorted[middle + 1]) / 2.0
            } else {
                sorted[middle + 1]
            };

            (min, max, median)
        }
    }
}

/// Latency distribution summary derived from a DDSketch over all samples.
#[derive(Clone, Debug, Serialize)]
pub struct LatencySummary {
    /// Number of observations.
    pub count: usize,
    /// Smallest observed latency.
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    /// Largest observed latency.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Mean latency.
    #[serde(with = "humantime_serde")]
    pub mean: Duration,
    /// 50th percentile latency.
    #[serde(with = "humantime_serde")]
    pub p50: Duration,
    /// 90th percentile latency.
    #[serde(with = "humantime_serde")]
    pub p90: Duration,
    /// 99th percentile latency.
    #[serde(with = "humantime_serde")]
    pub p99: Duration,
}

impl LatencySummary {
    fn from_samples(samples: &[Sample]) -> Self {
        let mut sketch = DDSketch::default();
        for sample in samples {
            sketch.add(sample.latency.as_secs_f64());
        }

        let count = sketch.count();
        let mean = match (sketch.sum(), count) {
            (Some(sum), count) if count > 0 => sum / count as f64,
            _ => 0.0,
        };
        let quantile = |q: f64| {
            let secs = sketch.quantile(q).ok().flatten().unwrap_or(0.0);
            Duration::from_secs_f64(secs.max(0.0))
        };

        Self {
            count,
            min: Duration::from_secs_f64(sketch.min().unwrap_or(0.0).max(0.0)),
            max: Duration::from_secs_f64(sketch.max().unwrap_or(0.0).max(0.0)),
            mean: Duration::from_secs_f64(mean.max(0.0)),
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
        }
    }
}

/// Read-only snapshot of one finished run.
///
/// Serializes to the JSON report printed by the CLI; credentials never enter
/// this structure.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    /// Unique token correlating this run's marker statements.
    pub token: String,
    /// Identity of the target, minus credentials.
    pub target: String,
    /// Wall-clock start of the run phase.
    #[serde(with = "humantime_serde")]
    pub started_at: SystemTime,
    /// Wall-clock end of the run phase.
    #[serde(with = "humantime_serde")]
    pub finished_at: SystemTime,
    /// Elapsed run time, truncated to whole seconds.
    pub elapsed_time_secs: u64,
    /// Echo of the task options.
    pub options: TaskOptions,
    /// Echo of the workload configuration.
    pub workload: WorkloadConfig,
    /// Total number of executed statements.
    pub query_count: usize,
    /// The configured target throughput (agents × rate).
    pub expected_qps: u64,
    /// Realized average QPS over the whole run.
    pub avg_qps: f64,
    /// Smallest per-second bucket count.
    pub min_qps: f64,
    /// Largest per-second bucket count.
    pub max_qps: f64,
    /// Median per-second bucket count, using the report's legacy formula.
    pub median_qps: f64,
    /// Latency distribution summary.
    pub response: LatencySummary,
}
