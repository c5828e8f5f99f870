//! Fan-out prober.
//!
//! Issues N lookups of one key concurrently, waits for every one of them,
//! and records per-call outcome and latency. Each task owns slot `i` of the
//! result vector, so the report is in issue order regardless of completion
//! order.

use crate::client::CacheClient;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Upper bound on the issue rate
pub const MAX_QPS: u32 = 1_000_000;

/// How a single lookup ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Miss,
    Timeout,
    Failed,
}

/// One lookup's result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Results of one fan-out, indexed by issue order
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub samples: Vec<Sample>,
}

impl ProbeReport {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.samples.iter().filter(|s| s.outcome == outcome).count()
    }

    /// Elapsed times sorted ascending
    pub fn sorted_elapsed(&self) -> Vec<Duration> {
        let mut elapsed: Vec<Duration> = self.samples.iter().map(|s| s.elapsed).collect();
        elapsed.sort_unstable();
        elapsed
    }
}

/// Options for a single fan-out
#[derive(Debug, Clone, Copy, Default)]
pub struct FanOut {
    pub count: usize,
    /// Issue no faster than this many lookups per second
    pub qps: Option<u32>,
}

/// A probe task did not finish
#[derive(Debug)]
pub enum ProbeError {
    Task(JoinError),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Task(e) => write!(f, "Probe task failed: {}", e),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Process-wide probe counters
#[derive(Debug, Default)]
pub struct ProbeStats {
    requests: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of `ProbeStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
    pub failures: u64,
}

impl ProbeStats {
    fn record(&self, outcome: Outcome) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Hit => &self.hits,
            Outcome::Miss => &self.misses,
            Outcome::Timeout => &self.timeouts,
            Outcome::Failed => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Fires concurrent lookups of a fixed key against a shared client.
pub struct Prober {
    client: Arc<dyn CacheClient>,
    keys: Arc<[String]>,
    deadline: Duration,
    max_in_flight: Option<usize>,
    stats: Arc<ProbeStats>,
}

impl Prober {
    pub fn new(client: Arc<dyn CacheClient>, key: String, deadline: Duration) -> Self {
        Prober {
            client,
            keys: Arc::from(vec![key]),
            deadline,
            max_in_flight: None,
            stats: Arc::new(ProbeStats::default()),
        }
    }

    /// Cap the number of lookups outstanding at once
    pub fn with_max_in_flight(mut self, max_in_flight: Option<usize>) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    /// Issue `fan_out.count` lookups and wait for all of them.
    pub async fn run(&self, fan_out: FanOut) -> Result<ProbeReport, ProbeError> {
        let FanOut { count, qps } = fan_out;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        debug!(count, ?qps, "Starting fan-out");

        let mut throttle = qps.map(|qps| {
            let period = Duration::from_secs(1) / qps.clamp(1, MAX_QPS);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let in_flight = self.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));

        let mut tasks = JoinSet::new();
        for index in 0..count {
            if let Some(throttle) = throttle.as_mut() {
                throttle.tick().await;
            }
            let permit = match &in_flight {
                Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
                None => None,
            };

            let client = Arc::clone(&self.client);
            let keys = Arc::clone(&self.keys);
            let stats = Arc::clone(&self.stats);
            let deadline = self.deadline;

            tasks.spawn(async move {
                let sample = lookup(client.as_ref(), &keys, deadline, index).await;
                stats.record(sample.outcome);
                drop(permit);
                (index, sample)
            });
        }

        let mut slots: Vec<Option<Sample>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            let (index, sample) = joined.map_err(ProbeError::Task)?;
            slots[index] = Some(sample);
        }

        let samples: Vec<Sample> = slots.into_iter().flatten().collect();
        debug!(
            count = samples.len(),
            hits = samples.iter().filter(|s| s.outcome == Outcome::Hit).count(),
            "Fan-out complete"
        );
        Ok(ProbeReport { samples })
    }
}

/// Run one deadline-bound lookup and time it.
async fn lookup(
    client: &dyn CacheClient,
    keys: &[String],
    deadline: Duration,
    index: usize,
) -> Sample {
    let start = Instant::now();
    let result = tokio::time::timeout(deadline, client.get_multi(keys)).await;
    let elapsed = start.elapsed();

    let outcome = match result {
        Ok(Ok(items)) if items.is_empty() => Outcome::Miss,
        Ok(Ok(_)) => Outcome::Hit,
        Ok(Err(e)) => {
            warn!(index, error = %e, "Lookup failed");
            Outcome::Failed
        }
        Err(_) => Outcome::Timeout,
    };

    Sample { outcome, elapsed }
}
