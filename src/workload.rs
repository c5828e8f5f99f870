//! Scheduler and CPU workloads served next to the cache probe.
//!
//! They give a baseline for how the host runs compute and task handoffs,
//! independent of cache latency.

use rand::Rng;
use std::fmt;
use std::hint::black_box;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::Instant;

/// Iterations of the complex recurrence per unit of `count`
const THINK_ITERATIONS: usize = 1000;

#[derive(Debug)]
pub enum WorkloadError {
    Task(JoinError),
    /// A link in the channel chain dropped its sender
    BrokenChain,
}

impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadError::Task(e) => write!(f, "Workload task failed: {}", e),
            WorkloadError::BrokenChain => write!(f, "Channel chain broken"),
        }
    }
}

impl std::error::Error for WorkloadError {}

/// Iterate `z = z*z + a` for `count` random `a`, on the blocking pool.
pub async fn think(count: usize) -> Result<Duration, WorkloadError> {
    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let mut rng = rand::thread_rng();
        for _ in 0..count {
            let a = (rng.gen::<f64>(), rng.gen::<f64>());
            let mut z = (0.0f64, 0.0f64);
            for _ in 0..THINK_ITERATIONS {
                z = (z.0 * z.0 - z.1 * z.1 + a.0, 2.0 * z.0 * z.1 + a.1);
            }
            black_box(z);
        }
        start.elapsed()
    })
    .await
    .map_err(WorkloadError::Task)
}

/// Pass a value through a chain of `count` tasks linked by one-shot channels.
pub async fn chan(count: usize) -> Result<Duration, WorkloadError> {
    let start = Instant::now();

    let (head, mut tail) = oneshot::channel::<bool>();
    for _ in 0..count {
        let (tx, next) = oneshot::channel();
        let prev = tail;
        tokio::spawn(async move {
            if let Ok(value) = prev.await {
                let _ = tx.send(value);
            }
        });
        tail = next;
    }

    head.send(true).map_err(|_| WorkloadError::BrokenChain)?;
    match tail.await {
        Ok(true) => Ok(start.elapsed()),
        _ => Err(WorkloadError::BrokenChain),
    }
}
