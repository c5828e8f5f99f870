//! HTTP front end.
//!
//! The router is built once at startup from an `AppState` and served until
//! shutdown. Every response is `text/plain`.

use crate::probe::{FanOut, Outcome, ProbeError, Prober, MAX_QPS};
use crate::report::{self, ReportFormat};
use crate::workload::{self, WorkloadError};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::fmt::Write;
use std::num::IntErrorKind;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{info, warn};

pub const USAGE: &str = "Paths:
\t/mem?count=N - fire N concurrent memcache get requests
\t\tadd qps=X to rate limit issuing
\t\tadd format=ok|latencies|quartiles to pick the response
\t/think?count=N - Nk iterations of thinking
\t/chan?count=N - pass a bool through a chain of N channels
\t/stats - probe counters
";

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub prober: Arc<Prober>,
    pub report: ReportFormat,
    pub max_count: usize,
}

/// Query parameters, kept raw so bad values get our own messages
#[derive(Debug, Default, Deserialize)]
pub struct Params {
    count: Option<String>,
    qps: Option<String>,
    format: Option<String>,
}

/// Request-level failures
#[derive(Debug)]
pub enum HttpError {
    /// `count` missing or not an integer
    BadCount,
    CountTooSmall,
    CountTooLarge(usize),
    BadFormat(String),
    Probe(ProbeError),
    Workload(WorkloadError),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::BadCount => write!(f, "Bad value for count param"),
            HttpError::CountTooSmall => write!(f, "Count must be at least 1"),
            HttpError::CountTooLarge(max) => write!(f, "Count must be at most {}", max),
            HttpError::BadFormat(format) => write!(f, "Unknown format: {}", format),
            HttpError::Probe(e) => write!(f, "{}", e),
            HttpError::Workload(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for HttpError {}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self {
            HttpError::Probe(_) | HttpError::Workload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Build the route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(usage))
        .route("/mem", get(mem))
        .route("/think", get(think))
        .route("/chan", get(chan))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve `router(state)` on `listener` until Ctrl-C.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn usage() -> &'static str {
    USAGE
}

async fn mem(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<String, HttpError> {
    let count = parse_count(params.count.as_deref(), state.max_count)?;
    let format = match params.format.as_deref() {
        Some(raw) => raw.parse::<ReportFormat>().map_err(HttpError::BadFormat)?,
        None => state.report,
    };
    let qps = parse_qps(params.qps.as_deref());

    let start = Instant::now();
    let report = state
        .prober
        .run(FanOut { count, qps })
        .await
        .map_err(HttpError::Probe)?;

    info!(
        count,
        hits = report.count(Outcome::Hit),
        misses = report.count(Outcome::Miss),
        timeouts = report.count(Outcome::Timeout),
        failures = report.count(Outcome::Failed),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Fan-out finished"
    );

    Ok(report::render(format, &report, qps))
}

async fn think(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<String, HttpError> {
    let count = parse_count(params.count.as_deref(), state.max_count)?;
    let elapsed = workload::think(count).await.map_err(HttpError::Workload)?;
    info!(count, ?elapsed, "Thought");
    Ok(format!("thought for {:?}", elapsed))
}

async fn chan(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<String, HttpError> {
    let count = parse_count(params.count.as_deref(), state.max_count)?;
    let elapsed = workload::chan(count).await.map_err(HttpError::Workload)?;
    info!(count, ?elapsed, "Channel tunnel done");
    Ok(format!("channel tunnel took {:?}", elapsed))
}

async fn stats(State(state): State<AppState>) -> String {
    let snapshot = state.prober.stats().snapshot();
    let mut out = String::new();
    for (name, value) in [
        ("requests", snapshot.requests),
        ("lookups", snapshot.lookups),
        ("hits", snapshot.hits),
        ("misses", snapshot.misses),
        ("timeouts", snapshot.timeouts),
        ("failures", snapshot.failures),
    ] {
        let _ = writeln!(out, "STAT {} {}", name, value);
    }
    out
}

/// Parse and bound the `count` parameter.
fn parse_count(raw: Option<&str>, max_count: usize) -> Result<usize, HttpError> {
    let count: i64 = raw
        .and_then(|s| s.parse().ok())
        .ok_or(HttpError::BadCount)?;
    if count < 1 {
        return Err(HttpError::CountTooSmall);
    }
    match usize::try_from(count) {
        Ok(count) if count <= max_count => Ok(count),
        _ => Err(HttpError::CountTooLarge(max_count)),
    }
}

/// Absent, unparseable or non-positive `qps` means no throttle.
/// Large values, including ones past `i64`, clamp to `MAX_QPS`.
fn parse_qps(raw: Option<&str>) -> Option<u32> {
    let qps: i64 = match raw?.parse() {
        Ok(qps) => qps,
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => return Some(MAX_QPS),
        Err(_) => return None,
    };
    if qps < 1 {
        return None;
    }
    Some(qps.min(MAX_QPS as i64) as u32)
}
