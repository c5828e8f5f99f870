//! Rendering of fan-out results into response bodies.

use crate::probe::ProbeReport;
use serde::Deserialize;
use std::fmt::Write;
use std::str::FromStr;

/// Response body format for `/mem`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Literal `OK`
    #[default]
    Ok,
    /// Per-lookup elapsed milliseconds in issue order
    Latencies,
    /// Min, quartiles and max of elapsed time
    Quartiles,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ok" => Ok(ReportFormat::Ok),
            "latencies" => Ok(ReportFormat::Latencies),
            "quartiles" => Ok(ReportFormat::Quartiles),
            _ => Err(s.to_string()),
        }
    }
}

/// Render `report` in `format`.
pub fn render(format: ReportFormat, report: &ProbeReport, qps: Option<u32>) -> String {
    match format {
        ReportFormat::Ok => "OK".to_string(),
        ReportFormat::Latencies => render_latencies(report),
        ReportFormat::Quartiles => render_quartiles(report, qps),
    }
}

/// `[1.234, 0.981, ...]`, one entry per lookup
fn render_latencies(report: &ProbeReport) -> String {
    let mut out = String::with_capacity(2 + report.len() * 8);
    out.push('[');
    for (i, sample) in report.samples.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{:.3}", sample.elapsed.as_secs_f64() * 1000.0);
    }
    out.push(']');
    out
}

/// `count N; [qps Q; ]quartiles [min, q1, median, q3, max]`
fn render_quartiles(report: &ProbeReport, qps: Option<u32>) -> String {
    let sorted = report.sorted_elapsed();
    let count = sorted.len();

    let mut out = format!("count {}; ", count);
    if let Some(qps) = qps {
        let _ = write!(out, "qps {}; ", qps);
    }
    if report.is_empty() {
        out.push_str("quartiles []");
        return out;
    }

    let _ = write!(
        out,
        "quartiles [{:?}, {:?}, {:?}, {:?}, {:?}]",
        sorted[0],
        sorted[count / 4],
        sorted[count / 2],
        sorted[3 * count / 4],
        sorted[count - 1]
    );
    out
}
