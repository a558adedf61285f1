//! # Health Probes
//!
//! Time-boxed dependency checks backing the liveness and readiness endpoints.
//! A check that overruns its budget is reported as [`CheckStatus::Timeout`]
//! instead of holding the probe open.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Budget for the liveness probe.
pub const LIVENESS_BUDGET: Duration = Duration::from_secs(1);
/// Budget for the readiness probe.
pub const READINESS_BUDGET: Duration = Duration::from_secs(5);

/// Outcome of a single check. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Degraded,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

/// Runs `check` under `budget`. `Err` maps to `Degraded`, overrun to `Timeout`.
pub async fn run_check<F, E>(name: &str, budget: Duration, check: F) -> CheckResult
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let (status, detail) = match tokio::time::timeout(budget, check).await {
        Ok(Ok(())) => (CheckStatus::Ok, None),
        Ok(Err(e)) => (CheckStatus::Degraded, Some(e.to_string())),
        Err(_) => (
            CheckStatus::Timeout,
            Some(format!("no answer within {}ms", budget.as_millis())),
        ),
    };
    if status != CheckStatus::Ok {
        tracing::warn!(check = name, ?status, detail = detail.as_deref(), "health check failed");
    }
    CheckResult {
        name: name.to_string(),
        status,
        detail,
        elapsed_ms: start.elapsed().as_millis().min(u64::MAX as u128) as u64,
    }
}

/// Aggregate of several checks; the overall status is the worst one.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Ok);
        Self { status, checks }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CheckStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn passing_check_is_ok() {
        let r = run_check("noop", LIVENESS_BUDGET, async { Ok::<(), String>(()) }).await;
        assert_eq!(r.status, CheckStatus::Ok);
        assert!(r.detail.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_check_is_degraded() {
        let r = run_check("db", READINESS_BUDGET, async { Err::<(), _>("connection refused") }).await;
        assert_eq!(r.status, CheckStatus::Degraded);
        assert_eq!(r.detail.as_deref(), Some("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_times_out_at_budget() {
        let start = Instant::now();
        let r = run_check("slow", LIVENESS_BUDGET, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), String>(())
        })
        .await;
        assert_eq!(r.status, CheckStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn report_takes_worst_status() {
        let mk = |status| CheckResult {
            name: "x".into(),
            status,
            detail: None,
            elapsed_ms: 0,
        };
        assert!(HealthReport::new(vec![]).is_ok());
        let report = HealthReport::new(vec![mk(CheckStatus::Ok), mk(CheckStatus::Timeout), mk(CheckStatus::Degraded)]);
        assert_eq!(report.status, CheckStatus::Timeout);
    }
}
