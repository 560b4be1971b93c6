use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::contracts::HealthCheck;
use crate::hooks::panic_message;

pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Runs every check; a check that errors, panics or overruns is unhealthy.
pub async fn run_checks(
    checks: &[(String, Arc<dyn HealthCheck>)],
    timeout: Duration,
) -> BTreeMap<String, HealthStatus> {
    let mut out = BTreeMap::new();
    for (module, check) in checks {
        let fut = AssertUnwindSafe(check.check()).catch_unwind();
        let status = match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(Ok(()))) => HealthStatus::Healthy,
            Ok(Ok(Err(e))) => HealthStatus::Unhealthy(format!("{e:#}")),
            Ok(Err(p)) => HealthStatus::Unhealthy(format!("panicked: {}", panic_message(p.as_ref()))),
            Err(_) => HealthStatus::Unhealthy(format!("timed out after {timeout:?}")),
        };
        if !status.is_healthy() {
            tracing::warn!(module = %module, status = ?status, "Health check failed");
        }
        out.insert(module.clone(), status);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl HealthCheck for Fixed {
        async fn check(&self) -> anyhow::Result<()> {
            match self.0 {
                None => Ok(()),
                Some(msg) => anyhow::bail!(msg),
            }
        }
    }

    struct Stuck;

    #[async_trait]
    impl HealthCheck for Stuck {
        async fn check(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn reports_each_module() {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = vec![
            ("ok".into(), Arc::new(Fixed(None))),
            ("bad".into(), Arc::new(Fixed(Some("db down")))),
            ("stuck".into(), Arc::new(Stuck)),
        ];
        let report = run_checks(&checks, Duration::from_millis(20)).await;

        assert_eq!(report["ok"], HealthStatus::Healthy);
        assert_eq!(report["bad"], HealthStatus::Unhealthy("db down".into()));
        assert!(matches!(&report["stuck"], HealthStatus::Unhealthy(m) if m.contains("timed out")));
    }
}
