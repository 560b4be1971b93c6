//! Pre-module bootstrap phase.
//!
//! Handlers prepare the environment (directories, database files) before any
//! module is discovered. They run sequentially in ascending priority; a
//! handler that fails or reports `false` aborts startup.

mod handlers;

pub use handlers::{EnsureDirectories, ProvisionSqliteFile};

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait BootstrapHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32;

    /// `false` means the work is already done (or not applicable); the handler is skipped.
    fn should_run(&self) -> bool;

    /// `Ok(false)` reports a failure without an error value.
    async fn execute(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap handler '{handler}' reported failure")]
    HandlerReportedFailure { handler: String },

    #[error("bootstrap handler '{handler}' failed")]
    HandlerFailed {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("bootstrap phase exceeded {timeout:?} (while running '{handler}')")]
    Timeout { handler: String, timeout: Duration },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Default)]
pub struct BootstrapOrchestrator {
    handlers: Vec<Box<dyn BootstrapHandler>>,
    timeout: Option<Duration>,
}

impl BootstrapOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound for the whole phase.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn register<H: BootstrapHandler + 'static>(&mut self, handler: H) -> &mut Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn run(&self) -> Result<BootstrapReport, BootstrapError> {
        // stable: equal priorities keep registration order
        let mut ordered: Vec<&dyn BootstrapHandler> = self.handlers.iter().map(|h| &**h).collect();
        ordered.sort_by_key(|h| h.priority());

        let deadline = self.timeout.map(|t| (tokio::time::Instant::now() + t, t));
        let mut report = BootstrapReport::default();

        tracing::info!(handlers = ordered.len(), "Phase: bootstrap");
        for h in ordered {
            let name = h.name().to_string();
            if !h.should_run() {
                tracing::debug!(handler = %name, "Bootstrap handler not needed; skipping");
                report.skipped.push(name);
                continue;
            }

            tracing::info!(handler = %name, priority = h.priority(), "Running bootstrap handler");
            let result = match deadline {
                Some((at, timeout)) => tokio::time::timeout_at(at, h.execute())
                    .await
                    .map_err(|_| BootstrapError::Timeout {
                        handler: name.clone(),
                        timeout,
                    })?,
                None => h.execute().await,
            };

            match result {
                Ok(true) => report.executed.push(name),
                Ok(false) => {
                    tracing::error!(handler = %name, "Bootstrap handler reported failure");
                    return Err(BootstrapError::HandlerReportedFailure { handler: name });
                }
                Err(source) => {
                    tracing::error!(handler = %name, error = %source, "Bootstrap handler failed");
                    return Err(BootstrapError::HandlerFailed {
                        handler: name,
                        source,
                    });
                }
            }
        }

        tracing::info!(
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "Bootstrap complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Step {
        name: &'static str,
        priority: i32,
        needed: bool,
        result: Option<bool>, // None -> Err
        delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Step {
        fn ok(name: &'static str, priority: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                priority,
                needed: true,
                result: Some(true),
                delay: Duration::ZERO,
                log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl BootstrapHandler for Step {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn should_run(&self) -> bool {
            self.needed
        }
        async fn execute(&self) -> anyhow::Result<bool> {
            tokio::time::sleep(self.delay).await;
            self.log.lock().push(self.name.to_string());
            self.result.ok_or_else(|| anyhow::anyhow!("disk on fire"))
        }
    }

    #[tokio::test]
    async fn runs_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut o = BootstrapOrchestrator::new();
        o.register(Step::ok("late", 20, &log))
            .register(Step::ok("early", 10, &log))
            .register(Step::ok("tie", 20, &log));

        let report = o.run().await.unwrap();
        assert_eq!(*log.lock(), vec!["early", "late", "tie"]);
        assert_eq!(report.executed, vec!["early", "late", "tie"]);
    }

    #[tokio::test]
    async fn not_needed_handler_is_never_executed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut skip = Step::ok("skip", 1, &log);
        skip.needed = false;

        let mut o = BootstrapOrchestrator::new();
        o.register(skip).register(Step::ok("run", 2, &log));
        let report = o.run().await.unwrap();

        assert_eq!(*log.lock(), vec!["run"]);
        assert_eq!(report.skipped, vec!["skip"]);
    }

    #[tokio::test]
    async fn false_result_aborts_before_later_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bad = Step::ok("bad", 1, &log);
        bad.result = Some(false);

        let mut o = BootstrapOrchestrator::new();
        o.register(bad).register(Step::ok("never", 2, &log));
        let err = o.run().await.unwrap_err();

        assert!(matches!(err, BootstrapError::HandlerReportedFailure { ref handler } if handler == "bad"));
        assert_eq!(*log.lock(), vec!["bad"]);
    }

    #[tokio::test]
    async fn error_result_aborts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bad = Step::ok("bad", 1, &log);
        bad.result = None;

        let mut o = BootstrapOrchestrator::new();
        o.register(bad);
        let err = o.run().await.unwrap_err();
        assert!(matches!(err, BootstrapError::HandlerFailed { .. }));
        assert!(format!("{:#}", anyhow::Error::from(err)).contains("disk on fire"));
    }

    #[tokio::test]
    async fn phase_timeout_is_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut slow = Step::ok("slow", 1, &log);
        slow.delay = Duration::from_secs(5);

        let mut o = BootstrapOrchestrator::new().with_timeout(Duration::from_millis(30));
        o.register(slow);
        let err = o.run().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Timeout { .. }));
    }

    #[tokio::test]
    async fn second_run_on_a_provisioned_environment_is_a_no_op() {
        let tmp = tempfile::TempDir::new().unwrap();
        let build = || {
            let mut o = BootstrapOrchestrator::new();
            o.register(EnsureDirectories::new([tmp.path().join("data"), tmp.path().join("logs")]));
            if let Some(db) = ProvisionSqliteFile::from_dsn("sqlite://data/app.db", tmp.path()).unwrap() {
                o.register(db);
            }
            o
        };

        let first = build().run().await.unwrap();
        assert_eq!(first.executed, vec!["ensure-directories", "provision-sqlite-file"]);

        let second = build().run().await.unwrap();
        assert!(second.executed.is_empty());
        assert_eq!(second.skipped, vec!["ensure-directories", "provision-sqlite-file"]);
    }
}
