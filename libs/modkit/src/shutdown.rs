//! Two-pass shutdown.
//!
//! The graceful pass awaits each module's async `stop` under its own timeout.
//! The forced pass then calls every synchronous `force_stop` on a dedicated
//! thread under a short timeout and abandons the call if it overruns. Neither
//! pass ever lets one handler's error, panic or timeout stop the rest.

use futures::FutureExt;
use std::cmp::Reverse;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::contracts::StatefulModule;
use crate::hooks::panic_message;

pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Graceful,
    Forced,
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownKind::Graceful => f.write_str("graceful"),
            ShutdownKind::Forced => f.write_str("forced"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("{kind} shutdown of '{module}' timed out after {timeout:?}")]
    Timeout {
        module: String,
        kind: ShutdownKind,
        timeout: Duration,
    },
    #[error("{kind} shutdown of '{module}' failed: {message}")]
    Failed {
        module: String,
        kind: ShutdownKind,
        message: String,
    },
    #[error("{kind} shutdown of '{module}' panicked: {message}")]
    Panicked {
        module: String,
        kind: ShutdownKind,
        message: String,
    },
}

pub struct ShutdownHandler {
    module_id: String,
    kind: ShutdownKind,
    priority: i32,
    timeout: Duration,
    load_index: usize,
    target: Arc<dyn StatefulModule>,
}

impl ShutdownHandler {
    pub fn graceful(
        module_id: impl Into<String>,
        target: Arc<dyn StatefulModule>,
        priority: i32,
        timeout: Duration,
    ) -> Self {
        Self::new(module_id, ShutdownKind::Graceful, target, priority, timeout)
    }

    pub fn forced(
        module_id: impl Into<String>,
        target: Arc<dyn StatefulModule>,
        priority: i32,
        timeout: Duration,
    ) -> Self {
        Self::new(module_id, ShutdownKind::Forced, target, priority, timeout)
    }

    fn new(
        module_id: impl Into<String>,
        kind: ShutdownKind,
        target: Arc<dyn StatefulModule>,
        priority: i32,
        timeout: Duration,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            kind,
            priority,
            timeout,
            load_index: 0,
            target,
        }
    }

    /// Position of the owning module in load order; later modules stop first on ties.
    pub fn with_load_index(mut self, index: usize) -> Self {
        self.load_index = index;
        self
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn kind(&self) -> ShutdownKind {
        self.kind
    }
}

impl fmt::Debug for ShutdownHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandler")
            .field("module", &self.module_id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("load_index", &self.load_index)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed,
    Failed(String),
    TimedOut(Duration),
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRecord {
    pub module_id: String,
    pub outcome: HandlerOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub graceful: Vec<HandlerRecord>,
    pub forced: Vec<HandlerRecord>,
}

impl ShutdownReport {
    pub fn all_completed(&self) -> bool {
        self.graceful
            .iter()
            .chain(&self.forced)
            .all(|r| r.outcome == HandlerOutcome::Completed)
    }
}

#[derive(Default)]
pub struct ShutdownOrchestrator {
    graceful: Vec<ShutdownHandler>,
    forced: Vec<ShutdownHandler>,
}

impl ShutdownOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: ShutdownHandler) {
        match handler.kind {
            ShutdownKind::Graceful => self.graceful.push(handler),
            ShutdownKind::Forced => self.forced.push(handler),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.graceful.is_empty() && self.forced.is_empty()
    }

    pub async fn run(self, cancel: CancellationToken) -> ShutdownReport {
        let graceful = self.run_graceful(&cancel).await;
        let forced = self.run_forced().await;
        ShutdownReport { graceful, forced }
    }

    pub async fn run_graceful(&self, cancel: &CancellationToken) -> Vec<HandlerRecord> {
        let mut records = Vec::with_capacity(self.graceful.len());
        for h in sorted(&self.graceful) {
            let token = cancel.child_token();
            tracing::debug!(module = %h.module_id, timeout = ?h.timeout, "Graceful stop");

            let stop = AssertUnwindSafe(h.target.stop(token.clone())).catch_unwind();
            let outcome = match tokio::time::timeout(h.timeout, stop).await {
                Ok(Ok(Ok(()))) => HandlerOutcome::Completed,
                Ok(Ok(Err(e))) => HandlerOutcome::Failed(format!("{e:#}")),
                Ok(Err(panic)) => HandlerOutcome::Panicked(panic_message(panic.as_ref())),
                Err(_) => {
                    token.cancel();
                    HandlerOutcome::TimedOut(h.timeout)
                }
            };
            log_outcome(h, &outcome);
            records.push(HandlerRecord {
                module_id: h.module_id.clone(),
                outcome,
            });
        }
        records
    }

    pub async fn run_forced(&self) -> Vec<HandlerRecord> {
        let mut records = Vec::with_capacity(self.forced.len());
        for h in sorted(&self.forced) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let target = h.target.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("force-stop:{}", h.module_id))
                .spawn(move || {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| target.force_stop()));
                    let _ = tx.send(result);
                });

            let outcome = match spawned {
                Err(e) => HandlerOutcome::Failed(format!("cannot spawn force-stop thread: {e}")),
                Ok(_detached) => match tokio::time::timeout(h.timeout, rx).await {
                    Ok(Ok(Ok(Ok(())))) => HandlerOutcome::Completed,
                    Ok(Ok(Ok(Err(e)))) => HandlerOutcome::Failed(format!("{e:#}")),
                    Ok(Ok(Err(panic))) => HandlerOutcome::Panicked(panic_message(panic.as_ref())),
                    Ok(Err(_closed)) => {
                        HandlerOutcome::Failed("force-stop thread exited without a result".into())
                    }
                    // abandoned: the thread keeps running, nobody waits for it
                    Err(_) => HandlerOutcome::TimedOut(h.timeout),
                },
            };
            log_outcome(h, &outcome);
            records.push(HandlerRecord {
                module_id: h.module_id.clone(),
                outcome,
            });
        }
        records
    }
}

/// Priority ascending; equal priorities stop in reverse load order.
fn sorted(handlers: &[ShutdownHandler]) -> Vec<&ShutdownHandler> {
    let mut v: Vec<&ShutdownHandler> = handlers.iter().collect();
    v.sort_by_key(|h| (h.priority, Reverse(h.load_index)));
    v
}

fn log_outcome(h: &ShutdownHandler, outcome: &HandlerOutcome) {
    let err = match outcome {
        HandlerOutcome::Completed => {
            tracing::info!(module = %h.module_id, kind = %h.kind, "Shutdown handler completed");
            return;
        }
        HandlerOutcome::TimedOut(timeout) => ShutdownError::Timeout {
            module: h.module_id.clone(),
            kind: h.kind,
            timeout: *timeout,
        },
        HandlerOutcome::Failed(message) => ShutdownError::Failed {
            module: h.module_id.clone(),
            kind: h.kind,
            message: message.clone(),
        },
        HandlerOutcome::Panicked(message) => ShutdownError::Panicked {
            module: h.module_id.clone(),
            kind: h.kind,
            message: message.clone(),
        },
    };
    match h.kind {
        ShutdownKind::Graceful => tracing::warn!(error = %err, "Shutdown handler did not complete"),
        // forced-pass errors are expected noise
        ShutdownKind::Forced => tracing::debug!(error = %err, "Forced stop did not complete"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Probe {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        stop_delay: Duration,
        stop_fails: bool,
        force_delay: Duration,
    }

    impl Probe {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: log.clone(),
                stop_delay: Duration::ZERO,
                stop_fails: false,
                force_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl StatefulModule for Probe {
        async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            tokio::time::sleep(self.stop_delay).await;
            self.log.lock().push(format!("stop:{}", self.name));
            if self.stop_fails {
                anyhow::bail!("stop failed");
            }
            Ok(())
        }

        fn force_stop(&self) -> anyhow::Result<()> {
            std::thread::sleep(self.force_delay);
            self.log.lock().push(format!("force:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn priority_then_reverse_load_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut o = ShutdownOrchestrator::new();
        let t = Duration::from_secs(1);
        o.register(ShutdownHandler::graceful("a", Arc::new(Probe::new("a", &log)), 10, t).with_load_index(0));
        o.register(ShutdownHandler::graceful("b", Arc::new(Probe::new("b", &log)), 10, t).with_load_index(1));
        o.register(ShutdownHandler::graceful("c", Arc::new(Probe::new("c", &log)), 5, t).with_load_index(2));

        let report = o.run(CancellationToken::new()).await;
        assert!(report.all_completed());
        assert_eq!(*log.lock(), vec!["stop:c", "stop:b", "stop:a"]);
    }

    #[tokio::test]
    async fn timeout_does_not_block_next_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut slow = Probe::new("slow", &log);
        slow.stop_delay = Duration::from_secs(30);

        let mut o = ShutdownOrchestrator::new();
        o.register(ShutdownHandler::graceful("slow", Arc::new(slow), 1, Duration::from_millis(50)));
        o.register(ShutdownHandler::graceful("next", Arc::new(Probe::new("next", &log)), 2, Duration::from_secs(1)));
        o.register(ShutdownHandler::forced("slow", Arc::new(Probe::new("slow", &log)), 1, Duration::from_secs(1)));

        let report = o.run(CancellationToken::new()).await;

        assert_eq!(report.graceful[0].outcome, HandlerOutcome::TimedOut(Duration::from_millis(50)));
        assert_eq!(report.graceful[1].outcome, HandlerOutcome::Completed);
        assert_eq!(report.forced[0].outcome, HandlerOutcome::Completed);
        assert_eq!(*log.lock(), vec!["stop:next", "force:slow"]);
    }

    #[tokio::test]
    async fn forced_pass_runs_after_every_graceful_handler_timed_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut o = ShutdownOrchestrator::new();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            let mut stuck = Probe::new(name, &log);
            stuck.stop_delay = Duration::from_secs(30);
            o.register(ShutdownHandler::graceful(name, Arc::new(stuck), i as i32, Duration::from_millis(20)));
            o.register(ShutdownHandler::forced(name, Arc::new(Probe::new(name, &log)), i as i32, Duration::from_secs(1)));
        }

        let started = std::time::Instant::now();
        let report = o.run(CancellationToken::new()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report
            .graceful
            .iter()
            .all(|r| r.outcome == HandlerOutcome::TimedOut(Duration::from_millis(20))));
        assert!(report.forced.iter().all(|r| r.outcome == HandlerOutcome::Completed));
        assert_eq!(*log.lock(), vec!["force:a", "force:b", "force:c"]);
    }

    #[tokio::test]
    async fn errors_are_logged_and_passed_over() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Probe::new("bad", &log);
        failing.stop_fails = true;

        let mut o = ShutdownOrchestrator::new();
        let t = Duration::from_secs(1);
        o.register(ShutdownHandler::graceful("bad", Arc::new(failing), 1, t));
        o.register(ShutdownHandler::graceful("good", Arc::new(Probe::new("good", &log)), 2, t));

        let report = o.run(CancellationToken::new()).await;
        assert!(matches!(report.graceful[0].outcome, HandlerOutcome::Failed(_)));
        assert_eq!(report.graceful[1].outcome, HandlerOutcome::Completed);
    }

    #[tokio::test]
    async fn hung_forced_handler_is_abandoned() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hung = Probe::new("hung", &log);
        hung.force_delay = Duration::from_millis(500);

        let mut o = ShutdownOrchestrator::new();
        o.register(ShutdownHandler::forced("hung", Arc::new(hung), 1, Duration::from_millis(20)));
        o.register(ShutdownHandler::forced("ok", Arc::new(Probe::new("ok", &log)), 2, Duration::from_secs(1)));

        let started = std::time::Instant::now();
        let report = o.run(CancellationToken::new()).await;

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(report.forced[0].outcome, HandlerOutcome::TimedOut(Duration::from_millis(20)));
        assert_eq!(report.forced[1].outcome, HandlerOutcome::Completed);
        assert_eq!(*log.lock(), vec!["force:ok"]);
    }

    #[tokio::test]
    async fn graceful_timeout_cancels_handler_token() {
        struct Watcher(Arc<Mutex<Option<CancellationToken>>>);

        #[async_trait]
        impl StatefulModule for Watcher {
            async fn stop(&self, cancel: CancellationToken) -> anyhow::Result<()> {
                *self.0.lock() = Some(cancel);
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let mut o = ShutdownOrchestrator::new();
        o.register(ShutdownHandler::graceful(
            "w",
            Arc::new(Watcher(seen.clone())),
            1,
            Duration::from_millis(20),
        ));
        o.run(CancellationToken::new()).await;

        let token = seen.lock().clone().expect("stop was called");
        assert!(token.is_cancelled());
    }
}
