//! Post-init hook scheduler.
//!
//! Hooks run one at a time. Order is dependency-first, ties broken by
//! `(priority, name)` ascending. A hook whose dependency is missing, failed,
//! skipped or part of a cycle never runs; the skip propagates to everything
//! that depends on it, transitively.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;

use crate::descriptor::DEFAULT_PRIORITY;
use crate::graph::DependencyGraph;

type HookFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct PostInitHook {
    name: String,
    module_id: String,
    dependencies: Vec<String>,
    priority: i32,
    callback: HookFn,
    disabled: Option<String>,
}

impl PostInitHook {
    pub fn new<F, Fut>(name: impl Into<String>, module_id: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            module_id: module_id.into(),
            dependencies: Vec::new(),
            priority: DEFAULT_PRIORITY,
            callback: Box::new(move || callback().boxed()),
            disabled: None,
        }
    }

    pub fn after(mut self, hook: impl Into<String>) -> Self {
        self.dependencies.push(hook.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Keeps the hook in the graph but never runs it; dependents are skipped.
    pub fn disabled(mut self, reason: impl Into<String>) -> Self {
        self.disabled = Some(reason.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }
}

impl fmt::Debug for PostInitHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostInitHook")
            .field("name", &self.name)
            .field("module", &self.module_id)
            .field("after", &self.dependencies)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HookError {
    #[error("post-init hook '{0}' is already registered")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Depends on a hook nobody registered.
    MissingDependency { dependency: String },
    /// A dependency failed or was skipped; `chain` walks back to the root cause.
    DependencyFailed { chain: Vec<String> },
    /// Part of (or downstream of) a dependency cycle.
    Cycle { path: Vec<String> },
    Disabled { reason: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingDependency { dependency } => {
                write!(f, "dependency '{dependency}' is not registered")
            }
            SkipReason::DependencyFailed { chain } => {
                write!(f, "dependency did not complete: {}", chain.join(" <- "))
            }
            SkipReason::Cycle { path } => write!(f, "dependency cycle: {}", path.join(" -> ")),
            SkipReason::Disabled { reason } => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Completed,
    Failed { error: String },
    Skipped { reason: SkipReason },
}

impl HookOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, HookOutcome::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    pub hook: String,
    pub module_id: String,
    pub outcome: HookOutcome,
}

/// Outcomes in the order hooks were considered.
#[derive(Debug, Clone, Default)]
pub struct HookReport {
    pub records: Vec<HookRecord>,
}

impl HookReport {
    pub fn outcome(&self, hook: &str) -> Option<&HookOutcome> {
        self.records.iter().find(|r| r.hook == hook).map(|r| &r.outcome)
    }

    /// Names of hooks that actually ran to completion, in execution order.
    pub fn completed(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, HookOutcome::Completed))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, HookOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, HookOutcome::Skipped { .. }))
    }

    fn filter(&self, pred: impl Fn(&HookOutcome) -> bool) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| pred(&r.outcome))
            .map(|r| r.hook.as_str())
            .collect()
    }
}

/// Progress notifications, delivered synchronously around each hook.
#[derive(Debug)]
pub enum HookEvent<'a> {
    Starting { hook: &'a str, module_id: &'a str },
    Finished { hook: &'a str, module_id: &'a str, outcome: &'a HookOutcome },
}

#[derive(Default)]
pub struct HookScheduler {
    hooks: Vec<PostInitHook>,
    names: HashMap<String, usize>,
}

impl HookScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: PostInitHook) -> Result<(), HookError> {
        if self.names.contains_key(&hook.name) {
            return Err(HookError::Duplicate(hook.name));
        }
        self.names.insert(hook.name.clone(), self.hooks.len());
        self.hooks.push(hook);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn run_all(self) -> HookReport {
        self.run(|_| {}).await
    }

    pub async fn run<F>(self, mut on_event: F) -> HookReport
    where
        F: FnMut(HookEvent<'_>) + Send,
    {
        let (order, mut pre_skipped) = self.plan();
        let mut slots: Vec<Option<PostInitHook>> = self.hooks.into_iter().map(Some).collect();
        let mut outcomes: HashMap<String, HookOutcome> = HashMap::new();
        let mut report = HookReport::default();

        for idx in order {
            let Some(hook) = slots[idx].take() else {
                continue;
            };

            let outcome = match pre_skipped.remove(&idx) {
                Some(reason) => HookOutcome::Skipped { reason },
                None => match blocked_by(&hook, &outcomes) {
                    Some(reason) => HookOutcome::Skipped { reason },
                    None => {
                        on_event(HookEvent::Starting {
                            hook: &hook.name,
                            module_id: &hook.module_id,
                        });
                        tracing::debug!(hook = %hook.name, module = %hook.module_id, "Running post-init hook");
                        execute(hook.callback).await
                    }
                },
            };

            match &outcome {
                HookOutcome::Completed => {
                    tracing::info!(hook = %hook.name, module = %hook.module_id, "Post-init hook completed")
                }
                HookOutcome::Failed { error } => {
                    tracing::error!(hook = %hook.name, module = %hook.module_id, error = %error, "Post-init hook failed")
                }
                HookOutcome::Skipped { reason } => {
                    tracing::warn!(hook = %hook.name, module = %hook.module_id, reason = %reason, "Post-init hook skipped")
                }
            }

            on_event(HookEvent::Finished {
                hook: &hook.name,
                module_id: &hook.module_id,
                outcome: &outcome,
            });
            outcomes.insert(hook.name.clone(), outcome.clone());
            report.records.push(HookRecord {
                hook: hook.name,
                module_id: hook.module_id,
                outcome,
            });
        }

        report
    }

    /// Kahn's algorithm over present dependencies with a `(priority, name)` min-heap.
    /// Hooks left over belong to, or hang off, a cycle; they are appended in
    /// `(priority, name)` order and pre-marked as skipped.
    fn plan(&self) -> (Vec<usize>, HashMap<usize, SkipReason>) {
        let n = self.hooks.len();
        let mut pre_skipped = HashMap::new();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        let mut graph = DependencyGraph::new();

        for h in &self.hooks {
            graph.add_node(h.name.as_str());
        }
        for (i, h) in self.hooks.iter().enumerate() {
            if let Some(reason) = &h.disabled {
                pre_skipped.insert(i, SkipReason::Disabled { reason: reason.clone() });
            }
            for dep in &h.dependencies {
                match self.names.get(dep) {
                    Some(&d) => {
                        if graph.add_edge(&h.name, dep) {
                            dependents[d].push(i);
                            indegree[i] += 1;
                        }
                    }
                    None => {
                        pre_skipped
                            .entry(i)
                            .or_insert_with(|| SkipReason::MissingDependency {
                                dependency: dep.clone(),
                            });
                    }
                }
            }
        }

        let key = |i: usize| Reverse((self.hooks[i].priority, self.hooks[i].name.clone(), i));
        let mut heap: BinaryHeap<_> = (0..n).filter(|&i| indegree[i] == 0).map(key).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, _, i))) = heap.pop() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    heap.push(key(d));
                }
            }
        }

        if order.len() < n {
            let mut rest: Vec<usize> = (0..n).filter(|&i| indegree[i] > 0).collect();
            rest.sort_by_key(|&i| (self.hooks[i].priority, self.hooks[i].name.clone()));
            for i in rest {
                let path = graph.cycle_from(&self.hooks[i].name).unwrap_or_default();
                tracing::error!(
                    hook = %self.hooks[i].name,
                    module = %self.hooks[i].module_id,
                    cycle = %path.join(" -> "),
                    "Post-init hook is blocked by a dependency cycle"
                );
                pre_skipped.insert(i, SkipReason::Cycle { path });
                order.push(i);
            }
        }

        (order, pre_skipped)
    }
}

fn blocked_by(hook: &PostInitHook, done: &HashMap<String, HookOutcome>) -> Option<SkipReason> {
    for dep in &hook.dependencies {
        match done.get(dep) {
            Some(HookOutcome::Completed) => {}
            Some(HookOutcome::Skipped {
                reason: SkipReason::DependencyFailed { chain },
            }) => {
                let mut full = vec![dep.clone()];
                full.extend(chain.iter().cloned());
                return Some(SkipReason::DependencyFailed { chain: full });
            }
            Some(_) | None => {
                return Some(SkipReason::DependencyFailed {
                    chain: vec![dep.clone()],
                })
            }
        }
    }
    None
}

async fn execute(callback: HookFn) -> HookOutcome {
    match AssertUnwindSafe(callback()).catch_unwind().await {
        Ok(Ok(())) => HookOutcome::Completed,
        Ok(Err(e)) => HookOutcome::Failed {
            error: format!("{e:#}"),
        },
        Err(panic) => HookOutcome::Failed {
            error: format!("panicked: {}", panic_message(panic.as_ref())),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &str) -> PostInitHook {
        let log = log.clone();
        let label = name.to_string();
        PostInitHook::new(name, "m", move || async move {
            log.lock().push(label);
            Ok(())
        })
    }

    #[tokio::test]
    async fn runs_dependencies_first_then_priority_then_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut s = HookScheduler::new();
        s.register(recording(&log, "z").with_priority(1)).unwrap();
        s.register(recording(&log, "b")).unwrap();
        s.register(recording(&log, "a")).unwrap();
        s.register(recording(&log, "first").with_priority(50).after("b")).unwrap();

        let report = s.run_all().await;
        assert_eq!(*log.lock(), vec!["z", "a", "b", "first"]);
        assert_eq!(report.completed(), vec!["z", "a", "b", "first"]);
    }

    #[tokio::test]
    async fn failure_skips_dependents_transitively() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut s = HookScheduler::new();
        s.register(PostInitHook::new("h1", "m", || async { Err(anyhow::anyhow!("boom")) }))
            .unwrap();
        s.register(recording(&log, "h2").after("h1")).unwrap();
        s.register(recording(&log, "h3").after("h2")).unwrap();
        s.register(recording(&log, "other")).unwrap();

        let report = s.run_all().await;

        assert_eq!(*log.lock(), vec!["other"]);
        assert_eq!(report.failed(), vec!["h1"]);
        assert_eq!(
            report.outcome("h3"),
            Some(&HookOutcome::Skipped {
                reason: SkipReason::DependencyFailed {
                    chain: vec!["h2".into(), "h1".into()]
                }
            })
        );
    }

    #[tokio::test]
    async fn missing_dependency_skips_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut s = HookScheduler::new();
        s.register(recording(&log, "h").after("ghost")).unwrap();
        s.register(recording(&log, "after_h").after("h")).unwrap();

        let report = s.run_all().await;
        assert!(log.lock().is_empty());
        assert_eq!(
            report.outcome("h"),
            Some(&HookOutcome::Skipped {
                reason: SkipReason::MissingDependency {
                    dependency: "ghost".into()
                }
            })
        );
        assert_eq!(report.skipped(), vec!["h", "after_h"]);
    }

    #[tokio::test]
    async fn cycle_is_skipped_not_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut s = HookScheduler::new();
        s.register(recording(&log, "x").after("y")).unwrap();
        s.register(recording(&log, "y").after("x")).unwrap();
        s.register(recording(&log, "free")).unwrap();

        let report = s.run_all().await;
        assert_eq!(*log.lock(), vec!["free"]);
        assert!(matches!(
            report.outcome("x"),
            Some(HookOutcome::Skipped { reason: SkipReason::Cycle { .. } })
        ));
        assert!(matches!(
            report.outcome("y"),
            Some(HookOutcome::Skipped { reason: SkipReason::Cycle { .. } })
        ));
    }

    #[tokio::test]
    async fn each_cycle_is_reported_on_its_own_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut s = HookScheduler::new();
        s.register(recording(&log, "a").after("b")).unwrap();
        s.register(recording(&log, "b").after("a")).unwrap();
        s.register(recording(&log, "x").after("y")).unwrap();
        s.register(recording(&log, "y").after("x")).unwrap();
        s.register(recording(&log, "tail").after("y")).unwrap();

        let report = s.run_all().await;
        assert!(log.lock().is_empty());
        let cycle = |hook: &str| match report.outcome(hook) {
            Some(HookOutcome::Skipped {
                reason: SkipReason::Cycle { path },
            }) => path.clone(),
            other => panic!("{hook}: unexpected outcome {other:?}"),
        };
        assert_eq!(cycle("a"), vec!["a", "b", "a"]);
        assert_eq!(cycle("x"), vec!["x", "y", "x"]);
        assert_eq!(cycle("y"), vec!["y", "x", "y"]);
        assert_eq!(cycle("tail"), vec!["y", "x", "y"]);
    }

    #[tokio::test]
    async fn panicking_hook_counts_as_failure() {
        let mut s = HookScheduler::new();
        let explode = true;
        s.register(PostInitHook::new("p", "m", move || async move {
            if explode {
                panic!("kaboom");
            }
            Ok(())
        }))
        .unwrap();
        let report = s.run_all().await;
        match report.outcome("p") {
            Some(HookOutcome::Failed { error }) => assert!(error.contains("kaboom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut s = HookScheduler::new();
        s.register(PostInitHook::new("h", "m", || async { Ok(()) })).unwrap();
        let err = s
            .register(PostInitHook::new("h", "n", || async { Ok(()) }))
            .unwrap_err();
        assert_eq!(err, HookError::Duplicate("h".into()));
    }

    #[tokio::test]
    async fn events_wrap_each_executed_hook() {
        let mut s = HookScheduler::new();
        s.register(PostInitHook::new("h", "m", || async { Ok(()) })).unwrap();
        s.register(PostInitHook::new("skip", "m", || async { Ok(()) }).disabled("off"))
            .unwrap();

        let mut seen = Vec::new();
        s.run(|ev| match ev {
            HookEvent::Starting { hook, .. } => seen.push(format!("start:{hook}")),
            HookEvent::Finished { hook, outcome, .. } => {
                seen.push(format!("end:{hook}:{}", outcome.is_completed()))
            }
        })
        .await;
        assert_eq!(seen, vec!["start:h", "end:h:true", "end:skip:false"]);
    }
}
