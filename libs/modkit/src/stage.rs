//! Stage executor.
//!
//! Stage 1 is synchronous and walks modules in load order. Stage 2 is handed
//! to the post-init hook scheduler. Module status follows both: a module is
//! `Ready` only once its own hook (if any) has completed.

use std::panic::AssertUnwindSafe;

use crate::container::ServiceContainer;
use crate::context::{ConfigProvider, ConfigRegistry, RegisterCtx};
use crate::descriptor::DependencyPolicy;
use crate::hooks::{panic_message, HookEvent, HookOutcome, HookReport, HookScheduler, PostInitHook};
use crate::pipeline::Wiring;
use crate::registry::{ModuleEntry, ModuleRegistry};
use crate::status::{FailurePhase, ModuleStatus};

pub(crate) struct StageExecutor<'a> {
    pub registry: &'a ModuleRegistry,
    pub wiring: &'a Wiring,
    pub container: &'a ServiceContainer,
    pub config: &'a dyn ConfigProvider,
    pub schemas: &'a dyn ConfigRegistry,
    pub policy: DependencyPolicy,
}

impl StageExecutor<'_> {
    /// Stage 1 for every wired module, in `order`. Returns ids that completed it.
    pub fn run_stage1(&self, order: &[String]) -> Vec<String> {
        tracing::info!("Phase: stage 1");
        let mut registered = Vec::new();

        for id in order {
            let (Some(entry), Some(wired)) = (self.registry.get(id), self.wiring.modules.get(id)) else {
                continue;
            };
            if !entry.is_processed() || entry.status() == ModuleStatus::Failed {
                continue;
            }

            let unavailable: Vec<&str> = wired
                .dependencies
                .iter()
                .filter(|dep| self.registry.status(dep) != Some(ModuleStatus::Stage1Registered))
                .map(String::as_str)
                .collect();
            if !unavailable.is_empty() {
                let strict = entry.descriptor().dependency_policy.unwrap_or(self.policy)
                    == DependencyPolicy::Strict;
                if strict {
                    self.fail(entry, format!("required dependencies failed stage 1: {}", unavailable.join(", ")));
                    continue;
                }
                tracing::warn!(
                    module = %id,
                    unavailable = ?unavailable,
                    "Dependencies failed stage 1; continuing without them"
                );
            }

            let mut ctx = RegisterCtx::new(id, self.config.get_module_config(id), self.schemas);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| wired.core.register(&mut ctx)));
            match result {
                Ok(Ok(())) => {
                    if let Err(e) = entry.transition(ModuleStatus::Stage1Registered) {
                        tracing::warn!(module = %id, error = %e, "Unexpected status after stage 1");
                        continue;
                    }
                    let published = self.container.publish_owner(id);
                    tracing::info!(
                        module = %id,
                        entry = %wired.stage1_entry,
                        services = ?published,
                        "Stage 1 complete"
                    );
                    registered.push(id.clone());
                }
                Ok(Err(e)) => self.fail(entry, format!("{e:#}")),
                Err(p) => self.fail(entry, format!("panicked: {}", panic_message(p.as_ref()))),
            }
        }
        registered
    }

    fn fail(&self, entry: &ModuleEntry, reason: String) {
        entry.fail(FailurePhase::Stage1, reason);
        let dropped = self.container.discard_owner(entry.id());
        if dropped > 0 {
            tracing::debug!(module = %entry.id(), dropped, "Discarded staged services");
        }
    }

    /// Stage 2 through the hook scheduler. Hooks of modules that did not
    /// complete Stage 1 stay in the graph disabled, so their dependents skip.
    pub async fn run_stage2(&self, hooks: Vec<PostInitHook>) -> HookReport {
        tracing::info!(hooks = hooks.len(), "Phase: stage 2");
        let mut scheduler = HookScheduler::new();
        for hook in hooks {
            let hook = if self.registry.status(hook.module_id()) == Some(ModuleStatus::Stage1Registered) {
                hook
            } else {
                let reason = format!("module '{}' did not complete stage 1", hook.module_id());
                hook.disabled(reason)
            };
            if let Err(e) = scheduler.register(hook) {
                tracing::warn!(error = %e, "Dropping post-init hook");
            }
        }

        let registry = self.registry;
        let report = scheduler
            .run(|event| match event {
                HookEvent::Starting { module_id, .. } => {
                    if let Some(e) = registry.get(module_id) {
                        if let Err(err) = e.transition(ModuleStatus::Stage2Initializing) {
                            tracing::warn!(module = %module_id, error = %err, "Unexpected status before stage 2");
                        }
                    }
                }
                HookEvent::Finished {
                    hook,
                    module_id,
                    outcome,
                } => {
                    let Some(e) = registry.get(module_id) else {
                        return;
                    };
                    match outcome {
                        HookOutcome::Completed => {
                            if e.transition(ModuleStatus::Ready).is_ok() {
                                tracing::info!(module = %module_id, "Module ready");
                            }
                        }
                        HookOutcome::Failed { error } => {
                            e.fail(FailurePhase::Stage2, format!("hook '{hook}' failed: {error}"))
                        }
                        HookOutcome::Skipped { reason } => {
                            if e.status().is_live() {
                                e.fail(FailurePhase::Stage2, format!("hook '{hook}' skipped: {reason}"))
                            }
                        }
                    }
                }
            })
            .await;

        // modules without a hook become ready once stage 2 is over
        for (id, wired) in &self.wiring.modules {
            if wired.has_hook {
                continue;
            }
            if let Some(e) = self.registry.get(id) {
                if e.status() == ModuleStatus::Stage1Registered && e.transition(ModuleStatus::Ready).is_ok() {
                    tracing::info!(module = %id, "Module ready");
                }
            }
        }
        report
    }
}
