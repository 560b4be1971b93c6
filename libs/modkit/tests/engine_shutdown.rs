//! Shutdown behaviour of the lifecycle engine.

mod common;

use common::{calls, tracker, Faults, Greeter, TestFactory};
use modkit::shutdown::HandlerOutcome;
use modkit::{Engine, EnginePhase, ModuleDescriptor, ModuleStatus, ServiceSpec};
use std::time::Duration;

fn stateful(id: &str, priority: i32) -> ModuleDescriptor {
    ModuleDescriptor::new(id)
        .graceful_shutdown(priority, Some(Duration::from_secs(1)))
        .forced_shutdown(priority, Some(Duration::from_secs(1)))
}

fn stop_calls(t: &common::CallTracker) -> Vec<String> {
    calls(t)
        .into_iter()
        .filter(|c| c.starts_with("stop:") || c.starts_with("force:"))
        .collect()
}

#[tokio::test]
async fn graceful_pass_runs_before_forced_pass_in_priority_order() {
    let t = tracker();
    let mut engine = Engine::builder()
        .module(TestFactory::new(stateful("late", 200), &t))
        .module(TestFactory::new(stateful("early", 10), &t))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let report = engine.shutdown().await;

    assert!(report.all_completed());
    assert_eq!(
        stop_calls(&t),
        vec!["stop:early", "stop:late", "force:early", "force:late"]
    );
    for id in ["early", "late"] {
        assert_eq!(engine.status(id), Some(ModuleStatus::Stopped));
    }
    assert_eq!(engine.phase(), EnginePhase::Stopped);
}

#[tokio::test]
async fn dependents_stop_first_on_equal_priority() {
    let t = tracker();
    let mut engine = Engine::builder()
        .module(TestFactory::new(stateful("db", 100).depends_on("cache"), &t))
        .module(TestFactory::new(stateful("cache", 100), &t))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.shutdown().await;

    assert_eq!(
        stop_calls(&t),
        vec!["stop:db", "stop:cache", "force:db", "force:cache"]
    );
}

#[tokio::test]
async fn failing_handler_does_not_stop_the_pass() {
    let t = tracker();
    let mut engine = Engine::builder()
        .module(
            TestFactory::new(stateful("flaky", 1), &t).with_faults(Faults {
                stop: true,
                ..Faults::default()
            }),
        )
        .module(TestFactory::new(stateful("steady", 2), &t))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let report = engine.shutdown().await;

    assert!(!report.all_completed());
    assert!(matches!(report.graceful[0].outcome, HandlerOutcome::Failed(_)));
    assert_eq!(report.graceful[1].outcome, HandlerOutcome::Completed);
    assert_eq!(engine.status("steady"), Some(ModuleStatus::Stopped));
    assert_eq!(engine.status("flaky"), Some(ModuleStatus::Stopped));
}

#[tokio::test]
async fn modules_that_never_registered_are_not_stopped() {
    let t = tracker();
    let mut engine = Engine::builder()
        .module(
            TestFactory::new(stateful("dud", 1), &t).with_faults(Faults {
                register: true,
                ..Faults::default()
            }),
        )
        .module(TestFactory::new(stateful("ok", 1), &t))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.shutdown().await;

    assert_eq!(stop_calls(&t), vec!["stop:ok", "force:ok"]);
    assert_eq!(engine.status("dud"), Some(ModuleStatus::Failed));
}

#[tokio::test]
async fn modules_failed_in_stage2_still_get_stopped() {
    let t = tracker();
    let mut engine = Engine::builder()
        .module(
            TestFactory::new(stateful("half", 1).init_hook(), &t).with_faults(Faults {
                init: true,
                ..Faults::default()
            }),
        )
        .build()
        .unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.status("half"), Some(ModuleStatus::Failed));

    engine.shutdown().await;

    assert_eq!(stop_calls(&t), vec!["stop:half", "force:half"]);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_clears_the_container() {
    let t = tracker();
    let mut engine = Engine::builder()
        .module(TestFactory::new(
            stateful("svc", 1).provides(ServiceSpec::new("greeter")),
            &t,
        ))
        .build()
        .unwrap();
    engine.start().await.unwrap();
    assert!(engine.container().get::<dyn Greeter>("greeter").is_ok());

    let first = engine.shutdown().await;
    let second = engine.shutdown().await;

    assert_eq!(first.graceful.len(), 1);
    assert!(second.graceful.is_empty() && second.forced.is_empty());
    assert!(engine.container().is_empty());
    assert_eq!(stop_calls(&t), vec!["stop:svc", "force:svc"]);
}
