//! Lifecycle tests for the module host: phase ordering, failure containment,
//! service visibility and shutdown.

use std::sync::{Arc, Mutex};

use modkit::{
    resolve, ContextError, EntryPointTable, FailureCause, HostOptions, LifecycleStep, Module,
    ModuleCtx, ModuleCtxBuilder, ModuleDescriptor, ModuleHost, ModulePhase, Phase,
};
use tokio_util::sync::CancellationToken;

type CallTracker = Arc<Mutex<Vec<String>>>;

fn record(calls: &CallTracker, event: String) {
    calls.lock().unwrap().push(event);
}

#[derive(Clone, Default)]
struct Behaviour {
    services: Vec<&'static str>,
    needs: Vec<&'static str>,
    fail_init: bool,
    fail_setup: bool,
    fail_shutdown: bool,
    panic_shutdown: bool,
}

struct Scripted {
    calls: CallTracker,
    b: Behaviour,
}

#[async_trait::async_trait]
impl Module for Scripted {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let id = ctx.module_id().to_string();
        record(&self.calls, format!("init:{id}"));

        for name in &self.b.services {
            ctx.register_service(name, Arc::new(format!("{id}/{name}")))?;
        }

        let calls = self.calls.clone();
        let fail_shutdown = self.b.fail_shutdown;
        let panic_shutdown = self.b.panic_shutdown;
        let stop_id = id.clone();
        ctx.register_shutdown_handler(move || async move {
            record(&calls, format!("stop:{stop_id}"));
            if panic_shutdown {
                panic!("stop panicked");
            }
            if fail_shutdown {
                anyhow::bail!("stop failed");
            }
            Ok(())
        })?;

        if self.b.fail_init {
            anyhow::bail!("init failed");
        }

        let calls = self.calls.clone();
        let needs = self.b.needs.clone();
        let fail_setup = self.b.fail_setup;
        ctx.register_setup_hook(move |ctx| async move {
            record(&calls, format!("setup:{}", ctx.module_id()));
            for name in needs {
                let svc = ctx.require_service::<String>(name)?;
                record(&calls, format!("saw:{svc}"));
            }
            if fail_setup {
                anyhow::bail!("setup failed");
            }
            Ok(())
        })?;
        Ok(())
    }
}

struct Fixture {
    calls: CallTracker,
    host: ModuleHost,
}

fn m(id: &'static str, deps: &[&'static str], b: Behaviour) -> (&'static str, Vec<&'static str>, Behaviour) {
    (id, deps.to_vec(), b)
}

fn fixture(modules: Vec<(&'static str, Vec<&'static str>, Behaviour)>) -> Fixture {
    let calls: CallTracker = Arc::default();
    let mut table = EntryPointTable::new();
    let mut catalogue = Vec::new();
    for (id, deps, b) in modules {
        catalogue.push(ModuleDescriptor::new(id, id, &deps));
        table.register_instance(
            id,
            Arc::new(Scripted {
                calls: calls.clone(),
                b,
            }),
        );
    }
    let plan = resolve(&catalogue).unwrap();
    let ctx = ModuleCtxBuilder::new(CancellationToken::new()).build();
    Fixture {
        calls,
        host: ModuleHost::new(plan, &table, ctx, HostOptions::default()),
    }
}

fn events(f: &Fixture) -> Vec<String> {
    f.calls.lock().unwrap().clone()
}

fn position(events: &[String], e: &str) -> usize {
    events
        .iter()
        .position(|x| x == e)
        .unwrap_or_else(|| panic!("missing event {e}: {events:?}"))
}

#[tokio::test]
async fn two_module_scenario_runs_end_to_end() {
    let f = fixture(vec![
        m(
            "core.b",
            &["core.a"],
            Behaviour {
                services: vec!["svc_b"],
                needs: vec!["svc_a"],
                ..Default::default()
            },
        ),
        m(
            "core.a",
            &[],
            Behaviour {
                services: vec!["svc_a"],
                ..Default::default()
            },
        ),
    ]);

    let report = f.host.start().await.unwrap();
    assert_eq!(report.order, vec!["core.a", "core.b"]);
    assert_eq!(report.active, vec!["core.a", "core.b"]);
    assert!(report.is_clean());

    f.host.shutdown().await;
    assert_eq!(
        events(&f),
        vec![
            "init:core.a",
            "init:core.b",
            "setup:core.a",
            "setup:core.b",
            "saw:core.a/svc_a",
            "stop:core.b",
            "stop:core.a",
        ]
    );
    assert!(f.host.context().services().is_empty());
}

#[tokio::test]
async fn every_phase_one_precedes_every_phase_two() {
    let f = fixture(vec![
        m("core.a", &[], Behaviour::default()),
        m("core.b", &["core.a"], Behaviour::default()),
        m("standard.c", &[], Behaviour::default()),
        m("standard.d", &["standard.c", "core.b"], Behaviour::default()),
    ]);
    f.host.start().await.unwrap();

    let ev = events(&f);
    let last_init = ev.iter().rposition(|e| e.starts_with("init:")).unwrap();
    let first_setup = ev.iter().position(|e| e.starts_with("setup:")).unwrap();
    assert!(last_init < first_setup, "{ev:?}");

    // Within each phase, dependencies first.
    for phase in ["init", "setup"] {
        assert!(position(&ev, &format!("{phase}:core.a")) < position(&ev, &format!("{phase}:core.b")));
        assert!(position(&ev, &format!("{phase}:core.b")) < position(&ev, &format!("{phase}:standard.d")));
        assert!(position(&ev, &format!("{phase}:standard.c")) < position(&ev, &format!("{phase}:standard.d")));
    }
}

#[tokio::test]
async fn phase_two_sees_services_of_later_modules() {
    // `core.early` does not depend on `ext.late`, yet its setup hook can use it.
    let f = fixture(vec![
        m(
            "core.early",
            &[],
            Behaviour {
                needs: vec!["late_svc"],
                ..Default::default()
            },
        ),
        m(
            "ext.late",
            &[],
            Behaviour {
                services: vec!["late_svc"],
                ..Default::default()
            },
        ),
    ]);
    let report = f.host.start().await.unwrap();
    assert!(report.is_clean());
    assert!(events(&f).contains(&"saw:ext.late/late_svc".to_string()));
}

#[tokio::test]
async fn phase_one_failure_is_contained() {
    let f = fixture(vec![
        m(
            "core.a",
            &[],
            Behaviour {
                services: vec!["svc_a"],
                fail_init: true,
                ..Default::default()
            },
        ),
        m("core.b", &["core.a"], Behaviour::default()),
        m("core.c", &[], Behaviour::default()),
    ]);

    let report = f.host.start().await.unwrap();
    assert_eq!(report.active, vec!["core.c"]);
    assert_eq!(f.host.status("core.a"), Some(ModulePhase::Failed));
    assert_eq!(f.host.status("core.b"), Some(ModulePhase::Failed));
    assert_eq!(f.host.status("core.c"), Some(ModulePhase::Phase2Complete));

    let ev = events(&f);
    assert!(!ev.contains(&"init:core.b".to_string()), "dependent must not be invoked");
    assert!(!ev.contains(&"setup:core.a".to_string()));
    // Partial registrations of the failed module are withdrawn.
    assert!(!f.host.context().services().contains("svc_a"));

    let failure = |id: &str| {
        report
            .failed
            .iter()
            .find(|(m, _)| m == id)
            .map(|(_, f)| f.clone())
            .unwrap()
    };
    assert_eq!(failure("core.a").step, LifecycleStep::Phase1);
    assert_eq!(failure("core.a").cause, FailureCause::Error);
    assert!(failure("core.a").message.contains("init failed"));
    assert_eq!(
        failure("core.b").cause,
        FailureCause::DependencyFailed {
            dependency: "core.a".into()
        }
    );

    // Shutdown handlers registered before the failure still run.
    f.host.shutdown().await;
    assert!(events(&f).contains(&"stop:core.a".to_string()));
}

#[tokio::test]
async fn phase_two_failure_keeps_services_and_fails_dependents() {
    let f = fixture(vec![
        m(
            "core.a",
            &[],
            Behaviour {
                services: vec!["svc_a"],
                fail_setup: true,
                ..Default::default()
            },
        ),
        m("core.b", &["core.a"], Behaviour::default()),
        m("core.c", &[], Behaviour::default()),
    ]);

    let report = f.host.start().await.unwrap();
    assert_eq!(report.active, vec!["core.c"]);
    assert_eq!(f.host.status("core.a"), Some(ModulePhase::Failed));
    assert_eq!(f.host.status("core.b"), Some(ModulePhase::Failed));

    let ev = events(&f);
    assert!(ev.contains(&"init:core.b".to_string()));
    assert!(!ev.contains(&"setup:core.b".to_string()));
    assert_eq!(
        f.host.context().services().owner_of("svc_a").as_deref(),
        Some("core.a")
    );
}

#[tokio::test]
async fn unavailable_service_fails_only_the_consumer() {
    let f = fixture(vec![
        m(
            "standard.consumer",
            &[],
            Behaviour {
                needs: vec!["scheduler_service"],
                ..Default::default()
            },
        ),
        m("standard.other", &[], Behaviour::default()),
    ]);
    let report = f.host.start().await.unwrap();
    assert_eq!(report.active, vec!["standard.other"]);
    let (id, failure) = &report.failed[0];
    assert_eq!(id, "standard.consumer");
    assert_eq!(failure.step, LifecycleStep::Phase2);
    assert!(failure.message.contains("scheduler_service"));
}

#[tokio::test]
async fn shutdown_runs_in_reverse_and_survives_failing_handlers() {
    let f = fixture(vec![
        m("core.a", &[], Behaviour::default()),
        m(
            "core.b",
            &["core.a"],
            Behaviour {
                fail_shutdown: true,
                ..Default::default()
            },
        ),
        m("core.c", &["core.b"], Behaviour::default()),
    ]);
    f.host.start().await.unwrap();
    f.host.shutdown().await;
    f.host.shutdown().await;

    let stops: Vec<String> = events(&f)
        .into_iter()
        .filter(|e| e.starts_with("stop:"))
        .collect();
    assert_eq!(stops, vec!["stop:core.c", "stop:core.b", "stop:core.a"]);
}

#[tokio::test]
async fn panicking_shutdown_handler_does_not_stop_teardown() {
    let f = fixture(vec![
        m(
            "core.a",
            &[],
            Behaviour {
                services: vec!["svc_a"],
                ..Default::default()
            },
        ),
        m(
            "core.b",
            &["core.a"],
            Behaviour {
                services: vec!["svc_b"],
                panic_shutdown: true,
                ..Default::default()
            },
        ),
        m("core.c", &["core.b"], Behaviour::default()),
    ]);
    f.host.start().await.unwrap();
    f.host.shutdown().await;

    let stops: Vec<String> = events(&f)
        .into_iter()
        .filter(|e| e.starts_with("stop:"))
        .collect();
    assert_eq!(stops, vec!["stop:core.c", "stop:core.b", "stop:core.a"]);
    assert!(f.host.is_shut_down());
    assert!(f.host.context().services().is_empty());
}

fn failure_of(report: &modkit::StartupReport, id: &str) -> modkit::PhaseFailure {
    report
        .failed
        .iter()
        .find(|(m, _)| m == id)
        .map(|(_, f)| f.clone())
        .unwrap_or_else(|| panic!("{id} did not fail: {report:?}"))
}

#[tokio::test]
async fn phase_one_failure_propagates_down_the_chain() {
    let f = fixture(vec![
        m(
            "core.a",
            &[],
            Behaviour {
                fail_init: true,
                ..Default::default()
            },
        ),
        m("core.b", &["core.a"], Behaviour::default()),
        m("core.c", &["core.b"], Behaviour::default()),
    ]);

    let report = f.host.start().await.unwrap();
    assert!(report.active.is_empty());
    for id in ["core.a", "core.b", "core.c"] {
        assert_eq!(f.host.status(id), Some(ModulePhase::Failed), "{id}");
    }

    let ev = events(&f);
    assert!(!ev.contains(&"init:core.b".to_string()), "{ev:?}");
    assert!(!ev.contains(&"init:core.c".to_string()), "{ev:?}");

    let c = failure_of(&report, "core.c");
    assert_eq!(c.step, LifecycleStep::Phase1);
    assert_eq!(
        c.cause,
        FailureCause::DependencyFailed {
            dependency: "core.b".into()
        }
    );
}

#[tokio::test]
async fn phase_two_failure_propagates_down_the_chain() {
    let f = fixture(vec![
        m(
            "core.a",
            &[],
            Behaviour {
                fail_setup: true,
                ..Default::default()
            },
        ),
        m("core.b", &["core.a"], Behaviour::default()),
        m("core.c", &["core.b"], Behaviour::default()),
    ]);

    let report = f.host.start().await.unwrap();
    assert!(report.active.is_empty());
    assert_eq!(f.host.status("core.c"), Some(ModulePhase::Failed));

    let ev = events(&f);
    assert!(ev.contains(&"init:core.c".to_string()), "{ev:?}");
    assert!(!ev.contains(&"setup:core.b".to_string()), "{ev:?}");
    assert!(!ev.contains(&"setup:core.c".to_string()), "{ev:?}");

    let b = failure_of(&report, "core.b");
    assert_eq!(
        b.cause,
        FailureCause::DependencyFailed {
            dependency: "core.a".into()
        }
    );
    let c = failure_of(&report, "core.c");
    assert_eq!(c.step, LifecycleStep::Phase2);
    assert_eq!(
        c.cause,
        FailureCause::DependencyFailed {
            dependency: "core.b".into()
        }
    );
}

/// Tries to take over a service published by another module.
struct Squatter {
    outcome: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Module for Squatter {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let removed = ctx.unregister_service("svc_a")?;
        let replaced = match ctx.register_service("svc_a", Arc::new(String::from("stolen"))) {
            Err(ContextError::Service(_)) => "rejected".to_string(),
            other => format!("{other:?}"),
        };
        let owner = ctx.services().owner_of("svc_a");
        self.outcome.lock().unwrap().extend([
            format!("unregister:{removed}"),
            format!("register:{replaced}"),
            format!("owner:{owner:?}"),
        ]);
        Ok(())
    }
}

#[tokio::test]
async fn module_cannot_replace_or_remove_foreign_service() {
    let calls: CallTracker = Arc::default();
    let outcome = Arc::new(Mutex::new(Vec::new()));
    let mut table = EntryPointTable::new();
    table.register_instance(
        "owner",
        Arc::new(Scripted {
            calls: calls.clone(),
            b: Behaviour {
                services: vec!["svc_a"],
                ..Default::default()
            },
        }),
    );
    table.register_instance(
        "squatter",
        Arc::new(Squatter {
            outcome: outcome.clone(),
        }),
    );
    let plan = resolve(&[
        ModuleDescriptor::new("core.a", "owner", &[]),
        ModuleDescriptor::new("core.b", "squatter", &["core.a"]),
    ])
    .unwrap();
    let ctx = ModuleCtxBuilder::new(CancellationToken::new()).build();
    let host = ModuleHost::new(plan, &table, ctx, HostOptions::default());

    let report = host.start().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(
        *outcome.lock().unwrap(),
        vec![
            "unregister:false".to_string(),
            "register:rejected".to_string(),
            "owner:Some(\"core.a\")".to_string(),
        ]
    );
    let svc = host.context().services().get_typed::<String>("svc_a").unwrap();
    assert_eq!(svc.as_str(), "core.a/svc_a");
}

struct LateRegistrar {
    outcome: Arc<Mutex<Option<String>>>,
}

#[async_trait::async_trait]
impl Module for LateRegistrar {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        assert_eq!(ctx.phase(), Phase::Structural);
        let outcome = self.outcome.clone();
        ctx.register_setup_hook(move |ctx| async move {
            let res = ctx.register_service("too_late", Arc::new(1u8));
            let phase = ctx.phase();
            *outcome.lock().unwrap() = Some(match res {
                Err(ContextError::PhaseClosed { .. }) => format!("closed in {phase:?}"),
                other => format!("unexpected: {other:?}"),
            });
            Ok(())
        })?;
        Ok(())
    }
}

#[tokio::test]
async fn registration_is_closed_during_phase_two() {
    let outcome = Arc::new(Mutex::new(None));
    let mut table = EntryPointTable::new();
    table.register_instance(
        "late",
        Arc::new(LateRegistrar {
            outcome: outcome.clone(),
        }),
    );
    let plan = resolve(&[ModuleDescriptor::new("core.late", "late", &[])]).unwrap();
    let ctx = ModuleCtxBuilder::new(CancellationToken::new()).build();
    let host = ModuleHost::new(plan, &table, ctx, HostOptions::default());

    host.start().await.unwrap();
    assert_eq!(outcome.lock().unwrap().as_deref(), Some("closed in Operational"));
    assert!(!host.context().services().contains("too_late"));
}

#[tokio::test]
async fn snapshot_reflects_module_state() {
    let f = fixture(vec![
        m(
            "core.a",
            &[],
            Behaviour {
                services: vec!["svc_a", "svc_a2"],
                ..Default::default()
            },
        ),
        m(
            "core.b",
            &[],
            Behaviour {
                fail_init: true,
                ..Default::default()
            },
        ),
    ]);
    f.host.run_phase1().await.unwrap();

    let snap = f.host.snapshot();
    assert_eq!(snap.len(), 2);
    assert_eq!(snap[0].module_id, "core.a");
    assert_eq!(snap[0].phase, ModulePhase::Phase1Complete);
    assert_eq!(snap[0].registered_services, vec!["svc_a", "svc_a2"]);
    assert!(snap[0].has_setup_hook);
    assert_eq!(snap[0].shutdown_handlers, 1);
    assert_eq!(snap[1].phase, ModulePhase::Failed);
    assert!(!snap[1].has_setup_hook);
    assert!(snap[1].failure.is_some());
    assert!(f.host.active_modules().is_empty());

    f.host.run_phase2().await.unwrap();
    assert_eq!(f.host.active_modules(), vec!["core.a"]);
    assert_eq!(f.host.status("core.missing"), None);
}
