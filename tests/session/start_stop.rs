use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nix::unistd::{Pid, getpid};

use dbgmux::session::DbgManager;
use dbgmux::session::breakpoint::{BoundBreakpointsBinder, ModuleRefreshSink, ModuleRefreshSource};
use dbgmux::session::engine::{EngineId, EngineMessage, MessageFlags, PredefinedBreak, StartOptions};
use dbgmux::session::error::Error;
use dbgmux::session::hook::StartListener;
use dbgmux::session::object::DbgObject;
use dbgmux::session::process::{DbgModule, DbgRuntime, ProcessState, RuntimeId};
use dbgmux::session::state::RunningState;

use crate::common::{RecordingHook, TestEngine, TestProvider, drain, manager_with};

#[test]
fn attach_then_detach() {
    let engine = TestEngine::attach(4242, 1, &["native", "x64"]);
    let (manager, hook) = manager_with(vec![engine.clone()]);

    manager
        .start(StartOptions::attach(Pid::from_raw(4242)))
        .unwrap();
    drain(&manager);

    assert_eq!(
        hook.take(),
        vec![
            "is_debugging:true",
            "is_running:running",
            r#"tags:added=["native", "x64"]:removed=[]"#,
            "message:process_created:4242",
            "processes_changed:added=[4242]:removed=[]",
            "message:runtime_created:1",
        ]
    );
    assert_eq!(engine.calls(), vec!["start", "run"]);
    assert!(manager.is_debugging());
    assert_eq!(manager.is_running(), RunningState::Running);
    assert_eq!(manager.debug_tags(), vec!["native", "x64"]);

    let process = manager.find_process(Pid::from_raw(4242)).unwrap();
    assert!(process.should_detach());
    let runtime = &process.runtimes()[0];
    assert_eq!(runtime.id(), RuntimeId(1));
    // engine-installed runtime data was visible from the first RuntimeCreated emission
    runtime.with_data::<String, _>(|data| assert_eq!(data.map(String::as_str), Some("data-1")));

    manager.detach_process(&process);
    drain(&manager);

    assert_eq!(
        hook.take(),
        vec![
            "message:runtime_exited:1",
            "message:process_exited:4242:0",
            "processes_changed:added=[]:removed=[4242]",
            r#"tags:added=[]:removed=["native", "x64"]"#,
            "is_running:not_running",
            "is_debugging:false",
        ]
    );
    assert_eq!(engine.calls(), vec!["start", "run", "detach", "close"]);
    assert_eq!(process.state(), ProcessState::Terminated);
    assert_eq!(process.exit_code(), Some(0));
    assert!(!manager.is_debugging());
    assert!(manager.processes().is_empty());
    assert!(manager.debug_tags().is_empty());
    manager.shutdown();
}

#[test]
fn no_provider_accepts() {
    let (manager, hook) = manager_with(vec![]);

    let err = manager
        .start(StartOptions::launch("/bin/app", vec![]))
        .unwrap_err();
    assert!(matches!(err, Error::NoSuitableEngine));

    drain(&manager);
    // nothing was registered, nothing was raised
    assert!(hook.take().is_empty());
    assert!(!manager.is_debugging());
    assert!(manager.debug_tags().is_empty());
    manager.shutdown();
}

#[test]
fn engine_construction_failure_is_reported() {
    let manager = DbgManager::builder()
        .with_provider(TestProvider::failing("backend refused the options"))
        .build();
    let hook = RecordingHook::new();
    manager.add_hook(hook.clone());

    let err = manager
        .start(StartOptions::launch("/bin/app", vec![]))
        .unwrap_err();
    match err {
        Error::EngineCreation(text) => assert!(text.contains("backend refused the options")),
        other => panic!("unexpected error: {other}"),
    }

    drain(&manager);
    assert!(hook.take().is_empty());
    assert!(!manager.is_debugging());
    manager.shutdown();
}

#[test]
fn lowest_provider_order_wins() {
    let preferred = TestEngine::launch(10, 1, &[]);
    let fallback = TestEngine::launch(11, 2, &[]);
    let manager = DbgManager::builder()
        .with_provider(TestProvider::with_order(vec![fallback.clone()], 50))
        .with_provider(TestProvider::with_order(vec![preferred.clone()], 5))
        .build();

    manager
        .start(StartOptions::launch("/bin/app", vec![]))
        .unwrap();
    drain(&manager);

    assert_eq!(preferred.call_count("start"), 1);
    assert!(fallback.calls().is_empty());
    manager.shutdown();
}

#[test]
fn connect_failure_is_routed_and_engine_removed() {
    let engine = TestEngine::attach(5555, 1, &["native"]);
    *engine.connect_error.lock().unwrap() = Some("no such pid".to_string());
    let (manager, hook) = manager_with(vec![engine.clone()]);

    manager
        .start(StartOptions::attach(Pid::from_raw(5555)))
        .unwrap();
    drain(&manager);

    assert_eq!(
        hook.take(),
        vec![
            "is_debugging:true",
            "is_running:running",
            r#"tags:added=["native"]:removed=[]"#,
            "message:user:could not connect:no such pid",
            r#"tags:added=[]:removed=["native"]"#,
            "is_running:not_running",
            "is_debugging:false",
        ]
    );
    assert!(!manager.is_debugging());
    assert!(manager.processes().is_empty());
    assert_eq!(engine.call_count("close"), 1);
    manager.shutdown();
}

#[test]
fn duplicate_runtime_is_refused() {
    let engine = TestEngine::attach(100, 7, &[]);
    let (manager, _hook) = manager_with(vec![engine]);

    manager
        .start(StartOptions::attach(Pid::from_raw(100)))
        .unwrap();
    drain(&manager);

    assert!(!manager.can_debug_runtime(Pid::from_raw(100), RuntimeId(7)));
    assert!(matches!(
        manager.check_debug_runtime(Pid::from_raw(100), RuntimeId(7)),
        Err(Error::AlreadyDebugged(_, _))
    ));
    assert!(manager.can_debug_runtime(Pid::from_raw(100), RuntimeId(8)));
    assert!(manager.can_debug_runtime(Pid::from_raw(101), RuntimeId(7)));
    manager.shutdown();
}

#[test]
fn self_debugging_is_refused() {
    let (manager, _hook) = manager_with(vec![]);
    assert!(!manager.can_debug_runtime(getpid(), RuntimeId(1)));
    assert!(matches!(
        manager.check_debug_runtime(getpid(), RuntimeId(1)),
        Err(Error::SelfAttach(_))
    ));
    assert!(matches!(
        manager.start(StartOptions::attach(getpid())),
        Err(Error::SelfAttach(_))
    ));
    manager.shutdown();
}

#[test]
fn shared_tags_survive_until_last_contributor_leaves() {
    let first = TestEngine::launch(100, 1, &["native"]);
    let second = TestEngine::launch(200, 2, &["native", "managed"]);
    let (manager, hook) = manager_with(vec![first.clone(), second.clone()]);

    manager
        .start(StartOptions::launch("/bin/a", vec![]))
        .unwrap();
    drain(&manager);
    manager
        .start(StartOptions::launch("/bin/b", vec![]))
        .unwrap();
    drain(&manager);

    let tag_events: Vec<String> = hook
        .take()
        .into_iter()
        .filter(|e| e.starts_with("tags:"))
        .collect();
    // the second engine only adds the tag that was not yet visible
    assert_eq!(
        tag_events,
        vec![
            r#"tags:added=["native"]:removed=[]"#,
            r#"tags:added=["managed"]:removed=[]"#,
        ]
    );
    assert_eq!(manager.debug_tags(), vec!["native", "managed"]);

    let p100 = manager.find_process(Pid::from_raw(100)).unwrap();
    manager.terminate_process(&p100);
    drain(&manager);
    // "native" is still contributed by the second engine
    assert!(!hook.take().iter().any(|e| e.starts_with("tags:")));
    assert_eq!(manager.debug_tags(), vec!["native", "managed"]);

    let p200 = manager.find_process(Pid::from_raw(200)).unwrap();
    manager.terminate_process(&p200);
    drain(&manager);
    let tag_events: Vec<String> = hook
        .take()
        .into_iter()
        .filter(|e| e.starts_with("tags:"))
        .collect();
    assert_eq!(
        tag_events,
        vec![r#"tags:added=[]:removed=["native", "managed"]"#]
    );
    manager.shutdown();
}

#[test]
fn break_kind_pauses_at_process_creation() {
    let engine = TestEngine::attach(100, 1, &[]);
    let (manager, hook) = manager_with(vec![engine.clone()]);

    manager
        .start(
            StartOptions::attach(Pid::from_raw(100))
                .with_break_kind(PredefinedBreak::ProcessCreate),
        )
        .unwrap();
    drain(&manager);

    // connected but never resumed
    assert_eq!(engine.calls(), vec!["start"]);
    assert_eq!(manager.is_running(), RunningState::NotRunning);
    assert!(hook.take().contains(&"process_paused:100".to_string()));
    let process = manager.find_process(Pid::from_raw(100)).unwrap();
    assert_eq!(process.state(), ProcessState::Paused);
    assert_eq!(manager.focused_process().unwrap().id(), Pid::from_raw(100));
    manager.shutdown();
}

#[test]
fn observer_vote_pauses_at_connect() {
    let engine = TestEngine::attach(100, 1, &[]);
    let (manager, hook) = manager_with(vec![engine.clone()]);
    hook.pause_on_runtime_created.store(true, Ordering::SeqCst);

    manager
        .start(StartOptions::attach(Pid::from_raw(100)))
        .unwrap();
    drain(&manager);

    assert_eq!(engine.calls(), vec!["start"]);
    assert_eq!(manager.is_running(), RunningState::NotRunning);
    manager.shutdown();
}

#[test]
fn can_detach_is_the_conjunction_over_engines() {
    let first = TestEngine::launch(100, 1, &[]);
    let second = TestEngine::launch(200, 2, &[]);
    let (manager, _hook) = manager_with(vec![first.clone(), second.clone()]);

    manager
        .start(StartOptions::launch("/bin/a", vec![]))
        .unwrap();
    drain(&manager);
    manager
        .start(StartOptions::launch("/bin/b", vec![]))
        .unwrap();
    drain(&manager);
    assert!(manager.can_detach_without_terminating());

    second.can_detach.store(false, Ordering::SeqCst);
    assert!(!manager.can_detach_without_terminating());
    manager.shutdown();
}

#[derive(Default)]
struct RecordingBinder {
    calls: Mutex<Vec<String>>,
}

impl RecordingBinder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BoundBreakpointsBinder for RecordingBinder {
    fn initialize(&self, _manager: &Arc<DbgManager>) {
        self.push("initialize".to_string());
    }

    fn initialize_engine(&self, _engine: EngineId, runtime: &Arc<DbgRuntime>) {
        self.push(format!("engine:{}", runtime.id().0));
    }

    fn remove_runtime(&self, runtime: &Arc<DbgRuntime>) {
        self.push(format!("remove:{}", runtime.id().0));
    }

    fn modules_loaded(&self, _runtime: &Arc<DbgRuntime>, modules: &[Arc<DbgModule>]) {
        self.push(format!("loaded:{}", modules[0].name()));
    }

    fn modules_unloaded(&self, _runtime: &Arc<DbgRuntime>, modules: &[Arc<DbgModule>]) {
        self.push(format!("unloaded:{}", modules[0].name()));
    }

    fn modules_refreshed(&self, modules: &[Arc<DbgModule>]) {
        self.push(format!("refreshed:{}", modules[0].name()));
    }
}

/// Hands the subscription sink out to the test body.
#[derive(Default)]
struct TestRefreshSource {
    sink: Mutex<Option<ModuleRefreshSink>>,
}

impl ModuleRefreshSource for TestRefreshSource {
    fn subscribe(&self, sink: ModuleRefreshSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }
}

#[test]
fn breakpoint_binder_follows_the_engine_lifecycle() {
    let engine = TestEngine::launch(100, 1, &[]);
    let binder = Arc::new(RecordingBinder::default());
    let source = Arc::new(TestRefreshSource::default());
    let manager = DbgManager::builder()
        .with_provider(TestProvider::new(vec![engine.clone()]))
        .with_breakpoint_binder(binder.clone())
        .with_refresh_source(source.clone())
        .build();

    manager
        .start(StartOptions::launch("/bin/a", vec![]))
        .unwrap();
    drain(&manager);
    assert_eq!(binder.calls(), vec!["initialize", "engine:1"]);

    let module = engine.factory().create_module("libfoo.so");
    engine.post(EngineMessage::ModuleLoaded {
        module: module.clone(),
        flags: MessageFlags::default(),
    });
    drain(&manager);
    assert_eq!(binder.calls().last().unwrap(), "loaded:libfoo.so");

    let sink = source.sink.lock().unwrap().clone().unwrap();
    sink.notify(vec![module.clone()]);
    drain(&manager);
    assert_eq!(binder.calls().last().unwrap(), "refreshed:libfoo.so");

    engine.post(EngineMessage::ModuleUnloaded {
        module,
        flags: MessageFlags::default(),
    });
    drain(&manager);
    assert_eq!(binder.calls().last().unwrap(), "unloaded:libfoo.so");

    manager.terminate_all();
    drain(&manager);
    assert_eq!(binder.calls().last().unwrap(), "remove:1");
    manager.shutdown();
}

#[derive(Default)]
struct CountingListener {
    invocations: AtomicUsize,
}

impl StartListener for CountingListener {
    fn on_first_start(&self, _manager: &Arc<DbgManager>) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn start_listeners_run_exactly_once() {
    let listener = Arc::new(CountingListener::default());
    let first = TestEngine::launch(100, 1, &[]);
    let second = TestEngine::launch(200, 2, &[]);
    let manager = DbgManager::builder()
        .with_provider(TestProvider::new(vec![first, second]))
        .with_start_listener(listener.clone())
        .build();

    manager
        .start(StartOptions::launch("/bin/a", vec![]))
        .unwrap();
    drain(&manager);
    manager
        .start(StartOptions::launch("/bin/b", vec![]))
        .unwrap();
    drain(&manager);

    assert_eq!(listener.invocations.load(Ordering::SeqCst), 1);
    manager.shutdown();
}

struct TestObject {
    closed: AtomicBool,
}

impl DbgObject for TestObject {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[test]
fn close_is_asynchronous_and_dispatcher_ordered() {
    let (manager, _hook) = manager_with(vec![]);
    let obj = Arc::new(TestObject {
        closed: AtomicBool::new(false),
    });

    manager.close(obj.clone());
    drain(&manager);
    assert!(obj.is_closed());

    let batch: Vec<Arc<dyn DbgObject>> = (0..4)
        .map(|_| {
            Arc::new(TestObject {
                closed: AtomicBool::new(false),
            }) as Arc<dyn DbgObject>
        })
        .collect();
    manager.close_many(batch.clone());
    drain(&manager);
    assert!(batch.iter().all(|o| o.is_closed()));
    manager.shutdown();
}
