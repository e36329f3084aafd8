use std::sync::atomic::Ordering;

use nix::unistd::Pid;

use dbgmux::session::engine::StartOptions;
use dbgmux::session::error::Error;
use dbgmux::session::state::RunningState;

use crate::common::{TestEngine, drain, manager_with};

#[test]
fn restart_stops_everything_then_starts_the_snapshots() {
    let first = TestEngine::launch(100, 1, &[]);
    let second = TestEngine::launch(200, 2, &[]);
    let first_reborn = TestEngine::launch(100, 1, &[]);
    let second_reborn = TestEngine::launch(200, 2, &[]);
    let (manager, hook) = manager_with(vec![
        first.clone(),
        second.clone(),
        first_reborn.clone(),
        second_reborn.clone(),
    ]);

    manager
        .start(StartOptions::launch("/bin/a", vec![]))
        .unwrap();
    drain(&manager);
    manager
        .start(StartOptions::launch("/bin/b", vec![]))
        .unwrap();
    drain(&manager);
    hook.take();
    assert!(manager.can_restart());

    manager.restart().unwrap();
    // observed right after the stop helper is installed, before any engine went away
    let during = {
        let m = manager.clone();
        manager
            .dispatcher()
            .invoke(move || m.can_restart())
            .unwrap()
    };
    assert!(!during);
    drain(&manager);

    // launched engines are terminated, not detached
    assert_eq!(first.call_count("terminate"), 1);
    assert_eq!(second.call_count("terminate"), 1);
    assert_eq!(first.call_count("close"), 1);
    assert_eq!(second.call_count("close"), 1);

    // every snapshot was started anew, in order
    assert_eq!(first_reborn.calls(), vec!["start", "run"]);
    assert_eq!(second_reborn.calls(), vec!["start", "run"]);
    let mut pids: Vec<i32> = manager.processes().iter().map(|p| p.id().as_raw()).collect();
    pids.sort();
    assert_eq!(pids, vec![100, 200]);
    assert_eq!(manager.is_running(), RunningState::Running);
    assert!(manager.can_restart());
    manager.shutdown();
}

#[test]
fn restart_detaches_attached_processes() {
    let engine = TestEngine::attach(4242, 1, &[]);
    let reborn = TestEngine::attach(4242, 1, &[]);
    let (manager, _hook) = manager_with(vec![engine.clone(), reborn.clone()]);

    manager
        .start(StartOptions::attach(Pid::from_raw(4242)))
        .unwrap();
    drain(&manager);

    manager.restart().unwrap();
    drain(&manager);

    assert_eq!(engine.call_count("detach"), 1);
    assert_eq!(engine.call_count("terminate"), 0);
    assert_eq!(reborn.call_count("start"), 1);
    manager.shutdown();
}

#[test]
fn restart_requires_a_live_session() {
    let (manager, _hook) = manager_with(vec![]);
    assert!(!manager.can_restart());
    assert!(matches!(manager.restart(), Err(Error::CannotRestart)));
    manager.shutdown();
}

#[test]
fn restart_is_denied_behind_a_break_all_fence() {
    let engine = TestEngine::launch(100, 1, &[]);
    engine.auto_break.store(false, Ordering::SeqCst);
    let (manager, _hook) = manager_with(vec![engine.clone()]);
    manager
        .start(StartOptions::launch("/bin/a", vec![]))
        .unwrap();
    drain(&manager);
    assert!(manager.can_restart());

    manager.break_all();
    drain(&manager);
    // the engine has not answered yet, the fence is still outstanding
    assert_eq!(engine.call_count("interrupt"), 1);
    assert!(!manager.can_restart());
    assert!(matches!(manager.restart(), Err(Error::CannotRestart)));

    // a batch resume is aborted outright while the fence holds
    manager.run_all();
    drain(&manager);
    assert_eq!(engine.call_count("run"), 1);

    engine.post(dbgmux::session::engine::EngineMessage::Break {
        error: None,
        thread: None,
    });
    drain(&manager);
    assert_eq!(manager.is_running(), RunningState::NotRunning);
    assert!(manager.can_restart());

    manager.run_all();
    drain(&manager);
    assert_eq!(engine.call_count("run"), 2);
    manager.shutdown();
}

#[test]
fn restart_options_die_with_the_session() {
    let engine = TestEngine::launch(100, 1, &[]);
    let next = TestEngine::launch(300, 3, &[]);
    let (manager, _hook) = manager_with(vec![engine.clone(), next.clone()]);

    manager
        .start(StartOptions::launch("/bin/a", vec![]))
        .unwrap();
    drain(&manager);
    assert!(manager.can_restart());

    manager.stop_debugging_all();
    drain(&manager);
    assert!(!manager.is_debugging());
    // the recorded snapshot did not survive the session
    assert!(!manager.can_restart());

    manager
        .start(StartOptions::launch("/bin/c", vec![]))
        .unwrap();
    drain(&manager);
    assert!(manager.can_restart());
    manager.shutdown();
}
