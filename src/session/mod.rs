//! Debug session manager.
//!
//! The manager owns the set of attached debug engines, funnels their asynchronous messages
//! into one dispatcher-serialized stream, tracks per-engine and per-process execution state
//! and exposes a unified start/run/break/detach/terminate control surface. Engine backends
//! and breakpoint binding live behind the contracts in [`engine`] and [`breakpoint`].

pub mod breakpoint;
mod control;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hook;
pub mod object;
pub mod process;
mod pump;
pub mod registry;
pub mod state;
mod tags;

pub use control::STOP_DEBUGGING_TIMEOUT;
pub use error::Error;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use nix::unistd::{Pid, getpid};

use crate::fatal_check;
use crate::session::breakpoint::{
    BoundBreakpointsBinder, BreakpointBridge, ModuleRefreshSink, ModuleRefreshSource,
};
use crate::session::control::{BreakAllHelper, StopDebuggingHelper};
use crate::session::dispatcher::Dispatcher;
use crate::session::engine::{
    DbgEngine, EngineId, EngineProvider, MessageSink, StartOptions, StartTarget,
};
use crate::session::hook::{ManagerMessageKind, MessageEvent, Outward, SessionHook, StartListener};
use crate::session::object::{CloseQueue, DbgObject};
use crate::session::process::{DbgProcess, ProcessState, RuntimeId};
use crate::session::registry::{EngineInfo, EngineRegistry, EngineState};
use crate::session::state::RunningState;
use crate::session::tags::TagsMultiset;

/// Quiescence window of the delayed running notifier.
pub const DELAYED_IS_RUNNING_WINDOW: Duration = Duration::from_secs(1);

/// One-time initialization phase of the session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum StartPhase {
    NotStarted,
    Starting,
    Started,
}

/// Mutable session state, guarded by a single mutex.
///
/// Mutations happen only on the dispatcher thread; foreign threads take the lock for reads.
pub(crate) struct SessionState {
    pub engines: EngineRegistry,
    pub processes: Vec<Arc<DbgProcess>>,
    pub tags: TagsMultiset,
    pub is_running: RunningState,
    pub restart_options: Vec<StartOptions>,
    pub debugged_runtimes: HashSet<(Pid, RuntimeId)>,
    pub break_all: Option<BreakAllHelper>,
    pub stop_debugging: Option<StopDebuggingHelper>,
    /// Process adopted at the last pause; cleared when it resumes or disconnects.
    pub focus: Option<Arc<DbgProcess>>,
    /// Bumped on every `is_running` change, invalidates pending delayed-notifier timers.
    pub delayed_generation: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            engines: EngineRegistry::default(),
            processes: Vec::new(),
            tags: TagsMultiset::default(),
            is_running: RunningState::NotRunning,
            restart_options: Vec::new(),
            debugged_runtimes: HashSet::new(),
            break_all: None,
            stop_debugging: None,
            focus: None,
            delayed_generation: 0,
        }
    }

    pub fn process_by_pid(&self, pid: Pid) -> Option<Arc<DbgProcess>> {
        self.processes.iter().find(|p| p.id() == pid).cloned()
    }
}

/// Assembles a [`DbgManager`].
pub struct DbgManagerBuilder {
    providers: Vec<Arc<dyn EngineProvider>>,
    binder: Option<Arc<dyn BoundBreakpointsBinder>>,
    refresh_sources: Vec<Arc<dyn ModuleRefreshSource>>,
    start_listeners: Vec<Arc<dyn StartListener>>,
    quiescence: Duration,
}

impl Default for DbgManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DbgManagerBuilder {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            binder: None,
            refresh_sources: Vec::new(),
            start_listeners: Vec::new(),
            quiescence: DELAYED_IS_RUNNING_WINDOW,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn EngineProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_breakpoint_binder(mut self, binder: Arc<dyn BoundBreakpointsBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    pub fn with_refresh_source(mut self, source: Arc<dyn ModuleRefreshSource>) -> Self {
        self.refresh_sources.push(source);
        self
    }

    pub fn with_start_listener(mut self, listener: Arc<dyn StartListener>) -> Self {
        self.start_listeners.push(listener);
        self
    }

    /// Override the delayed-notifier quiescence window (mostly for tests).
    pub fn with_quiescence_window(mut self, window: Duration) -> Self {
        self.quiescence = window;
        self
    }

    pub fn build(mut self) -> Arc<DbgManager> {
        self.providers.sort_by_key(|p| p.order());
        Arc::new_cyclic(|weak| DbgManager {
            self_weak: weak.clone(),
            dispatcher: Dispatcher::new(),
            state: Mutex::new(SessionState::new()),
            hooks: Mutex::new(Vec::new()),
            providers: self.providers,
            start_listeners: Mutex::new(self.start_listeners),
            start_phase: Mutex::new(StartPhase::NotStarted),
            bridge: BreakpointBridge::new(self.binder),
            refresh_sources: self.refresh_sources,
            close_queue: Arc::new(CloseQueue::default()),
            break_all_processes: AtomicBool::new(false),
            ignore_break_instructions: AtomicBool::new(false),
            quiescence: self.quiescence,
            next_engine_id: AtomicU32::new(0),
        })
    }
}

/// The debug session manager. See the module docs.
pub struct DbgManager {
    self_weak: Weak<DbgManager>,
    dispatcher: Dispatcher,
    pub(crate) state: Mutex<SessionState>,
    hooks: Mutex<Vec<Arc<dyn SessionHook>>>,
    providers: Vec<Arc<dyn EngineProvider>>,
    start_listeners: Mutex<Vec<Arc<dyn StartListener>>>,
    start_phase: Mutex<StartPhase>,
    bridge: BreakpointBridge,
    refresh_sources: Vec<Arc<dyn ModuleRefreshSource>>,
    close_queue: Arc<CloseQueue>,
    break_all_processes: AtomicBool,
    ignore_break_instructions: AtomicBool,
    pub(crate) quiescence: Duration,
    next_engine_id: AtomicU32,
}

impl DbgManager {
    pub fn builder() -> DbgManagerBuilder {
        DbgManagerBuilder::new()
    }

    /// The serialization domain every state change runs on. Engines may post follow-up
    /// cleanup here from [`DbgEngine::close`].
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn weak(&self) -> Weak<DbgManager> {
        self.self_weak.clone()
    }

    pub(crate) fn bridge(&self) -> &BreakpointBridge {
        &self.bridge
    }

    /// Register a session observer.
    pub fn add_hook(&self, hook: Arc<dyn SessionHook>) {
        self.hooks.lock().unwrap().push(hook);
    }

    /// Register a component invoked once, at the first `start` call.
    pub fn add_start_listener(&self, listener: Arc<dyn StartListener>) {
        self.start_listeners.lock().unwrap().push(listener);
    }

    // ---------------------------------- settings -------------------------------------------------

    /// When set, any single pause fans out to every process and any per-process run is
    /// upgraded to a global run.
    pub fn set_break_all_processes(&self, value: bool) {
        self.break_all_processes.store(value, Ordering::SeqCst);
    }

    pub fn break_all_processes(&self) -> bool {
        self.break_all_processes.load(Ordering::SeqCst)
    }

    /// When set, `ProgramBreak` messages do not force a pause.
    pub fn set_ignore_break_instructions(&self, value: bool) {
        self.ignore_break_instructions.store(value, Ordering::SeqCst);
    }

    pub fn ignore_break_instructions(&self) -> bool {
        self.ignore_break_instructions.load(Ordering::SeqCst)
    }

    // ---------------------------------- start ----------------------------------------------------

    /// Launch or attach a new debuggee.
    ///
    /// Provider selection runs on the caller thread; the engine record appears and events are
    /// raised on the dispatcher. On error nothing is registered and no state changes.
    pub fn start(self: &Arc<Self>, options: StartOptions) -> Result<(), Error> {
        // two clones: one canonical restart snapshot, one for the provider, so a caller
        // mutating its options after the call cannot corrupt either
        let restart_snapshot = options.clone();
        let provider_options = options.clone();

        if let StartTarget::Attach { pid } = &options.target {
            if *pid == getpid() {
                return Err(Error::SelfAttach(*pid));
            }
        }

        self.ensure_initialized()?;

        let mut engine = None;
        for provider in &self.providers {
            match provider.create(self, &provider_options) {
                Ok(Some(created)) => {
                    engine = Some(created);
                    break;
                }
                Ok(None) => continue,
                Err(e) => return Err(Error::EngineCreation(format!("{e:#}"))),
            }
        }
        let Some(engine) = engine else {
            return Err(Error::NoSuitableEngine);
        };

        let this = self.clone();
        self.dispatcher
            .post(move || this.start_on_dbg_thread(engine, options, restart_snapshot));
        Ok(())
    }

    fn ensure_initialized(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut phase = self.start_phase.lock().unwrap();
            match *phase {
                StartPhase::Started => return Ok(()),
                StartPhase::Starting => {
                    fatal_check!(false, "recursive start during session initialization");
                    return Err(Error::RecursiveStart);
                }
                StartPhase::NotStarted => *phase = StartPhase::Starting,
            }
        }

        self.bridge.initialize(self);
        for source in &self.refresh_sources {
            source.subscribe(ModuleRefreshSink::new(self.weak()));
        }
        let listeners = self.start_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_first_start(self);
        }

        *self.start_phase.lock().unwrap() = StartPhase::Started;
        Ok(())
    }

    fn start_on_dbg_thread(
        self: Arc<Self>,
        engine: Arc<dyn DbgEngine>,
        options: StartOptions,
        restart_snapshot: StartOptions,
    ) {
        self.dispatcher.check_access();
        let id = EngineId(self.next_engine_id.fetch_add(1, Ordering::SeqCst));

        let mut out = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let was_debugging = !state.engines.is_empty();

            let info = EngineInfo::new(id, engine.clone(), options.break_kind);
            let added_tags = state.tags.add(info.debug_tags.iter().map(String::as_str));
            state.engines.add(info);
            state.restart_options.push(restart_snapshot);

            if !was_debugging {
                out.push(Outward::IsDebuggingChanged(true));
            }
            self.reconcile_is_running(&mut state, &mut out);
            if !added_tags.is_empty() {
                out.push(Outward::DebugTagsChanged {
                    added: added_tags,
                    removed: Vec::new(),
                });
            }
        }
        // observers see the engine in the registry before any message from it can arrive
        self.emit(out);

        engine.subscribe(MessageSink::new(self.weak(), id));
        engine.start(&options);
    }

    // ---------------------------------- read surface ---------------------------------------------

    pub fn is_debugging(&self) -> bool {
        !self.state.lock().unwrap().engines.is_empty()
    }

    pub fn is_running(&self) -> RunningState {
        self.state.lock().unwrap().is_running
    }

    /// Visible debug tags, in first-appearance order.
    pub fn debug_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().tags.snapshot()
    }

    pub fn processes(&self) -> Vec<Arc<DbgProcess>> {
        self.state.lock().unwrap().processes.clone()
    }

    pub fn find_process(&self, pid: Pid) -> Option<Arc<DbgProcess>> {
        self.state.lock().unwrap().process_by_pid(pid)
    }

    /// The process adopted at the last pause, if any.
    pub fn focused_process(&self) -> Option<Arc<DbgProcess>> {
        self.state.lock().unwrap().focus.clone()
    }

    /// False when `pid` hosts this session or the runtime is already under debugging.
    pub fn can_debug_runtime(&self, pid: Pid, runtime_id: RuntimeId) -> bool {
        self.check_debug_runtime(pid, runtime_id).is_ok()
    }

    /// [`DbgManager::can_debug_runtime`] with the reason for a refusal.
    pub fn check_debug_runtime(&self, pid: Pid, runtime_id: RuntimeId) -> Result<(), Error> {
        if pid == getpid() {
            return Err(Error::SelfAttach(pid));
        }
        let state = self.state.lock().unwrap();
        if state.debugged_runtimes.contains(&(pid, runtime_id)) {
            return Err(Error::AlreadyDebugged(pid, runtime_id));
        }
        Ok(())
    }

    /// True while every attached engine can detach from its debuggee.
    pub fn can_detach_without_terminating(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .engines
            .iter()
            .all(|info| info.engine.can_detach())
    }

    // ---------------------------------- object closing -------------------------------------------

    /// Enqueue an object for closing. The close runs on the dispatcher, coalesced with other
    /// pending closes, exactly once per enqueue.
    pub fn close(&self, obj: Arc<dyn DbgObject>) {
        self.close_queue.enqueue(obj, &self.dispatcher);
    }

    pub fn close_many(&self, objs: Vec<Arc<dyn DbgObject>>) {
        self.close_queue.enqueue_many(objs, &self.dispatcher);
    }

    pub(crate) fn enqueue_close(&self, obj: Arc<dyn DbgObject>) {
        self.close_queue.enqueue(obj, &self.dispatcher);
    }

    // ---------------------------------- messages -------------------------------------------------

    /// Emit a manager message for logging consumers, mirrored to the `log` facade.
    pub fn write_message(self: &Arc<Self>, kind: ManagerMessageKind, text: impl Into<String>) {
        let text = text.into();
        match kind {
            ManagerMessageKind::Output => log::info!(target: "session", "{text}"),
            ManagerMessageKind::Warning => log::warn!(target: "session", "{text}"),
            ManagerMessageKind::Error => log::error!(target: "session", "{text}"),
        }
        let this = self.clone();
        self.dispatcher
            .post(move || this.emit(vec![Outward::ManagerMessage { kind, text }]));
    }

    /// Drain every posted task and park the dispatcher. The manager is inert afterwards.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    // ---------------------------------- emission -------------------------------------------------

    /// Raise one broad-channel message and collect observer pause votes.
    /// Must be called with the session lock released.
    pub(crate) fn raise_message(&self, event: &mut MessageEvent) {
        let hooks = self.hooks.lock().unwrap().clone();
        for hook in &hooks {
            hook.on_message(event);
        }
    }

    /// Deliver buffered outward events to every hook, in order.
    /// Must be called with the session lock released.
    pub(crate) fn emit(&self, events: Vec<Outward>) {
        if events.is_empty() {
            return;
        }
        let hooks = self.hooks.lock().unwrap().clone();
        for event in events {
            match event {
                Outward::Message(mut message) => {
                    for hook in &hooks {
                        hook.on_message(&mut message);
                    }
                }
                Outward::ProcessesChanged { added, removed } => {
                    for hook in &hooks {
                        hook.on_processes_changed(&added, &removed);
                    }
                }
                Outward::DebugTagsChanged { added, removed } => {
                    for hook in &hooks {
                        hook.on_debug_tags_changed(&added, &removed);
                    }
                }
                Outward::ProcessPaused { process, thread } => {
                    for hook in &hooks {
                        hook.on_process_paused(&process, thread.as_ref());
                    }
                }
                Outward::IsDebuggingChanged(value) => {
                    for hook in &hooks {
                        hook.on_is_debugging_changed(value);
                    }
                }
                Outward::IsRunningChanged(value) => {
                    for hook in &hooks {
                        hook.on_is_running_changed(value);
                    }
                }
                Outward::DelayedIsRunningChanged => {
                    for hook in &hooks {
                        hook.on_delayed_is_running_changed();
                    }
                }
                Outward::ManagerMessage { kind, text } => {
                    for hook in &hooks {
                        hook.on_manager_message(kind, &text);
                    }
                }
            }
        }
    }

    // ---------------------------------- derived state --------------------------------------------

    /// Recompute `is_running` inside the critical section; buffer a change event and re-arm
    /// the delayed notifier when the value moved.
    pub(crate) fn reconcile_is_running(&self, state: &mut SessionState, out: &mut Vec<Outward>) {
        let new = RunningState::calculate(&state.engines);
        if new == state.is_running {
            return;
        }
        state.is_running = new;
        state.delayed_generation += 1;
        if new == RunningState::Running {
            let generation = state.delayed_generation;
            let weak = self.self_weak.clone();
            self.dispatcher.post_delayed(self.quiescence, move || {
                if let Some(this) = weak.upgrade() {
                    this.delayed_is_running_tick(generation);
                }
            });
        }
        out.push(Outward::IsRunningChanged(new));
    }

    /// Delayed notifier body: fires only when the session still runs and no state change
    /// happened since the timer was armed.
    fn delayed_is_running_tick(self: Arc<Self>, generation: u64) {
        self.dispatcher.check_access();
        let mut fire = false;
        {
            let mut state = self.state.lock().unwrap();
            if state.delayed_generation != generation || state.is_running != RunningState::Running {
                return;
            }
            for info in state.engines.iter_mut() {
                if info.state != EngineState::Paused && !info.delayed_is_running {
                    info.delayed_is_running = true;
                    fire = true;
                }
            }
        }
        if fire {
            self.emit(vec![Outward::DelayedIsRunningChanged]);
        }
    }

    /// Roll a process state up from the engines targeting it.
    pub(crate) fn rollup_process_state(state: &SessionState, process: &Arc<DbgProcess>) {
        let mut any = false;
        let mut all_paused = true;
        for info in state.engines.iter().filter(|info| info.targets(process)) {
            any = true;
            if info.state != EngineState::Paused {
                all_paused = false;
            }
        }
        if !any {
            // retirement is handled by the disconnect path
            return;
        }
        process.set_state(if all_paused {
            ProcessState::Paused
        } else {
            ProcessState::Running
        });
    }
}

impl Drop for DbgManager {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}
