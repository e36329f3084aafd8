//! Engine-message pump.
//!
//! Every engine message is re-posted onto the dispatcher, validated against the registry and
//! applied here. Handlers mutate state under the session lock, buffer outward events, then
//! emit them with the lock released, so reentrant observer calls see consistent state.

use std::slice;
use std::sync::Arc;

use crate::fatal_check;
use crate::session::DbgManager;
use crate::session::control::BreakAllHelper;
use crate::session::engine::{
    ConnectedMessage, EngineId, EngineMessage, PredefinedBreak, StartKind,
};
use crate::session::hook::{
    ManagerMessageKind, MessageEvent, MessagePayload, Outward, UserMessageKind,
};
use crate::session::object::DbgObject;
use crate::session::process::{
    DbgException, DbgObjectFactory, DbgProcess, DbgRuntime, DbgThread, ProcessState,
};
use crate::session::registry::EngineState;

impl DbgManager {
    /// Entry point for every engine message, runs on the dispatcher.
    pub(crate) fn process_engine_message(self: Arc<Self>, id: EngineId, message: EngineMessage) {
        self.dispatcher().check_access();

        // the engine may have disconnected between message post and dispatch
        if self.state.lock().unwrap().engines.get(id).is_none() {
            log::debug!(target: "session", "message from unknown engine {id:?} dropped");
            return;
        }

        match message {
            EngineMessage::Connected(msg) => self.on_connected(id, msg),
            EngineMessage::Disconnected { exit_code } => self.on_disconnected(id, exit_code),
            EngineMessage::Break { error, thread } => self.on_break(id, error, thread),
            other => self.on_conditional_message(id, other),
        }
    }

    // ---------------------------------- connect --------------------------------------------------

    fn on_connected(self: &Arc<Self>, id: EngineId, msg: ConnectedMessage) {
        if let Some(error) = msg.error {
            let mut event = MessageEvent::new(MessagePayload::UserMessage {
                kind: UserMessageKind::CouldNotConnect,
                text: error,
            });
            self.raise_message(&mut event);
            self.on_disconnected(id, -1);
            return;
        }

        let engine;
        let break_kind;
        let process: Arc<DbgProcess>;
        let process_created;
        let runtime: Arc<DbgRuntime>;
        let factory: Arc<DbgObjectFactory>;
        {
            let mut state = self.state.lock().unwrap();
            let Some(info) = state.engines.get(id) else {
                return;
            };
            engine = info.engine.clone();
            break_kind = info.break_kind;

            let should_detach = engine.start_kind() == StartKind::Attach;
            match state.process_by_pid(msg.pid) {
                Some(existing) => {
                    process = existing;
                    process_created = false;
                }
                None => {
                    process = Arc::new(DbgProcess::new(msg.pid, should_detach));
                    state.processes.push(process.clone());
                    process_created = true;
                }
            }

            runtime = Arc::new(DbgRuntime::new(msg.runtime_id, msg.runtime_name, msg.pid));
            factory = Arc::new(DbgObjectFactory::new(runtime.clone()));

            let inserted = state.debugged_runtimes.insert((msg.pid, msg.runtime_id));
            fatal_check!(inserted, "runtime reported by two engines at once");

            let Some(info) = state.engines.get_mut(id) else {
                return;
            };
            info.process = Some(process.clone());
            info.runtime = Some(runtime.clone());
            info.factory = Some(factory.clone());
            info.state = EngineState::Paused;
            info.delayed_is_running = false;
            info.break_thread = None;
        }

        // the engine installs its runtime data first, so the data is visible to the first
        // observers of the new runtime
        engine.on_connected(&factory, &runtime);
        process.add_runtime(runtime.clone());

        let mut observer_pause = false;
        if process_created {
            let mut event = MessageEvent::new(MessagePayload::ProcessCreated(process.clone()))
                .with_process(Some(process.clone()));
            self.raise_message(&mut event);
            observer_pause |= event.pause;
            self.emit(vec![Outward::ProcessesChanged {
                added: vec![process.clone()],
                removed: Vec::new(),
            }]);
        }
        let mut event = MessageEvent::new(MessagePayload::RuntimeCreated(runtime.clone()))
            .with_process(Some(process.clone()))
            .with_runtime(Some(runtime.clone()));
        self.raise_message(&mut event);
        observer_pause |= event.pause;

        self.bridge().engine_connected(id, &runtime);

        let break_all_active = self.state.lock().unwrap().break_all.is_some();
        let pause = msg.flags.pause
            || break_kind == Some(PredefinedBreak::ProcessCreate)
            || break_all_active
            || observer_pause;

        if pause {
            self.finish_pause(id, None, false, None);
        } else {
            self.resume_engine_on_dispatcher(id, false);
        }
    }

    // ---------------------------------- disconnect -----------------------------------------------

    pub(crate) fn on_disconnected(self: &Arc<Self>, id: EngineId, exit_code: i32) {
        let mut out = Vec::new();
        let mut closes: Vec<Arc<dyn DbgObject>> = Vec::new();
        let mut process_retired: Option<Arc<DbgProcess>> = None;
        let mut break_all_completed: Option<BreakAllHelper> = None;
        let mut stop_completed = None;
        let info;
        {
            let mut state = self.state.lock().unwrap();
            let Some(removed) = state.engines.remove(id) else {
                return;
            };
            info = removed;

            if let (Some(process), Some(runtime)) = (&info.process, &info.runtime) {
                state.debugged_runtimes.remove(&(process.id(), runtime.id()));
                let last_runtime = process.remove_runtime(runtime.id());
                let retained = state.engines.iter().any(|other| other.targets(process));
                out.push(Outward::Message(
                    MessageEvent::new(MessagePayload::RuntimeExited(runtime.clone()))
                        .with_process(Some(process.clone()))
                        .with_runtime(Some(runtime.clone())),
                ));
                if last_runtime && !retained {
                    state.processes.retain(|p| !Arc::ptr_eq(p, process));
                    process.set_state(ProcessState::Terminated);
                    process.set_exit_code(exit_code);
                    process_retired = Some(process.clone());
                    out.push(Outward::Message(
                        MessageEvent::new(MessagePayload::ProcessExited {
                            process: process.clone(),
                            exit_code,
                        })
                        .with_process(Some(process.clone())),
                    ));
                    out.push(Outward::ProcessesChanged {
                        added: Vec::new(),
                        removed: vec![process.clone()],
                    });
                }
            }

            // reselect focus away from a retired process
            if let Some(gone) = &process_retired {
                if state.focus.as_ref().is_some_and(|f| Arc::ptr_eq(f, gone)) {
                    state.focus = state
                        .processes
                        .iter()
                        .find(|p| p.state() == ProcessState::Paused)
                        .cloned();
                }
            }

            if let Some(helper) = state.break_all.as_mut() {
                if helper.note_engine_removed(id) {
                    break_all_completed = state.break_all.take();
                }
            }
            if let Some(helper) = state.stop_debugging.as_mut() {
                if helper.note_engine_removed(id) {
                    stop_completed = state.stop_debugging.take();
                }
            }

            // stop-side emission order is the reverse of start
            let removed_tags = state.tags.remove(info.debug_tags.iter().map(String::as_str));
            if !removed_tags.is_empty() {
                out.push(Outward::DebugTagsChanged {
                    added: Vec::new(),
                    removed: removed_tags,
                });
            }
            self.reconcile_is_running(&mut state, &mut out);
            if state.engines.is_empty() {
                state.restart_options.clear();
                state.focus = None;
                out.push(Outward::IsDebuggingChanged(false));
            }
        }

        self.emit(out);

        if let Some(exception) = info.exception {
            closes.push(exception);
        }
        // breakpoint bindings go before the engine itself is closed
        if let Some(runtime) = &info.runtime {
            self.bridge().runtime_removed(runtime);
        }
        info.engine.close(self.dispatcher());
        if let Some(factory) = info.factory {
            closes.push(factory);
        }
        if let Some(runtime) = info.runtime {
            closes.push(runtime);
        }
        if let Some(process) = process_retired {
            closes.push(process);
        }
        self.close_many(closes);

        if let Some(helper) = break_all_completed {
            helper.complete(self);
        }
        if let Some(helper) = stop_completed {
            helper.complete(self, true);
        }
    }

    // ---------------------------------- break ----------------------------------------------------

    fn on_break(self: &Arc<Self>, id: EngineId, error: Option<String>, thread: Option<Arc<DbgThread>>) {
        if let Some(error) = error {
            // no state change, the engine stays as it was
            let mut event = MessageEvent::new(MessagePayload::UserMessage {
                kind: UserMessageKind::CouldNotBreak,
                text: error,
            });
            self.raise_message(&mut event);
            return;
        }

        let was_paused = {
            let state = self.state.lock().unwrap();
            match state.engines.get(id) {
                Some(info) => info.state == EngineState::Paused,
                None => return,
            }
        };
        self.finish_pause(id, thread, was_paused, None);
    }

    // ---------------------------------- conditional family ---------------------------------------

    fn on_conditional_message(self: &Arc<Self>, id: EngineId, message: EngineMessage) {
        let (runtime, process, was_paused, break_kind) = {
            let state = self.state.lock().unwrap();
            let Some(info) = state.engines.get(id) else {
                return;
            };
            (
                info.runtime.clone(),
                info.process.clone(),
                info.state == EngineState::Paused,
                info.break_kind,
            )
        };

        let mut exception: Option<Arc<DbgException>> = None;
        let mut force_pause = false;
        let (payload, thread, flags) = match message {
            EngineMessage::EntryPointBreak { thread, flags } => {
                force_pause = break_kind == Some(PredefinedBreak::EntryPoint);
                (MessagePayload::EntryPointBreak, thread, flags)
            }
            EngineMessage::ProgramMessage {
                text,
                thread,
                flags,
            } => (MessagePayload::ProgramMessage { text }, thread, flags),
            EngineMessage::BreakpointHit {
                number,
                thread,
                flags,
            } => (MessagePayload::BreakpointHit { number }, thread, flags),
            EngineMessage::ProgramBreak { thread, flags } => {
                force_pause = !self.ignore_break_instructions() && !flags.resume;
                (MessagePayload::ProgramBreak, thread, flags)
            }
            EngineMessage::SetIpComplete {
                error,
                thread,
                flags,
            } => {
                if let Some(error) = error {
                    self.write_message(ManagerMessageKind::Warning, error);
                }
                force_pause = !flags.resume;
                (MessagePayload::SetIpComplete, thread, flags)
            }
            EngineMessage::DomainLoaded { name, flags } => {
                (MessagePayload::DomainLoaded { name }, None, flags)
            }
            EngineMessage::DomainUnloaded { name, flags } => {
                (MessagePayload::DomainUnloaded { name }, None, flags)
            }
            EngineMessage::ModuleLoaded { module, flags } => {
                if let Some(runtime) = &runtime {
                    self.bridge().loaded(runtime, slice::from_ref(&module));
                }
                (MessagePayload::ModuleLoaded(module), None, flags)
            }
            EngineMessage::ModuleUnloaded { module, flags } => {
                if let Some(runtime) = &runtime {
                    self.bridge().unloaded(runtime, slice::from_ref(&module));
                }
                (MessagePayload::ModuleUnloaded(module), None, flags)
            }
            EngineMessage::ThreadCreated { thread, flags } => {
                (MessagePayload::ThreadCreated(thread), None, flags)
            }
            EngineMessage::ThreadExited { thread, flags } => {
                (MessagePayload::ThreadExited(thread), None, flags)
            }
            EngineMessage::ExceptionThrown {
                exception: exc,
                thread,
                flags,
            } => {
                exception = Some(exc.clone());
                (MessagePayload::ExceptionThrown(exc), thread, flags)
            }
            EngineMessage::Connected(_) | EngineMessage::Disconnected { .. } | EngineMessage::Break { .. } => {
                unreachable!("routed by process_engine_message")
            }
        };

        // observers vote first, then the pause verdict is computed
        let mut event = MessageEvent::new(payload)
            .with_process(process.clone())
            .with_runtime(runtime.clone())
            .with_thread(thread.clone());
        event.pause = false;
        self.raise_message(&mut event);
        let observer_pause = event.pause;

        let break_all_active = self.state.lock().unwrap().break_all.is_some();
        let keep_paused = was_paused && !flags.resume;
        let pause =
            flags.pause || observer_pause || break_all_active || keep_paused || force_pause;

        if pause {
            self.finish_pause(id, thread, was_paused, exception);
        } else {
            if let Some(exception) = exception {
                self.enqueue_close(exception);
            }
            self.resume_engine_on_dispatcher(id, was_paused && flags.resume);
        }
    }

    // ---------------------------------- shared transitions ---------------------------------------

    /// Finalize a pause of one engine: state, break thread, exception stash, process roll-up,
    /// focus adoption and the break-all fence.
    pub(crate) fn finish_pause(
        self: &Arc<Self>,
        id: EngineId,
        thread: Option<Arc<DbgThread>>,
        was_paused: bool,
        exception: Option<Arc<DbgException>>,
    ) {
        let mut out = Vec::new();
        let mut break_all_completed: Option<BreakAllHelper> = None;
        let mut drop_exception = None;
        {
            let mut state = self.state.lock().unwrap();
            let Some(info) = state.engines.get_mut(id) else {
                return;
            };
            info.state = EngineState::Paused;
            info.delayed_is_running = false;
            if thread.is_some() {
                info.break_thread = thread.clone();
            }
            let break_thread = info.break_thread.clone();
            if let Some(exception) = exception {
                // the displayed exception is the first one of this pause
                if info.exception.is_none() {
                    info.exception = Some(exception);
                } else {
                    drop_exception = Some(exception);
                }
            }
            let process = info.process.clone();

            if let Some(helper) = state.break_all.as_mut() {
                if helper.note_engine_paused(id) {
                    break_all_completed = state.break_all.take();
                }
            }

            if let Some(process) = &process {
                Self::rollup_process_state(&state, process);
            }
            self.reconcile_is_running(&mut state, &mut out);

            if !was_paused && state.focus.is_none() {
                if let Some(process) = &process {
                    state.focus = Some(process.clone());
                    out.push(Outward::ProcessPaused {
                        process: process.clone(),
                        thread: break_thread,
                    });
                }
            }
        }

        if let Some(exception) = drop_exception {
            self.enqueue_close(exception);
        }
        self.emit(out);

        if let Some(helper) = break_all_completed {
            helper.complete(self);
        }
        if self.break_all_processes() {
            self.break_all();
        }
    }

    /// Resume one engine: drain the stashed exception, roll the process up, optionally fire
    /// the runtime pre-continue hook, then hand control back to the backend.
    pub(crate) fn resume_engine_on_dispatcher(
        self: &Arc<Self>,
        id: EngineId,
        invoke_pre_continue: bool,
    ) {
        let mut out = Vec::new();
        let engine;
        let runtime;
        let stashed;
        {
            let mut state = self.state.lock().unwrap();
            let Some(info) = state.engines.get_mut(id) else {
                return;
            };
            info.state = EngineState::Running;
            info.break_thread = None;
            stashed = info.exception.take();
            engine = info.engine.clone();
            runtime = info.runtime.clone();
            let process = info.process.clone();

            if let Some(process) = &process {
                Self::rollup_process_state(&state, process);
                if state.focus.as_ref().is_some_and(|f| Arc::ptr_eq(f, process))
                    && process.state() != ProcessState::Paused
                {
                    state.focus = None;
                }
            }
            self.reconcile_is_running(&mut state, &mut out);
        }

        if let Some(exception) = stashed {
            self.enqueue_close(exception);
        }
        self.emit(out);

        if invoke_pre_continue {
            if let Some(runtime) = &runtime {
                runtime.notify_before_continue();
            }
        }
        engine.run();
    }
}
