//! Run/break/detach/terminate controllers and the helper state machines.
//!
//! `BreakAllHelper` and `StopDebuggingHelper` exist at most once each; construction is
//! serialized through the session lock and completion runs a stored continuation on the
//! dispatcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::session::DbgManager;
use crate::session::engine::{DbgEngine, EngineId, StartKind};
use crate::session::error::{Error, ResultExt};
use crate::session::hook::ManagerMessageKind;
use crate::session::process::DbgProcess;
use crate::session::registry::{EngineInfo, EngineState};

/// How long a graceful stop may take before a restart gives up. The engines remain attached
/// after a timeout; no forced kill happens here.
pub const STOP_DEBUGGING_TIMEOUT: Duration = Duration::from_secs(10);

static STOP_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Global fence bringing every running engine to a pause.
///
/// Tracks outstanding break requests; completes when every targeted engine reported paused
/// or disappeared. While the fence is active, newly connected engines are steered into a
/// pause and batch resumes abort.
pub(crate) struct BreakAllHelper {
    outstanding: HashSet<EngineId>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl BreakAllHelper {
    fn new(outstanding: HashSet<EngineId>, on_complete: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self {
            outstanding,
            on_complete,
        }
    }

    /// Returns true when the fence is complete.
    pub fn note_engine_paused(&mut self, id: EngineId) -> bool {
        self.outstanding.remove(&id);
        self.outstanding.is_empty()
    }

    pub fn note_engine_removed(&mut self, id: EngineId) -> bool {
        self.outstanding.remove(&id);
        self.outstanding.is_empty()
    }

    pub fn complete(mut self, manager: &Arc<DbgManager>) {
        if let Some(continuation) = self.on_complete.take() {
            manager.dispatcher().post(continuation);
        }
    }
}

/// Drives a graceful stop of every engine, used by the restart protocol.
pub(crate) struct StopDebuggingHelper {
    outstanding: HashSet<EngineId>,
    generation: u64,
    on_complete: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl StopDebuggingHelper {
    fn new(
        outstanding: HashSet<EngineId>,
        generation: u64,
        on_complete: Box<dyn FnOnce(bool) + Send>,
    ) -> Self {
        Self {
            outstanding,
            generation,
            on_complete: Some(on_complete),
        }
    }

    pub fn note_engine_removed(&mut self, id: EngineId) -> bool {
        self.outstanding.remove(&id);
        self.outstanding.is_empty()
    }

    pub fn complete(mut self, manager: &Arc<DbgManager>, success: bool) {
        if let Some(continuation) = self.on_complete.take() {
            manager.dispatcher().post(move || continuation(success));
        }
    }
}

/// Whether stopping this engine should detach rather than terminate.
fn stop_by_detach(info: &EngineInfo) -> bool {
    info.process
        .as_ref()
        .map(|p| p.should_detach())
        .unwrap_or_else(|| info.engine.start_kind() == StartKind::Attach)
}

impl DbgManager {
    // ---------------------------------- run ------------------------------------------------------

    /// Resume every paused engine. The whole batch aborts when a break-all fence is active,
    /// a partial resume would defeat the fence.
    pub fn run_all(self: &Arc<Self>) {
        let this = self.clone();
        if self.dispatcher().verify_access() {
            this.run_all_on_dbg_thread();
        } else {
            self.dispatcher().post(move || this.run_all_on_dbg_thread());
        }
    }

    fn run_all_on_dbg_thread(self: Arc<Self>) {
        self.dispatcher().check_access();
        let paused: Vec<EngineId> = {
            let state = self.state.lock().unwrap();
            if state.break_all.is_some() {
                return;
            }
            state
                .engines
                .iter()
                .filter(|info| info.state == EngineState::Paused)
                .map(|info| info.id)
                .collect()
        };
        for id in paused {
            self.resume_engine_on_dispatcher(id, true);
        }
    }

    /// Resume the engines targeting one process. Upgraded to [`DbgManager::run_all`] while
    /// the break-all-processes setting is on.
    pub fn run_process(self: &Arc<Self>, process: &Arc<DbgProcess>) {
        if self.break_all_processes() {
            self.run_all();
            return;
        }
        let this = self.clone();
        let process = process.clone();
        if self.dispatcher().verify_access() {
            this.run_process_on_dbg_thread(process);
        } else {
            self.dispatcher()
                .post(move || this.run_process_on_dbg_thread(process));
        }
    }

    fn run_process_on_dbg_thread(self: Arc<Self>, process: Arc<DbgProcess>) {
        self.dispatcher().check_access();
        let paused: Vec<EngineId> = {
            let state = self.state.lock().unwrap();
            if state.break_all.is_some() {
                return;
            }
            state
                .engines
                .iter()
                .filter(|info| info.targets(&process) && info.state == EngineState::Paused)
                .map(|info| info.id)
                .collect()
        };
        for id in paused {
            self.resume_engine_on_dispatcher(id, true);
        }
    }

    // ---------------------------------- break ----------------------------------------------------

    /// Bring every running engine to a pause behind a single fence.
    pub fn break_all(self: &Arc<Self>) {
        let this = self.clone();
        if self.dispatcher().verify_access() {
            this.break_all_on_dbg_thread();
        } else {
            self.dispatcher().post(move || this.break_all_on_dbg_thread());
        }
    }

    fn break_all_on_dbg_thread(self: Arc<Self>) {
        self.dispatcher().check_access();
        let targets: Vec<Arc<dyn DbgEngine>> = {
            let mut state = self.state.lock().unwrap();
            if state.break_all.is_some() {
                return;
            }
            let running: Vec<&EngineInfo> = state
                .engines
                .iter()
                .filter(|info| info.state == EngineState::Running)
                .collect();
            if running.is_empty() {
                return;
            }
            let outstanding = running.iter().map(|info| info.id).collect();
            let targets = running.iter().map(|info| info.engine.clone()).collect();
            state.break_all = Some(BreakAllHelper::new(outstanding, None));
            targets
        };
        for engine in targets {
            engine.interrupt();
        }
    }

    /// Request a pause of one process's running engines.
    pub fn break_process(&self, process: &Arc<DbgProcess>) {
        let targets: Vec<Arc<dyn DbgEngine>> = {
            let state = self.state.lock().unwrap();
            state
                .engines
                .iter()
                .filter(|info| info.targets(process) && info.state == EngineState::Running)
                .map(|info| info.engine.clone())
                .collect()
        };
        for engine in targets {
            engine.interrupt();
        }
    }

    // ---------------------------------- detach / terminate ---------------------------------------

    pub fn detach_process(&self, process: &Arc<DbgProcess>) {
        for engine in self.engines_of(Some(process)) {
            engine.detach();
        }
    }

    pub fn terminate_process(&self, process: &Arc<DbgProcess>) {
        for engine in self.engines_of(Some(process)) {
            engine.terminate();
        }
    }

    pub fn detach_all(&self) {
        for engine in self.engines_of(None) {
            engine.detach();
        }
    }

    pub fn terminate_all(&self) {
        for engine in self.engines_of(None) {
            engine.terminate();
        }
    }

    /// Stop every engine: detach the attached ones, terminate the launched ones.
    pub fn stop_debugging_all(&self) {
        let ops: Vec<(Arc<dyn DbgEngine>, bool)> = {
            let state = self.state.lock().unwrap();
            state
                .engines
                .iter()
                .map(|info| (info.engine.clone(), stop_by_detach(info)))
                .collect()
        };
        for (engine, detach) in ops {
            if detach {
                engine.detach();
            } else {
                engine.terminate();
            }
        }
    }

    fn engines_of(&self, process: Option<&Arc<DbgProcess>>) -> Vec<Arc<dyn DbgEngine>> {
        let state = self.state.lock().unwrap();
        state
            .engines
            .iter()
            .filter(|info| process.is_none_or(|p| info.targets(p)))
            .map(|info| info.engine.clone())
            .collect()
    }

    // ---------------------------------- restart --------------------------------------------------

    /// True when a restart may be requested right now.
    pub fn can_restart(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.engines.is_empty()
            && state.break_all.is_none()
            && state.stop_debugging.is_none()
            && !state.restart_options.is_empty()
    }

    /// Gracefully stop every engine, then start each recorded option snapshot anew.
    pub fn restart(self: &Arc<Self>) -> Result<(), Error> {
        if !self.can_restart() {
            return Err(Error::CannotRestart);
        }
        let this = self.clone();
        self.dispatcher().post(move || this.restart_on_dbg_thread());
        Ok(())
    }

    fn restart_on_dbg_thread(self: Arc<Self>) {
        self.dispatcher().check_access();
        let generation = STOP_GENERATION.fetch_add(1, Ordering::SeqCst);
        let ops: Vec<(Arc<dyn DbgEngine>, bool)> = {
            let mut state = self.state.lock().unwrap();
            // the validity window may have closed between the API call and this task
            if state.engines.is_empty()
                || state.break_all.is_some()
                || state.stop_debugging.is_some()
                || state.restart_options.is_empty()
            {
                return;
            }

            let snapshot = state.restart_options.clone();
            let outstanding: HashSet<EngineId> = state.engines.iter().map(|info| info.id).collect();

            let weak = self.weak();
            let on_complete = Box::new(move |success: bool| {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if !success {
                    manager.write_message(
                        ManagerMessageKind::Error,
                        "stop debugging timed out, restart aborted",
                    );
                    return;
                }
                // posted, not inline: starting from inside the completion would reenter
                // collection-changed emission
                for options in snapshot {
                    let target = manager.clone();
                    manager.dispatcher().post(move || {
                        target.start(options).or_log("restart");
                    });
                }
            });
            state.stop_debugging = Some(StopDebuggingHelper::new(
                outstanding,
                generation,
                on_complete,
            ));

            state
                .engines
                .iter()
                .map(|info| (info.engine.clone(), stop_by_detach(info)))
                .collect()
        };

        for (engine, detach) in ops {
            if detach {
                engine.detach();
            } else {
                engine.terminate();
            }
        }

        let weak = self.weak();
        self.dispatcher().post_delayed(STOP_DEBUGGING_TIMEOUT, move || {
            if let Some(manager) = weak.upgrade() {
                manager.stop_debugging_timed_out(generation);
            }
        });
    }

    fn stop_debugging_timed_out(self: Arc<Self>, generation: u64) {
        self.dispatcher().check_access();
        let helper = {
            let mut state = self.state.lock().unwrap();
            match &state.stop_debugging {
                Some(helper) if helper.generation == generation => state.stop_debugging.take(),
                _ => None,
            }
        };
        if let Some(helper) = helper {
            helper.complete(&self, false);
        }
    }
}
