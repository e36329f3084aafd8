use std::sync::Arc;

use strum_macros::Display;

use crate::session::DbgManager;
use crate::session::process::{DbgException, DbgModule, DbgProcess, DbgRuntime, DbgThread};
use crate::session::state::RunningState;

/// Kind of a user-facing message routed through the broad observer channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum UserMessageKind {
    #[strum(serialize = "could not connect")]
    CouldNotConnect,
    #[strum(serialize = "could not break")]
    CouldNotBreak,
}

/// Severity of a manager log message.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum ManagerMessageKind {
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "warning")]
    Warning,
    #[strum(serialize = "error")]
    Error,
}

/// Typed payload carried by the broad `on_message` channel.
#[derive(Clone)]
pub enum MessagePayload {
    ProcessCreated(Arc<DbgProcess>),
    ProcessExited {
        process: Arc<DbgProcess>,
        exit_code: i32,
    },
    RuntimeCreated(Arc<DbgRuntime>),
    RuntimeExited(Arc<DbgRuntime>),
    DomainLoaded {
        name: String,
    },
    DomainUnloaded {
        name: String,
    },
    ModuleLoaded(Arc<DbgModule>),
    ModuleUnloaded(Arc<DbgModule>),
    ThreadCreated(Arc<DbgThread>),
    ThreadExited(Arc<DbgThread>),
    BreakpointHit {
        number: u32,
    },
    EntryPointBreak,
    ProgramBreak,
    SetIpComplete,
    ProgramMessage {
        text: String,
    },
    ExceptionThrown(Arc<DbgException>),
    UserMessage {
        kind: UserMessageKind,
        text: String,
    },
}

/// One event on the broad observer channel.
///
/// Observers may set `pause` to request that the reporting engine stays paused; votes from
/// all observers are combined with the engine's own flags.
pub struct MessageEvent {
    pub payload: MessagePayload,
    pub process: Option<Arc<DbgProcess>>,
    pub runtime: Option<Arc<DbgRuntime>>,
    pub thread: Option<Arc<DbgThread>>,
    pub pause: bool,
}

impl MessageEvent {
    pub(crate) fn new(payload: MessagePayload) -> Self {
        Self {
            payload,
            process: None,
            runtime: None,
            thread: None,
            pause: false,
        }
    }

    pub(crate) fn with_process(mut self, process: Option<Arc<DbgProcess>>) -> Self {
        self.process = process;
        self
    }

    pub(crate) fn with_runtime(mut self, runtime: Option<Arc<DbgRuntime>>) -> Self {
        self.runtime = runtime;
        self
    }

    pub(crate) fn with_thread(mut self, thread: Option<Arc<DbgThread>>) -> Self {
        self.thread = thread;
        self
    }
}

/// Session observer.
///
/// Hooks are invoked on the dispatcher thread with no locks held; state read through the
/// manager reflects the change being reported. Reentrant control calls (run/break/close)
/// are permitted and take effect after the current handler.
pub trait SessionHook: Send + Sync {
    fn on_message(&self, event: &mut MessageEvent) {
        _ = event;
    }

    fn on_processes_changed(&self, added: &[Arc<DbgProcess>], removed: &[Arc<DbgProcess>]) {
        let (_, _) = (added, removed);
    }

    fn on_debug_tags_changed(&self, added: &[String], removed: &[String]) {
        let (_, _) = (added, removed);
    }

    fn on_process_paused(&self, process: &Arc<DbgProcess>, thread: Option<&Arc<DbgThread>>) {
        let (_, _) = (process, thread);
    }

    fn on_is_debugging_changed(&self, is_debugging: bool) {
        _ = is_debugging;
    }

    fn on_is_running_changed(&self, state: RunningState) {
        _ = state;
    }

    fn on_delayed_is_running_changed(&self) {}

    fn on_manager_message(&self, kind: ManagerMessageKind, text: &str) {
        let (_, _) = (kind, text);
    }
}

/// Component notified exactly once, when the first `start` call initializes the session.
pub trait StartListener: Send + Sync {
    fn on_first_start(&self, manager: &Arc<DbgManager>);
}

/// Outward event, buffered under the session lock and emitted after it is released.
pub(crate) enum Outward {
    Message(MessageEvent),
    ProcessesChanged {
        added: Vec<Arc<DbgProcess>>,
        removed: Vec<Arc<DbgProcess>>,
    },
    DebugTagsChanged {
        added: Vec<String>,
        removed: Vec<String>,
    },
    ProcessPaused {
        process: Arc<DbgProcess>,
        thread: Option<Arc<DbgThread>>,
    },
    IsDebuggingChanged(bool),
    IsRunningChanged(RunningState),
    DelayedIsRunningChanged,
    ManagerMessage {
        kind: ManagerMessageKind,
        text: String,
    },
}
