use std::path::PathBuf;
use std::sync::{Arc, Weak};

use nix::unistd::Pid;

use crate::session::DbgManager;
use crate::session::dispatcher::Dispatcher;
use crate::session::process::{
    DbgException, DbgModule, DbgObjectFactory, DbgRuntime, DbgThread, RuntimeId,
};

/// Manager-assigned engine identity, used to correlate sink messages with registry records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EngineId(pub(crate) u32);

/// How an engine acquired its debuggee.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StartKind {
    Launch,
    Attach,
}

/// What to start or attach to.
#[derive(Clone, Debug)]
pub enum StartTarget {
    Launch { path: PathBuf, args: Vec<String> },
    Attach { pid: Pid },
}

impl StartTarget {
    pub fn kind(&self) -> StartKind {
        match self {
            StartTarget::Launch { .. } => StartKind::Launch,
            StartTarget::Attach { .. } => StartKind::Attach,
        }
    }
}

/// Distinguished event at which the debuggee should make its initial stop.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PredefinedBreak {
    ProcessCreate,
    EntryPoint,
}

/// Start request, passed to providers and kept as the restart snapshot.
#[derive(Clone, Debug)]
pub struct StartOptions {
    pub target: StartTarget,
    /// Initial pause request, captured into the engine record at start.
    pub break_kind: Option<PredefinedBreak>,
    /// Optional backend name, lets a caller steer provider selection.
    pub backend: Option<String>,
}

impl StartOptions {
    pub fn launch(path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            target: StartTarget::Launch {
                path: path.into(),
                args,
            },
            break_kind: None,
            backend: None,
        }
    }

    pub fn attach(pid: Pid) -> Self {
        Self {
            target: StartTarget::Attach { pid },
            break_kind: None,
            backend: None,
        }
    }

    pub fn with_break_kind(mut self, break_kind: PredefinedBreak) -> Self {
        self.break_kind = Some(break_kind);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

/// Flags an engine attaches to a message.
#[derive(Clone, Copy, Default, Debug)]
pub struct MessageFlags {
    /// The engine asks the manager to pause the debuggee after this message.
    pub pause: bool,
    /// The engine asks to keep the debuggee running even when it is currently paused.
    pub resume: bool,
}

/// Payload of the `Connected` message.
#[derive(Clone, Debug)]
pub struct ConnectedMessage {
    pub pid: Pid,
    pub runtime_id: RuntimeId,
    pub runtime_name: String,
    /// Set when the engine failed to attach; the message is then treated as a disconnect.
    pub error: Option<String>,
    pub flags: MessageFlags,
}

/// Messages an engine delivers to the manager over its sink.
///
/// Per engine, delivery order is preserved; handlers run on the dispatcher thread.
pub enum EngineMessage {
    Connected(ConnectedMessage),
    Disconnected {
        exit_code: i32,
    },
    Break {
        error: Option<String>,
        thread: Option<Arc<DbgThread>>,
    },
    EntryPointBreak {
        thread: Option<Arc<DbgThread>>,
        flags: MessageFlags,
    },
    ProgramMessage {
        text: String,
        thread: Option<Arc<DbgThread>>,
        flags: MessageFlags,
    },
    BreakpointHit {
        number: u32,
        thread: Option<Arc<DbgThread>>,
        flags: MessageFlags,
    },
    ProgramBreak {
        thread: Option<Arc<DbgThread>>,
        flags: MessageFlags,
    },
    SetIpComplete {
        error: Option<String>,
        thread: Option<Arc<DbgThread>>,
        flags: MessageFlags,
    },
    DomainLoaded {
        name: String,
        flags: MessageFlags,
    },
    DomainUnloaded {
        name: String,
        flags: MessageFlags,
    },
    ModuleLoaded {
        module: Arc<DbgModule>,
        flags: MessageFlags,
    },
    ModuleUnloaded {
        module: Arc<DbgModule>,
        flags: MessageFlags,
    },
    ThreadCreated {
        thread: Arc<DbgThread>,
        flags: MessageFlags,
    },
    ThreadExited {
        thread: Arc<DbgThread>,
        flags: MessageFlags,
    },
    ExceptionThrown {
        exception: Arc<DbgException>,
        thread: Option<Arc<DbgThread>>,
        flags: MessageFlags,
    },
}

/// The channel an engine uses to deliver messages to the manager.
///
/// Messages are re-posted onto the dispatcher; a sink outliving its manager drops messages
/// silently.
#[derive(Clone)]
pub struct MessageSink {
    manager: Weak<DbgManager>,
    engine_id: EngineId,
}

impl MessageSink {
    pub(crate) fn new(manager: Weak<DbgManager>, engine_id: EngineId) -> Self {
        Self { manager, engine_id }
    }

    pub fn post(&self, message: EngineMessage) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let id = self.engine_id;
        let target = manager.clone();
        manager
            .dispatcher()
            .post(move || target.process_engine_message(id, message));
    }
}

/// A backend that drives one native or managed debuggee runtime.
///
/// All control methods return immediately; outcomes arrive as [`EngineMessage`]s.
pub trait DbgEngine: Send + Sync {
    /// Capability tags contributed to the session while this engine is attached.
    fn debug_tags(&self) -> Vec<String>;

    fn start_kind(&self) -> StartKind;

    /// True when the engine can detach from its debuggee without killing it.
    fn can_detach(&self) -> bool;

    /// Install the message channel. Called once, before [`DbgEngine::start`].
    fn subscribe(&self, sink: MessageSink);

    /// Begin launching or attaching. Must eventually produce a `Connected` message.
    fn start(&self, options: &StartOptions);

    /// Resume the debuggee.
    fn run(&self);

    /// Request a pause; the engine answers with a `Break` message.
    fn interrupt(&self);

    fn detach(&self);

    fn terminate(&self);

    /// Invoked on the dispatcher right after `Connected` is accepted, before the runtime is
    /// attached to its process. Engine-installed runtime data is therefore visible to the
    /// first observers of the new runtime.
    fn on_connected(&self, factory: &Arc<DbgObjectFactory>, runtime: &Arc<DbgRuntime>) {
        let (_, _) = (factory, runtime);
    }

    /// Final cleanup, invoked on the dispatcher after the engine left the registry.
    fn close(&self, dispatcher: &Dispatcher) {
        _ = dispatcher;
    }
}

/// Creates engines for start requests. Providers are consulted in ascending
/// [`EngineProvider::order`]; the first one returning an engine wins.
pub trait EngineProvider: Send + Sync {
    /// Metadata order; lower values are consulted first.
    fn order(&self) -> u32 {
        100
    }

    /// Return `Ok(None)` to pass, `Ok(Some(engine))` to accept, `Err` when construction of an
    /// accepted engine failed.
    fn create(
        &self,
        manager: &Arc<DbgManager>,
        options: &StartOptions,
    ) -> anyhow::Result<Option<Arc<dyn DbgEngine>>>;
}
