use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use nix::unistd::Pid;

use crate::session::object::DbgObject;

/// Runtime identity inside a process, assigned by the engine backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct RuntimeId(pub u64);

/// Process running-status, the join of the states of every engine attached to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessState {
    Running,
    Paused,
    Terminated,
}

/// An OS process under debugging. At most one record exists per pid.
///
/// The record is owned by the manager; consumers get `Arc` views and must treat them as
/// read-only.
pub struct DbgProcess {
    id: Pid,
    /// True when the process was attached rather than spawned, a stop should detach it.
    should_detach: AtomicBool,
    state: Mutex<ProcessState>,
    runtimes: Mutex<Vec<Arc<DbgRuntime>>>,
    exit_code: OnceLock<i32>,
    closed: AtomicBool,
}

impl DbgProcess {
    pub(crate) fn new(id: Pid, should_detach: bool) -> Self {
        Self {
            id,
            should_detach: AtomicBool::new(should_detach),
            state: Mutex::new(ProcessState::Running),
            runtimes: Mutex::new(Vec::new()),
            exit_code: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Pid {
        self.id
    }

    pub fn should_detach(&self) -> bool {
        self.should_detach.load(Ordering::SeqCst)
    }

    pub fn set_should_detach(&self, value: bool) {
        self.should_detach.store(value, Ordering::SeqCst);
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        *self.state.lock().unwrap() = state;
    }

    /// Runtimes currently attached to this process.
    pub fn runtimes(&self) -> Vec<Arc<DbgRuntime>> {
        self.runtimes.lock().unwrap().clone()
    }

    pub(crate) fn add_runtime(&self, runtime: Arc<DbgRuntime>) {
        self.runtimes.lock().unwrap().push(runtime);
    }

    /// Detach a runtime, return true when it was the last one.
    pub(crate) fn remove_runtime(&self, id: RuntimeId) -> bool {
        let mut runtimes = self.runtimes.lock().unwrap();
        runtimes.retain(|rt| rt.id() != id);
        runtimes.is_empty()
    }

    /// Exit code, present once the process is [`ProcessState::Terminated`].
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        _ = self.exit_code.set(code);
    }
}

impl DbgObject for DbgProcess {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.runtimes.lock().unwrap().clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type PreContinueFn = Box<dyn Fn() + Send>;

/// A single execution environment inside a process that one engine drives.
pub struct DbgRuntime {
    id: RuntimeId,
    name: String,
    process_id: Pid,
    modules: Mutex<Vec<Arc<DbgModule>>>,
    /// Backend-specific state installed by the engine in its connect callback.
    data: Mutex<Option<Box<dyn Any + Send>>>,
    /// Invoked right before the debuggee is resumed by a user continue.
    pre_continue: Mutex<Option<PreContinueFn>>,
    closed: AtomicBool,
}

impl DbgRuntime {
    pub(crate) fn new(id: RuntimeId, name: impl Into<String>, process_id: Pid) -> Self {
        Self {
            id,
            name: name.into(),
            process_id,
            modules: Mutex::new(Vec::new()),
            data: Mutex::new(None),
            pre_continue: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> RuntimeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the hosting process. The runtime does not hold the process record, the
    /// ownership graph stays a DAG with the manager at the root.
    pub fn process_id(&self) -> Pid {
        self.process_id
    }

    pub fn modules(&self) -> Vec<Arc<DbgModule>> {
        self.modules.lock().unwrap().clone()
    }

    /// Install backend-specific runtime state.
    pub fn set_data(&self, data: Box<dyn Any + Send>) {
        *self.data.lock().unwrap() = Some(data);
    }

    /// Borrow the backend-specific state downcast to `T`.
    pub fn with_data<T: 'static, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let data = self.data.lock().unwrap();
        f(data.as_deref().and_then(|d| d.downcast_ref::<T>()))
    }

    /// Register the hook invoked right before a user continue resumes the debuggee.
    pub fn set_pre_continue(&self, f: impl Fn() + Send + 'static) {
        *self.pre_continue.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn notify_before_continue(&self) {
        if let Some(hook) = self.pre_continue.lock().unwrap().as_ref() {
            hook();
        }
    }
}

impl DbgObject for DbgRuntime {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.modules.lock().unwrap().clear();
        *self.data.lock().unwrap() = None;
        *self.pre_continue.lock().unwrap() = None;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A debuggee thread observed by an engine.
pub struct DbgThread {
    id: u64,
    name: Option<String>,
    closed: AtomicBool,
}

impl DbgThread {
    pub(crate) fn new(id: u64, name: Option<String>) -> Self {
        Self {
            id,
            name,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl DbgObject for DbgThread {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// An executable image loaded into a runtime.
pub struct DbgModule {
    name: String,
    runtime_id: RuntimeId,
    closed: AtomicBool,
}

impl DbgModule {
    pub(crate) fn new(name: impl Into<String>, runtime_id: RuntimeId) -> Self {
        Self {
            name: name.into(),
            runtime_id,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime_id(&self) -> RuntimeId {
        self.runtime_id
    }
}

impl DbgObject for DbgModule {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The exception an engine reported at its last pause.
pub struct DbgException {
    description: String,
    closed: AtomicBool,
}

impl DbgException {
    pub(crate) fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl DbgObject for DbgException {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory bound to one `(runtime, engine)` pair, the only way engines mint debuggee-side
/// objects.
pub struct DbgObjectFactory {
    runtime: Arc<DbgRuntime>,
    closed: AtomicBool,
}

impl DbgObjectFactory {
    pub(crate) fn new(runtime: Arc<DbgRuntime>) -> Self {
        Self {
            runtime,
            closed: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &Arc<DbgRuntime> {
        &self.runtime
    }

    /// Create a module record and attach it to the factory's runtime.
    pub fn create_module(&self, name: impl Into<String>) -> Arc<DbgModule> {
        let module = Arc::new(DbgModule::new(name, self.runtime.id()));
        self.runtime.modules.lock().unwrap().push(module.clone());
        module
    }

    /// Drop a module record from the factory's runtime.
    pub fn remove_module(&self, module: &Arc<DbgModule>) {
        self.runtime
            .modules
            .lock()
            .unwrap()
            .retain(|m| !Arc::ptr_eq(m, module));
    }

    pub fn create_thread(&self, id: u64, name: Option<String>) -> Arc<DbgThread> {
        Arc::new(DbgThread::new(id, name))
    }

    pub fn create_exception(&self, description: impl Into<String>) -> Arc<DbgException> {
        Arc::new(DbgException::new(description))
    }
}

impl DbgObject for DbgObjectFactory {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
