use std::sync::{Arc, Weak};

use crate::session::DbgManager;
use crate::session::engine::EngineId;
use crate::session::process::{DbgModule, DbgRuntime};

/// External bound-breakpoint binder contract.
///
/// The manager only drives lifecycle hooks; address resolution and symbol lookup live behind
/// this trait. All hooks run on the dispatcher thread.
pub trait BoundBreakpointsBinder: Send + Sync {
    /// One-time subsystem initialization, invoked by the first `start` call.
    fn initialize(&self, manager: &Arc<DbgManager>) {
        _ = manager;
    }

    /// A new engine connected; create its initial bindings.
    fn initialize_engine(&self, engine: EngineId, runtime: &Arc<DbgRuntime>) {
        let (_, _) = (engine, runtime);
    }

    /// An engine disconnected; drop every binding owned by its runtime.
    fn remove_runtime(&self, runtime: &Arc<DbgRuntime>) {
        _ = runtime;
    }

    fn modules_loaded(&self, runtime: &Arc<DbgRuntime>, modules: &[Arc<DbgModule>]) {
        let (_, _) = (runtime, modules);
    }

    fn modules_unloaded(&self, runtime: &Arc<DbgRuntime>, modules: &[Arc<DbgModule>]) {
        let (_, _) = (runtime, modules);
    }

    /// An external component asks to re-bind the listed modules.
    fn modules_refreshed(&self, modules: &[Arc<DbgModule>]) {
        _ = modules;
    }
}

/// A component that occasionally invalidates module bindings (symbol reload, edit-and-continue
/// style patching). The manager subscribes at first start; notifications are funneled to the
/// dispatcher before reaching the binder.
pub trait ModuleRefreshSource: Send + Sync {
    fn subscribe(&self, sink: ModuleRefreshSink);
}

#[derive(Clone)]
pub struct ModuleRefreshSink {
    manager: Weak<DbgManager>,
}

impl ModuleRefreshSink {
    pub(crate) fn new(manager: Weak<DbgManager>) -> Self {
        Self { manager }
    }

    pub fn notify(&self, modules: Vec<Arc<DbgModule>>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let target = manager.clone();
        manager
            .dispatcher()
            .post(move || target.bridge().refreshed(&modules));
    }
}

/// Thin dispatcher-side wrapper over the optional binder.
pub(crate) struct BreakpointBridge {
    binder: Option<Arc<dyn BoundBreakpointsBinder>>,
}

impl BreakpointBridge {
    pub fn new(binder: Option<Arc<dyn BoundBreakpointsBinder>>) -> Self {
        Self { binder }
    }

    pub fn initialize(&self, manager: &Arc<DbgManager>) {
        if let Some(binder) = &self.binder {
            binder.initialize(manager);
        }
    }

    pub fn engine_connected(&self, engine: EngineId, runtime: &Arc<DbgRuntime>) {
        if let Some(binder) = &self.binder {
            binder.initialize_engine(engine, runtime);
        }
    }

    pub fn runtime_removed(&self, runtime: &Arc<DbgRuntime>) {
        if let Some(binder) = &self.binder {
            binder.remove_runtime(runtime);
        }
    }

    pub fn loaded(&self, runtime: &Arc<DbgRuntime>, modules: &[Arc<DbgModule>]) {
        if let Some(binder) = &self.binder {
            binder.modules_loaded(runtime, modules);
        }
    }

    pub fn unloaded(&self, runtime: &Arc<DbgRuntime>, modules: &[Arc<DbgModule>]) {
        if let Some(binder) = &self.binder {
            binder.modules_unloaded(runtime, modules);
        }
    }

    pub fn refreshed(&self, modules: &[Arc<DbgModule>]) {
        if let Some(binder) = &self.binder {
            binder.modules_refreshed(modules);
        }
    }
}
