use std::sync::Arc;

use crate::session::engine::{DbgEngine, EngineId, PredefinedBreak};
use crate::session::process::{DbgException, DbgObjectFactory, DbgProcess, DbgRuntime, DbgThread};

/// Engine execution state.
///
/// `Starting` holds from registry insertion until the `Connected` message is observed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EngineState {
    Starting,
    Running,
    Paused,
}

/// One record per attached engine, owned by the registry.
///
/// `process`, `runtime` and `factory` are all absent while `Starting` and all present after a
/// successful connect.
pub(crate) struct EngineInfo {
    pub id: EngineId,
    pub engine: Arc<dyn DbgEngine>,
    pub process: Option<Arc<DbgProcess>>,
    pub runtime: Option<Arc<DbgRuntime>>,
    pub factory: Option<Arc<DbgObjectFactory>>,
    pub state: EngineState,
    /// Immutable tag snapshot captured at engine construction.
    pub debug_tags: Vec<String>,
    /// Initial pause request captured from the start options.
    pub break_kind: Option<PredefinedBreak>,
    pub delayed_is_running: bool,
    /// Thread reported by the engine at the last pause.
    pub break_thread: Option<Arc<DbgThread>>,
    /// Displayed exception, non-empty only while `Paused`.
    pub exception: Option<Arc<DbgException>>,
}

impl EngineInfo {
    pub fn new(
        id: EngineId,
        engine: Arc<dyn DbgEngine>,
        break_kind: Option<PredefinedBreak>,
    ) -> Self {
        let debug_tags = engine.debug_tags();
        Self {
            id,
            engine,
            process: None,
            runtime: None,
            factory: None,
            state: EngineState::Starting,
            debug_tags,
            break_kind,
            delayed_is_running: false,
            break_thread: None,
            exception: None,
        }
    }

    /// True when this record targets `process`.
    pub fn targets(&self, process: &Arc<DbgProcess>) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, process))
    }
}

/// The list of engine records. Lives inside the session mutex; mutated only on the
/// dispatcher thread.
#[derive(Default)]
pub(crate) struct EngineRegistry {
    engines: Vec<EngineInfo>,
}

impl EngineRegistry {
    pub fn add(&mut self, info: EngineInfo) {
        self.engines.push(info);
    }

    /// Detach a record. Absence is a normal condition: the engine may already be gone by the
    /// time an in-flight message is dispatched.
    pub fn remove(&mut self, id: EngineId) -> Option<EngineInfo> {
        let idx = self.engines.iter().position(|info| info.id == id)?;
        Some(self.engines.remove(idx))
    }

    pub fn get(&self, id: EngineId) -> Option<&EngineInfo> {
        self.engines.iter().find(|info| info.id == id)
    }

    pub fn get_mut(&mut self, id: EngineId) -> Option<&mut EngineInfo> {
        self.engines.iter_mut().find(|info| info.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineInfo> {
        self.engines.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EngineInfo> {
        self.engines.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }
}
