use crate::session::registry::{EngineRegistry, EngineState};

/// Ternary session running-state.
///
/// `Partial` is a first-class product of mixed engine states, not an error or a transition
/// artifact: with several engines attached, some may pause while others keep running.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunningState {
    /// No engines, or every engine is paused.
    NotRunning,
    /// Every engine is running or still starting.
    Running,
    /// Some engines are paused, some are not.
    Partial,
}

impl RunningState {
    /// Derive the session state from the engine list.
    pub(crate) fn calculate(engines: &EngineRegistry) -> Self {
        if engines.is_empty() {
            return RunningState::NotRunning;
        }
        let paused = engines
            .iter()
            .filter(|info| info.state == EngineState::Paused)
            .count();
        if paused == 0 {
            RunningState::Running
        } else if paused == engines.len() {
            RunningState::NotRunning
        } else {
            RunningState::Partial
        }
    }
}
