use nix::unistd::Pid;

use crate::session::process::RuntimeId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- start errors ----------------------------------------------
    #[error("no debug engine accepts the start options")]
    NoSuitableEngine,
    #[error("debug engine construction failed: {0}")]
    EngineCreation(String),
    #[error("start called while a previous start is still initializing")]
    RecursiveStart,

    // --------------------------------- attach errors ---------------------------------------------
    #[error("process {0} hosts this session, self-debugging is denied")]
    SelfAttach(Pid),
    #[error("runtime {1:?} in process {0} is already being debugged")]
    AlreadyDebugged(Pid, RuntimeId),

    // --------------------------------- restart errors --------------------------------------------
    #[error("restart is unavailable in the current session state")]
    CannotRestart,

    // --------------------------------- dispatcher errors -----------------------------------------
    #[error("dispatcher thread is gone")]
    DispatcherGone,
}

impl Error {
    /// Return a hint to an interface - continue using the manager after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NoSuitableEngine => false,
            Error::EngineCreation(_) => false,
            Error::SelfAttach(_) => false,
            Error::AlreadyDebugged(_, _) => false,
            Error::CannotRestart => false,

            // currently fatal errors
            Error::RecursiveStart => true,
            Error::DispatcherGone => true,
        }
    }
}

/// Log-and-continue for operations whose failure must not take the session down.
///
/// Fire-and-forget follow-ups (restart re-starts, cleanup posted from handlers) have nobody
/// left to return an error to, they get a warning in the session log instead.
pub(crate) trait ResultExt<T> {
    fn or_log(self, what: &'static str) -> Option<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn or_log(self, what: &'static str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "session", "{what} failed: {e:#}");
                None
            }
        }
    }
}

/// Fatal programmer-error check: panic in debug builds, log and fall through in release.
#[macro_export]
macro_rules! fatal_check {
    ($cond: expr, $msg: tt) => {
        if !$cond {
            if cfg!(debug_assertions) {
                panic!($msg);
            }
            log::error!(target: "session", $msg);
        }
    };
}
