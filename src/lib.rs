//! dbgmux - a debug session manager.
//!
//! One manager owns any number of debug engines (native, managed, remote - whatever a
//! registered [`session::engine::EngineProvider`] creates), multiplexes their event streams
//! into a single serialized stream and exposes a unified control surface to the embedding
//! front-end. See [`session`] for the full picture.

pub mod log;
pub mod session;
