//! In-memory session log for embedding front-ends.
//!
//! Debugger hosts usually render a log pane next to the session views. This module captures
//! the crate's `log` records into a bounded buffer the host drains on its own cadence,
//! instead of forcing every embedder to bring a logger implementation. Installation is lazy
//! and one-shot: the buffer becomes the global logger on first access. A host that already
//! installed its own logger keeps it, records then bypass the buffer entirely.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;

/// Upper bound on buffered records, the oldest are evicted first.
const CAPACITY: usize = 512;

/// One captured record.
#[derive(Clone, Debug)]
pub struct SessionLogRecord {
    pub level: Level,
    pub target: String,
    pub text: String,
}

/// Bounded capture buffer behind the `log` facade.
pub struct SessionLog {
    records: Mutex<VecDeque<SessionLogRecord>>,
}

/// The capture buffer. Dereferencing installs it as the global logger if none is set yet.
pub static SESSION_LOG: Lazy<&'static SessionLog> = Lazy::new(|| {
    static BUFFER: SessionLog = SessionLog {
        records: Mutex::new(VecDeque::new()),
    };
    if log::set_logger(&BUFFER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
    &BUFFER
});

impl SessionLog {
    /// Take every record buffered since the previous drain.
    pub fn drain(&self) -> Vec<SessionLogRecord> {
        self.records.lock().unwrap().drain(..).collect()
    }

    /// Raise or lower what gets captured.
    pub fn set_level(&self, level: LevelFilter) {
        log::set_max_level(level);
    }
}

impl Log for SessionLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut records = self.records.lock().unwrap();
        if records.len() == CAPACITY {
            records.pop_front();
        }
        records.push_back(SessionLogRecord {
            level: record.level(),
            target: record.target().to_string(),
            text: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}
