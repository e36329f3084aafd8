use std::sync::Mutex;
use std::sync::mpsc::{Sender, channel};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::fatal_check;
use crate::session::error::Error;

enum Job {
    Task(Box<dyn FnOnce() + Send + 'static>),
    Exit,
}

/// Single-threaded serialization domain.
///
/// All session state mutations and event emissions are executed by one worker thread, in the
/// order they were posted. API entry points running on foreign threads post closures here and
/// return immediately.
pub struct Dispatcher {
    tx: Sender<Job>,
    worker_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::<Job>();
        let worker = thread::Builder::new()
            .name("dbgmux-dispatcher".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Task(task) => task(),
                        Job::Exit => break,
                    }
                }
            })
            .expect("spawn dispatcher thread");

        Self {
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            tx,
        }
    }

    /// Enqueue a task, FIFO with everything already posted.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        _ = self.tx.send(Job::Task(Box::new(f)));
    }

    /// Execute a task on the dispatcher thread and wait for its result.
    ///
    /// Runs the task inline when already on the dispatcher thread, a queue round-trip would
    /// deadlock there.
    pub fn invoke<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.verify_access() {
            return Ok(f());
        }
        let (tx, rx) = channel();
        self.post(move || {
            _ = tx.send(f());
        });
        rx.recv().map_err(|_| Error::DispatcherGone)
    }

    /// Enqueue a task after a delay. Delivery order relative to other delayed tasks with the
    /// same deadline is unspecified.
    pub fn post_delayed(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let tx = self.tx.clone();
        let timer = thread::Builder::new()
            .name("dbgmux-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                _ = tx.send(Job::Task(Box::new(f)));
            });
        if let Err(e) = timer {
            log::error!(target: "session", "timer thread spawn fail: {e}");
        }
    }

    /// True when the caller runs on the dispatcher thread.
    pub fn verify_access(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Residency assertion for methods that must run on the dispatcher thread.
    pub(crate) fn check_access(&self) {
        fatal_check!(self.verify_access(), "dispatcher thread residency violated");
    }

    /// Stop the worker after draining every task posted before this call.
    pub(crate) fn shutdown(&self) {
        _ = self.tx.send(Job::Exit);
        if self.verify_access() {
            // shutting down from inside a task, the worker exits once this task returns
            return;
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            _ = worker.join();
        }
    }
}
