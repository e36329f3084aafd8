use std::sync::{Arc, Mutex};

use crate::session::dispatcher::Dispatcher;

/// A manager-owned object with an asynchronous close lifecycle.
///
/// `close` is idempotent at the object level but the manager guarantees it is invoked exactly
/// once per enqueue, on the dispatcher thread, ordered with other state changes.
pub trait DbgObject: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Coalesced batch destructor queue.
///
/// Closes are appended under a lock; a drain task is posted only when the queue was empty on
/// entry, so any number of closes between two dispatcher turns costs a single drain.
#[derive(Default)]
pub(crate) struct CloseQueue {
    queue: Mutex<Vec<Arc<dyn DbgObject>>>,
}

impl CloseQueue {
    pub fn enqueue(self: &Arc<Self>, obj: Arc<dyn DbgObject>, dispatcher: &Dispatcher) {
        self.enqueue_many(vec![obj], dispatcher);
    }

    pub fn enqueue_many(self: &Arc<Self>, objs: Vec<Arc<dyn DbgObject>>, dispatcher: &Dispatcher) {
        if objs.is_empty() {
            return;
        }
        let start_drain = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.extend(objs);
            was_empty
        };
        if start_drain {
            let this = self.clone();
            dispatcher.post(move || this.drain());
        }
    }

    fn drain(&self) {
        let batch = std::mem::take(&mut *self.queue.lock().unwrap());
        for obj in batch {
            obj.close();
        }
    }
}
