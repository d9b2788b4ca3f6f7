use std::fmt::Debug;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

/// Fan-out of events to any number of subscribers.
///
/// Each subscriber gets its own unbounded receiver, and no event is ever dropped for a slow
///  subscriber. The receiver is the subscription handle: dropping it unsubscribes, and the
///  sender side is pruned on the next event.
pub struct EventNotifier<E: Clone + Debug> {
    listeners: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl <E: Clone + Debug> EventNotifier<E> {
    pub fn new() -> EventNotifier<E> {
        EventNotifier {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().push(sender);
        receiver
    }

    pub fn send_event(&self, event: E) {
        trace!("event: {:?}", event);
        self.lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    pub fn num_listeners(&self) -> usize {
        let mut listeners = self.lock();
        listeners.retain(|l| !l.is_closed());
        listeners.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        // a panic while holding the lock can not leave the listener list inconsistent
        self.listeners.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl <E: Clone + Debug> Default for EventNotifier<E> {
    fn default() -> Self {
        EventNotifier::new()
    }
}
