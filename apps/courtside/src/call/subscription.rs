use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Slots<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
}

/// A set of listener callbacks. Emission snapshots the list and calls each
/// listener outside the lock, so a listener may subscribe or unsubscribe.
pub(crate) struct Listeners<E> {
    slots: Arc<Mutex<Slots<E>>>,
}

impl<E: 'static> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut slots = self.slots.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.callbacks.push((id, Arc::new(callback)));
            id
        };
        let weak: Weak<Mutex<Slots<E>>> = Arc::downgrade(&self.slots);
        Subscription::new(move || {
            if let Some(slots) = weak.upgrade() {
                slots.lock().callbacks.retain(|(existing, _)| *existing != id);
            }
        })
    }

    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .slots
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().callbacks.len()
    }
}

/// Handle returned by listener registration. Dropping it unsubscribes; call
/// [`Subscription::detach`] to keep the listener for the life of the session.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unsubscribe_stops_delivery() {
        let listeners = Listeners::<u64>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = listeners.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&1);
        sub.unsubscribe();
        listeners.emit(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn detached_listener_survives_handle() {
        let listeners = Listeners::<u64>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners
            .subscribe(move |value| sink.lock().push(*value))
            .detach();

        listeners.emit(&4);
        listeners.emit(&5);
        assert_eq!(*seen.lock(), vec![4, 5]);
    }

    #[test]
    fn listener_may_register_during_emit() {
        let listeners = Arc::new(Listeners::<u64>::new());
        let inner = Arc::clone(&listeners);
        listeners
            .subscribe(move |_| inner.subscribe(|_| {}).detach())
            .detach();

        listeners.emit(&0);
        assert_eq!(listeners.len(), 2);
    }
}
