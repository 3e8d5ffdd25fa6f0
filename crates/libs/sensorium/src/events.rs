//! Synchronous subscriber callbacks.
//!
//! Sensors deliver decoded frames by invoking every connected callback on
//! the rendering call stack, inside `post_render`. Dropping the returned
//! [`Connection`] detaches the callback; it is never invoked again, even for
//! frames already rendered.

use std::sync::{Arc, Mutex, Weak};

/// A frame of decoded image-like sensor data handed to subscribers.
///
/// The sensor owns one of these as its persistent output cache; `data` is
/// reused across frames and reallocated only on resize. Subscribers borrow
/// it for the duration of the callback and must copy what they keep.
#[derive(Debug, Default)]
pub struct Frame<T> {
    /// Decoded samples, row-major, tightly packed.
    pub data: Vec<T>,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Samples per pixel.
    pub channels: u32,
    /// Wire-format name, e.g. `"FLOAT32"` or `"L16"`.
    pub format: &'static str,
}

type Callback<P> = Box<dyn FnMut(&P) + Send>;

/// Callbacks live behind their own lock so `emit` can release the registry
/// lock before invoking them; a callback is then free to connect or drop
/// connections on the same hub.
struct Registry<P> {
    next_id: u64,
    subscribers: Vec<(u64, Arc<Mutex<Callback<P>>>)>,
}

/// Callback registry of one sensor.
pub struct EventHub<P> {
    inner: Arc<Mutex<Registry<P>>>,
}

impl<P> Default for EventHub<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> EventHub<P> {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Registers a callback; it stays connected for the lifetime of the
    /// returned [`Connection`].
    pub fn connect(&self, callback: impl FnMut(&P) + Send + 'static) -> Connection<P> {
        let mut registry = self.inner.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .subscribers
            .push((id, Arc::new(Mutex::new(Box::new(callback)))));
        Connection {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Whether any subscriber is connected. Sensors use this to skip the
    /// GPU read-back and decode entirely when nobody is listening.
    pub fn has_subscribers(&self) -> bool {
        !self.inner.lock().unwrap().subscribers.is_empty()
    }

    /// Invokes every connected callback with `payload`, synchronously.
    ///
    /// The registry lock is released before each invocation, so callbacks
    /// may drop their own or other [`Connection`]s mid-emit; a connection
    /// dropped that way is not invoked for the rest of this emit.
    pub fn emit(&self, payload: &P) {
        let snapshot: Vec<_> = {
            let registry = self.inner.lock().unwrap();
            registry
                .subscribers
                .iter()
                .map(|(id, cb)| (*id, cb.clone()))
                .collect()
        };
        for (id, callback) in snapshot {
            let connected = {
                let registry = self.inner.lock().unwrap();
                registry.subscribers.iter().any(|(i, _)| *i == id)
            };
            if connected {
                (callback.lock().unwrap())(payload);
            }
        }
    }
}

/// Handle tying a callback's lifetime to a value; dropping it detaches the
/// callback from its [`EventHub`].
pub struct Connection<P> {
    id: u64,
    registry: Weak<Mutex<Registry<P>>>,
}

impl<P> Drop for Connection<P> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap();
            registry.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_to_connected_subscribers() {
        let hub = EventHub::<u32>::new();
        assert!(!hub.has_subscribers());
        let count = Arc::new(AtomicUsize::new(0));
        let c = {
            let count = count.clone();
            hub.connect(move |v| {
                count.fetch_add(*v as usize, Ordering::SeqCst);
            })
        };
        assert!(hub.has_subscribers());
        hub.emit(&2);
        hub.emit(&3);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        drop(c);
    }

    #[test]
    fn dropping_connection_detaches() {
        let hub = EventHub::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = {
            let count = count.clone();
            hub.connect(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        hub.emit(&());
        drop(c);
        assert!(!hub.has_subscribers());
        hub.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_another_connection_inside_a_callback_detaches_it() {
        let hub = EventHub::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let second = {
            let count = count.clone();
            hub.connect(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let parked = Arc::new(Mutex::new(Some(second)));
        let first = {
            let parked = parked.clone();
            hub.connect(move |_| {
                parked.lock().unwrap().take();
            })
        };
        // `second` registered before `first`, so it fires once; after the
        // in-callback drop it is skipped for good.
        hub.emit(&());
        hub.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(first);
        assert!(!hub.has_subscribers());
    }

    #[test]
    fn dropping_own_connection_inside_a_callback_detaches_it() {
        let hub = EventHub::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Connection<()>>>> = Arc::new(Mutex::new(None));
        let c = {
            let count = count.clone();
            let slot = slot.clone();
            hub.connect(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                slot.lock().unwrap().take();
            })
        };
        *slot.lock().unwrap() = Some(c);
        hub.emit(&());
        hub.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!hub.has_subscribers());
    }

    #[test]
    fn connection_outliving_hub_is_harmless() {
        let hub = EventHub::<()>::new();
        let c = hub.connect(|_| {});
        drop(hub);
        drop(c);
    }
}
