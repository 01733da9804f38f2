use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;

use tailscope_types::Modification;

/// Receives change notifications from a log source.
///
/// Called while the source's listener registry is locked: implementations
/// must not add or remove listeners on the same source from inside
/// `on_modified`. Reading the source is fine.
pub trait LogSourceListener: Send + Sync {
    fn on_modified(&self, modification: Modification);
}

/// Listener that forwards every modification into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Modification>,
}

impl ChannelListener {
    /// Create a listener together with the receiving end of its channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Modification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl LogSourceListener for ChannelListener {
    fn on_modified(&self, modification: Modification) {
        // Receiver gone means the consumer was disposed
        let _ = self.tx.send(modification);
    }
}

/// One listener plus its batching policy and delivery state
struct Registration {
    listener: Arc<dyn LogSourceListener>,
    maximum_wait: Duration,
    maximum_batch: usize,

    /// Number of lines this listener has been told about
    reported: usize,

    /// When the last notification went out
    last_notified: Option<Instant>,
}

impl Registration {
    /// Deliver appends up to `total` if the policy says it is time
    fn publish(&mut self, total: usize, now: Instant, force: bool) {
        if total <= self.reported {
            return;
        }

        let pending = total - self.reported;
        let due = force
            || pending >= self.maximum_batch
            || self
                .last_notified
                .is_none_or(|at| now.duration_since(at) >= self.maximum_wait);
        if !due {
            return;
        }

        while self.reported < total {
            let count = (total - self.reported).min(self.maximum_batch);
            self.listener
                .on_modified(Modification::appended(self.reported, count));
            self.reported += count;
        }
        self.last_notified = Some(now);
    }

    fn reset(&mut self, now: Instant) {
        self.reported = 0;
        self.last_notified = Some(now);
        self.listener.on_modified(Modification::Reset);
    }
}

#[derive(Default)]
struct Registry {
    registrations: Vec<Registration>,

    /// Line count as of the last notification from the producer
    total: usize,
}

/// Per-source registry of listeners.
///
/// Each listener is throttled on its own: appends are delivered once its
/// batch threshold is reached or its wait time has elapsed since the last
/// delivery, whichever comes first. Invalidations and resets are delivered
/// immediately. Notifications reach each listener in the order the producer
/// issued them.
#[derive(Default)]
pub struct ListenerCollection {
    registry: Mutex<Registry>,
}

impl ListenerCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    ///
    /// The listener is primed right away with a `Reset` followed by appends
    /// covering every line the producer has announced so far.
    pub fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        maximum_wait: Duration,
        maximum_batch: usize,
    ) {
        let mut registry = self.registry.lock();
        let mut registration = Registration {
            listener,
            maximum_wait,
            maximum_batch: maximum_batch.max(1),
            reported: 0,
            last_notified: None,
        };

        let now = Instant::now();
        registration.reset(now);
        let total = registry.total;
        registration.publish(total, now, true);
        registry.registrations.push(registration);
    }

    /// Remove a listener; returns whether it was registered
    pub fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.registrations.len();
        registry
            .registrations
            .retain(|r| !std::ptr::addr_eq(Arc::as_ptr(&r.listener), Arc::as_ptr(listener)));
        registry.registrations.len() != before
    }

    pub fn len(&self) -> usize {
        self.registry.lock().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The producer now holds `total` lines
    pub fn on_read(&self, total: usize) {
        let mut registry = self.registry.lock();
        registry.total = total;
        let now = Instant::now();
        for registration in &mut registry.registrations {
            registration.publish(total, now, false);
        }
    }

    /// The producer was cleared to empty
    pub fn reset(&self) {
        let mut registry = self.registry.lock();
        registry.total = 0;
        let now = Instant::now();
        for registration in &mut registry.registrations {
            registration.reset(now);
        }
    }

    /// Lines from `first_index` onwards were removed; `count` is the number
    /// the producer dropped
    pub fn invalidate(&self, first_index: usize, count: usize) {
        trace!(first_index, count, "invalidating listeners");
        let mut registry = self.registry.lock();
        registry.total = first_index;
        for registration in &mut registry.registrations {
            // A throttled listener only hears about the lines it was told of
            if registration.reported <= first_index {
                continue;
            }
            let removed = registration.reported - first_index;
            registration
                .listener
                .on_modified(Modification::invalidated(first_index, removed));
            registration.reported = first_index;
        }
    }

    /// Deliver every throttled append regardless of policy
    pub fn flush(&self) {
        let mut registry = self.registry.lock();
        let total = registry.total;
        let now = Instant::now();
        for registration in &mut registry.registrations {
            registration.publish(total, now, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Modification>) -> Vec<Modification> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_new_listener_is_primed() {
        let listeners = ListenerCollection::new();
        listeners.on_read(5);

        let (listener, mut rx) = ChannelListener::new();
        listeners.add_listener(listener, Duration::from_secs(60), 100);

        assert_eq!(
            drain(&mut rx),
            vec![Modification::Reset, Modification::appended(0, 5)]
        );
    }

    #[test]
    fn test_zero_wait_delivers_every_read() {
        let listeners = ListenerCollection::new();
        let (listener, mut rx) = ChannelListener::new();
        listeners.add_listener(listener, Duration::ZERO, 100);
        drain(&mut rx);

        listeners.on_read(1);
        listeners.on_read(3);
        assert_eq!(
            drain(&mut rx),
            vec![Modification::appended(0, 1), Modification::appended(1, 2)]
        );
    }

    #[test]
    fn test_throttled_until_batch_reached() {
        let listeners = ListenerCollection::new();
        let (listener, mut rx) = ChannelListener::new();
        listeners.add_listener(listener, Duration::from_secs(60), 4);
        drain(&mut rx);

        listeners.on_read(2);
        listeners.on_read(3);
        assert!(drain(&mut rx).is_empty());

        listeners.on_read(9);
        assert_eq!(
            drain(&mut rx),
            vec![
                Modification::appended(0, 4),
                Modification::appended(4, 4),
                Modification::appended(8, 1),
            ]
        );
    }

    #[test]
    fn test_flush_delivers_withheld_lines() {
        let listeners = ListenerCollection::new();
        let (listener, mut rx) = ChannelListener::new();
        listeners.add_listener(listener, Duration::from_secs(60), 100);
        drain(&mut rx);

        listeners.on_read(3);
        assert!(drain(&mut rx).is_empty());

        listeners.flush();
        assert_eq!(drain(&mut rx), vec![Modification::appended(0, 3)]);
    }

    #[test]
    fn test_policies_are_independent() {
        let listeners = ListenerCollection::new();
        let (eager, mut eager_rx) = ChannelListener::new();
        let (lazy, mut lazy_rx) = ChannelListener::new();
        listeners.add_listener(eager, Duration::ZERO, 100);
        listeners.add_listener(lazy, Duration::from_secs(60), 100);
        drain(&mut eager_rx);
        drain(&mut lazy_rx);

        listeners.on_read(2);
        assert_eq!(drain(&mut eager_rx), vec![Modification::appended(0, 2)]);
        assert!(drain(&mut lazy_rx).is_empty());
    }

    #[test]
    fn test_invalidate_and_reset() {
        let listeners = ListenerCollection::new();
        let (listener, mut rx) = ChannelListener::new();
        listeners.add_listener(listener, Duration::ZERO, 100);
        listeners.on_read(4);
        drain(&mut rx);

        listeners.invalidate(1, 3);
        assert_eq!(drain(&mut rx), vec![Modification::invalidated(1, 3)]);

        listeners.on_read(2);
        assert_eq!(drain(&mut rx), vec![Modification::appended(1, 1)]);

        listeners.reset();
        assert_eq!(drain(&mut rx), vec![Modification::Reset]);

        listeners.on_read(1);
        assert_eq!(drain(&mut rx), vec![Modification::appended(0, 1)]);
    }

    #[test]
    fn test_invalidate_skips_listener_that_never_saw_the_lines() {
        let listeners = ListenerCollection::new();
        let (listener, mut rx) = ChannelListener::new();
        listeners.add_listener(listener, Duration::from_secs(60), 100);
        drain(&mut rx);

        listeners.on_read(4);
        listeners.invalidate(2, 2);
        assert!(drain(&mut rx).is_empty());

        listeners.flush();
        assert_eq!(drain(&mut rx), vec![Modification::appended(0, 2)]);
    }

    #[test]
    fn test_remove_listener() {
        let listeners = ListenerCollection::new();
        let (listener, mut rx) = ChannelListener::new();
        let listener: Arc<dyn LogSourceListener> = listener;
        listeners.add_listener(listener.clone(), Duration::ZERO, 100);
        assert_eq!(listeners.len(), 1);

        assert!(listeners.remove_listener(&listener));
        assert!(!listeners.remove_listener(&listener));
        assert!(listeners.is_empty());

        drain(&mut rx);
        listeners.on_read(3);
        assert!(drain(&mut rx).is_empty());
    }
}
