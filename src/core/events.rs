//! Event fan-out with a backlog for late subscribers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::warn;

use super::session::lock;

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Handler<E> = Box<dyn Fn(&E) + Send + Sync>;

struct HubInner<E> {
    handlers: Vec<(SubscriptionId, Handler<E>)>,
    backlog: VecDeque<E>,
    dropped: u64,
}

/// Ordered delivery of events to every subscriber.
///
/// Events emitted while nobody is subscribed are held (up to
/// `backlog_limit`, oldest dropped first) and replayed to the next
/// subscriber. Handlers run on the emitting thread with the hub locked, so a
/// handler must not subscribe or unsubscribe on the same hub.
pub struct EventHub<E> {
    inner: Mutex<HubInner<E>>,
    next_id: AtomicU64,
    backlog_limit: usize,
}

impl<E> EventHub<E> {
    pub fn new(backlog_limit: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                handlers: Vec::new(),
                backlog: VecDeque::new(),
                dropped: 0,
            }),
            next_id: AtomicU64::new(1),
            backlog_limit,
        }
    }

    pub fn subscribe(&self, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = lock(&self.inner);

        if inner.dropped > 0 {
            warn!("{} events were dropped before the first subscriber", inner.dropped);
            inner.dropped = 0;
        }
        for event in inner.backlog.drain(..) {
            handler(&event);
        }

        inner.handlers.push((id, handler));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.handlers.len();
        inner.handlers.retain(|(handler_id, _)| *handler_id != id);
        inner.handlers.len() != before
    }

    pub fn emit(&self, event: E) {
        let mut inner = lock(&self.inner);

        if inner.handlers.is_empty() {
            if self.backlog_limit == 0 {
                inner.dropped += 1;
                return;
            }
            if inner.backlog.len() == self.backlog_limit {
                inner.backlog.pop_front();
                inner.dropped += 1;
            }
            inner.backlog.push_back(event);
            return;
        }

        for (_, handler) in &inner.handlers {
            handler(&event);
        }
    }

    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).handlers.len()
    }
}
