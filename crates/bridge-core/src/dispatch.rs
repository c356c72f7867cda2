use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{EventEnvelope, EventKind};

/// Identifier returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

/// Pull-style subscription: envelopes in dispatch order.
pub type EventStream = mpsc::UnboundedReceiver<EventEnvelope>;

/// Error a callback may return; it is logged and counted, never propagated.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by dispatcher operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The owning session was destroyed.
    #[error("event dispatcher is closed")]
    Closed,
    /// Callback subscriptions need a tokio runtime to run on.
    #[error("callback subscriptions require a tokio runtime")]
    NoRuntime,
}

/// Which events a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(EventKind),
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Kind(wanted) => *wanted == kind,
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    queue: mpsc::UnboundedSender<EventEnvelope>,
}

#[derive(Default)]
struct DispatcherState {
    next_id: SubscriptionId,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Per-session fan-out of events to subscribers.
///
/// Every subscriber owns an unbounded FIFO. Callback subscribers are drained
/// by their own task, so a slow callback only delays itself and a failing one
/// never reaches the caller of `dispatch`.
#[derive(Default)]
pub struct EventDispatcher {
    state: Mutex<DispatcherState>,
    failures: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, run on its own task for every matching event.
    pub fn subscribe<F>(
        &self,
        filter: EventFilter,
        mut callback: F,
    ) -> Result<SubscriptionId, DispatchError>
    where
        F: FnMut(&EventEnvelope) -> Result<(), CallbackError> + Send + 'static,
    {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let (id, mut queue) = self.register(filter)?;
        let failures = Arc::clone(&self.failures);

        runtime.spawn(async move {
            while let Some(envelope) = queue.recv().await {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(&envelope)));
                let failure = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => err.to_string(),
                    Err(_) => "callback panicked".to_owned(),
                };
                failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    subscription = id,
                    channel = %envelope.channel,
                    kind = %envelope.kind(),
                    error = %failure,
                    "event subscriber failed"
                );
            }
        });

        Ok(id)
    }

    /// Register a pull-style subscriber.
    pub fn subscribe_stream(
        &self,
        filter: EventFilter,
    ) -> Result<(SubscriptionId, EventStream), DispatchError> {
        self.register(filter)
    }

    /// Remove a subscriber. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|subscriber| subscriber.id != id);
        state.subscribers.len() != before
    }

    /// Queue `envelope` for every matching subscriber. Returns how many
    /// subscribers it was queued for.
    pub fn dispatch(&self, envelope: &EventEnvelope) -> usize {
        let kind = envelope.kind();
        let mut state = self.lock();
        if state.closed {
            return 0;
        }

        let mut delivered = 0;
        state.subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(kind) {
                return true;
            }
            match subscriber.queue.send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Stream receiver dropped.
                Err(_) => false,
            }
        });
        delivered
    }

    /// Drop every subscriber and refuse new ones. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Number of callback invocations that returned an error or panicked.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn register(&self, filter: EventFilter) -> Result<(SubscriptionId, EventStream), DispatchError> {
        let mut state = self.lock();
        if state.closed {
            return Err(DispatchError::Closed);
        }
        state.next_id += 1;
        let id = state.next_id;
        let (queue, stream) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber { id, filter, queue });
        Ok((id, stream))
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        // Subscriber bookkeeping stays consistent even if a holder panicked.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
