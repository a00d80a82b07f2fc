use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use anyhow::{anyhow, Result};
use tracing::warn;

use super::{Blockable, Cancellable, Event, Verdict};
use crate::error::panic_message;

type ErasedHandler = dyn Fn(&mut dyn Any) -> Result<()> + Send + Sync;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    handler: Arc<ErasedHandler>,
}

/// Handlers for one event type. The list is replaced wholesale on every change so
/// a publisher only clones the `Arc` and never holds the lock while dispatching.
struct Channel {
    type_name: &'static str,
    handlers: Arc<[HandlerEntry]>,
}

#[derive(Default)]
struct BusInner {
    channels: RwLock<HashMap<TypeId, Channel>>,
    next_handler_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl BusInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TypeId, Channel>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TypeId, Channel>> {
        self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_handler(&self, type_id: TypeId, handler_id: u64) -> bool {
        let mut channels = self.write();
        let Some(channel) = channels.get_mut(&type_id) else {
            return false;
        };
        if !channel.handlers.iter().any(|entry| entry.id == handler_id) {
            return false;
        }
        let remaining: Vec<HandlerEntry> =
            channel.handlers.iter().filter(|entry| entry.id != handler_id).cloned().collect();
        if remaining.is_empty() {
            channels.remove(&type_id);
        } else {
            channel.handlers = remaining.into();
        }
        true
    }
}

/// Counters for one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Lifetime counters for a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Typed, thread-safe publish/subscribe dispatcher.
///
/// Cloning is cheap; clones share the same subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.inner.read();
        let mut map = f.debug_map();
        for channel in channels.values() {
            map.entry(&channel.type_name, &channel.handlers.len());
        }
        map.finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of type `T`. The registration lives until the
    /// returned [`Subscription`] is disposed or dropped.
    pub fn subscribe<T, F>(&self, handler: F) -> Subscription
    where
        T: Event,
        F: Fn(&mut T) -> Result<()> + Send + Sync + 'static,
    {
        let erased: Arc<ErasedHandler> = Arc::new(move |event: &mut dyn Any| {
            let event = event
                .downcast_mut::<T>()
                .ok_or_else(|| anyhow!("event routed to a handler for '{}'", type_name::<T>()))?;
            handler(event)
        });
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed) + 1;
        let type_id = TypeId::of::<T>();
        {
            let mut channels = self.inner.write();
            let channel = channels
                .entry(type_id)
                .or_insert_with(|| Channel { type_name: type_name::<T>(), handlers: Arc::from(Vec::new()) });
            let mut handlers = Vec::with_capacity(channel.handlers.len() + 1);
            handlers.extend(channel.handlers.iter().cloned());
            handlers.push(HandlerEntry { id, handler: erased });
            channel.handlers = handlers.into();
        }
        Subscription {
            bus: Arc::downgrade(&self.inner),
            type_id,
            handler_id: id,
            event_type: type_name::<T>(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Delivers `event` to every handler registered for `T`, in registration order.
    ///
    /// Handlers see the mutations of earlier handlers. A handler that returns an
    /// error or panics is logged and the remaining handlers still run.
    pub fn publish<T: Event>(&self, event: &mut T) -> DispatchReport {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let handlers = {
            let channels = self.inner.read();
            match channels.get(&TypeId::of::<T>()) {
                Some(channel) => Arc::clone(&channel.handlers),
                None => return DispatchReport::default(),
            }
        };

        let mut report = DispatchReport::default();
        for entry in handlers.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.handler)(&mut *event)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
            };
            match failure {
                None => report.delivered += 1,
                Some(message) => {
                    report.failed += 1;
                    warn!(
                        event = event.event_type(),
                        handler = entry.id,
                        error = %message,
                        "event handler failed; continuing dispatch"
                    );
                }
            }
        }
        self.inner.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.inner.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Publishes a cancellable event and reports whether any handler cancelled it.
    pub fn publish_cancellable<T: Cancellable>(&self, event: &mut T) -> Verdict {
        self.publish(event);
        event.cancellation().verdict()
    }

    /// Publishes a blockable event and reports whether any handler blocked it.
    pub fn publish_blockable<T: Blockable>(&self, event: &mut T) -> Verdict {
        self.publish(event);
        event.blocking().verdict()
    }

    pub fn subscriber_count<T: Event>(&self) -> usize {
        self.inner.read().get(&TypeId::of::<T>()).map_or(0, |channel| channel.handlers.len())
    }

    /// Total handlers across every event type.
    pub fn total_subscribers(&self) -> usize {
        self.inner.read().values().map(|channel| channel.handlers.len()).sum()
    }

    pub fn clear_subscriptions<T: Event>(&self) {
        self.inner.write().remove(&TypeId::of::<T>());
    }

    pub fn clear_all_subscriptions(&self) {
        self.inner.write().clear();
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

/// Handle to one handler registration on an [`EventBus`].
///
/// Disposing is idempotent: only the first call removes the handler. Dropping the
/// handle disposes it, so whoever holds the subscription owns the registration.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    type_id: TypeId,
    handler_id: u64,
    event_type: &'static str,
    disposed: AtomicBool,
}

impl Subscription {
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_handler(self.type_id, self.handler_id);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Keeps the handler registered for the lifetime of the bus.
    pub fn detach(self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("handler_id", &self.handler_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
