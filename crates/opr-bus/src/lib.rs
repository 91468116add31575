//! A small in-process pub/sub bus used to notify interested parties (HTTP
//! long-poll handlers, producer loops, logging sinks) about offer changes
//! without coupling the orchestrator to any particular transport, per
//! spec.md §4.9's change-notification requirement.
//!
//! Generic over the event type so `opr-bus` carries no business logic;
//! `opr-model` instantiates `ChangeBus<OfferChange>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

type HandlerFn<T> =
    Arc<dyn Fn(&T) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// A fan-out notification bus. Cloning shares the same handler registry.
pub struct ChangeBus<T> {
    handlers: Arc<Mutex<HashMap<u64, HandlerFn<T>>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for ChangeBus<T> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for ChangeBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> ChangeBus<T> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers a handler, returning a [`ChangeHandle`] that unregisters it
    /// when removed. Handlers are never run concurrently with each other for
    /// the same event, but a slow handler delays delivery to the rest — keep
    /// handlers cheap or have them hand off internally.
    pub async fn register<F, Fut>(&self, handler: F) -> ChangeHandle<T>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let boxed: HandlerFn<T> = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers.lock().await.insert(id, boxed);
        ChangeHandle {
            bus: self.clone(),
            id,
        }
    }

    /// Runs every registered handler against `event`. Handler errors are
    /// logged and otherwise ignored; one failing handler never blocks
    /// delivery to the rest.
    pub async fn fire(&self, event: &T) {
        let handlers: Vec<HandlerFn<T>> = self.handlers.lock().await.values().cloned().collect();
        for handler in handlers {
            if let Err(err) = handler(event).await {
                tracing::warn!(error = %err, "change handler failed");
            }
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.lock().await.len()
    }
}

/// A registration returned by [`ChangeBus::register`]. Dropping this without
/// calling [`Self::remove`] leaves the handler registered indefinitely.
pub struct ChangeHandle<T> {
    bus: ChangeBus<T>,
    id: u64,
}

impl<T: Send + Sync + 'static> ChangeHandle<T> {
    pub async fn remove(self) {
        self.bus.handlers.lock().await.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fires_registered_handlers() {
        let bus: ChangeBus<i32> = ChangeBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let _handle = bus
            .register(move |event: &i32| {
                let count = count2.clone();
                let event = *event;
                async move {
                    count.fetch_add(event as usize, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        bus.fire(&3).await;
        bus.fire(&4).await;
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn remove_stops_delivery() {
        let bus: ChangeBus<i32> = ChangeBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handle = bus
            .register(move |_: &i32| {
                let count = count2.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        bus.fire(&1).await;
        handle.remove().await;
        bus.fire(&1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count().await, 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus: ChangeBus<i32> = ChangeBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.register(|_: &i32| async { anyhow::bail!("boom") }).await;
        let count2 = count.clone();
        bus.register(move |_: &i32| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.fire(&1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
