use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::dispatch::Dispatcher;
use crate::handle::DescriptorHandle;

/// Receives value-change notifications for one structural handle.
///
/// An `Observer` fires whenever the target characteristic or descriptor
/// value updates, whether from a completed read or from a
/// peripheral-initiated notify/indicate. It's valid for the lifetime of the
/// owning device, including across reconnects.
///
/// If a reconnect produces a different GATT profile the handle an observer
/// is keyed on may stop resolving; the observer is kept but silently stops
/// receiving updates. There is deliberately no invalidation signal.
#[derive(Clone, Debug)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

type ValueCallback = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

struct ObserverInner {
    value_bus: broadcast::Sender<Vec<u8>>,
    callbacks: StdMutex<Vec<ValueCallback>>,
}

impl std::fmt::Debug for ObserverInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverInner")
            .field("callbacks", &self.callbacks.lock().unwrap().len())
            .finish()
    }
}

impl Observer {
    fn new() -> Self {
        let (value_bus, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(ObserverInner {
                value_bus,
                callbacks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// A stream of values as they change. Values delivered while nobody is
    /// polling fast enough may be dropped (lagging receivers skip ahead);
    /// there is no buffering for unobserved periods.
    pub fn values(&self) -> impl Stream<Item = Vec<u8>> {
        let receiver = self.inner.value_bus.subscribe();
        BroadcastStream::new(receiver).filter_map(|item| async move { item.ok() })
    }

    /// Registers a callback run on the delivery context for every value
    /// change.
    pub fn on_value_changed(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .push(Arc::new(callback));
    }

    pub(crate) fn notify(&self, dispatcher: &Dispatcher, value: Vec<u8>) {
        let _ = self.inner.value_bus.send(value.clone());

        let callbacks = self.inner.callbacks.lock().unwrap().clone();
        if !callbacks.is_empty() {
            dispatcher.post(move || {
                for callback in &callbacks {
                    callback(&value);
                }
            });
        }
    }
}

/// Per-device registry of observers, keyed by [`DescriptorHandle`]
/// (including the synthetic form addressing a characteristic's own value).
///
/// Registrations persist across cache rebuilds and reconnects. The delivery
/// path only ever looks entries up; if nothing is registered for a handle
/// at delivery time the update is dropped rather than allocating machinery
/// for an unobserved handle.
#[derive(Debug)]
pub(crate) struct ObserverRegistry {
    observers: DashMap<DescriptorHandle, Observer>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self {
            observers: DashMap::new(),
        }
    }

    pub(crate) fn get_or_create(&self, handle: &DescriptorHandle) -> Observer {
        // entry() makes the lookup-or-insert atomic; two racing first
        // subscriptions for the same handle must share one observer
        self.observers
            .entry(handle.clone())
            .or_insert_with(Observer::new)
            .clone()
    }

    pub(crate) fn lookup(&self, handle: &DescriptorHandle) -> Option<Observer> {
        self.observers.get(handle).map(|observer| observer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TokioDelivery;
    use crate::uuid::uuid_from_u16;
    use crate::ServiceHandle;
    use tokio::sync::mpsc;

    fn value_handle() -> DescriptorHandle {
        ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0)
            .value_handle()
    }

    #[tokio::test]
    async fn get_or_create_reuses_the_observer() {
        let registry = ObserverRegistry::new();
        let handle = value_handle();

        assert!(registry.lookup(&handle).is_none());
        let a = registry.get_or_create(&handle);
        let b = registry.get_or_create(&handle);
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(registry.lookup(&handle).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn racing_subscriptions_share_one_observer() {
        let registry = Arc::new(ObserverRegistry::new());
        let handle = value_handle();

        let tasks: Vec<_> = (0..16).map(|_| {
                                       let registry = registry.clone();
                                       let handle = handle.clone();
                                       tokio::spawn(async move {
                                           registry.get_or_create(&handle)
                                       })
                                   })
                                   .collect();

        let first = registry.get_or_create(&handle);
        for task in tasks {
            let observer = task.await.unwrap();
            assert!(Arc::ptr_eq(&first.inner, &observer.inner));
        }
    }

    #[tokio::test]
    async fn callbacks_and_streams_both_deliver() {
        let dispatcher = Dispatcher::new(TokioDelivery::spawn());
        let registry = ObserverRegistry::new();
        let handle = value_handle();

        let observer = registry.get_or_create(&handle);
        let mut values = Box::pin(observer.values());

        let (tx, mut rx) = mpsc::unbounded_channel();
        observer.on_value_changed(move |value| {
            let _ = tx.send(value.to_vec());
        });

        registry.lookup(&handle)
                .unwrap()
                .notify(&dispatcher, vec![0x2a]);

        assert_eq!(values.next().await, Some(vec![0x2a]));
        assert_eq!(rx.recv().await, Some(vec![0x2a]));
    }

    #[tokio::test]
    async fn unobserved_handles_are_dropped_silently() {
        let registry = ObserverRegistry::new();
        // Delivery path only does a lookup; nothing registered, nothing
        // allocated, nothing delivered.
        assert!(registry.lookup(&value_handle()).is_none());
    }
}
