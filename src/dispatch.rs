use std::fmt;
use std::sync::Arc;

use log::trace;
use tokio::sync::mpsc;

/// A queued listener callback.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The delivery context for listener-visible callbacks.
///
/// Everything the engine reports through callbacks (operation completion,
/// observer value changes) is marshalled through a `DeliveryContext` rather
/// than invoked from whichever background task produced the result. An
/// embedding application with its own main loop can provide an
/// implementation that forwards onto that loop; submission order must be
/// preserved per submitter.
pub trait DeliveryContext: Send + Sync + fmt::Debug {
    fn post(&self, task: Task);
}

/// Cheap handle used throughout the engine to post callbacks onto the
/// configured [`DeliveryContext`].
#[derive(Clone, Debug)]
pub struct Dispatcher {
    context: Arc<dyn DeliveryContext>,
}

impl Dispatcher {
    pub(crate) fn new(context: Arc<dyn DeliveryContext>) -> Self {
        Self { context }
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.context.post(Box::new(task));
    }
}

/// Default delivery context: a dedicated tokio task draining an unbounded
/// queue, so callbacks run one at a time in submission order.
#[derive(Debug)]
pub struct TokioDelivery {
    queue: mpsc::UnboundedSender<Task>,
}

impl TokioDelivery {
    /// Spawns the draining task; must be called from within a tokio runtime.
    pub fn spawn() -> Arc<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            trace!("Delivery queue closed; exiting delivery task");
        });
        Arc::new(Self { queue })
    }
}

impl DeliveryContext for TokioDelivery {
    fn post(&self, task: Task) {
        // Failure means the session (and so the draining task) is gone and
        // there is nobody left to notify.
        let _ = self.queue.send(task);
    }
}
