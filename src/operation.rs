use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::error;
use tokio::sync::watch;

use crate::dispatch::Dispatcher;
use crate::{Error, Result};

/// Lifecycle of an [`Operation`]. `Success` and `Error` are terminal and
/// sticky.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    NotStarted,
    Running,
    Success,
    Error,
}

type Action<T> = Box<dyn FnOnce(Operation<T>) -> BoxFuture<'static, ()> + Send + 'static>;
type DoneCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// A single-use handle for one asynchronous action.
///
/// Every externally initiated action (connect, disconnect, scan start/stop,
/// read, write, notification config) is wrapped in an `Operation`:
/// [`start`][Self::start] dispatches the bound action onto the background
/// execution pool exactly once (later calls are no-ops) and completion is
/// reported exactly once, either through [`wait`][Self::wait] or through
/// callbacks registered with [`on_done`][Self::on_done], which run on the
/// session's delivery context.
///
/// The bound action receives the operation itself so it can call
/// [`succeed`][Self::succeed] or [`fail`][Self::fail]. Calling either after
/// a terminal state has been reached overwrites the stored result fields but
/// never re-emits completion; the emission is state-checked so even a buggy
/// producer can't signal twice.
pub struct Operation<T> {
    inner: Arc<OperationInner<T>>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for Operation<T> {
    fn eq(&self, other: &Operation<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl<T> Eq for Operation<T> {}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Read the lock directly; state() requires T: Send + 'static
        f.debug_struct("Operation")
            .field("state", &*self.inner.state.lock().unwrap())
            .finish()
    }
}

struct OperationInner<T> {
    state: StdMutex<OperationState>,
    action: StdMutex<Option<Action<T>>>,
    result: StdMutex<Option<T>>,
    error: StdMutex<Option<String>>,
    callbacks: StdMutex<Vec<DoneCallback>>,
    done: watch::Sender<bool>,
    dispatcher: Dispatcher,
}

impl<T: Send + 'static> Operation<T> {
    pub(crate) fn create<F, Fut>(dispatcher: Dispatcher, action: F) -> Self
        where F: FnOnce(Operation<T>) -> Fut + Send + 'static,
              Fut: Future<Output = ()> + Send + 'static
    {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(OperationInner {
                state: StdMutex::new(OperationState::NotStarted),
                action: StdMutex::new(Some(Box::new(move |op| action(op).boxed()))),
                result: StdMutex::new(None),
                error: StdMutex::new(None),
                callbacks: StdMutex::new(Vec::new()),
                done,
                dispatcher,
            }),
        }
    }

    /// Dispatches the bound action onto the background execution pool.
    ///
    /// Idempotent: only the first call moves the operation to `Running` and
    /// runs the action; calls while running or after completion do nothing.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != OperationState::NotStarted {
                return;
            }
            *state = OperationState::Running;
        }

        let action = self.inner.action.lock().unwrap().take();
        match action {
            Some(action) => {
                let op = self.clone();
                tokio::spawn(async move { action(op).await });
            }
            None => {
                // Unreachable via create(); the state check above means the
                // action can only be taken once.
                error!("Operation started with no bound action");
            }
        }
    }

    pub fn succeed(&self, value: T) {
        *self.inner.result.lock().unwrap() = Some(value);
        self.complete(OperationState::Success);
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Operation failed: {}", message);
        *self.inner.error.lock().unwrap() = Some(message);
        self.complete(OperationState::Error);
    }

    fn complete(&self, terminal: OperationState) {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                OperationState::Success | OperationState::Error => {
                    // Already completed; internal fields may have been
                    // overwritten but we never signal twice.
                    return;
                }
                _ => *state = terminal,
            }
        }

        // send_replace updates the value even while there are no waiters
        self.inner.done.send_replace(true);

        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock().unwrap());
        let success = terminal == OperationState::Success;
        for callback in callbacks {
            self.inner.dispatcher.post(move || callback(success));
        }
    }

    /// Registers a completion callback, run on the delivery context. If the
    /// operation already completed the callback is posted immediately.
    pub fn on_done(&self, callback: impl FnOnce(bool) + Send + 'static) {
        let state = *self.inner.state.lock().unwrap();
        match state {
            OperationState::Success => self.inner.dispatcher.post(move || callback(true)),
            OperationState::Error => self.inner.dispatcher.post(move || callback(false)),
            _ => self.inner
                     .callbacks
                     .lock()
                     .unwrap()
                     .push(Box::new(callback)),
        }
    }

    pub fn state(&self) -> OperationState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(),
                 OperationState::Success | OperationState::Error)
    }

    pub fn is_success(&self) -> bool {
        self.state() == OperationState::Success
    }

    /// The failure message, if the operation failed.
    pub fn error(&self) -> Option<String> {
        self.inner.error.lock().unwrap().clone()
    }
}

impl<T: Clone + Send + 'static> Operation<T> {
    /// The success value, if the operation succeeded.
    pub fn result(&self) -> Option<T> {
        match self.state() {
            OperationState::Success => self.inner.result.lock().unwrap().clone(),
            _ => None,
        }
    }

    /// Waits for the operation to complete and returns its outcome.
    ///
    /// This doesn't start the operation; callers typically
    /// `op.start(); op.wait().await`.
    pub async fn wait(&self) -> Result<T> {
        let mut done = self.inner.done.subscribe();
        // The sender lives in our own inner so this can't error while we
        // hold a reference.
        let _ = done.wait_for(|done| *done).await;

        if self.is_success() {
            self.inner
                .result
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::OperationFailed("missing result value".to_string()))
        } else {
            let message = self.error()
                              .unwrap_or_else(|| "unknown error".to_string());
            Err(Error::OperationFailed(message))
        }
    }
}
