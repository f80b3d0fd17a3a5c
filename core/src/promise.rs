//! Pluggable bridge between the dispatcher's deferreds and the future type
//! handed to callers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{CourierError, Result};

/// Message carried by every request timeout.
pub const TIMEOUT_MESSAGE: &str = "Timeout limit exceeded for request.";

pub const MISSING_CREATE_DEFERRED: &str = "You need to provide an implementation for postal.configuration.promise.createDeferred that returns a deferred/promise instance.";

pub const MISSING_GET_PROMISE: &str = "You need to provide an implementation for postal.configuration.promise.getPromise that returns a promise safe for consuming APIs to use.";

/// No reply arrived within the request's timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Timeout limit exceeded for request.")]
pub struct TimeoutError {
    pub request_id: String,
}

/// Reason a deferred was rejected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Rejection {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// Exactly the value the responder replied with
    #[error("Responder replied with error: {0}")]
    Application(Value),

    #[error("Deferred dropped before it was settled")]
    Dropped,
}

impl Rejection {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Rejection::Timeout(_))
    }

    /// The responder's error value, if this is an application rejection.
    pub fn application_value(&self) -> Option<&Value> {
        match self {
            Rejection::Application(v) => Some(v),
            _ => None,
        }
    }
}

/// A handle that can be settled at most once.
pub trait Deferred: Send + 'static {
    fn resolve(&self, data: Value);
    fn reject(&self, reason: Rejection);
}

type Settlement = std::result::Result<Value, Rejection>;

/// Resolves once the caller has dropped its future unsettled.
pub type Abandoned = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Deferred backed by a tokio oneshot channel.
pub struct OneshotDeferred {
    tx: Mutex<Option<oneshot::Sender<Settlement>>>,
    rx: Option<oneshot::Receiver<Settlement>>,
    // Closes when the detached ReplyFuture is dropped
    watch: Option<oneshot::Receiver<()>>,
}

impl OneshotDeferred {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Some(rx),
            watch: None,
        }
    }

    /// Detaches the caller-facing future. Later calls yield a future that
    /// rejects with [`Rejection::Dropped`].
    pub fn promise(&mut self) -> ReplyFuture {
        let Some(rx) = self.rx.take() else {
            return ReplyFuture {
                rx: None,
                _guard: None,
            };
        };
        let (guard, watch) = oneshot::channel();
        self.watch = Some(watch);
        ReplyFuture {
            rx: Some(rx),
            _guard: Some(guard),
        }
    }

    /// Signal firing when the detached future is dropped. `None` before
    /// [`promise`](Self::promise) or once taken.
    pub fn abandoned(&mut self) -> Option<Abandoned> {
        let watch = self.watch.take()?;
        Some(Box::pin(async move {
            // Nothing is ever sent; only the guard's drop completes this
            let _ = watch.await;
        }))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    fn settle(&self, outcome: Settlement) {
        let sender = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            // The caller may have dropped its future; nothing to report then
            let _ = tx.send(outcome);
        }
    }
}

impl Default for OneshotDeferred {
    fn default() -> Self {
        Self::new()
    }
}

impl Deferred for OneshotDeferred {
    fn resolve(&self, data: Value) {
        self.settle(Ok(data));
    }

    fn reject(&self, reason: Rejection) {
        self.settle(Err(reason));
    }
}

/// Caller-facing future of a [`OneshotDeferred`].
#[derive(Debug)]
pub struct ReplyFuture {
    rx: Option<oneshot::Receiver<Settlement>>,
    _guard: Option<oneshot::Sender<()>>,
}

impl Future for ReplyFuture {
    type Output = std::result::Result<Value, Rejection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(Rejection::Dropped));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                this.rx = None;
                Poll::Ready(res.unwrap_or(Err(Rejection::Dropped)))
            }
        }
    }
}

type CreateFn<D> = Arc<dyn Fn() -> D + Send + Sync>;
type PromiseFn<D, F> = Arc<dyn Fn(&mut D) -> F + Send + Sync>;
type FulfillFn<D> = Arc<dyn Fn(&D, Value) + Send + Sync>;
type FailFn<D> = Arc<dyn Fn(&D, Rejection) + Send + Sync>;
type AbandonFn<D> = Arc<dyn Fn(&mut D) -> Option<Abandoned> + Send + Sync>;

/// Promise adapter configuration injected into a dispatcher.
///
/// * `create_deferred` - produces a fresh deferred per request
/// * `get_promise` - turns the deferred into the future returned to callers
/// * `fulfill` / `fail` - the two settlement operations on a deferred;
///   they default to [`Deferred::resolve`] and [`Deferred::reject`]
/// * `abandoned` - optional; lets the dispatcher release a request whose
///   caller dropped the future before it settled
///
/// Both factories must be set before a request is issued, otherwise the
/// request fails with [`CourierError::Configuration`].
///
/// # Examples
///
/// ```
/// use courier_core::{OneshotDeferred, PromiseConfig, ReplyFuture};
///
/// let config: PromiseConfig<OneshotDeferred, ReplyFuture> = PromiseConfig::unconfigured()
///     .create_deferred(OneshotDeferred::new)
///     .get_promise(|d: &mut OneshotDeferred| d.promise());
/// assert!(config.is_configured());
/// ```
pub struct PromiseConfig<D, F> {
    create_deferred: Option<CreateFn<D>>,
    get_promise: Option<PromiseFn<D, F>>,
    fulfill: FulfillFn<D>,
    fail: FailFn<D>,
    abandoned: Option<AbandonFn<D>>,
}

impl<D: Deferred, F> PromiseConfig<D, F> {
    /// Settlement defaults to `resolve`/`reject`; both factories unset.
    pub fn unconfigured() -> Self {
        Self::with_verbs(|d: &D, data| d.resolve(data), |d: &D, reason| d.reject(reason))
    }
}

impl<D, F> PromiseConfig<D, F> {
    /// Unconfigured adapter for deferreds with differently-named settlement
    /// operations.
    pub fn with_verbs(
        fulfill: impl Fn(&D, Value) + Send + Sync + 'static,
        fail: impl Fn(&D, Rejection) + Send + Sync + 'static,
    ) -> Self {
        Self {
            create_deferred: None,
            get_promise: None,
            fulfill: Arc::new(fulfill),
            fail: Arc::new(fail),
            abandoned: None,
        }
    }

    pub fn create_deferred(mut self, f: impl Fn() -> D + Send + Sync + 'static) -> Self {
        self.create_deferred = Some(Arc::new(f));
        self
    }

    pub fn get_promise(mut self, f: impl Fn(&mut D) -> F + Send + Sync + 'static) -> Self {
        self.get_promise = Some(Arc::new(f));
        self
    }

    pub fn abandoned(
        mut self,
        f: impl Fn(&mut D) -> Option<Abandoned> + Send + Sync + 'static,
    ) -> Self {
        self.abandoned = Some(Arc::new(f));
        self
    }

    pub fn is_configured(&self) -> bool {
        self.create_deferred.is_some() && self.get_promise.is_some()
    }

    /// Creates a deferred and its caller-facing future.
    ///
    /// Fails without side effects when either factory is missing.
    pub(crate) fn make(&self) -> Result<(D, F)> {
        let create = self
            .create_deferred
            .as_ref()
            .ok_or_else(|| CourierError::Configuration(MISSING_CREATE_DEFERRED.into()))?;
        let promise = self
            .get_promise
            .as_ref()
            .ok_or_else(|| CourierError::Configuration(MISSING_GET_PROMISE.into()))?;
        let mut deferred = create();
        let future = promise(&mut deferred);
        Ok((deferred, future))
    }

    /// Checks both factories without creating anything.
    pub(crate) fn ensure_configured(&self) -> Result<()> {
        if self.create_deferred.is_none() {
            return Err(CourierError::Configuration(MISSING_CREATE_DEFERRED.into()));
        }
        if self.get_promise.is_none() {
            return Err(CourierError::Configuration(MISSING_GET_PROMISE.into()));
        }
        Ok(())
    }

    pub(crate) fn fulfill(&self, deferred: &D, data: Value) {
        (self.fulfill)(deferred, data)
    }

    pub(crate) fn fail(&self, deferred: &D, reason: Rejection) {
        (self.fail)(deferred, reason)
    }

    pub(crate) fn watch_abandoned(&self, deferred: &mut D) -> Option<Abandoned> {
        self.abandoned.as_ref().and_then(|f| f(deferred))
    }
}

impl PromiseConfig<OneshotDeferred, ReplyFuture> {
    /// Built-in adapter yielding [`ReplyFuture`]s.
    pub fn tokio() -> Self {
        Self::unconfigured()
            .create_deferred(OneshotDeferred::new)
            .get_promise(OneshotDeferred::promise)
            .abandoned(OneshotDeferred::abandoned)
    }
}

impl<D, F> Clone for PromiseConfig<D, F> {
    fn clone(&self) -> Self {
        Self {
            create_deferred: self.create_deferred.clone(),
            get_promise: self.get_promise.clone(),
            fulfill: Arc::clone(&self.fulfill),
            fail: Arc::clone(&self.fail),
            abandoned: self.abandoned.clone(),
        }
    }
}

impl<D, F> fmt::Debug for PromiseConfig<D, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseConfig")
            .field("create_deferred", &self.create_deferred.is_some())
            .field("get_promise", &self.get_promise.is_some())
            .field("abandoned", &self.abandoned.is_some())
            .finish()
    }
}
