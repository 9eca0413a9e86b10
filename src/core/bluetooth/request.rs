//! Generic request abstraction
//! Every native operation issued by the central (connect, disconnect, RSSI and
//! characteristic requests) is wrapped into a [`Request`]: a timeout-bounded,
//! single-resolution operation that callers poll from their own scheduling
//! tick or simply `.await`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::core::bluetooth::error::RequestError;
use crate::core::bluetooth::queue::QueueHandle;
use crate::core::bluetooth::transport::{StatusCallback, ValueCallback};
use crate::core::bluetooth::types::{RequestOperation, RequestStatus};

/// Run once when a request times out
pub(crate) type CancelHook = Box<dyn FnOnce() + Send>;

/// What a caller observes when polling a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState<V> {
    Pending,
    Succeeded(V),
    Failed(RequestStatus),
    TimedOut,
}

impl<V> RequestState<V> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

enum Outcome<V> {
    Succeeded(V),
    Failed(RequestStatus),
    TimedOut,
}

struct Slot<V> {
    outcome: Option<Outcome<V>>,
    deadline: Option<Instant>,
    on_timeout: Option<CancelHook>,
    waker: Option<Waker>,
}

struct Shared<V> {
    operation: RequestOperation,
    timeout: Duration,
    slot: Mutex<Slot<V>>,
}

impl<V> Shared<V> {
    fn lock(&self) -> MutexGuard<'_, Slot<V>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First resolution wins, later ones are dropped
    fn settle(&self, outcome: Outcome<V>) -> bool {
        let waker = {
            let mut slot = self.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome);
            slot.on_timeout = None;
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn expire_if_due(&self, now: Instant) -> bool {
        let (hook, waker) = {
            let mut slot = self.lock();
            match slot.deadline {
                Some(deadline) if slot.outcome.is_none() && now >= deadline => {
                    slot.outcome = Some(Outcome::TimedOut);
                    (slot.on_timeout.take(), slot.waker.take())
                }
                _ => return false,
            }
        };
        warn!("[BLE] {} timed out after {:?}", self.operation, self.timeout);
        if let Some(hook) = hook {
            hook();
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

/// Type-erased view used by the central to sweep request deadlines
pub(crate) trait Deadline: Send + Sync {
    /// Times the request out if its deadline passed, returns true when settled
    fn sweep(&self, now: Instant) -> bool;
}

impl<V: Send> Deadline for Shared<V> {
    fn sweep(&self, now: Instant) -> bool {
        self.expire_if_due(now);
        self.lock().outcome.is_some()
    }
}

/// A pending or terminated asynchronous operation
pub struct Request<V = ()> {
    shared: Arc<Shared<V>>,
}

impl<V: Send + 'static> Request<V> {
    /// Creates a pending request, a zero `timeout` never expires
    pub(crate) fn new(operation: RequestOperation, timeout: Duration) -> (Self, Completion<V>) {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let shared = Arc::new(Shared {
            operation,
            timeout,
            slot: Mutex::new(Slot {
                outcome: None,
                deadline,
                on_timeout: None,
                waker: None,
            }),
        });
        let completion = Completion {
            shared: shared.clone(),
        };
        (Self { shared }, completion)
    }

    /// Creates a request that already failed with `status`
    pub(crate) fn failed(operation: RequestOperation, status: RequestStatus) -> Self {
        let (request, completion) = Self::new(operation, Duration::ZERO);
        completion.settle(Err(status));
        request
    }

    /// Installs the hook run exactly once if the request times out
    pub(crate) fn on_timeout(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.shared.lock();
        if slot.outcome.is_none() {
            slot.on_timeout = Some(Box::new(hook));
        }
    }

    /// Deadline view for the central sweep, `None` if the request cannot expire
    pub(crate) fn deadline(&self) -> Option<Arc<dyn Deadline>> {
        let has_deadline = {
            let slot = self.shared.lock();
            slot.deadline.is_some() && slot.outcome.is_none()
        };
        has_deadline.then(|| self.shared.clone() as Arc<dyn Deadline>)
    }
}

impl<V> Request<V> {
    pub fn operation(&self) -> RequestOperation {
        self.shared.operation
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// True once the request reached a terminal state
    pub fn is_done(&self) -> bool {
        self.shared.expire_if_due(Instant::now());
        self.shared.lock().outcome.is_some()
    }

    /// Returns the current state without blocking, timing the request out if due
    pub fn poll_state(&self) -> RequestState<V>
    where
        V: Clone,
    {
        self.shared.expire_if_due(Instant::now());
        match &self.shared.lock().outcome {
            None => RequestState::Pending,
            Some(Outcome::Succeeded(value)) => RequestState::Succeeded(value.clone()),
            Some(Outcome::Failed(status)) => RequestState::Failed(*status),
            Some(Outcome::TimedOut) => RequestState::TimedOut,
        }
    }
}

/// Awaiting leaves the outcome in place, so `poll_state` still reports it afterwards
impl<V: Clone> Future for Request<V> {
    type Output = Result<V, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let shared = &self.shared;
        shared.expire_if_due(Instant::now());
        let operation = shared.operation;
        let mut slot = shared.lock();
        match &slot.outcome {
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Some(Outcome::Succeeded(value)) => Poll::Ready(Ok(value.clone())),
            Some(Outcome::Failed(status)) => Poll::Ready(Err(RequestError::Failed {
                operation,
                status: *status,
            })),
            Some(Outcome::TimedOut) => Poll::Ready(Err(RequestError::TimedOut { operation })),
        }
    }
}

/// Resolving side of a [`Request`]
pub(crate) struct Completion<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Completion<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V: Send + 'static> Completion<V> {
    /// False once settled or past the deadline
    pub(crate) fn is_pending(&self) -> bool {
        self.shared.expire_if_due(Instant::now());
        self.shared.lock().outcome.is_none()
    }

    /// Resolves the request unless it already terminated
    pub(crate) fn settle(&self, result: Result<V, RequestStatus>) -> bool {
        let outcome = match result {
            Ok(value) => Outcome::Succeeded(value),
            Err(RequestStatus::Timeout) => Outcome::TimedOut,
            Err(RequestStatus::Success) => Outcome::Failed(RequestStatus::Error),
            Err(status) => Outcome::Failed(status),
        };
        let settled = self.shared.settle(outcome);
        if !settled {
            debug!("[BLE] Discarding late result of {}", self.shared.operation);
        }
        settled
    }

    /// Native callback that settles the request from the designated thread
    pub(crate) fn value_callback<C: 'static>(self, queue: &QueueHandle<C>) -> ValueCallback<V> {
        let queue = queue.clone();
        Box::new(move |result| {
            queue.post(move |_: &mut C| {
                self.settle(result);
            });
        })
    }
}

impl Completion<()> {
    pub(crate) fn settle_status(&self, status: RequestStatus) -> bool {
        self.settle(match status {
            RequestStatus::Success => Ok(()),
            status => Err(status),
        })
    }

    /// Native callback that settles a value-less request from the designated thread
    pub(crate) fn status_callback<C: 'static>(self, queue: &QueueHandle<C>) -> StatusCallback {
        let queue = queue.clone();
        Box::new(move |status| {
            queue.post(move |_: &mut C| {
                self.settle_status(status);
            });
        })
    }
}
