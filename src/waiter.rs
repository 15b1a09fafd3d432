//! Bridges a promise's outcome into a [`Future`] with a one-shot
//! producer/consumer pair. The producer rides inside a continuation; the
//! consumer is what callers `.await`.
use crate::{Error, Rejection};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

pub(crate) struct Producer<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

/// A future that completes with a promise's outcome.
///
/// Obtained from [`Promise::settled`](crate::Promise::settled) or by
/// awaiting a [`Promise`](crate::Promise) directly. Polling never blocks and
/// never drives the promise; the chain's executor does that.
///
/// # Examples
///
/// ```
/// use promise_chain::{executor::ThreadPerTask, Promise};
/// use futures::executor::block_on;
/// use std::sync::Arc;
///
/// let p = Promise::new(Arc::new(ThreadPerTask::new()), |resolve, _reject| {
///     resolve.resolve(String::from("🍓"))?;
///     Ok(())
/// });
/// assert_eq!(block_on(async move { p.await }).unwrap(), "🍓");
/// ```
#[derive(Debug)]
pub struct Settled<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

#[derive(Debug)]
struct Inner<T> {
    value: Option<Result<T, Rejection>>,
    waker: Result<Waker, WakerState>,
}

pub(crate) fn pair<T>() -> (Producer<T>, Settled<T>) {
    let inner = Arc::new(Mutex::new(Inner {
        value: None,
        waker: Err(WakerState::Fresh),
    }));
    (
        Producer {
            inner: inner.clone(),
        },
        Settled { inner },
    )
}

impl<T> Producer<T> {
    pub(crate) fn send(self, outcome: Result<T, Rejection>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.value = Some(outcome);
        if let Ok(waker) = std::mem::replace(&mut inner.waker, Err(WakerState::Tainted)) {
            waker.wake()
        }
    }
}

impl<T> Drop for Producer<T> {
    /// If this is an unsent producer, wake with error.
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(waker) = std::mem::replace(&mut inner.waker, Err(WakerState::Tainted)) {
            waker.wake()
        }
    }
}

impl<T> Future for Settled<T> {
    type Output = Result<T, Rejection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.value.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => match std::mem::replace(&mut inner.waker, Ok(cx.waker().clone())) {
                Err(WakerState::Tainted) => {
                    Poll::Ready(Err(Rejection::from(Error::ProducerDropped)))
                }
                _ => Poll::Pending,
            },
        }
    }
}
