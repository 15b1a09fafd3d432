use crate::{
    executor::{panic_message, Executor},
    state::Shared,
    waiter::{self, Settled},
    Error, PromiseState, Rejection,
};
use std::{
    fmt,
    future::IntoFuture,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// A handle to a value, or a rejection, that becomes available later.
///
/// Cloning a `Promise` yields another handle to the same node. Each chaining
/// call (`then`, `catch`, `finally`, ...) registers a continuation on this
/// node and returns a handle to a new downstream node. Continuations run
/// through the node's [`Executor`], never while a lock is held.
///
/// `T` is `Clone` because one node may feed any number of continuations,
/// each of which receives its own copy of the value. It is `Sync` because
/// the settled value is shared between the threads making those copies.
/// Unit-valued promises are simply `Promise<()>`.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Fulfills the promise it was created for. Handed to the task of
/// [`Promise::new`].
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

/// Rejects the promise it was created for. Handed to the task of
/// [`Promise::new`].
pub struct Rejecter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Clone for Rejecter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&self.shared).finish()
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resolver").field(&self.shared).finish()
    }
}

impl<T> fmt::Debug for Rejecter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejecter").field(&self.shared).finish()
    }
}

impl<T> Resolver<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Fulfills the promise with `value`.
    ///
    /// Fails with [`Error::AlreadySettled`] if the promise was already
    /// fulfilled or rejected; the earlier outcome is kept.
    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.shared.settle(Ok(value))
    }
}

impl<T> Rejecter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Rejects the promise with `reason`.
    ///
    /// Fails with [`Error::AlreadySettled`] if the promise was already
    /// fulfilled or rejected; the earlier outcome is kept.
    pub fn reject(&self, reason: impl Into<Rejection>) -> Result<(), Error> {
        self.shared.settle(Err(reason.into()))
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a promise settled by `task`, which is submitted to `executor`.
    ///
    /// The task must call exactly one of [`Resolver::resolve`] or
    /// [`Rejecter::reject`], once. Returning `Err` from the task, or
    /// panicking in it, rejects the promise with that reason. A task that
    /// never settles leaves the promise pending forever.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{executor::Inline, Promise, Rejection};
    /// use std::sync::Arc;
    ///
    /// let failed = Promise::<i32>::new(Arc::new(Inline), |_resolve, _reject| {
    ///     Err(Rejection::msg("boom"))
    /// });
    /// let recovered = failed.catch(|_| -1).then(|v| v);
    /// assert_eq!(futures::executor::block_on(recovered.settled()).unwrap(), -1);
    /// ```
    pub fn new<F>(executor: Arc<dyn Executor>, task: F) -> Self
    where
        F: FnOnce(Resolver<T>, Rejecter<T>) -> Result<(), Rejection> + Send + 'static,
    {
        let shared = Shared::pending(executor);
        let resolver = Resolver {
            shared: shared.clone(),
        };
        let rejecter = Rejecter {
            shared: shared.clone(),
        };
        shared.executor().submit(Box::new(move || {
            let fallback = rejecter.clone();
            if let Err(reason) = guarded(move || task(resolver, rejecter)) {
                // A failure after the task already settled is logged by settle.
                fallback.reject(reason).ok();
            }
        }));
        Self { shared }
    }

    /// A promise that is already fulfilled with `value`.
    pub fn resolve(value: T, executor: Arc<dyn Executor>) -> Self {
        Self::from_shared(Shared::settled(Ok(value), executor))
    }

    /// A promise that is already rejected with `reason`.
    pub fn reject(reason: impl Into<Rejection>, executor: Arc<dyn Executor>) -> Self {
        Self::from_shared(Shared::settled(Err(reason.into()), executor))
    }

    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    pub fn state(&self) -> PromiseState {
        self.shared.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// The executor continuations of this node are dispatched through.
    pub fn executor(&self) -> Arc<dyn Executor> {
        self.shared.executor().clone()
    }

    /// Registers both callbacks at once; whichever matches the outcome runs.
    ///
    /// A rejection handled by `on_rejected` becomes a fulfillment downstream.
    /// An `Err` returned by either callback rejects the downstream node.
    pub fn try_then_or<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, Rejection> + Send + 'static,
        R: FnOnce(Rejection) -> Result<U, Rejection> + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value),
            Err(reason) => on_rejected(reason),
        })
    }

    /// Infallible form of [`try_then_or`](Self::try_then_or).
    pub fn then_or<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        R: FnOnce(Rejection) -> U + Send + 'static,
    {
        self.try_then_or(
            move |value| Ok(on_fulfilled(value)),
            move |reason| Ok(on_rejected(reason)),
        )
    }

    /// Maps the fulfilled value; a rejection passes through unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{executor::Inline, Promise};
    /// use std::sync::Arc;
    ///
    /// let p = Promise::resolve(42, Arc::new(Inline))
    ///     .then(|v| v * 2)
    ///     .then(|v| v + 1);
    /// assert_eq!(futures::executor::block_on(p.settled()).unwrap(), 85);
    /// ```
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_then_or(move |value| Ok(on_fulfilled(value)), Err)
    }

    /// Like [`then`](Self::then), but the callback may fail.
    pub fn try_then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, Rejection> + Send + 'static,
    {
        self.try_then_or(on_fulfilled, Err)
    }

    /// Recovers from a rejection; a fulfilled value passes through unchanged.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Rejection) -> T + Send + 'static,
    {
        self.try_then_or(Ok, move |reason| Ok(on_rejected(reason)))
    }

    /// Like [`catch`](Self::catch), but the handler may reject again.
    pub fn try_catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Rejection) -> Result<T, Rejection> + Send + 'static,
    {
        self.try_then_or(Ok, on_rejected)
    }

    /// Runs `on_finally` once this node settles, either way, and passes the
    /// original outcome on untouched.
    ///
    /// Only a panic inside `on_finally` changes what flows downstream: it
    /// becomes a rejection, as with every other callback.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain(move |outcome| {
            on_finally();
            outcome
        })
    }

    /// Continues the chain on another executor.
    ///
    /// The returned node settles with this node's outcome, and everything
    /// chained onto it is dispatched through `executor` instead.
    pub fn via(&self, executor: Arc<dyn Executor>) -> Promise<T> {
        self.chain_on(executor, |outcome| outcome)
    }

    /// A future resolving to this node's outcome.
    pub fn settled(&self) -> Settled<T> {
        let (producer, settled) = waiter::pair();
        self.shared
            .enqueue_or_run(Box::new(move |outcome| producer.send(outcome)));
        settled
    }

    fn chain<U, F>(&self, reaction: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T, Rejection>) -> Result<U, Rejection> + Send + 'static,
    {
        self.chain_on(self.executor(), reaction)
    }

    fn chain_on<U, F>(&self, executor: Arc<dyn Executor>, reaction: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T, Rejection>) -> Result<U, Rejection> + Send + 'static,
    {
        let next = Shared::pending(executor);
        let target = next.clone();
        self.shared.enqueue_or_run(Box::new(move |outcome| {
            // Nothing else holds a resolver for `target`, so this cannot fail.
            target.settle(guarded(move || reaction(outcome))).ok();
        }));
        Promise::from_shared(next)
    }
}

impl<T> IntoFuture for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, Rejection>;
    type IntoFuture = Settled<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled()
    }
}

/// Runs a user callback, turning a panic into a rejection.
fn guarded<U>(callback: impl FnOnce() -> Result<U, Rejection>) -> Result<U, Rejection> {
    catch_unwind(AssertUnwindSafe(callback)).unwrap_or_else(|payload| {
        let message = panic_message(&*payload);
        log::debug!("promise callback panicked: {message}");
        Err(Rejection::from(Error::Panicked(message)))
    })
}

#[cfg(test)]
mod tests {
    use super::Promise;
    use crate::{
        executor::{Inline, ThreadPerTask},
        Error, PromiseState, Rejection, Work,
    };
    use futures::executor::block_on;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::channel,
        Arc, Barrier, Mutex,
    };
    use std::thread;

    #[test]
    fn test_concurrent_settlement_has_one_winner() {
        for _ in 0..20 {
            let (tx, rx) = channel();
            let promise = Promise::<usize>::new(Arc::new(Inline), move |resolve, reject| {
                tx.send((resolve, reject)).unwrap();
                Ok(())
            });
            let (resolve, reject) = rx.recv().unwrap();

            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let barrier = barrier.clone();
                    let resolve = resolve.clone();
                    let reject = reject.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 {
                            resolve.resolve(i)
                        } else {
                            reject.reject(Rejection::msg(i))
                        }
                    })
                })
                .collect();
            let results: Vec<_> = handles
                .into_iter()
                .map(|h| h.join().expect("The settling thread has panicked"))
                .collect();

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            let settled_as = promise.state();
            assert_ne!(settled_as, PromiseState::Pending);
            for result in results.into_iter().filter_map(Result::err) {
                assert_eq!(result, Error::AlreadySettled(settled_as));
            }
        }
    }

    #[test]
    fn test_resolve_after_reject_keeps_rejection() {
        let promise = Promise::<i32>::new(Arc::new(Inline), |resolve, reject| {
            reject.reject(Rejection::msg("first"))?;
            assert_eq!(
                resolve.resolve(1),
                Err(Error::AlreadySettled(PromiseState::Rejected))
            );
            Ok(())
        });
        let err = block_on(promise.settled()).unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn test_task_error_after_settling_is_ignored() {
        let promise = Promise::new(Arc::new(Inline), |resolve, _reject| {
            resolve.resolve(5)?;
            Err(Rejection::msg("too late"))
        });
        assert_eq!(block_on(promise.settled()).unwrap(), 5);
    }

    #[test]
    fn test_inline_then_runs_before_returning() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let next = Promise::resolve(1, Arc::new(Inline)).then(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            v
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(next.state(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_pending_then_waits_for_settlement() {
        let (tx, rx) = channel();
        let promise = Promise::<i32>::new(Arc::new(Inline), move |resolve, _reject| {
            tx.send(resolve).unwrap();
            Ok(())
        });
        let doubled = promise.then(|v| v * 2);
        assert!(promise.is_pending());
        assert!(doubled.is_pending());

        rx.recv().unwrap().resolve(21).unwrap();
        assert_eq!(doubled.state(), PromiseState::Fulfilled);
        assert_eq!(block_on(doubled.settled()).unwrap(), 42);
    }

    #[test]
    fn test_panicking_task_rejects() {
        let promise = Promise::<i32>::new(Arc::new(Inline), |_resolve, _reject| panic!("boom"));
        let err = block_on(promise.settled()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::Panicked("boom".into()))
        );
    }

    #[test]
    fn test_panicking_callback_rejects_downstream() {
        let promise = Promise::resolve(1, Arc::new(Inline))
            .then(|v: i32| -> i32 { panic!("bad {v}") })
            .then(|v| v + 1);
        assert_eq!(promise.state(), PromiseState::Rejected);
        let err = block_on(promise.settled()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::Panicked("bad 1".into()))
        );
    }

    #[test]
    fn test_try_then_error_rejects_downstream() {
        let promise = Promise::resolve("forty-two", Arc::new(Inline))
            .try_then(|s| Ok(s.parse::<i32>()?))
            .then(|v| v + 1);
        let err = block_on(promise.settled()).unwrap_err();
        assert!(err.is::<std::num::ParseIntError>());
    }

    #[test]
    fn test_try_catch_can_reject_again() {
        let promise = Promise::<i32>::reject(Rejection::msg("first"), Arc::new(Inline))
            .try_catch(|reason| Err(Rejection::msg(format!("{reason}, then second"))));
        let err = block_on(promise.settled()).unwrap_err();
        assert_eq!(err.to_string(), "first, then second");
    }

    #[test]
    fn test_then_or_picks_the_matching_branch() {
        let exec = Arc::new(Inline);
        let ok = Promise::resolve(2, exec.clone()).then_or(|v| v * 10, |_| -1);
        let err = Promise::<i32>::reject(Rejection::msg("nope"), exec).then_or(|v| v * 10, |_| -1);
        assert_eq!(block_on(ok.settled()).unwrap(), 20);
        assert_eq!(block_on(err.settled()).unwrap(), -1);
    }

    #[test]
    fn test_fan_out_from_one_node() {
        let source = Promise::resolve(String::from("🍓"), Arc::new(Inline));
        let a = source.then(|s| s.len());
        let b = source.then(|s| format!("{s}{s}"));
        assert_eq!(block_on(a.settled()).unwrap(), "🍓".len());
        assert_eq!(block_on(b.settled()).unwrap(), "🍓🍓");
    }

    #[test]
    fn test_via_rebinds_executor() {
        let submitted = Arc::new(Mutex::new(0));
        let count = submitted.clone();
        let counting = Arc::new(move |work: Work| {
            *count.lock().unwrap() += 1;
            work()
        });
        let promise = Promise::resolve(1, Arc::new(Inline))
            .via(counting)
            .then(|v| v + 1)
            .then(|v| v + 1);
        assert_eq!(block_on(promise.settled()).unwrap(), 3);
        // Two thens plus the settled() waiter ran on the rebound executor.
        assert_eq!(*submitted.lock().unwrap(), 3);
    }

    #[test]
    fn test_dropped_work_abandons_waiter() {
        let discard = Arc::new(|work: Work| drop(work));
        let promise = Promise::resolve(1, discard);
        let err = block_on(promise.settled()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::ProducerDropped));
    }

    #[test]
    fn test_into_future_on_thread_executor() {
        let promise = Promise::new(Arc::new(ThreadPerTask::new()), |resolve, _reject| {
            resolve.resolve(7)?;
            Ok(())
        })
        .then(|v| v * 6);
        assert_eq!(block_on(async move { promise.await }).unwrap(), 42);
    }

    #[derive(Debug)]
    struct Bomb;

    impl Clone for Bomb {
        fn clone(&self) -> Self {
            panic!("clone exploded")
        }
    }

    fn panicked(message: &str) -> Option<Error> {
        Some(Error::Panicked(message.into()))
    }

    #[test]
    fn test_panicking_clone_spares_sibling_continuations() {
        let (tx, rx) = channel();
        let source = Promise::<i32>::new(Arc::new(Inline), move |resolve, _reject| {
            tx.send(resolve).unwrap();
            Ok(())
        });
        let bomb = source.then(|_| Bomb);
        let after_bomb = bomb.then(|_| 1);
        let sibling = source.then(|v| v + 1);

        assert_eq!(rx.recv().unwrap().resolve(1), Ok(()));
        assert_eq!(source.state(), PromiseState::Fulfilled);
        assert_eq!(bomb.state(), PromiseState::Fulfilled);
        assert_eq!(block_on(sibling.settled()).unwrap(), 2);

        let err = block_on(after_bomb.settled()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), panicked("clone exploded").as_ref());
        let late = bomb.then(|_| 2);
        assert_eq!(late.state(), PromiseState::Rejected);
    }

    #[test]
    fn test_panicking_finally_rejects_downstream() {
        let fulfilled = Promise::resolve(1, Arc::new(Inline)).finally(|| panic!("finally failed"));
        let err = block_on(fulfilled.settled()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), panicked("finally failed").as_ref());

        let rejected = Promise::<i32>::reject(Rejection::msg("first"), Arc::new(Inline))
            .finally(|| panic!("finally failed"));
        let err = block_on(rejected.settled()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), panicked("finally failed").as_ref());
    }

    #[test]
    fn test_panicking_rejection_handler_rejects_downstream() {
        let promise = Promise::<i32>::reject(Rejection::msg("first"), Arc::new(Inline))
            .then_or(|v| v, |_| -> i32 { panic!("handler failed") })
            .then(|v| v + 1);
        assert_eq!(promise.state(), PromiseState::Rejected);
        let err = block_on(promise.settled()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), panicked("handler failed").as_ref());
    }

    #[test]
    fn test_long_inline_chain_settles_and_drops() {
        let (tx, rx) = channel();
        let head = Promise::<u32>::new(Arc::new(Inline), move |resolve, _reject| {
            tx.send(resolve).unwrap();
            Ok(())
        });
        let mut tail = head.clone();
        for _ in 0..200 {
            tail = tail.then(|v| v + 1);
        }
        rx.recv().unwrap().resolve(0).unwrap();
        assert_eq!(block_on(tail.settled()).unwrap(), 200);

        // An unsettled chain of the same depth drops cleanly too.
        let pending = Promise::<u32>::new(Arc::new(Inline), |_resolve, _reject| Ok(()));
        let mut tail = pending.clone();
        for _ in 0..200 {
            tail = tail.then(|v| v + 1);
        }
        drop(pending);
        drop(tail);
    }
}
