//! The scheduling capability a promise chain runs its continuations on.
//!
//! The engine only ever calls [`Executor::submit`]; it assumes nothing about
//! when or on which thread the work runs, only that each submission runs
//! exactly once. Three reference executors are provided, and any
//! `Fn(Work)` closure is an executor too.
use crossbeam_channel::{unbounded, Sender};
use std::{
    any::Any,
    io,
    num::NonZeroUsize,
    panic::{catch_unwind, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

/// A unit of work handed to an executor.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync + 'static {
    /// Run `work` exactly once, eventually. Must not block indefinitely.
    fn submit(&self, work: Work);
}

impl<F> Executor for F
where
    F: Fn(Work) + Send + Sync + 'static,
{
    fn submit(&self, work: Work) {
        self(work)
    }
}

/// Runs work immediately on the submitting thread.
///
/// Settling a node dispatches its continuations on the same stack, and each
/// of those settles the next node, so settling a pending chain recurses once
/// per node. Dropping a long unsettled chain recurses the same way, whatever
/// the executor, because each pending node owns the next one through its
/// queued continuation. Chains many thousands of nodes deep can overflow the
/// stack; use a queueing executor such as [`ThreadPool`] for those.
///
/// # Examples
///
/// ```
/// use promise_chain::{executor::Inline, Promise};
/// use std::sync::Arc;
///
/// let doubled = Promise::resolve(21, Arc::new(Inline)).then(|v| v * 2);
/// // The continuation already ran by the time `then` returned.
/// assert!(!doubled.is_pending());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Executor for Inline {
    fn submit(&self, work: Work) {
        work()
    }
}

/// Spawns a detached thread per unit of work.
#[derive(Debug, Clone, Default)]
pub struct ThreadPerTask {
    name: Option<String>,
}

impl ThreadPerTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names every spawned thread `name`.
    pub fn named<N: Into<String>>(name: N) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl Executor for ThreadPerTask {
    fn submit(&self, work: Work) {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Err(err) = builder.spawn(work) {
            // The closure is gone with the failed spawn, nothing left to run.
            log::error!("failed to spawn promise thread: {err}");
        }
    }
}

/// Configures and spawns a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolBuilder {
    size: usize,
    name: String,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self {
            size: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            name: "promise-worker".into(),
        }
    }
}

impl ThreadPoolBuilder {
    /// Number of worker threads; zero is treated as one.
    pub fn size(self, size: usize) -> Self {
        Self {
            size: size.max(1),
            ..self
        }
    }

    /// Prefix of the worker thread names; workers are named `{name}-{index}`.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn build(self) -> io::Result<ThreadPool> {
        let (sender, receiver) = unbounded::<Work>();
        let mut workers = Vec::with_capacity(self.size);
        for index in 0..self.size {
            let name = format!("{}-{index}", self.name);
            let receiver = receiver.clone();
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                log::trace!("worker '{name}' starting");
                for work in receiver {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
                        log::warn!(
                            "worker '{name}' caught a panicking work item: {}",
                            panic_message(&*payload)
                        );
                    }
                }
                log::trace!("worker '{name}' exiting");
            })?;
            workers.push(handle);
        }
        Ok(ThreadPool {
            sender: Some(sender),
            workers,
        })
    }
}

/// A fixed set of worker threads pulling work off one unbounded queue.
///
/// Dropping the pool lets queued work finish, then joins the workers. If the
/// last reference is dropped on one of the workers themselves, that worker
/// is left to exit on its own.
///
/// # Examples
///
/// ```
/// use promise_chain::{executor::ThreadPool, Promise};
/// use std::sync::Arc;
///
/// let pool = Arc::new(ThreadPool::builder().size(2).build().unwrap());
/// let p = Promise::resolve(20, pool).then(|v| v + 22);
/// assert_eq!(futures::executor::block_on(p.settled()).unwrap(), 42);
/// ```
pub struct ThreadPool {
    sender: Option<Sender<Work>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::default()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Executor for ThreadPool {
    fn submit(&self, work: Work) {
        let sent = self
            .sender
            .as_ref()
            .map(|sender| sender.send(work).is_ok())
            .unwrap_or(false);
        if !sent {
            log::error!("thread pool is shut down, work dropped");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker drain the queue and exit.
        drop(self.sender.take());
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("promise worker exited by panic");
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
