//! The lock-protected resolution record behind every promise.
use crate::{
    executor::{panic_message, Executor},
    Error, PromiseState, Rejection,
};
use std::{
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// A fully bound continuation, waiting for this node's outcome.
pub(crate) type Reaction<T> = Box<dyn FnOnce(Result<T, Rejection>) + Send + 'static>;

pub(crate) struct Shared<T> {
    slot: Mutex<Slot<T>>,
    executor: Arc<dyn Executor>,
}

/// The stored outcome. Values sit behind an `Arc` so that only the `Arc` is
/// cloned under the lock; `T::clone` runs later, inside the dispatched work.
type Stored<T> = Result<Arc<T>, Rejection>;

enum Slot<T> {
    Pending(Vec<Reaction<T>>),
    Fulfilled(Arc<T>),
    Rejected { reason: Rejection, handled: bool },
}

impl<T> Slot<T> {
    fn state(&self) -> PromiseState {
        match self {
            Slot::Pending(_) => PromiseState::Pending,
            Slot::Fulfilled(_) => PromiseState::Fulfilled,
            Slot::Rejected { .. } => PromiseState::Rejected,
        }
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Pending(reactions) => write!(f, "Pending({} reactions)", reactions.len()),
            Slot::Fulfilled(_) => f.write_str("Fulfilled"),
            Slot::Rejected { reason, .. } => write!(f, "Rejected({reason})"),
        }
    }
}

impl<T> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").field("slot", &*self.lock()).finish()
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // No user code runs under this lock, so poisoning cannot leave a
        // half-written slot behind.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn pending(executor: Arc<dyn Executor>) -> Arc<Self> {
        Self::with_slot(Slot::Pending(Vec::new()), executor)
    }

    pub(crate) fn settled(outcome: Result<T, Rejection>, executor: Arc<dyn Executor>) -> Arc<Self> {
        let slot = match outcome {
            Ok(value) => Slot::Fulfilled(Arc::new(value)),
            Err(reason) => Slot::Rejected {
                reason,
                handled: false,
            },
        };
        Self::with_slot(slot, executor)
    }

    fn with_slot(slot: Slot<T>, executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(slot),
            executor,
        })
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub(crate) fn state(&self) -> PromiseState {
        self.lock().state()
    }

    /// Performs the one legal transition out of `Pending`, then hands every
    /// queued reaction to the executor in registration order.
    pub(crate) fn settle(&self, outcome: Result<T, Rejection>) -> Result<(), Error> {
        let outcome: Stored<T> = outcome.map(Arc::new);
        let mut reactions = {
            let mut slot = self.lock();
            let reactions = match &mut *slot {
                Slot::Pending(reactions) => mem::take(reactions),
                settled => {
                    let current = settled.state();
                    log::error!("attempted to settle a promise that is already {current}");
                    return Err(Error::AlreadySettled(current));
                }
            };
            *slot = match &outcome {
                Ok(value) => Slot::Fulfilled(Arc::clone(value)),
                Err(reason) => Slot::Rejected {
                    reason: reason.clone(),
                    handled: !reactions.is_empty(),
                },
            };
            reactions
        };
        log::trace!(
            "promise {}, dispatching {} reactions",
            if outcome.is_ok() { "fulfilled" } else { "rejected" },
            reactions.len()
        );
        // Dispatch outside the lock: reactions may touch this or other states.
        let last = reactions.pop();
        for reaction in reactions {
            self.dispatch(reaction, outcome.clone());
        }
        if let Some(reaction) = last {
            self.dispatch(reaction, outcome);
        }
        Ok(())
    }

    /// Queues `reaction` while pending, otherwise dispatches it right away.
    pub(crate) fn enqueue_or_run(&self, reaction: Reaction<T>) {
        let outcome = {
            let mut slot = self.lock();
            match &mut *slot {
                Slot::Pending(reactions) => {
                    reactions.push(reaction);
                    return;
                }
                Slot::Fulfilled(value) => Ok(Arc::clone(value)),
                Slot::Rejected { reason, handled } => {
                    *handled = true;
                    Err(reason.clone())
                }
            }
        };
        self.dispatch(reaction, outcome);
    }

    fn dispatch(&self, reaction: Reaction<T>, outcome: Stored<T>) {
        self.executor
            .submit(Box::new(move || reaction(copy_out(&outcome))));
    }
}

/// Hands a reaction its own copy of the value. A panicking `Clone` becomes a
/// rejection for that reaction alone.
fn copy_out<T: Clone>(outcome: &Stored<T>) -> Result<T, Rejection> {
    let value = outcome.as_ref().map_err(Rejection::clone)?;
    catch_unwind(AssertUnwindSafe(|| T::clone(&**value))).map_err(|payload| {
        let message = panic_message(&*payload);
        log::debug!("cloning a fulfilled value panicked: {message}");
        Rejection::from(Error::Panicked(message))
    })
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Slot::Rejected {
            reason,
            handled: false,
        } = slot
        {
            log::debug!("rejected promise dropped without a handler: {reason}");
        }
    }
}
