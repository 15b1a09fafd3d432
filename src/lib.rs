//! Promise chains with JavaScript-style `then`/`catch`/`finally` that leave
//! scheduling to a caller-supplied [`Executor`].
//!
//! A [`Promise`] is a cheap, cloneable handle over one shared resolution
//! state. The state settles exactly once, either fulfilled with a value or
//! rejected with a [`Rejection`]. Every chaining call returns a new promise
//! whose outcome is produced by the registered callback, and every callback is
//! handed to the chain's executor rather than run under a lock.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{executor::Inline, Promise, PromiseState};
//! use std::sync::Arc;
//!
//! let answer = Promise::new(Arc::new(Inline), |resolve, _reject| {
//!     resolve.resolve(42)?;
//!     Ok(())
//! })
//! .then(|v| v * 2)
//! .then(|v| v + 1);
//!
//! assert_eq!(answer.state(), PromiseState::Fulfilled);
//! assert_eq!(futures::executor::block_on(answer.settled()).unwrap(), 85);
//! ```
//!
//! Rejections travel down the chain until something handles them:
//!
//! ```
//! use promise_chain::{executor::Inline, Promise, Rejection};
//! use std::sync::Arc;
//!
//! let recovered = Promise::<i32>::reject(Rejection::msg("boom"), Arc::new(Inline))
//!     .then(|v| v * 2)
//!     .catch(|_| -1);
//!
//! assert_eq!(futures::executor::block_on(recovered.settled()).unwrap(), -1);
//! ```
use std::fmt;
use thiserror::Error;

pub mod executor;
mod promise;
mod rejection;
mod state;
mod waiter;

pub use executor::{Executor, Work};
pub use promise::{Promise, Rejecter, Resolver};
pub use rejection::Rejection;
pub use waiter::Settled;

/// Where a promise is in its single `Pending -> Fulfilled | Rejected` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PromiseState::Pending => "pending",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A resolver or rejecter was used on a promise that had already settled.
    #[error("promise is already {0}")]
    AlreadySettled(PromiseState),
    /// The continuation feeding a [`Settled`] future was dropped without running.
    #[error("producer dropped before settling")]
    ProducerDropped,
    /// A user callback panicked; the payload message, if it had one.
    #[error("callback panicked: {0}")]
    Panicked(String),
}
