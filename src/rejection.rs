use std::{error::Error as StdError, fmt, sync::Arc};
use thiserror::Error;

type Payload = dyn StdError + Send + Sync + 'static;

/// The reason a promise was rejected.
///
/// Any `std::error::Error + Send + Sync + 'static` converts into a
/// `Rejection`, so `?` works inside fallible callbacks. Cloning is cheap and
/// every clone points at the same payload, which is how one rejection can be
/// handed to several downstream callbacks unchanged.
#[derive(Clone)]
pub struct Rejection {
    payload: Arc<Payload>,
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl Rejection {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            payload: Arc::new(error),
        }
    }

    /// A rejection carrying nothing but a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(Message(message.to_string()))
    }

    pub fn from_boxed(error: Box<Payload>) -> Self {
        Self {
            payload: Arc::from(error),
        }
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }

    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.payload.is::<E>()
    }

    pub fn as_error(&self) -> &Payload {
        &*self.payload
    }

    /// Whether both rejections share the very same payload.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.payload, &other.payload)
    }
}

impl<E> From<E> for Rejection
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.payload, f)
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejection").field(&self.payload).finish()
    }
}
