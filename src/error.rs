use std::rc::Rc;

/// Returned as the rejection of a [`Future`](crate::Future) that was resolved
/// with itself.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("a future cannot be resolved with itself")]
pub struct CycleError;

/// The default rejection payload of a [`Future`](crate::Future).
///
/// Rejections are handed to every registered callback, so the payload must be
/// [`Clone`]. Arbitrary errors are carried behind an [`Rc`], which keeps the
/// identity of the original error object as it travels down a chain.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The future was resolved with itself.
    #[error(transparent)]
    Cycle(#[from] CycleError),
    /// A plain message.
    #[error("{0}")]
    Message(String),
    /// Any other error value.
    #[error("{0}")]
    Custom(Rc<dyn std::error::Error>),
}

impl Error {
    /// Wrap an arbitrary error value.
    pub fn custom<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Error::Custom(Rc::new(err))
    }

    /// Returns true if this is the rejection produced by a self-resolution.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Error::Cycle(_))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_owned())
    }
}

impl From<CycleError> for String {
    fn from(err: CycleError) -> Self {
        err.to_string()
    }
}
