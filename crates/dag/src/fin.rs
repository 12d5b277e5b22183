//! Finish signals and operator error classification
//!
//! An operator that fails does not unwind its task. The vertex boundary turns
//! the error into a classified [`FinError`] and sends it down the output edges
//! in place of the normal finish signal, so the consumer at the root sees
//! exactly why the job stopped.

use meridian_common::Key;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Classification carried by an error finish signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinKind {
    WriteConflict,
    DuplicateEntry,
    LockWait,
    Cancelled,
    Other,
}

impl fmt::Display for FinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FinKind::WriteConflict => "write-conflict",
            FinKind::DuplicateEntry => "duplicate-entry",
            FinKind::LockWait => "lock-wait",
            FinKind::Cancelled => "cancelled",
            FinKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Errors that know which finish class they belong to.
pub trait ClassifiedError: StdError + Send + Sync + 'static {
    fn fin_kind(&self) -> FinKind;

    /// Key the failure is about, when there is one
    fn conflict_key(&self) -> Option<Key> {
        None
    }
}

/// Error returned by operator callbacks.
///
/// Any [`ClassifiedError`] converts into it with `?`; the original error is
/// kept so the consumer can downcast it back from the [`FinError`].
#[derive(Debug, Clone)]
pub struct OperatorError {
    kind: FinKind,
    key: Option<Key>,
    message: String,
    cause: Arc<dyn StdError + Send + Sync>,
}

impl OperatorError {
    pub fn kind(&self) -> FinKind {
        self.kind
    }

    pub fn into_fin(self) -> FinError {
        FinError {
            kind: self.kind,
            message: self.message,
            key: self.key,
            cause: Some(self.cause),
        }
    }
}

impl<E: ClassifiedError> From<E> for OperatorError {
    fn from(err: E) -> Self {
        Self {
            kind: err.fin_kind(),
            key: err.conflict_key(),
            message: err.to_string(),
            cause: Arc::new(err),
        }
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

pub type OperatorResult<T> = std::result::Result<T, OperatorError>;

/// Structured failure travelling along edges
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct FinError {
    pub kind: FinKind,
    pub message: String,
    pub key: Option<Key>,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl FinError {
    pub fn new(kind: FinKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            key: None,
            cause: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FinKind::Cancelled, message)
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// The typed error the failing operator raised, looking through any
    /// finish errors it was forwarded in.
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        let cause = self.cause.as_deref()?;
        if let Some(inner) = cause.downcast_ref::<FinError>() {
            return inner.downcast_ref::<T>();
        }
        cause.downcast_ref::<T>()
    }
}

impl ClassifiedError for FinError {
    fn fin_kind(&self) -> FinKind {
        self.kind
    }

    fn conflict_key(&self) -> Option<Key> {
        self.key.clone()
    }
}

/// Finish signal sent once per edge
#[derive(Debug, Clone)]
pub enum Fin {
    Ok,
    Err(FinError),
}

impl Fin {
    pub fn is_ok(&self) -> bool {
        matches!(self, Fin::Ok)
    }

    pub fn into_result(self) -> std::result::Result<(), FinError> {
        match self {
            Fin::Ok => Ok(()),
            Fin::Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("duplicate {0}")]
    struct Dup(String);

    impl ClassifiedError for Dup {
        fn fin_kind(&self) -> FinKind {
            FinKind::DuplicateEntry
        }

        fn conflict_key(&self) -> Option<Key> {
            Some(self.0.as_bytes().to_vec())
        }
    }

    fn raise() -> OperatorResult<()> {
        Err(Dup("k1".to_string()))?;
        Ok(())
    }

    #[test]
    fn test_classification_survives_conversion() {
        let fin = raise().unwrap_err().into_fin();
        assert_eq!(fin.kind, FinKind::DuplicateEntry);
        assert_eq!(fin.key, Some(b"k1".to_vec()));
        assert_eq!(fin.downcast_ref::<Dup>().unwrap().0, "k1");
    }

    #[test]
    fn test_downcast_through_forwarded_fin() {
        let original = raise().unwrap_err().into_fin();
        let forwarded = OperatorError::from(original).into_fin();
        assert_eq!(forwarded.kind, FinKind::DuplicateEntry);
        assert!(forwarded.downcast_ref::<Dup>().is_some());
    }
}
