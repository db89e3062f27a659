use crate::status::AbandonReason;

pub const UNKNOWN_ERROR_CODE: &str = "UnknownError";

/// Returned by writer operations. The variant tells the caller whether a
/// retry can help.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
    /// Storage hiccup; retrying the whole write may succeed.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// The destination is gone or refuses us. The writer is abandoned.
    #[error("non-transient storage failure ({reason}): {details}")]
    Terminal {
        reason: AbandonReason,
        details: String,
    },

    #[error("write cancelled")]
    Cancelled,

    #[error("writer has been disposed")]
    Disposed,
}

impl WriteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }
}

/// An error reported by blob storage, reduced to what the writer records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{origin}.{code}: {message}")]
pub struct StorageFault {
    pub origin: String,
    pub code: String,
    pub message: String,
}

impl StorageFault {
    pub fn new(origin: &str, code: &str, message: impl Into<String>) -> Self {
        let code = if code.trim().is_empty() {
            UNKNOWN_ERROR_CODE
        } else {
            code
        };
        Self {
            origin: origin.to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Error text as recorded on the writer. Downstream status records
    /// reserve `#`.
    pub fn details(&self) -> String {
        sanitize(&self.to_string())
    }

    pub fn from_object_store(err: &object_store::Error) -> Self {
        let code = match err {
            object_store::Error::NotFound { .. } => "ContainerNotFound",
            object_store::Error::PermissionDenied { .. } => "AuthorizationFailure",
            object_store::Error::Unauthenticated { .. } => "AuthenticationFailed",
            object_store::Error::Generic { source, .. } if is_dns_failure(&source.to_string()) => {
                "NameResolutionFailure"
            }
            object_store::Error::Generic { .. } => "StorageError",
            _ => UNKNOWN_ERROR_CODE,
        };
        StorageFault::new("ObjectStore", code, err.to_string())
    }

    /// Finds the object store error behind an `anyhow` chain, if any.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<object_store::Error>() {
            Some(store_err) => StorageFault::from_object_store(store_err),
            None => StorageFault::new("BlobStorage", UNKNOWN_ERROR_CODE, format!("{:#}", err)),
        }
    }
}

/// Failures of an export pipeline append.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageFault),

    #[error("timed out appending to {file_name}")]
    Timeout {
        file_name: String,
        inner: Option<StorageFault>,
    },

    #[error("append cancelled")]
    Cancelled,
}

pub fn sanitize(text: &str) -> String {
    text.replace('#', "-")
}

fn is_dns_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("dns error") || message.contains("failed to lookup address")
}
