use crate::ObjectRef;

/// Errors surfaced by stores and reconciliation primitives.
///
/// Only [`Error::VersionConflict`] is ever retried inside this workspace;
/// everything else reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(ObjectRef),
    #[error("{0} already exists")]
    AlreadyExists(ObjectRef),
    #[error("version conflict on {target}: {message}")]
    VersionConflict { target: ObjectRef, message: String },
    #[error("intended {target} already exists and is not owned by {owner}")]
    ValidationConflict { target: ObjectRef, owner: String },
    #[error("invalid {target}: {message}")]
    Invalid { target: ObjectRef, message: String },
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidKey(String),
    #[error("gave up on {target} after {attempts} attempts{}", last_cause(.last_error))]
    DeadlineExceeded { target: ObjectRef, attempts: u32, last_error: Option<String> },
    #[error("cancelled while waiting on {target} after {attempts} attempts")]
    Cancelled { target: ObjectRef, attempts: u32 },
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

fn last_cause(last: &Option<String>) -> String {
    match last {
        Some(e) => format!(" due to {}", e),
        None => String::new(),
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
