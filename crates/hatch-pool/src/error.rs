use hatch_store::StoreError;
use thiserror::Error;

/// Error classification surfaced through the manager facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NotAllowed,
    BadRequest,
    Conflict,
    Internal,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::NotAllowed => "NotAllowed",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotAllowed(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotAllowed(_) => ErrorKind::NotAllowed,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Error::NotAllowed(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { .. } => Error::NotFound(err.to_string()),
            StoreError::Conflict { .. } => Error::Conflict(err.to_string()),
            _ => Error::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Unknown(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_kinds() {
        let err: Error = StoreError::not_found("default", "sb-1").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: Error = StoreError::Conflict {
            id: "sb-1".into(),
            expected: 1,
            found: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: Error = StoreError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
