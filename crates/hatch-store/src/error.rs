use thiserror::Error;

/// Failures surfaced by the sandbox store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record '{id}' already exists in namespace '{namespace}'")]
    AlreadyExists { namespace: String, id: String },
    #[error("record '{id}' not found in namespace '{namespace}'")]
    NotFound { namespace: String, id: String },
    #[error("conflict writing record '{id}': expected version {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },
    #[error("failed to encode record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("store backend error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("watch stream closed")]
    Closed,
}

impl StoreError {
    pub fn not_found(namespace: &str, id: &str) -> Self {
        StoreError::NotFound {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(namespace: &str, id: &str) -> Self {
        StoreError::AlreadyExists {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}
