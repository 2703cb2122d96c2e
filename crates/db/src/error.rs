//! Public error type (spec §7).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated on index {index}")]
    ConflictUnique { index: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error")]
    Io(#[from] storage::StorageError),

    #[error("corruption: {detail}")]
    Corruption { detail: String },
}

impl Error {
    pub fn corruption(detail: impl Into<String>) -> Self {
        Error::Corruption {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
