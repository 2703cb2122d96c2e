use std::path::PathBuf;

/// Failures from the file-level durability layer.
///
/// This crate only ever sees raw paths and bytes; it has no notion of
/// tables, indexes or rows, so its error set stays deliberately small.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
