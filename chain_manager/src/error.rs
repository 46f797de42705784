use std::path::PathBuf;

use block_commands::BlockError;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("storage daemon unavailable: {0}")]
    Transport(#[source] BlockError),

    #[error(transparent)]
    Command(BlockError),

    #[error(transparent)]
    JobTimeout(BlockError),

    #[error("filesystem operation on {} failed: {}", path.display(), source)]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chain registry inconsistent: {0}")]
    Consistency(String),
}

impl ChainError {
    pub fn not_found(what: &'static str, id: &str) -> Self {
        ChainError::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> ChainError {
        let path = path.into();
        move |source| ChainError::Filesystem { path, source }
    }
}

impl From<BlockError> for ChainError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Transport(_) => ChainError::Transport(err),
            BlockError::JobTimeout { .. } => ChainError::JobTimeout(err),
            BlockError::NotFound(node) => ChainError::NotFound {
                what: "block node",
                id: node,
            },
            BlockError::InvalidSize(_) => ChainError::Validation(err.to_string()),
            BlockError::Command { .. } | BlockError::JobFailed { .. } | BlockError::Decode { .. } => {
                ChainError::Command(err)
            }
        }
    }
}
