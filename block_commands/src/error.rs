use std::time::Duration;

use qmp::QmpError;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// The QMP channel failed; the command may or may not have been applied.
    #[error(transparent)]
    Transport(QmpError),

    #[error("failed to {intent}: {source}")]
    Command {
        intent: String,
        #[source]
        source: QmpError,
    },

    #[error("block node {0} not found")]
    NotFound(String),

    #[error("job {job_id} did not conclude within {after:?}")]
    JobTimeout { job_id: String, after: Duration },

    #[error("job {job_id} failed: {error}")]
    JobFailed { job_id: String, error: String },

    #[error("invalid size {0:?}: expected digits followed by M, MB, G or GB")]
    InvalidSize(String),

    #[error("unexpected reply to {command}: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl BlockError {
    pub(crate) fn wrap(intent: impl Into<String>) -> impl FnOnce(QmpError) -> BlockError {
        let intent = intent.into();
        move |err| {
            if err.is_transport() {
                BlockError::Transport(err)
            } else {
                BlockError::Command {
                    intent,
                    source: err,
                }
            }
        }
    }
}

impl From<QmpError> for BlockError {
    fn from(err: QmpError) -> Self {
        BlockError::Transport(err)
    }
}
