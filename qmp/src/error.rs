use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodecError;

use crate::Command;

/// Error object the daemon puts in the `error` member of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub class: String,
    pub desc: String,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QmpError {
    #[error("failed to connect to QMP socket {}: {}", path.display(), source)]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("QMP handshake failed: {0}")]
    Handshake(String),

    #[error("QMP connection to the storage daemon was lost")]
    Disconnected,

    #[error("QMP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("QMP framing error: {0}")]
    Framing(#[from] LinesCodecError),

    #[error("malformed QMP message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{command} rejected by the storage daemon: {class}: {desc}")]
    Command {
        command: String,
        class: String,
        desc: String,
    },

    #[error("{command} got no reply within {after:?}")]
    Timeout { command: String, after: Duration },
}

impl QmpError {
    pub fn command(command: &Command, reply: ReplyError) -> Self {
        Self::Command {
            command: command.as_ref().to_string(),
            class: reply.class,
            desc: reply.desc,
        }
    }

    /// The daemon reported that the node, export or job named in the command
    /// does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Command { class, desc, .. } => {
                class == "DeviceNotFound"
                    || desc.contains("Failed to find node")
                    || desc.contains("Cannot find node")
                    || desc.contains("not found")
            }
            _ => false,
        }
    }

    /// The failure is about the channel, not about the command itself.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Command { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let cmd = Command::QueryJobs;
        let err = QmpError::command(
            &cmd,
            ReplyError {
                class: "GenericError".to_string(),
                desc: "Failed to find node with node-name='node-abc'".to_string(),
            },
        );
        assert!(err.is_not_found());
        assert!(!err.is_transport());

        let err = QmpError::command(
            &cmd,
            ReplyError {
                class: "GenericError".to_string(),
                desc: "Node 'node-abc' is busy: node is used as backing hd".to_string(),
            },
        );
        assert!(!err.is_not_found());
        assert!(QmpError::Disconnected.is_transport());
        assert!(!QmpError::Disconnected.is_not_found());
    }

    #[test]
    fn test_command_error_names_the_command() {
        let err = QmpError::command(
            &Command::QueryNamedBlockNodes,
            ReplyError {
                class: "GenericError".to_string(),
                desc: "boom".to_string(),
            },
        );
        assert_eq!(
            err.to_string(),
            "query-named-block-nodes rejected by the storage daemon: GenericError: boom"
        );
    }
}
