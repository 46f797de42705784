//! Typed QMP commands.
//!
//! Every command the storage layer issues is a variant of [`Command`]; the
//! serde representation is exactly the object the daemon expects, minus the
//! request `id` which the session adds.

use serde::{Deserialize, Serialize};
use strum::AsRefStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(
    tag = "execute",
    content = "arguments",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
#[strum(serialize_all = "kebab-case")]
pub enum Command {
    #[serde(rename = "qmp_capabilities")]
    #[strum(serialize = "qmp_capabilities")]
    QmpCapabilities,
    BlockdevCreate {
        job_id: String,
        options: CreateOptions,
    },
    BlockdevAdd(BlockdevOptions),
    BlockdevDel {
        node_name: String,
    },
    BlockdevSnapshot {
        node: String,
        overlay: String,
    },
    BlockStream {
        job_id: String,
        device: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        base_node: Option<String>,
        auto_dismiss: bool,
    },
    BlockCommit {
        job_id: String,
        device: String,
        top: String,
        base: String,
        auto_dismiss: bool,
    },
    JobCancel {
        id: String,
    },
    JobDismiss {
        id: String,
    },
    QueryJobs,
    BlockExportAdd {
        #[serde(rename = "type")]
        kind: ExportType,
        id: String,
        node_name: String,
        writable: bool,
        addr: SocketAddress,
    },
    BlockExportDel {
        id: String,
    },
    QueryNamedBlockNodes,
}

/// Options of a `blockdev-create` job, keyed by driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum CreateOptions {
    File {
        filename: String,
        size: u64,
    },
    Qcow2 {
        /// Node-name of the protocol node the image is written to.
        file: String,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        backing_file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        backing_fmt: Option<String>,
    },
}

/// Arguments of `blockdev-add`, keyed by driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum BlockdevOptions {
    File {
        node_name: String,
        filename: String,
    },
    Qcow2 {
        node_name: String,
        /// Node-name of the protocol node holding the image.
        file: String,
        /// `None` leaves the backing chain to the image header, `Some(None)`
        /// sends an explicit `null` so the daemon opens no backing node at all.
        #[serde(skip_serializing_if = "Option::is_none")]
        backing: Option<Option<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportType {
    VhostUserBlk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SocketAddress {
    Unix { path: String },
}

impl Command {
    /// Encode the command as one wire object tagged with `id`.
    pub fn to_request(&self, id: u64) -> Result<serde_json::Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("id".to_string(), serde_json::Value::from(id));
        }
        Ok(value)
    }

    pub fn is_job(&self) -> bool {
        matches!(
            self,
            Command::BlockdevCreate { .. } | Command::BlockStream { .. } | Command::BlockCommit { .. }
        )
    }
}
