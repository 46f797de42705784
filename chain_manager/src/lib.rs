//! Copy-on-write backing chains of volumes and snapshots.
//!
//! [`ChainManager`] owns the [`Registry`] and drives the daemon through
//! [`BlockCommands`]. Operations on the same name are serialized by
//! per-name locks; the registry itself is only locked around in-memory
//! changes, never across a daemon round trip.

mod cleanup;
mod error;
mod layout;
mod locks;
mod registry;
mod snapshots;
mod volumes;

use block_commands::BlockCommands;
pub use error::ChainError;
pub use layout::Layout;
use locks::{NameGuard, NameLocks};
use qmp::query::NamedBlockNode;
pub use registry::{ExportRecord, Registry};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use data_model::{short_id, VolumeInfo};

/// What happens to a deleted snapshot that later snapshots still read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeletionPolicy {
    /// Unbind the name and keep the node in the chain until nothing reads
    /// from it any more.
    #[default]
    ChainRetained,
    /// Stream the snapshot's data into its only child and remove the node
    /// right away.
    Flatten,
}

pub struct ChainManager {
    block: BlockCommands,
    layout: Layout,
    policy: DeletionPolicy,
    registry: RwLock<Registry>,
    locks: NameLocks,
    /// Serializes zero-reference cleanup walks.
    collector: Mutex<()>,
}

impl ChainManager {
    pub fn new(block: BlockCommands, layout: Layout, policy: DeletionPolicy) -> Self {
        Self {
            block,
            layout,
            policy,
            registry: RwLock::new(Registry::default()),
            locks: NameLocks::default(),
            collector: Mutex::new(()),
        }
    }

    /// Registry entries sorted by depth, then name.
    pub async fn list_volumes(&self) -> Vec<VolumeInfo> {
        self.registry.read().await.list()
    }

    /// The daemon's own view of its block nodes.
    pub async fn list_nodes(&self) -> Result<Vec<NamedBlockNode>, ChainError> {
        Ok(self.block.list_nodes().await?)
    }

    /// Run `check` against the registry under its lock.
    pub async fn inspect<T>(&self, check: impl FnOnce(&Registry) -> T) -> T {
        check(&*self.registry.read().await)
    }

    /// Lock `names` together with the image `resolve` picks from the
    /// registry. The image can change while the locks are being taken, so
    /// resolve again under the locks and start over until both agree.
    async fn lock_resolved(
        &self,
        names: &[&str],
        resolve: impl Fn(&Registry) -> Option<String>,
    ) -> NameGuard {
        loop {
            let seen = resolve(&*self.registry.read().await);
            let mut wanted = names.to_vec();
            wanted.extend(seen.as_deref());
            let guard = self.locks.lock(&wanted).await;
            if resolve(&*self.registry.read().await) == seen {
                return guard;
            }
            debug!(names = ?names, "resolved image changed while locking, retrying");
        }
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), ChainError> {
    if name.is_empty() {
        return Err(ChainError::Validation(format!("{} name is empty", kind)));
    }
    if name.contains('/') || name.contains("..") || name.chars().any(char::is_whitespace) {
        return Err(ChainError::Validation(format!(
            "{} name {:?} is not a valid path component",
            kind, name
        )));
    }
    if short_id(name).is_empty() {
        return Err(ChainError::Validation(format!(
            "{} name {:?} has no id after its prefix",
            kind, name
        )));
    }
    Ok(())
}
