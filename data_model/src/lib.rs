pub mod forest;
pub mod test_objects;

use std::{
    fmt::{self, Display},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use strum::AsRefStr;

/// Number of characters of the external name kept in a node id.
pub const NODE_ID_LEN: usize = 8;

/// Prefixes the orchestrator puts in front of volume and snapshot names.
const NAME_PREFIXES: [&str; 2] = ["pvc-", "snapshot-"];

/// Derive the short daemon-side id for an external volume or snapshot name.
///
/// The well-known orchestrator prefix is stripped and at most
/// [`NODE_ID_LEN`] characters are kept, so `pvc-0f3a9c11-...` becomes
/// `0f3a9c11`.
pub fn short_id(name: &str) -> String {
    let stripped = NAME_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name);
    stripped.chars().take(NODE_ID_LEN).collect()
}

/// Daemon node-name of the qcow2 format node for `id`.
pub fn format_node_name(id: &str) -> String {
    format!("node-{}", id)
}

/// Daemon node-name of the file protocol node under the format node.
pub fn file_node_name(id: &str) -> String {
    format!("file-{}", id)
}

/// Export id of the vhost-user export for `id`.
pub fn export_id(id: &str) -> String {
    format!("vhost-{}", id)
}

/// Lifecycle of a chain node as seen from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum ImageState {
    /// Bound to an external volume or snapshot name.
    Live,
    /// No longer bound, kept because later snapshots still read from it or it
    /// is the head of a volume.
    Detached,
}

/// One node of a copy-on-write backing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Registry key, the external name this node was created for.
    pub name: String,
    /// Short daemon-side id, see [`short_id`].
    pub id: String,
    /// Registry key of the parent node, `None` for chain roots.
    pub backing_image_id: Option<String>,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    /// Number of images declaring this node as their backing parent.
    pub ref_count: u32,
    /// External name currently bound to the node, empty once detached.
    pub volume_ref: String,
    /// Distance from the chain root.
    pub depth: u32,
}

impl Image {
    pub fn new_root(name: &str, file_path: PathBuf, size_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            id: short_id(name),
            backing_image_id: None,
            file_path,
            size_bytes,
            ref_count: 0,
            volume_ref: name.to_string(),
            depth: 0,
        }
    }

    /// An overlay reading from `parent`. The parent's reference count is
    /// owned by the registry and is not touched here.
    pub fn new_overlay(parent: &Image, name: &str, file_path: PathBuf, size_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            id: short_id(name),
            backing_image_id: Some(parent.name.clone()),
            file_path,
            size_bytes: size_bytes.max(parent.size_bytes),
            ref_count: 0,
            volume_ref: name.to_string(),
            depth: parent.depth + 1,
        }
    }

    pub fn state(&self) -> ImageState {
        if self.volume_ref.is_empty() {
            ImageState::Detached
        } else {
            ImageState::Live
        }
    }

    pub fn node_name(&self) -> String {
        format_node_name(&self.id)
    }
}

impl Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image(name: {}, id: {}, backing: {}, refs: {}, volume_ref: {:?}, depth: {})",
            self.name,
            self.id,
            self.backing_image_id.as_deref().unwrap_or("-"),
            self.ref_count,
            self.volume_ref,
            self.depth
        )
    }
}

/// Flat, read-only view of a registry entry returned by volume listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: String,
    pub node_id: String,
    pub backing_image_id: Option<String>,
    pub file: String,
    pub ref_count: u32,
    pub depth: u32,
    pub volume_ref: String,
}

impl From<&Image> for VolumeInfo {
    fn from(image: &Image) -> Self {
        Self {
            id: image.name.clone(),
            node_id: image.id.clone(),
            backing_image_id: image.backing_image_id.clone(),
            file: image.file_path.to_string_lossy().to_string(),
            ref_count: image.ref_count,
            depth: image.depth,
            volume_ref: image.volume_ref.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_strips_known_prefixes() {
        assert_eq!(
            short_id("pvc-0f3a9c11-5d2e-4d7b-9a4c-1e2f3a4b5c6d"),
            "0f3a9c11"
        );
        assert_eq!(short_id("snapshot-77aa01bc-ffff"), "77aa01bc");
        assert_eq!(short_id("scratch-volume"), "scratch-");
    }

    #[test]
    fn test_short_id_keeps_short_names() {
        assert_eq!(short_id("vol1"), "vol1");
        assert_eq!(short_id("pvc-ab"), "ab");
        assert_eq!(short_id(""), "");
    }

    #[test]
    fn test_overlay_inherits_depth_and_size() {
        let root = Image::new_root("pvc-root0001", PathBuf::from("/img/root/disk.img"), 1024);
        let snap = Image::new_overlay(&root, "snapshot-s1", PathBuf::from("/img/root/snap-s1"), 0);

        assert_eq!(snap.depth, 1);
        assert_eq!(snap.size_bytes, 1024);
        assert_eq!(snap.backing_image_id.as_deref(), Some("pvc-root0001"));
        assert_eq!(snap.node_name(), "node-s1");
        assert_eq!(snap.state(), ImageState::Live);
        assert_eq!(root.ref_count, 0);
    }

    #[test]
    fn test_volume_info_uses_registry_key() {
        let mut root = Image::new_root("pvc-root0001", PathBuf::from("/img/disk.img"), 1);
        root.volume_ref.clear();
        let info = VolumeInfo::from(&root);

        assert_eq!(info.id, "pvc-root0001");
        assert_eq!(info.node_id, "root0001");
        assert_eq!(info.file, "/img/disk.img");
        assert_eq!(root.state(), ImageState::Detached);
        assert!(info.volume_ref.is_empty());
    }
}
