//! In-memory record of every chain node and which node each volume writes to.
//!
//! The registry never talks to the daemon. Callers hold the manager's lock
//! around these methods only, so every method leaves the registry consistent:
//! a node's `ref_count` equals the number of nodes naming it as their
//! backing image, and every active-layer entry points at a registered node.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
};

use data_model::{Image, VolumeInfo};

use crate::ChainError;

/// A vhost-user export created for a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    /// Short id the export was created with; the export id is derived from it.
    pub node_id: String,
    pub socket: PathBuf,
}

#[derive(Debug, Default)]
pub struct Registry {
    images: HashMap<String, Image>,
    /// Volume name to the name of the image it currently writes to.
    active: HashMap<String, String>,
    exports: HashMap<String, ExportRecord>,
}

impl Registry {
    pub fn image(&self, name: &str) -> Option<&Image> {
        self.images.get(name)
    }

    pub fn active_layer(&self, volume: &str) -> Option<&Image> {
        self.active.get(volume).and_then(|name| self.images.get(name))
    }

    pub fn is_volume(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    /// Whether any volume writes to `image`.
    pub fn is_active(&self, image: &str) -> bool {
        self.active.values().any(|name| name == image)
    }

    /// The image a new clone of `source` should be based on: the active layer
    /// when `source` is a volume, otherwise the live snapshot node so named.
    pub fn resolve_source(&self, source: &str) -> Option<&Image> {
        self.active_layer(source).or_else(|| {
            self.images
                .get(source)
                .filter(|image| !image.volume_ref.is_empty())
        })
    }

    /// `name` is a live snapshot in the backing chain of `volume`'s active
    /// layer.
    pub fn is_live_snapshot_of(&self, name: &str, volume: &str) -> bool {
        let Some(image) = self.images.get(name) else {
            return false;
        };
        if image.volume_ref != name || self.is_volume(name) {
            return false;
        }
        let mut current = self.active_layer(volume);
        while let Some(layer) = current {
            if layer.name == name {
                return true;
            }
            current = layer
                .backing_image_id
                .as_deref()
                .and_then(|parent| self.images.get(parent));
        }
        false
    }

    /// Registered name already using the daemon-side id `id`.
    pub fn id_owner(&self, id: &str) -> Option<&str> {
        self.images
            .values()
            .find(|image| image.id == id)
            .map(|image| image.name.as_str())
    }

    pub fn children(&self, name: &str) -> Vec<&Image> {
        let mut children: Vec<&Image> = self
            .images
            .values()
            .filter(|image| image.backing_image_id.as_deref() == Some(name))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// Zero-reference cleanup may remove `image`.
    pub fn collectible(&self, image: &Image) -> bool {
        image.ref_count == 0 && image.volume_ref.is_empty() && !self.is_active(&image.name)
    }

    /// Register a new volume head, either a base image or a clone. The
    /// volume becomes its own active layer.
    pub fn insert_volume(&mut self, image: Image) -> Result<(), ChainError> {
        let name = image.name.clone();
        self.insert(image)?;
        self.active.insert(name.clone(), name);
        Ok(())
    }

    /// Register a snapshot overlay of `volume`; the overlay becomes the
    /// volume's active layer.
    pub fn insert_snapshot(&mut self, image: Image, volume: &str) -> Result<(), ChainError> {
        if !self.active.contains_key(volume) {
            return Err(ChainError::not_found("source volume", volume));
        }
        let name = image.name.clone();
        self.insert(image)?;
        self.active.insert(volume.to_string(), name);
        Ok(())
    }

    fn insert(&mut self, image: Image) -> Result<(), ChainError> {
        if self.images.contains_key(&image.name) {
            return Err(ChainError::Consistency(format!(
                "{} is already registered",
                image.name
            )));
        }
        if let Some(parent) = image.backing_image_id.as_deref() {
            let parent = self
                .images
                .get_mut(parent)
                .ok_or_else(|| ChainError::not_found("backing image", parent))?;
            parent.ref_count += 1;
        }
        self.images.insert(image.name.clone(), image);
        Ok(())
    }

    /// Unregister `name`, releasing its reference on the parent and every
    /// active-layer entry pointing at it.
    pub fn remove_image(&mut self, name: &str) -> Result<Option<Image>, ChainError> {
        let Some(image) = self.images.get(name) else {
            return Ok(None);
        };
        if image.ref_count > 0 {
            return Err(ChainError::Consistency(format!(
                "{} still backs {} image(s)",
                name, image.ref_count
            )));
        }
        if let Some(parent) = image.backing_image_id.clone() {
            self.release(&parent)?;
        }
        let image = self.images.remove(name);
        self.active.retain(|_, active| active != name);
        Ok(image)
    }

    fn release(&mut self, name: &str) -> Result<(), ChainError> {
        let parent = self
            .images
            .get_mut(name)
            .ok_or_else(|| ChainError::not_found("backing image", name))?;
        parent.ref_count = parent.ref_count.checked_sub(1).ok_or_else(|| {
            ChainError::Consistency(format!("reference count of {} would go negative", name))
        })?;
        Ok(())
    }

    /// Unbind the external name from its node; the node stays in the chain.
    pub fn detach(&mut self, name: &str) -> bool {
        match self.images.get_mut(name) {
            Some(image) => {
                image.volume_ref.clear();
                true
            }
            None => false,
        }
    }

    pub fn remove_active(&mut self, volume: &str) -> Option<String> {
        self.active.remove(volume)
    }

    /// Move `name` onto `new_parent` and fix up depths below it.
    pub fn reparent(&mut self, name: &str, new_parent: Option<&str>) -> Result<(), ChainError> {
        let old_parent = self
            .images
            .get(name)
            .ok_or_else(|| ChainError::not_found("image", name))?
            .backing_image_id
            .clone();
        if old_parent.as_deref() == new_parent {
            return Ok(());
        }

        let depth = match new_parent {
            Some(parent) => {
                let parent = self
                    .images
                    .get_mut(parent)
                    .ok_or_else(|| ChainError::not_found("backing image", parent))?;
                parent.ref_count += 1;
                parent.depth + 1
            }
            None => 0,
        };
        if let Some(old) = old_parent.as_deref() {
            self.release(old)?;
        }
        if let Some(image) = self.images.get_mut(name) {
            image.backing_image_id = new_parent.map(str::to_string);
            image.depth = depth;
        }
        self.recompute_depths(name);
        Ok(())
    }

    fn recompute_depths(&mut self, root: &str) {
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(name) = queue.pop_front() {
            let Some(depth) = self.images.get(&name).map(|image| image.depth) else {
                continue;
            };
            let children: Vec<String> = self
                .children(&name)
                .into_iter()
                .map(|child| child.name.clone())
                .collect();
            for child in children {
                if let Some(image) = self.images.get_mut(&child) {
                    image.depth = depth + 1;
                }
                queue.push_back(child);
            }
        }
    }

    pub fn export(&self, volume: &str) -> Option<&ExportRecord> {
        self.exports.get(volume)
    }

    pub fn insert_export(&mut self, volume: &str, record: ExportRecord) {
        self.exports.insert(volume.to_string(), record);
    }

    pub fn remove_export(&mut self, volume: &str) -> Option<ExportRecord> {
        self.exports.remove(volume)
    }

    /// Flat listing sorted by depth, then name.
    pub fn list(&self) -> Vec<VolumeInfo> {
        let mut images: Vec<&Image> = self.images.values().collect();
        images.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.name.cmp(&b.name)));
        images.into_iter().map(VolumeInfo::from).collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Describe the first broken registry invariant, if any.
    pub fn check_invariants(&self) -> Result<(), String> {
        for image in self.images.values() {
            let children = self.children(&image.name).len() as u32;
            if image.ref_count != children {
                return Err(format!(
                    "{} has ref_count {} but {} children",
                    image.name, image.ref_count, children
                ));
            }
            match image.backing_image_id.as_deref() {
                Some(parent) => {
                    let parent = self
                        .images
                        .get(parent)
                        .ok_or_else(|| format!("{} backed by missing {}", image.name, parent))?;
                    if image.depth != parent.depth + 1 {
                        return Err(format!(
                            "{} has depth {} under {} at depth {}",
                            image.name, image.depth, parent.name, parent.depth
                        ));
                    }
                }
                None if image.depth != 0 => {
                    return Err(format!("root {} has depth {}", image.name, image.depth));
                }
                None => {}
            }
        }
        for (volume, active) in &self.active {
            if !self.images.contains_key(active) {
                return Err(format!("volume {} active on missing {}", volume, active));
            }
        }
        Ok(())
    }
}
