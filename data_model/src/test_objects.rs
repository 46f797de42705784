pub mod tests {
    use std::path::PathBuf;

    use crate::{short_id, Image, VolumeInfo};

    pub const TEST_VOLUME: &str = "pvc-0f3a9c11-5d2e-4d7b-9a4c-1e2f3a4b5c6d";
    pub const TEST_SNAPSHOT: &str = "snapshot-77aa01bc-2b3c-4d5e-8f90-a1b2c3d4e5f6";
    pub const TEST_SIZE: u64 = 100_000_000;

    pub fn volume_info(id: &str, backing: Option<&str>, depth: u32) -> VolumeInfo {
        VolumeInfo {
            id: id.to_string(),
            node_id: short_id(id),
            backing_image_id: backing.map(str::to_string),
            file: format!("/var/run/qsd/images/{}/disk.img", id),
            ref_count: 0,
            depth,
            volume_ref: id.to_string(),
        }
    }

    pub fn mock_root(name: &str) -> Image {
        Image::new_root(
            name,
            PathBuf::from(format!("/var/run/qsd/images/{}/disk.img", name)),
            TEST_SIZE,
        )
    }

    pub fn mock_overlay(parent: &Image, name: &str) -> Image {
        Image::new_overlay(
            parent,
            name,
            PathBuf::from(format!("/var/run/qsd/images/{}/snap-{}", parent.name, short_id(name))),
            0,
        )
    }
}
