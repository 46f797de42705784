//! Client-side reconstruction of backing chains from a flat volume listing.
//!
//! Listings are flat so they stay cheap to produce under the registry lock.
//! Roots are the entries at depth 0 (or whose parent is not part of the
//! listing); every other entry is attached below its `backing_image_id`.

use std::collections::{HashMap, HashSet};

use crate::VolumeInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode {
    pub volume: VolumeInfo,
    pub children: Vec<ChainNode>,
}

impl ChainNode {
    /// Number of nodes in this subtree, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ChainNode::node_count).sum::<usize>()
    }
}

pub fn build_forest(volumes: &[VolumeInfo]) -> Vec<ChainNode> {
    let known: HashSet<&str> = volumes.iter().map(|v| v.id.as_str()).collect();
    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();

    for (idx, volume) in volumes.iter().enumerate() {
        match volume.backing_image_id.as_deref() {
            Some(parent) if volume.depth > 0 && known.contains(parent) => {
                children.entry(parent).or_default().push(idx);
            }
            _ => roots.push(idx),
        }
    }
    roots.sort_by(|a, b| volumes[*a].id.cmp(&volumes[*b].id));

    let mut visited = HashSet::new();
    roots
        .into_iter()
        .filter_map(|idx| attach(idx, volumes, &children, &mut visited))
        .collect()
}

fn attach(
    idx: usize,
    volumes: &[VolumeInfo],
    children: &HashMap<&str, Vec<usize>>,
    visited: &mut HashSet<usize>,
) -> Option<ChainNode> {
    // A malformed listing with a cycle must not recurse forever.
    if !visited.insert(idx) {
        return None;
    }
    let volume = volumes[idx].clone();
    let mut kids: Vec<usize> = children
        .get(volume.id.as_str())
        .cloned()
        .unwrap_or_default();
    kids.sort_by(|a, b| volumes[*a].id.cmp(&volumes[*b].id));

    let subtrees = kids
        .into_iter()
        .filter_map(|kid| attach(kid, volumes, children, visited))
        .collect();
    Some(ChainNode {
        volume,
        children: subtrees,
    })
}

/// Render the forest as an indented tree, one chain node per line.
pub fn render_tree(forest: &[ChainNode]) -> String {
    let mut out = String::new();
    for root in forest {
        out.push_str(&describe(&root.volume));
        out.push('\n');
        render_children(&root.children, "", &mut out);
    }
    out
}

fn render_children(children: &[ChainNode], prefix: &str, out: &mut String) {
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        out.push_str(prefix);
        out.push_str(if last { "└── " } else { "├── " });
        out.push_str(&describe(&child.volume));
        out.push('\n');
        let next = format!("{}{}", prefix, if last { "    " } else { "│   " });
        render_children(&child.children, &next, out);
    }
}

fn describe(volume: &VolumeInfo) -> String {
    let binding = if volume.volume_ref.is_empty() {
        "detached"
    } else {
        volume.volume_ref.as_str()
    };
    format!(
        "{} [node-{}] refs={} ({})",
        volume.id, volume.node_id, volume.ref_count, binding
    )
}
