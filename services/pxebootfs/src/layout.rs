//! Per-node filesystem layout.
//!
//! The namespace is partitioned by node key: every path derived here embeds
//! the key, so two nodes never touch the same directory.

use std::path::{Path, PathBuf};

use netroot_id::NodeKey;

/// Base directories shared by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    /// Shared read-only base image.
    pub root_dir: PathBuf,
    /// Parent of the per-node mount points.
    pub node_dir: PathBuf,
    /// Parent of the per-node writable overlays.
    pub overlay_dir: PathBuf,
}

impl NodeLayout {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        node_dir: impl Into<PathBuf>,
        overlay_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            node_dir: node_dir.into(),
            overlay_dir: overlay_dir.into(),
        }
    }

    /// Where the node's union mount lives (and what gets exported).
    pub fn mount_path(&self, key: NodeKey) -> PathBuf {
        self.node_dir.join(key.to_string())
    }

    /// The node's private writable layer.
    pub fn overlay_path(&self, key: NodeKey) -> PathBuf {
        self.overlay_dir.join(key.to_string())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_embed_key() {
        let layout = NodeLayout::new("/srv/root", "/netboot/node", "/srv/overlay");
        let key: NodeKey = "0A000005".parse().unwrap();

        assert_eq!(layout.mount_path(key), PathBuf::from("/netboot/node/0A000005"));
        assert_eq!(layout.overlay_path(key), PathBuf::from("/srv/overlay/0A000005"));
    }

    #[test]
    fn test_distinct_keys_never_share_paths() {
        let layout = NodeLayout::new("/srv/root", "/netboot/node", "/srv/overlay");
        let a: NodeKey = "0A000005".parse().unwrap();
        let b: NodeKey = "0A000006".parse().unwrap();

        assert_ne!(layout.mount_path(a), layout.mount_path(b));
        assert_ne!(layout.overlay_path(a), layout.overlay_path(b));
    }
}
