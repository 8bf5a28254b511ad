//! The synthetic boot-configuration filesystem.
//!
//! Transport-independent: paths in, attributes and bytes out. The FUSE
//! binding in [`crate::fuse`] only translates inodes and replies.
//!
//! ```text
//! /                   directory: by-ip + one file per active node
//! /<KEY>              rendered boot configuration (read provisions)
//! /by-ip/             directory: one link per active node
//! /by-ip/<a.b.c.d>    symlink to <node_dir>/<KEY>
//! ```

use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use netroot_id::NodeKey;
use tracing::{debug, trace, warn};

use crate::error::ReadError;
use crate::mountinfo::{mount_at, read_mount_table};
use crate::resolve::resolve;
use crate::store::ProvisioningStore;
use crate::template::BootTemplate;

/// Name of the address-indexed directory.
pub const BY_IP: &str = "by-ip";

/// A node in the synthetic tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    Root,
    ByIp,
    /// Boot configuration for one node.
    NodeFile(NodeKey),
    /// Address link to one node's root.
    NodeLink(Ipv4Addr),
}

impl Entry {
    /// Classify an absolute path within the filesystem.
    pub fn classify(path: &str) -> Option<Entry> {
        let mut entry = Entry::Root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            entry = entry.child(component)?;
        }
        Some(entry)
    }

    /// Look up `name` inside this entry.
    pub fn child(&self, name: &str) -> Option<Entry> {
        match self {
            Entry::Root if name == BY_IP => Some(Entry::ByIp),
            Entry::Root => resolve(name).map(Entry::NodeFile),
            Entry::ByIp => match name.parse::<Ipv4Addr>() {
                Ok(addr) => Some(Entry::NodeLink(addr)),
                Err(_) => {
                    trace!(name = %name, "lookup name is not an address");
                    None
                }
            },
            Entry::NodeFile(_) | Entry::NodeLink(_) => None,
        }
    }

    /// Absolute path of this entry.
    pub fn path(&self) -> String {
        match self {
            Entry::Root => "/".to_string(),
            Entry::ByIp => format!("/{}", BY_IP),
            Entry::NodeFile(key) => format!("/{}", key),
            Entry::NodeLink(addr) => format!("/{}/{}", BY_IP, addr),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Root | Entry::ByIp => EntryKind::Directory,
            Entry::NodeFile(_) => EntryKind::File,
            Entry::NodeLink(_) => EntryKind::Symlink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// Attributes of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Used for atime, mtime and ctime alike.
    pub time: SystemTime,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub entry: Entry,
}

/// Read-only filesystem whose reads drive provisioning.
pub struct PxeFs {
    store: Arc<ProvisioningStore>,
    template: Arc<BootTemplate>,
    mount_table: PathBuf,
    started: SystemTime,
    uid: u32,
    gid: u32,
}

impl PxeFs {
    pub fn new(
        store: Arc<ProvisioningStore>,
        template: Arc<BootTemplate>,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        // SAFETY: getuid and getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            store,
            template,
            mount_table: mount_table.into(),
            started: SystemTime::now(),
            uid,
            gid,
        }
    }

    pub fn store(&self) -> &Arc<ProvisioningStore> {
        &self.store
    }

    /// Attributes of `entry`. Never provisions.
    pub fn getattr(&self, entry: &Entry) -> Attr {
        let (size, perm, nlink) = match entry {
            Entry::Root | Entry::ByIp => (0, 0o555, 2),
            Entry::NodeFile(_) => (self.template.rendered_len(), 0o444, 1),
            Entry::NodeLink(addr) => (self.link_target(*addr).as_os_str().len() as u64, 0o777, 1),
        };
        Attr {
            kind: entry.kind(),
            size,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            time: self.started,
        }
    }

    /// List a directory.
    pub fn readdir(&self, entry: &Entry) -> Result<Vec<DirEntry>, ReadError> {
        match entry {
            Entry::Root => {
                let mut entries = vec![DirEntry {
                    name: BY_IP.to_string(),
                    entry: Entry::ByIp,
                }];
                entries.extend(self.active_nodes().into_iter().map(|key| DirEntry {
                    name: key.to_string(),
                    entry: Entry::NodeFile(key),
                }));
                Ok(entries)
            }
            Entry::ByIp => Ok(self
                .active_nodes()
                .into_iter()
                .map(|key| {
                    let addr = key.to_ipv4();
                    DirEntry {
                        name: addr.to_string(),
                        entry: Entry::NodeLink(addr),
                    }
                })
                .collect()),
            other => Err(ReadError::NotADirectory(other.path())),
        }
    }

    /// Target of an address link.
    pub fn readlink(&self, entry: &Entry) -> Result<PathBuf, ReadError> {
        match entry {
            Entry::NodeLink(addr) => Ok(self.link_target(*addr)),
            other => Err(ReadError::NotFound(other.path())),
        }
    }

    /// Read `size` bytes at `offset` from a node's boot configuration,
    /// provisioning the node first.
    pub async fn read(&self, entry: &Entry, offset: u64, size: u32) -> Result<Vec<u8>, ReadError> {
        let Entry::NodeFile(key) = entry else {
            return Err(ReadError::NotFound(entry.path()));
        };
        let rendered = self.render(*key).await?;
        Ok(slice(&rendered, offset, size))
    }

    /// Answer a whole-file read of `lookup_name`.
    pub async fn on_read(&self, lookup_name: &str) -> Result<Vec<u8>, ReadError> {
        let key = resolve(lookup_name).ok_or_else(|| ReadError::NotFound(lookup_name.to_string()))?;
        self.render(key).await
    }

    async fn render(&self, key: NodeKey) -> Result<Vec<u8>, ReadError> {
        self.store.ensure_provisioned(key).await?;
        debug!(node = %key, "Serving boot configuration");
        Ok(self.template.render(key))
    }

    /// Nodes whose mount point under `node_dir` is currently mounted.
    pub fn active_nodes(&self) -> Vec<NodeKey> {
        let node_dir = &self.store.layout().node_dir;

        let dir = match fs::read_dir(node_dir) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(node_dir = %node_dir.display(), error = %e, "Cannot list node directory");
                return Vec::new();
            }
        };
        let mounts = match read_mount_table(&self.mount_table) {
            Ok(mounts) => mounts,
            Err(e) => {
                warn!(
                    mount_table = %self.mount_table.display(),
                    error = %e,
                    "Cannot read mount table"
                );
                return Vec::new();
            }
        };

        let mut keys: Vec<NodeKey> = dir
            .filter_map(Result::ok)
            .filter(|dirent| dirent.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|dirent| {
                let key = dirent.file_name().to_str().and_then(|name| name.parse().ok())?;
                mount_at(&mounts, &dirent.path()).map(|_| key)
            })
            .collect();
        keys.sort();
        keys
    }

    fn link_target(&self, addr: Ipv4Addr) -> PathBuf {
        self.store.layout().mount_path(NodeKey::from(addr))
    }
}

fn slice(bytes: &[u8], offset: u64, size: u32) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
    let end = start.saturating_add(size as usize).min(bytes.len());
    bytes[start..end].to_vec()
}
