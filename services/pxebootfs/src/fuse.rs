//! FUSE binding for [`PxeFs`].
//!
//! The session thread handles lookups and attributes inline. Reads of node
//! files are handed to the tokio runtime so that a slow mount or export for
//! one client does not hold up every other client's read.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, Request, FUSE_ROOT_ID,
};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::pxefs::{Attr, Entry, EntryKind, PxeFs};

/// Attribute cache lifetime; short because the active node set changes.
const TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct InodeSlot {
    entry: Entry,
    /// Kernel references from `lookup` replies not yet forgotten.
    lookups: u64,
}

/// Maps inode numbers to synthetic entries. Inodes are never reused.
///
/// An entry is dropped once the kernel forgets every lookup of it, so
/// names that were only looked up once do not pin memory. The root is
/// never dropped. Entries that only appeared in a directory listing stay
/// until looked up and forgotten; listings only contain active nodes.
#[derive(Debug)]
pub struct InodeTable {
    by_ino: HashMap<u64, InodeSlot>,
    by_entry: HashMap<Entry, u64>,
    next: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_entry: HashMap::new(),
            next: FUSE_ROOT_ID + 1,
        };
        table.by_ino.insert(
            FUSE_ROOT_ID,
            InodeSlot {
                entry: Entry::Root,
                lookups: 0,
            },
        );
        table.by_entry.insert(Entry::Root, FUSE_ROOT_ID);
        table
    }

    pub fn entry(&self, ino: u64) -> Option<Entry> {
        self.by_ino.get(&ino).map(|slot| slot.entry)
    }

    /// Inode for `entry`, assigning a fresh one on first sight. Does not
    /// count as a lookup.
    pub fn ino(&mut self, entry: Entry) -> u64 {
        if let Some(ino) = self.by_entry.get(&entry) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, InodeSlot { entry, lookups: 0 });
        self.by_entry.insert(entry, ino);
        ino
    }

    /// Inode for `entry`, counting one kernel lookup against it.
    pub fn lookup(&mut self, entry: Entry) -> u64 {
        let ino = self.ino(entry);
        if let Some(slot) = self.by_ino.get_mut(&ino) {
            slot.lookups += 1;
        }
        ino
    }

    /// Drop `nlookup` kernel references; evicts the entry at zero.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let Some(slot) = self.by_ino.get_mut(&ino) else {
            return;
        };
        slot.lookups = slot.lookups.saturating_sub(nlookup);
        if slot.lookups == 0 {
            let entry = slot.entry;
            self.by_ino.remove(&ino);
            self.by_entry.remove(&entry);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Filesystem`] implementation over [`PxeFs`].
pub struct PxeFuse {
    fs: Arc<PxeFs>,
    inodes: InodeTable,
    runtime: Handle,
}

impl PxeFuse {
    pub fn new(fs: Arc<PxeFs>, runtime: Handle) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            runtime,
        }
    }

    fn file_attr(&self, ino: u64, entry: &Entry) -> FileAttr {
        to_file_attr(ino, &self.fs.getattr(entry))
    }
}

impl Filesystem for PxeFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent) = self.inodes.entry(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(entry) = name.to_str().and_then(|name| parent.child(name)) else {
            reply.error(libc::ENOENT);
            return;
        };
        let ino = self.inodes.lookup(entry);
        let attr = self.file_attr(ino, &entry);
        reply.entry(&TTL, &attr, 0);
    }

    // The default batch_forget calls this once per node.
    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.inodes.entry(ino) {
            Some(entry) => {
                let attr = self.file_attr(ino, &entry);
                reply.attr(&TTL, &attr);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(entry) = self.inodes.entry(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.readlink(&entry) {
            Ok(target) => {
                use std::os::unix::ffi::OsStrExt;
                reply.data(target.as_os_str().as_bytes());
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.inodes.entry(ino) {
            None => reply.error(libc::ENOENT),
            Some(_) if flags & libc::O_ACCMODE != libc::O_RDONLY => reply.error(libc::EROFS),
            Some(Entry::NodeFile(_)) => reply.opened(0, 0),
            Some(_) => reply.error(libc::EISDIR),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(entry) = self.inodes.entry(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.read(&entry, offset, size).await {
                Ok(bytes) => reply.data(&bytes),
                Err(e) => {
                    warn!(
                        path = %entry.path(),
                        reason_code = e.reason_code(),
                        error = %e,
                        "Read failed"
                    );
                    reply.error(e.errno());
                }
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir) = self.inodes.entry(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let children = match self.fs.readdir(&dir) {
            Ok(children) => children,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (FUSE_ROOT_ID, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_ino = self.inodes.ino(child.entry);
            listing.push((child_ino, file_type(child.entry.kind()), child.name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (idx, (child_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
            if reply.add(child_ino, (idx + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.time,
        mtime: attr.time,
        ctime: attr.time,
        crtime: attr.time,
        kind: file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Mount options for the filesystem.
pub fn mount_options(allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![MountOption::FSName("pxebootfs".to_string()), MountOption::RO];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Mount at `mountpoint` on a background thread. Dropping the session
/// unmounts.
pub fn mount(
    fs: Arc<PxeFs>,
    runtime: Handle,
    mountpoint: &Path,
    allow_other: bool,
) -> io::Result<BackgroundSession> {
    let session = fuser::spawn_mount2(
        PxeFuse::new(fs, runtime),
        mountpoint,
        &mount_options(allow_other),
    )?;
    info!(mountpoint = %mountpoint.display(), allow_other, "Filesystem mounted");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_root_inode_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.entry(FUSE_ROOT_ID), Some(Entry::Root));
        assert_eq!(table.entry(FUSE_ROOT_ID + 1), None);
    }

    #[test]
    fn test_inodes_are_stable() {
        let mut table = InodeTable::new();
        let file = Entry::NodeFile("0A000005".parse().unwrap());
        let link = Entry::NodeLink(Ipv4Addr::new(10, 0, 0, 5));

        let a = table.ino(file);
        let b = table.ino(link);
        assert_ne!(a, b);
        assert_eq!(table.ino(file), a);
        assert_eq!(table.ino(Entry::Root), FUSE_ROOT_ID);
        assert_eq!(table.entry(b), Some(link));
    }

    #[test]
    fn test_forgotten_entry_is_evicted() {
        let mut table = InodeTable::new();
        let file = Entry::NodeFile("0A000005".parse().unwrap());

        let ino = table.lookup(file);
        assert_eq!(table.lookup(file), ino);

        table.forget(ino, 1);
        assert_eq!(table.entry(ino), Some(file));
        table.forget(ino, 1);
        assert_eq!(table.entry(ino), None);

        // A later lookup gets a fresh inode rather than the old number.
        let again = table.lookup(file);
        assert_ne!(again, ino);
        assert_eq!(table.entry(again), Some(file));
    }

    #[test]
    fn test_root_survives_forget() {
        let mut table = InodeTable::new();
        table.forget(FUSE_ROOT_ID, 10);
        assert_eq!(table.entry(FUSE_ROOT_ID), Some(Entry::Root));
    }

    #[test]
    fn test_forget_unknown_inode_is_ignored() {
        let mut table = InodeTable::new();
        let link = Entry::NodeLink(Ipv4Addr::new(10, 0, 0, 5));
        let ino = table.lookup(link);

        table.forget(ino + 100, 1);

        assert_eq!(table.entry(ino), Some(link));
    }

    #[test]
    fn test_mount_options() {
        assert_eq!(mount_options(false).len(), 2);
        assert!(mount_options(true).contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_file_attr_conversion() {
        let attr = Attr {
            kind: EntryKind::File,
            size: 1025,
            perm: 0o444,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            time: std::time::UNIX_EPOCH,
        };
        let converted = to_file_attr(7, &attr);
        assert_eq!(converted.ino, 7);
        assert_eq!(converted.blocks, 3);
        assert_eq!(converted.kind, FileType::RegularFile);
        assert_eq!(converted.perm, 0o444);
    }
}
