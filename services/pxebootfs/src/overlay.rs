//! Overlay provisioning.
//!
//! Ensures a node's private writable directory exists and that a union
//! mount layering it over the shared read-only root is active at the node's
//! mount path.
//!
//! Note: mounting uses direct libc calls and is Linux-only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use netroot_id::NodeKey;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::MountError;
use crate::layout::NodeLayout;
use crate::mountinfo::{mount_at, read_mount_table};

/// Union filesystem driver used for node roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnionFs {
    /// In-tree overlayfs; needs separate upper and work directories.
    #[default]
    Overlay,
    /// Out-of-tree aufs; the overlay directory itself is the rw branch.
    Aufs,
}

impl UnionFs {
    /// Filesystem type as it appears in mount(2) and the mount table.
    pub fn fs_type(&self) -> &'static str {
        match self {
            UnionFs::Overlay => "overlay",
            UnionFs::Aufs => "aufs",
        }
    }
}

/// Everything needed to perform one node's union mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: &'static str,
    pub fs_type: &'static str,
    pub target: PathBuf,
    pub data: String,
    /// Directories that must exist before mounting.
    pub directories: Vec<PathBuf>,
}

impl MountSpec {
    /// Compute the mount for `key`: shared root below, private overlay above.
    pub fn for_node(layout: &NodeLayout, union_fs: UnionFs, key: NodeKey) -> Self {
        let target = layout.mount_path(key);
        let overlay = layout.overlay_path(key);
        let root = layout.root_dir().display();

        match union_fs {
            UnionFs::Overlay => {
                let upper = overlay.join("upper");
                let work = overlay.join("work");
                Self {
                    source: "overlay",
                    fs_type: union_fs.fs_type(),
                    data: format!(
                        "lowerdir={},upperdir={},workdir={}",
                        root,
                        upper.display(),
                        work.display()
                    ),
                    directories: vec![target.clone(), overlay, upper, work],
                    target,
                }
            }
            UnionFs::Aufs => Self {
                source: "none",
                fs_type: union_fs.fs_type(),
                data: format!("br:{}=rw:{}=ro", overlay.display(), root),
                directories: vec![target.clone(), overlay],
                target,
            },
        }
    }
}

/// Port for bringing a node's union mount into existence.
#[async_trait]
pub trait OverlayProvisioner: Send + Sync {
    /// Idempotently create the node's overlay and mount it.
    async fn provision(&self, key: NodeKey) -> Result<(), MountError>;
}

/// Provisioner that performs real union mounts.
pub struct UnionMountProvisioner {
    layout: NodeLayout,
    union_fs: UnionFs,
    mount_table: PathBuf,
}

impl UnionMountProvisioner {
    pub fn new(layout: NodeLayout, union_fs: UnionFs, mount_table: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            union_fs,
            mount_table: mount_table.into(),
        }
    }

    /// Check the mount table: `Ok(true)` if our union mount is already there.
    fn already_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let entries = read_mount_table(&self.mount_table)
            .map_err(|e| MountError::MountTable(format!("{}: {}", self.mount_table.display(), e)))?;

        match mount_at(&entries, target) {
            None => Ok(false),
            Some(entry) if entry.fs_type == self.union_fs.fs_type() => Ok(true),
            Some(entry) => Err(MountError::Conflict {
                mount_path: target.to_path_buf(),
                fs_type: entry.fs_type.clone(),
            }),
        }
    }
}

#[async_trait]
impl OverlayProvisioner for UnionMountProvisioner {
    async fn provision(&self, key: NodeKey) -> Result<(), MountError> {
        let spec = MountSpec::for_node(&self.layout, self.union_fs, key);

        for dir in &spec.directories {
            create_dir_if_absent(dir)?;
        }

        if self.already_mounted(&spec.target)? {
            debug!(
                node = %key,
                mount_path = %spec.target.display(),
                fs_type = spec.fs_type,
                "Union mount already active"
            );
            return Ok(());
        }

        let target = spec.target.clone();
        let fs_type = spec.fs_type;
        tokio::task::spawn_blocking(move || mount_union(&spec))
            .await
            .map_err(|e| MountError::Failed {
                mount_path: target.clone(),
                fs_type: fs_type.to_string(),
                detail: format!("mount task failed: {}", e),
            })??;

        info!(
            node = %key,
            mount_path = %target.display(),
            fs_type,
            "Union mount created"
        );
        Ok(())
    }
}

fn create_dir_if_absent(path: &Path) -> Result<(), MountError> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|e| MountError::CreateDirectory {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    debug!(path = %path.display(), "Created directory");
    Ok(())
}

/// Perform the mount syscall.
#[cfg(target_os = "linux")]
fn mount_union(spec: &MountSpec) -> Result<(), MountError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let invalid = || MountError::InvalidPath(spec.target.clone());

    let source = CString::new(spec.source).map_err(|_| invalid())?;
    let target = CString::new(spec.target.as_os_str().as_bytes()).map_err(|_| invalid())?;
    let fstype = CString::new(spec.fs_type).map_err(|_| invalid())?;
    let data = CString::new(spec.data.as_str()).map_err(|_| invalid())?;

    let result = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            data.as_ptr().cast(),
        )
    };

    if result != 0 {
        let err = std::io::Error::last_os_error();
        return Err(MountError::Failed {
            mount_path: spec.target.clone(),
            fs_type: spec.fs_type.to_string(),
            detail: err.to_string(),
        });
    }

    Ok(())
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
fn mount_union(spec: &MountSpec) -> Result<(), MountError> {
    Err(MountError::Failed {
        mount_path: spec.target.clone(),
        fs_type: spec.fs_type.to_string(),
        detail: "union mounts only supported on Linux".to_string(),
    })
}

/// Mock provisioner for testing.
pub struct MockProvisioner {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl MockProvisioner {
    /// Create a mock provisioner that always succeeds.
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    /// Create a mock provisioner that fails every call.
    pub fn failing() -> Self {
        let mock = Self::new();
        mock.set_failing(true);
        mock
    }

    /// Sleep this long inside every call, to widen race windows in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of times `provision` has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most `provision` calls ever running at the same moment.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverlayProvisioner for MockProvisioner {
    async fn provision(&self, key: NodeKey) -> Result<(), MountError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        debug!(node = %key, "[MOCK] Provisioning overlay");

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(MountError::Failed {
                mount_path: PathBuf::from(format!("/mock/node/{}", key)),
                fs_type: "overlay".to_string(),
                detail: "mock provisioner configured to fail".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> NodeLayout {
        NodeLayout::new("/srv/root", "/netboot/node", "/srv/overlay")
    }

    fn key() -> NodeKey {
        "0A000005".parse().unwrap()
    }

    #[test]
    fn test_overlay_spec() {
        let spec = MountSpec::for_node(&layout(), UnionFs::Overlay, key());
        assert_eq!(spec.source, "overlay");
        assert_eq!(spec.fs_type, "overlay");
        assert_eq!(spec.target, PathBuf::from("/netboot/node/0A000005"));
        assert_eq!(
            spec.data,
            "lowerdir=/srv/root,upperdir=/srv/overlay/0A000005/upper,workdir=/srv/overlay/0A000005/work"
        );
        assert!(spec.directories.contains(&PathBuf::from("/srv/overlay/0A000005/work")));
    }

    #[test]
    fn test_aufs_spec() {
        let spec = MountSpec::for_node(&layout(), UnionFs::Aufs, key());
        assert_eq!(spec.source, "none");
        assert_eq!(spec.fs_type, "aufs");
        assert_eq!(spec.data, "br:/srv/overlay/0A000005=rw:/srv/root=ro");
        assert_eq!(spec.directories.len(), 2);
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: NodeLayout,
        table: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = NodeLayout::new(
                dir.path().join("root"),
                dir.path().join("node"),
                dir.path().join("overlay"),
            );
            let table = dir.path().join("mountinfo");
            Self {
                _dir: dir,
                layout,
                table,
            }
        }

        fn mounted(&self, fs_type: &str) {
            let line = format!(
                "41 22 0:36 / {} rw - {} {} rw\n",
                self.layout.mount_path(key()).display(),
                fs_type,
                fs_type
            );
            std::fs::write(&self.table, line).unwrap();
        }

        fn provisioner(&self) -> UnionMountProvisioner {
            UnionMountProvisioner::new(self.layout.clone(), UnionFs::Overlay, self.table.clone())
        }
    }

    #[tokio::test]
    async fn test_existing_union_mount_is_reused() {
        let fixture = Fixture::new();
        fixture.mounted("overlay");

        fixture.provisioner().provision(key()).await.unwrap();

        assert!(fixture.layout.mount_path(key()).is_dir());
        assert!(fixture.layout.overlay_path(key()).join("upper").is_dir());
        assert!(fixture.layout.overlay_path(key()).join("work").is_dir());
    }

    #[tokio::test]
    async fn test_foreign_mount_is_conflict() {
        let fixture = Fixture::new();
        fixture.mounted("tmpfs");

        let err = fixture.provisioner().provision(key()).await.unwrap_err();
        assert!(matches!(err, MountError::Conflict { ref fs_type, .. } if fs_type == "tmpfs"));
    }

    #[tokio::test]
    async fn test_unreadable_mount_table() {
        let fixture = Fixture::new();

        let err = fixture.provisioner().provision(key()).await.unwrap_err();
        assert_eq!(err.reason_code(), "mount_table_unreadable");
    }

    #[tokio::test]
    async fn test_mock_provisioner_counts_and_fails() {
        let mock = MockProvisioner::new();
        mock.provision(key()).await.unwrap();
        mock.set_failing(true);
        assert!(mock.provision(key()).await.is_err());
        assert_eq!(mock.calls(), 2);
    }
}
