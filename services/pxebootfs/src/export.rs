//! NFS export publishing.
//!
//! Registers a node's mount path in the kernel NFS export table, restricted
//! to the node's own address and tagged with its allocated `fsid`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use netroot_id::{ExportId, NodeKey};
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ExportError;

/// Default export options, before `fsid=` is appended.
pub const DEFAULT_EXPORT_OPTIONS: &str = "rw,no_root_squash";

/// Port for registering a mount in the export table.
#[async_trait]
pub trait ExportPublisher: Send + Sync {
    /// Export `mount_path` to the node under `id`.
    ///
    /// Publishing a path again under the id it already has is a no-op.
    async fn publish(&self, key: NodeKey, mount_path: &Path, id: ExportId)
        -> Result<(), ExportError>;
}

/// Publisher backed by `exportfs(8)`.
pub struct ExportfsPublisher {
    exportfs: PathBuf,
    options: String,
    /// Paths this process has exported, and under which id.
    published: Mutex<HashMap<PathBuf, ExportId>>,
}

impl ExportfsPublisher {
    pub fn new(exportfs: impl Into<PathBuf>, options: impl Into<String>) -> Self {
        Self {
            exportfs: exportfs.into(),
            options: options.into(),
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Arguments for one `exportfs` invocation.
    pub fn command_args(&self, key: NodeKey, mount_path: &Path, id: ExportId) -> Vec<String> {
        let options = if self.options.is_empty() {
            format!("fsid={}", id)
        } else {
            format!("{},fsid={}", self.options, id)
        };
        vec![
            "-o".to_string(),
            options,
            format!("{}:{}", key.to_ipv4(), mount_path.display()),
        ]
    }

    /// The id a path was exported under by this process, if any.
    pub fn exported_id(&self, mount_path: &Path) -> Option<ExportId> {
        self.published.lock().get(mount_path).copied()
    }
}

#[async_trait]
impl ExportPublisher for ExportfsPublisher {
    async fn publish(
        &self,
        key: NodeKey,
        mount_path: &Path,
        id: ExportId,
    ) -> Result<(), ExportError> {
        match self.exported_id(mount_path) {
            Some(existing) if existing == id => {
                debug!(node = %key, export_id = %id, "Export already registered");
                return Ok(());
            }
            Some(existing) => {
                return Err(ExportError::IdConflict {
                    mount_path: mount_path.to_path_buf(),
                    existing,
                    requested: id,
                });
            }
            None => {}
        }

        let args = self.command_args(key, mount_path, id);
        let output = Command::new(&self.exportfs)
            .args(&args)
            .output()
            .await
            .map_err(|e| ExportError::Spawn {
                command: self.exportfs.display().to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExportError::CommandFailed {
                mount_path: mount_path.to_path_buf(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        self.published.lock().insert(mount_path.to_path_buf(), id);

        info!(
            node = %key,
            client = %key.to_ipv4(),
            mount_path = %mount_path.display(),
            export_id = %id,
            "Export registered"
        );
        Ok(())
    }
}

/// A publish call as seen by [`MockPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    pub key: NodeKey,
    pub mount_path: PathBuf,
    pub id: ExportId,
    pub succeeded: bool,
}

/// Mock publisher for testing.
pub struct MockPublisher {
    calls: Mutex<Vec<PublishCall>>,
    fail: AtomicBool,
    /// Fail only this many upcoming calls, then recover.
    fail_next: AtomicUsize,
}

impl MockPublisher {
    /// Create a mock publisher that always succeeds.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Create a mock publisher that fails every call.
    pub fn failing() -> Self {
        let mock = Self::new();
        mock.set_failing(true);
        mock
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` calls only.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PublishCall> {
        self.calls.lock().clone()
    }

    pub fn successful_calls(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.succeeded).count()
    }

    fn should_fail(&self) -> bool {
        if self.fail.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExportPublisher for MockPublisher {
    async fn publish(
        &self,
        key: NodeKey,
        mount_path: &Path,
        id: ExportId,
    ) -> Result<(), ExportError> {
        let fail = self.should_fail();
        debug!(node = %key, export_id = %id, fail, "[MOCK] Publishing export");

        self.calls.lock().push(PublishCall {
            key,
            mount_path: mount_path.to_path_buf(),
            id,
            succeeded: !fail,
        });

        if fail {
            return Err(ExportError::CommandFailed {
                mount_path: mount_path.to_path_buf(),
                status: "exit status: 1".to_string(),
                stderr: "mock publisher configured to fail".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> NodeKey {
        "0A000005".parse().unwrap()
    }

    fn mount_path() -> PathBuf {
        PathBuf::from("/netboot/node/0A000005")
    }

    #[test]
    fn test_command_args() {
        let publisher = ExportfsPublisher::new("exportfs", DEFAULT_EXPORT_OPTIONS);
        let args = publisher.command_args(key(), &mount_path(), ExportId::new(100000));
        assert_eq!(
            args,
            vec![
                "-o",
                "rw,no_root_squash,fsid=100000",
                "10.0.0.5:/netboot/node/0A000005"
            ]
        );
    }

    #[test]
    fn test_command_args_without_extra_options() {
        let publisher = ExportfsPublisher::new("exportfs", "");
        let args = publisher.command_args(key(), &mount_path(), ExportId::new(7));
        assert_eq!(args[1], "fsid=7");
    }

    #[tokio::test]
    async fn test_successful_command_records_export() {
        // `true` accepts any arguments and exits 0.
        let publisher = ExportfsPublisher::new("true", DEFAULT_EXPORT_OPTIONS);
        let id = ExportId::new(100000);

        publisher.publish(key(), &mount_path(), id).await.unwrap();
        assert_eq!(publisher.exported_id(&mount_path()), Some(id));

        // Same path, same id: no-op.
        publisher.publish(key(), &mount_path(), id).await.unwrap();
    }

    #[tokio::test]
    async fn test_republish_under_other_id_conflicts() {
        let publisher = ExportfsPublisher::new("true", DEFAULT_EXPORT_OPTIONS);
        publisher
            .publish(key(), &mount_path(), ExportId::new(1))
            .await
            .unwrap();

        let err = publisher
            .publish(key(), &mount_path(), ExportId::new(2))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "export_id_conflict");
    }

    #[tokio::test]
    async fn test_failing_command_surfaces_error() {
        let publisher = ExportfsPublisher::new("false", DEFAULT_EXPORT_OPTIONS);
        let err = publisher
            .publish(key(), &mount_path(), ExportId::new(1))
            .await
            .unwrap_err();

        assert!(matches!(err, ExportError::CommandFailed { .. }));
        assert_eq!(publisher.exported_id(&mount_path()), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let publisher =
            ExportfsPublisher::new("/nonexistent/exportfs-for-tests", DEFAULT_EXPORT_OPTIONS);
        let err = publisher
            .publish(key(), &mount_path(), ExportId::new(1))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "export_spawn_failed");
    }

    #[tokio::test]
    async fn test_mock_fail_next_recovers() {
        let mock = MockPublisher::new();
        mock.fail_next(1);

        assert!(mock
            .publish(key(), &mount_path(), ExportId::new(1))
            .await
            .is_err());
        assert!(mock
            .publish(key(), &mount_path(), ExportId::new(2))
            .await
            .is_ok());
        assert_eq!(mock.calls().len(), 2);
        assert_eq!(mock.successful_calls(), 1);
    }
}
