//! Provisioning state store.
//!
//! Owns one [`NodeRecord`] per node key and drives it through
//! Unprovisioned → Provisioning → Ready | Failed.
//!
//! ## Locking
//!
//! - The node table lock is held only to look up or insert a slot. It never
//!   spans I/O.
//! - Each slot has an async attempt lock, held for the whole of a mount /
//!   export attempt. A second caller for the same node queues on it, so at
//!   most one attempt per node is ever in flight and distinct nodes never
//!   wait on each other.
//! - The attempt itself runs on a spawned task that owns the lock. A caller
//!   that gives up only stops waiting; the lock is released when the mount
//!   and export steps have actually returned.
//! - Each slot also has a short state lock so status can be read while an
//!   attempt is running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use netroot_id::{ExportId, NodeKey};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info};

use crate::allocator::ExportIdAllocator;
use crate::error::ProvisionError;
use crate::export::ExportPublisher;
use crate::layout::NodeLayout;
use crate::overlay::OverlayProvisioner;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unprovisioned,
    Provisioning,
    Ready,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub key: NodeKey,
    pub state: NodeState,
    pub overlay_path: PathBuf,
    pub mount_path: PathBuf,
    /// Set once, after the first successful export.
    pub export_id: Option<ExportId>,
    /// The union mount step has succeeded at least once.
    pub mounted: bool,
    pub last_error: Option<ProvisionError>,
}

impl NodeRecord {
    fn new(key: NodeKey, layout: &NodeLayout) -> Self {
        Self {
            key,
            state: NodeState::Unprovisioned,
            overlay_path: layout.overlay_path(key),
            mount_path: layout.mount_path(key),
            export_id: None,
            mounted: false,
            last_error: None,
        }
    }
}

struct SlotState {
    record: NodeRecord,
    /// Attempts that have run to completion (either outcome).
    completed_attempts: u64,
}

struct NodeSlot {
    state: Mutex<SlotState>,
    attempt: Arc<tokio::sync::Mutex<()>>,
}

impl NodeSlot {
    fn finish(&self, result: &Result<PathBuf, ProvisionError>) {
        let mut slot = self.state.lock();
        slot.completed_attempts += 1;
        match result {
            Ok(_) => {
                slot.record.state = NodeState::Ready;
                slot.record.last_error = None;
            }
            Err(e) => {
                slot.record.state = NodeState::Failed;
                slot.record.last_error = Some(e.clone());
            }
        }
    }
}

/// Holds a node's attempt lock for the life of one attempt.
///
/// Marks the attempt Failed if its task unwinds or is cancelled before
/// recording an outcome. The lock is released only after that.
struct AttemptGuard {
    slot: Arc<NodeSlot>,
    _permit: OwnedMutexGuard<()>,
    armed: bool,
}

impl AttemptGuard {
    fn new(slot: Arc<NodeSlot>, permit: OwnedMutexGuard<()>) -> Self {
        Self {
            slot,
            _permit: permit,
            armed: true,
        }
    }

    fn complete(mut self, result: &Result<PathBuf, ProvisionError>) {
        self.armed = false;
        self.slot.finish(result);
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.slot.state.lock();
        if slot.record.state == NodeState::Provisioning {
            let key = slot.record.key;
            slot.record.state = NodeState::Failed;
            slot.record.last_error = Some(ProvisionError::Interrupted { key });
            slot.completed_attempts += 1;
        }
    }
}

/// The ports an attempt drives. Shared with the task running it.
struct Steps {
    allocator: ExportIdAllocator,
    provisioner: Arc<dyn OverlayProvisioner>,
    publisher: Arc<dyn ExportPublisher>,
}

impl Steps {
    /// Run the steps that have not yet succeeded for this node.
    async fn run(&self, slot: &NodeSlot, key: NodeKey) -> Result<PathBuf, ProvisionError> {
        let (mounted, export_id, mount_path) = {
            let state = slot.state.lock();
            let record = &state.record;
            (record.mounted, record.export_id, record.mount_path.clone())
        };

        if mounted {
            debug!(node = %key, "Union mount already provisioned, skipping");
        } else {
            self.provisioner
                .provision(key)
                .await
                .map_err(|source| ProvisionError::Mount { key, source })?;
            slot.state.lock().record.mounted = true;
        }

        if export_id.is_none() {
            let id = self
                .allocator
                .next()
                .ok_or(ProvisionError::ExportIdsExhausted { key })?;
            self.publisher
                .publish(key, &mount_path, id)
                .await
                .map_err(|source| ProvisionError::Export { key, source })?;
            slot.state.lock().record.export_id = Some(id);
        }

        Ok(mount_path)
    }
}

/// Orchestrates provisioning of every node.
pub struct ProvisioningStore {
    layout: NodeLayout,
    steps: Arc<Steps>,
    nodes: Mutex<HashMap<NodeKey, Arc<NodeSlot>>>,
}

impl ProvisioningStore {
    pub fn new(
        layout: NodeLayout,
        allocator: ExportIdAllocator,
        provisioner: Arc<dyn OverlayProvisioner>,
        publisher: Arc<dyn ExportPublisher>,
    ) -> Self {
        Self {
            layout,
            steps: Arc::new(Steps {
                allocator,
                provisioner,
                publisher,
            }),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// Make sure `key` has an active, exported root and return its mount path.
    ///
    /// Safe to call any number of times, concurrently, for any mix of keys.
    /// A caller that arrives while another attempt for the same key is in
    /// flight waits for it and reports its outcome rather than starting over.
    ///
    /// The attempt runs on its own task. Dropping the returned future stops
    /// the wait, not the mount or export; a later call picks up the outcome.
    /// Must be called within a tokio runtime.
    pub async fn ensure_provisioned(&self, key: NodeKey) -> Result<PathBuf, ProvisionError> {
        let slot = self.slot(key);
        let observed = slot.state.lock().completed_attempts;

        let permit = Arc::clone(&slot.attempt).lock_owned().await;

        {
            let mut state = slot.state.lock();
            if state.record.state == NodeState::Ready {
                return Ok(state.record.mount_path.clone());
            }
            // An attempt finished while we queued: that was the in-flight
            // attempt we were waiting on, so its failure is ours too.
            if state.completed_attempts != observed {
                if let Some(err) = &state.record.last_error {
                    return Err(err.clone());
                }
            }
            state.record.state = NodeState::Provisioning;
        }

        info!(node = %key, "Provisioning node");
        let steps = Arc::clone(&self.steps);
        let guard = AttemptGuard::new(Arc::clone(&slot), permit);
        let attempt = tokio::spawn(async move {
            let result = steps.run(&guard.slot, key).await;
            guard.complete(&result);

            match &result {
                Ok(mount_path) => info!(
                    node = %key,
                    mount_path = %mount_path.display(),
                    "Node ready"
                ),
                Err(e) => error!(
                    node = %key,
                    reason_code = e.reason_code(),
                    error = %e,
                    "Node provisioning failed"
                ),
            }
            result
        });

        match attempt.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(node = %key, error = %join_err, "Provisioning task did not complete");
                Err(ProvisionError::Interrupted { key })
            }
        }
    }

    /// Current record for `key`, if the node has ever been seen.
    pub fn status(&self, key: NodeKey) -> Option<NodeRecord> {
        let slot = self.nodes.lock().get(&key).cloned()?;
        let record = slot.state.lock().record.clone();
        Some(record)
    }

    /// All records, sorted by key.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let slots: Vec<Arc<NodeSlot>> = self.nodes.lock().values().cloned().collect();
        let mut records: Vec<NodeRecord> = slots
            .iter()
            .map(|s| s.state.lock().record.clone())
            .collect();
        records.sort_by_key(|r| r.key);
        records
    }

    fn slot(&self, key: NodeKey) -> Arc<NodeSlot> {
        let mut nodes = self.nodes.lock();
        Arc::clone(nodes.entry(key).or_insert_with(|| {
            Arc::new(NodeSlot {
                state: Mutex::new(SlotState {
                    record: NodeRecord::new(key, &self.layout),
                    completed_attempts: 0,
                }),
                attempt: Arc::new(tokio::sync::Mutex::new(())),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::error::MountError;
    use crate::export::MockPublisher;
    use crate::overlay::MockProvisioner;

    fn key(s: &str) -> NodeKey {
        s.parse().unwrap()
    }

    fn store(
        provisioner: Arc<MockProvisioner>,
        publisher: Arc<MockPublisher>,
    ) -> ProvisioningStore {
        ProvisioningStore::new(
            NodeLayout::new("/srv/root", "/netboot/node", "/srv/overlay"),
            ExportIdAllocator::new(ExportId::new(100000)),
            provisioner,
            publisher,
        )
    }

    #[tokio::test]
    async fn test_first_call_provisions_and_exports() {
        let provisioner = Arc::new(MockProvisioner::new());
        let publisher = Arc::new(MockPublisher::new());
        let store = store(provisioner.clone(), publisher.clone());

        let path = store.ensure_provisioned(key("0A000005")).await.unwrap();

        assert_eq!(path, PathBuf::from("/netboot/node/0A000005"));
        assert_eq!(provisioner.calls(), 1);
        let calls = publisher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, ExportId::new(100000));
        assert_eq!(calls[0].mount_path, path);

        let record = store.status(key("0A000005")).unwrap();
        assert_eq!(record.state, NodeState::Ready);
        assert_eq!(record.export_id, Some(ExportId::new(100000)));
        assert_eq!(record.overlay_path, PathBuf::from("/srv/overlay/0A000005"));
    }

    #[tokio::test]
    async fn test_unknown_node_has_no_status() {
        let store = store(Arc::new(MockProvisioner::new()), Arc::new(MockPublisher::new()));
        assert!(store.status(key("0A000005")).is_none());
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_mount_failure_marks_failed_without_export() {
        let provisioner = Arc::new(MockProvisioner::failing());
        let publisher = Arc::new(MockPublisher::new());
        let store = store(provisioner.clone(), publisher.clone());

        let err = store.ensure_provisioned(key("0A000005")).await.unwrap_err();

        assert!(matches!(err, ProvisionError::Mount { .. }));
        assert!(publisher.calls().is_empty());
        let record = store.status(key("0A000005")).unwrap();
        assert_eq!(record.state, NodeState::Failed);
        assert!(!record.mounted);
        assert_eq!(record.last_error, Some(err));
    }

    #[tokio::test]
    async fn test_mount_failure_is_retried() {
        let provisioner = Arc::new(MockProvisioner::failing());
        let publisher = Arc::new(MockPublisher::new());
        let store = store(provisioner.clone(), publisher.clone());

        assert!(store.ensure_provisioned(key("0A000005")).await.is_err());
        provisioner.set_failing(false);
        assert!(store.ensure_provisioned(key("0A000005")).await.is_ok());

        assert_eq!(provisioner.calls(), 2);
        assert_eq!(publisher.successful_calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_ids_fail_after_mount() {
        let provisioner = Arc::new(MockProvisioner::new());
        let publisher = Arc::new(MockPublisher::new());
        let store = ProvisioningStore::new(
            NodeLayout::new("/srv/root", "/netboot/node", "/srv/overlay"),
            ExportIdAllocator::new(ExportId::new(u32::MAX)),
            provisioner.clone(),
            publisher.clone(),
        );

        store.ensure_provisioned(key("0A000005")).await.unwrap();
        let err = store.ensure_provisioned(key("0A000006")).await.unwrap_err();

        assert_eq!(err.reason_code(), "export_ids_exhausted");
        assert!(store.status(key("0A000006")).unwrap().mounted);
    }

    #[tokio::test]
    async fn test_timed_out_caller_does_not_restart_attempt() {
        let provisioner = Arc::new(MockProvisioner::new().with_delay(Duration::from_millis(300)));
        let publisher = Arc::new(MockPublisher::new());
        let store = store(provisioner.clone(), publisher.clone());

        let first = timeout(Duration::from_millis(50), store.ensure_provisioned(key("0A000005")));
        assert!(first.await.is_err());
        assert_eq!(
            store.status(key("0A000005")).unwrap().state,
            NodeState::Provisioning
        );

        let path = store.ensure_provisioned(key("0A000005")).await.unwrap();

        assert_eq!(path, PathBuf::from("/netboot/node/0A000005"));
        assert_eq!(provisioner.calls(), 1);
        assert_eq!(provisioner.max_in_flight(), 1);
        assert_eq!(publisher.calls().len(), 1);
        let record = store.status(key("0A000005")).unwrap();
        assert_eq!(record.state, NodeState::Ready);
        assert_eq!(record.export_id, Some(ExportId::new(100000)));
    }

    #[tokio::test]
    async fn test_abandoned_attempt_finishes_in_background() {
        let provisioner = Arc::new(MockProvisioner::new().with_delay(Duration::from_millis(100)));
        let publisher = Arc::new(MockPublisher::new());
        let store = store(provisioner.clone(), publisher.clone());

        let first = timeout(Duration::from_millis(20), store.ensure_provisioned(key("0A000005")));
        assert!(first.await.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;

        let record = store.status(key("0A000005")).unwrap();
        assert_eq!(record.state, NodeState::Ready);
        assert_eq!(publisher.successful_calls(), 1);
    }

    struct PanickingProvisioner;

    #[async_trait::async_trait]
    impl OverlayProvisioner for PanickingProvisioner {
        async fn provision(&self, _key: NodeKey) -> Result<(), MountError> {
            panic!("mount helper crashed");
        }
    }

    #[tokio::test]
    async fn test_panicked_attempt_is_interrupted() {
        let store = ProvisioningStore::new(
            NodeLayout::new("/srv/root", "/netboot/node", "/srv/overlay"),
            ExportIdAllocator::new(ExportId::new(100000)),
            Arc::new(PanickingProvisioner),
            Arc::new(MockPublisher::new()),
        );

        let err = store.ensure_provisioned(key("0A000005")).await.unwrap_err();

        assert_eq!(err, ProvisionError::Interrupted { key: key("0A000005") });
        let record = store.status(key("0A000005")).unwrap();
        assert_eq!(record.state, NodeState::Failed);
        assert_eq!(record.last_error, Some(err));
    }

    #[tokio::test]
    async fn test_snapshot_sorted_by_key() {
        let store = store(Arc::new(MockProvisioner::new()), Arc::new(MockPublisher::new()));
        for k in ["0A000009", "0A000001", "0A000005"] {
            store.ensure_provisioned(key(k)).await.unwrap();
        }

        let keys: Vec<String> = store.snapshot().iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["0A000001", "0A000005", "0A000009"]);
    }
}
