//! netroot pxebootfs
//!
//! Provisions a private, writable root filesystem for each diskless
//! network-boot client the first time its boot loader reads its boot
//! configuration, and serves that configuration pointing at the new root.
//!
//! ## Architecture
//!
//! ```text
//! fuse::PxeFuse                    (kernel requests → PxeFs)
//! └── pxefs::PxeFs                 (synthetic tree, read = provision)
//!     └── store::ProvisioningStore (per-node state machine)
//!         ├── OverlayProvisioner   (overlay dir + union mount)
//!         ├── ExportIdAllocator    (fsid values)
//!         └── ExportPublisher      (exportfs)
//! ```
//!
//! Provisioning ports are traits with real and mock implementations, so the
//! state machine can be driven in tests without mounting or exporting.
//!
//! ## Modules
//!
//! - `store`: node records and the provisioning state machine
//! - `overlay`, `mountinfo`: union mounts and the kernel mount table
//! - `export`: NFS export registration
//! - `template`: boot-configuration rendering
//! - `pxefs`, `fuse`: the filesystem boot loaders read from

pub mod allocator;
pub mod config;
pub mod error;
pub mod export;
pub mod fuse;
pub mod layout;
pub mod logging;
pub mod mountinfo;
pub mod overlay;
pub mod pxefs;
pub mod resolve;
pub mod startup;
pub mod store;
pub mod template;

pub use allocator::ExportIdAllocator;
pub use error::{ExportError, MountError, ProvisionError, ReadError, StartupError};
pub use export::{ExportPublisher, ExportfsPublisher, MockPublisher};
pub use layout::NodeLayout;
pub use overlay::{MockProvisioner, OverlayProvisioner, UnionFs, UnionMountProvisioner};
pub use pxefs::PxeFs;
pub use store::{NodeRecord, NodeState, ProvisioningStore};
pub use template::BootTemplate;
