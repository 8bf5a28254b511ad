//! # netroot-id
//!
//! Identifier types shared by the netroot provisioning services.
//!
//! ## Design Principles
//!
//! - A node is named by the address it booted from, never by a label
//! - Every identifier has exactly one canonical string form with strict parsing
//! - Identifiers are typed so a node key is never confused with an export id
//!
//! ## Node Key Format
//!
//! Node keys are the eight-character uppercase hexadecimal rendering of the
//! client's IPv4 address, the same form pxelinux uses when it asks for a
//! per-client configuration file:
//!
//! - `192.168.1.1` → `C0A80101`
//! - `10.0.0.5` → `0A000005`
//!
//! Export identifiers are plain integers handed to the NFS server as the
//! `fsid=` export option.

mod error;
mod types;

pub use error::IdError;
pub use types::*;
