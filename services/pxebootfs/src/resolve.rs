//! Lookup-name resolution.
//!
//! Boot loaders request many names that are not node keys (MAC-based names,
//! shortened address prefixes, `default`). Those resolve to `None` and are
//! answered as not-found without ever reaching the provisioning path.

use netroot_id::NodeKey;
use tracing::trace;

/// Resolve a requested file name to a node key.
///
/// Accepts a bare name, or one directly under the root (a single leading
/// `/`). Anything nested deeper is not a node file.
pub fn resolve(lookup_name: &str) -> Option<NodeKey> {
    let name = lookup_name.strip_prefix('/').unwrap_or(lookup_name);

    match NodeKey::parse(name) {
        Ok(key) => Some(key),
        Err(e) => {
            trace!(name = %name, error = %e, "lookup name is not a node key");
            None
        }
    }
}
