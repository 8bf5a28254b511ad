//! Boot-configuration template rendering.
//!
//! The template is read once at startup and never re-read. Rendering is a
//! byte-level substitution of [`NODE_TOKEN`]; nothing else in the template is
//! interpreted, so non-UTF-8 content passes through untouched.

use std::fs;
use std::path::{Path, PathBuf};

use netroot_id::NodeKey;
use tracing::info;

use crate::error::TemplateError;

/// Placeholder replaced by the node key.
pub const NODE_TOKEN: &str = "<NODE>";

/// A loaded, immutable boot-configuration template.
#[derive(Debug, Clone)]
pub struct BootTemplate {
    bytes: Vec<u8>,
    occurrences: usize,
}

impl BootTemplate {
    /// Load a template from disk. It must mention [`NODE_TOKEN`] at least once.
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let bytes = fs::read(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let template = Self::from_bytes(bytes, path)?;
        info!(
            path = %path.display(),
            size = template.bytes.len(),
            tokens = template.occurrences,
            "Boot template loaded"
        );
        Ok(template)
    }

    /// Build a template from bytes already in memory; `origin` is only used
    /// in the error message.
    pub fn from_bytes(bytes: Vec<u8>, origin: &Path) -> Result<Self, TemplateError> {
        let occurrences = count_tokens(&bytes);
        if occurrences == 0 {
            return Err(TemplateError::MissingToken {
                path: PathBuf::from(origin),
                token: NODE_TOKEN,
            });
        }
        Ok(Self { bytes, occurrences })
    }

    /// Render the template for one node.
    pub fn render(&self, key: NodeKey) -> Vec<u8> {
        render(&self.bytes, key)
    }

    /// Exact size of every rendered file; all keys have the same length.
    pub fn rendered_len(&self) -> u64 {
        let token = NODE_TOKEN.len() as u64;
        let key = NodeKey::LEN as u64;
        self.bytes.len() as u64 - self.occurrences as u64 * token + self.occurrences as u64 * key
    }
}

/// Replace every literal [`NODE_TOKEN`] in `template` with `key`.
pub fn render(template: &[u8], key: NodeKey) -> Vec<u8> {
    let token = NODE_TOKEN.as_bytes();
    let key = key.to_string();

    let mut out = Vec::with_capacity(template.len() + NodeKey::LEN);
    let mut rest = template;
    while let Some(pos) = find(rest, token) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(key.as_bytes());
        rest = &rest[pos + token.len()..];
    }
    out.extend_from_slice(rest);
    out
}

fn count_tokens(template: &[u8]) -> usize {
    let token = NODE_TOKEN.as_bytes();
    let mut count = 0;
    let mut rest = template;
    while let Some(pos) = find(rest, token) {
        count += 1;
        rest = &rest[pos + token.len()..];
    }
    count
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
