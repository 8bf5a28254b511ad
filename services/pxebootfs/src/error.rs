//! Error types for provisioning.
//!
//! Every per-node error is `Clone` so a failed attempt can be stored on the
//! node record and handed to every caller that waited on that attempt.

use std::path::PathBuf;

use netroot_id::{ExportId, NodeKey};
use thiserror::Error;

/// Union mount creation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MountError {
    /// Could not create the mount point or an overlay directory.
    #[error("create_dir_failed: {path}: {detail}")]
    CreateDirectory { path: PathBuf, detail: String },

    /// Path cannot be handed to mount(2).
    #[error("invalid_path: {0}")]
    InvalidPath(PathBuf),

    /// Something other than the union filesystem is mounted at the target.
    #[error("mount_conflict: {mount_path} already carries a {fs_type} mount")]
    Conflict { mount_path: PathBuf, fs_type: String },

    /// The kernel mount table could not be read.
    #[error("mount_table_unreadable: {0}")]
    MountTable(String),

    /// The mount syscall itself failed.
    #[error("mount_failed: {fs_type} at {mount_path}: {detail}")]
    Failed {
        mount_path: PathBuf,
        fs_type: String,
        detail: String,
    },
}

impl MountError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            MountError::CreateDirectory { .. } => "create_dir_failed",
            MountError::InvalidPath(_) => "invalid_path",
            MountError::Conflict { .. } => "mount_conflict",
            MountError::MountTable(_) => "mount_table_unreadable",
            MountError::Failed { .. } => "mount_failed",
        }
    }
}

/// Export table registration failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExportError {
    /// The export command could not be started.
    #[error("export_spawn_failed: {command}: {detail}")]
    Spawn { command: String, detail: String },

    /// The export command ran and reported failure.
    #[error("export_failed: {mount_path} ({status}): {stderr}")]
    CommandFailed {
        mount_path: PathBuf,
        status: String,
        stderr: String,
    },

    /// The path is already exported under another identifier.
    #[error("export_id_conflict: {mount_path} exported as fsid={existing}, requested fsid={requested}")]
    IdConflict {
        mount_path: PathBuf,
        existing: ExportId,
        requested: ExportId,
    },
}

impl ExportError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ExportError::Spawn { .. } => "export_spawn_failed",
            ExportError::CommandFailed { .. } => "export_failed",
            ExportError::IdConflict { .. } => "export_id_conflict",
        }
    }
}

/// A provisioning attempt for one node failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("node {key}: {source}")]
    Mount {
        key: NodeKey,
        #[source]
        source: MountError,
    },

    #[error("node {key}: {source}")]
    Export {
        key: NodeKey,
        #[source]
        source: ExportError,
    },

    /// The 32-bit fsid space is used up.
    #[error("node {key}: export identifiers exhausted")]
    ExportIdsExhausted { key: NodeKey },

    /// The caller driving the attempt went away before it finished.
    #[error("node {key}: provisioning attempt interrupted")]
    Interrupted { key: NodeKey },
}

impl ProvisionError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProvisionError::Mount { source, .. } => source.reason_code(),
            ProvisionError::Export { source, .. } => source.reason_code(),
            ProvisionError::ExportIdsExhausted { .. } => "export_ids_exhausted",
            ProvisionError::Interrupted { .. } => "interrupted",
        }
    }
}

/// A request against the synthetic filesystem could not be answered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    /// The name is not a node key, address or directory we serve.
    #[error("not_found: {0}")]
    NotFound(String),

    #[error("not_a_directory: {0}")]
    NotADirectory(String),

    /// Provisioning failed; only this read fails.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl ReadError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ReadError::NotFound(_) => "not_found",
            ReadError::NotADirectory(_) => "not_a_directory",
            ReadError::Provision(e) => e.reason_code(),
        }
    }

    /// errno to hand back to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            ReadError::NotFound(_) => libc::ENOENT,
            ReadError::NotADirectory(_) => libc::ENOTDIR,
            ReadError::Provision(_) => libc::EIO,
        }
    }
}

/// The boot-configuration template is unusable.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template_unreadable: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template_missing_token: {path} does not contain {token}")]
    MissingToken { path: PathBuf, token: &'static str },
}

/// Static configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config_load_failed: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("config_missing_key: {0}")]
    MissingKey(&'static str),
}

/// Fatal conditions detected before serving any request.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("directory_missing: {role} directory {path} does not exist")]
    DirectoryMissing { role: &'static str, path: PathBuf },

    #[error("not_a_directory: {role} path {path} is not a directory")]
    NotADirectory { role: &'static str, path: PathBuf },

    #[error("directory_not_writable: no read/write permission on {role} directory {path}")]
    DirectoryNotWritable { role: &'static str, path: PathBuf },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StartupError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            StartupError::DirectoryMissing { .. } => "directory_missing",
            StartupError::NotADirectory { .. } => "not_a_directory",
            StartupError::DirectoryNotWritable { .. } => "directory_not_writable",
            StartupError::Template(TemplateError::Io { .. }) => "template_unreadable",
            StartupError::Template(TemplateError::MissingToken { .. }) => "template_missing_token",
            StartupError::Config(ConfigError::Load(_)) => "config_load_failed",
            StartupError::Config(ConfigError::MissingKey(_)) => "config_missing_key",
        }
    }
}
