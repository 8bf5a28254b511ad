//! Static configuration for pxebootfs.
//!
//! Settings live in the `[PXEBOOTFS]` section of an INI file. Files are read
//! in order, each overriding the last:
//!
//! 1. `/etc/pxebootfs/pxebootfs.cfg`
//! 2. `~/.pxebootfs.cfg`
//! 3. `./pxebootfs.cfg`
//! 4. the file given with `--config` (must exist)
//!
//! `PXEBOOTFS_<KEY>` environment variables override every file.

use std::path::{Path, PathBuf};

use ::config::{Config as Settings, Environment, File, FileFormat, Map, Value};
use directories::BaseDirs;
use netroot_id::ExportId;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::export::DEFAULT_EXPORT_OPTIONS;
use crate::layout::NodeLayout;
use crate::logging::LogFormat;
use crate::overlay::UnionFs;

/// INI section holding our keys.
pub const SECTION: &str = "PXEBOOTFS";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PXEBOOTFS";

/// System-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/pxebootfs/pxebootfs.cfg";

/// First export id handed out when `start_fsid` is not set.
pub const DEFAULT_START_FSID: u32 = 100_000;

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Boot-configuration template.
    pub pxe_template: PathBuf,

    /// Parent of per-node mount points.
    pub node_dir: PathBuf,

    /// Shared read-only root.
    pub root_dir: PathBuf,

    /// Parent of per-node writable overlays.
    pub overlay_dir: PathBuf,

    /// First export id.
    pub start_fsid: ExportId,

    pub union_fs: UnionFs,

    /// exportfs options, before `fsid=`.
    pub export_options: String,

    pub exportfs_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

/// Keys as read, before defaults and validation.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    pxe_template: Option<PathBuf>,
    node_dir: Option<PathBuf>,
    root_dir: Option<PathBuf>,
    overlay_dir: Option<PathBuf>,
    start_fsid: Option<u32>,
    union_fs: Option<UnionFs>,
    export_options: Option<String>,
    exportfs_path: Option<PathBuf>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
}

impl Config {
    /// Load from the default search path, an optional explicit file and the
    /// environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_sources(&default_search_paths(), explicit, ENV_PREFIX)
    }

    /// Load from the given files (missing ones skipped), then `explicit`
    /// (must exist), then environment variables starting with `env_prefix`.
    pub fn from_sources(
        search_paths: &[PathBuf],
        explicit: Option<&Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        let files = search_paths
            .iter()
            .map(|path| (path.as_path(), false))
            .chain(explicit.map(|path| (path, true)));

        // Each file is read on its own so later files win key by key.
        let mut builder = Settings::builder();
        for (path, required) in files {
            for (key, value) in read_section(path, required)? {
                builder = builder.set_default(key, value)?;
            }
        }

        let raw: RawSettings = builder
            .add_source(Environment::with_prefix(env_prefix).ignore_empty(true))
            .build()?
            .try_deserialize()?;

        Self::validate(raw)
    }

    fn validate(raw: RawSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            pxe_template: required(raw.pxe_template, "pxe_template")?,
            node_dir: required(raw.node_dir, "node_dir")?,
            root_dir: required(raw.root_dir, "root_dir")?,
            overlay_dir: required(raw.overlay_dir, "overlay_dir")?,
            start_fsid: ExportId::new(raw.start_fsid.unwrap_or(DEFAULT_START_FSID)),
            union_fs: raw.union_fs.unwrap_or_default(),
            export_options: raw
                .export_options
                .unwrap_or_else(|| DEFAULT_EXPORT_OPTIONS.to_string()),
            exportfs_path: raw
                .exportfs_path
                .unwrap_or_else(|| PathBuf::from("exportfs")),
            log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
            log_format: raw.log_format.unwrap_or_default(),
        })
    }

    /// Base directories as a [`NodeLayout`].
    pub fn layout(&self) -> NodeLayout {
        NodeLayout::new(&self.root_dir, &self.node_dir, &self.overlay_dir)
    }
}

/// Config files consulted before any explicit `--config`.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
    if let Some(dirs) = BaseDirs::new() {
        paths.push(dirs.home_dir().join(".pxebootfs.cfg"));
    }
    paths.push(PathBuf::from("pxebootfs.cfg"));
    paths
}

fn required<T>(value: Option<T>, key: &'static str) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::MissingKey(key))
}

/// Read the `[PXEBOOTFS]` keys of one INI file.
///
/// Section name and keys are matched without regard to case.
fn read_section(path: &Path, required: bool) -> Result<Vec<(String, Value)>, ConfigError> {
    let file = Settings::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Ini)
                .required(required),
        )
        .build()?;

    let sections: Map<String, Value> = file.try_deserialize()?;
    let mut keys = Vec::new();
    for (name, section) in sections {
        if !name.eq_ignore_ascii_case(SECTION) {
            continue;
        }
        for (key, value) in section.into_table()? {
            keys.push((key.to_lowercase(), value));
        }
    }
    Ok(keys)
}
