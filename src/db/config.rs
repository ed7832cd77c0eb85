//! Module: config
//! Responsibility: the recognized `Database::open` options and their
//! documented defaults.
//! Does not own: validation beyond type-level constraints; the storage
//! backend is free to reject a combination it cannot honor (e.g. a
//! `map_size` too small for `max_readers`).

use std::path::PathBuf;

/// How `Database::open` should treat an existing (or missing) store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DbOpenMode {
    /// Create the store if it does not exist; open it read-write either way.
    Create,
    /// Open an existing store read-write; fail if it does not exist.
    ReadWrite,
}

///
/// Config
///
/// Recognized configuration options, with the defaults documented per field.
///

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub path: PathBuf,
    #[serde(default = "default_open_mode")]
    pub open_mode: DbOpenMode,
    /// Maximum concurrent reader snapshots the store will admit.
    #[serde(default = "default_max_readers")]
    pub max_readers: u32,
    /// Upper bound on the memory-mapped region, in bytes. Only load-bearing
    /// for backends (like `heed`) that must reserve address space up front;
    /// used as the reservation size during `vacuum`'s reload.
    #[serde(default = "default_map_size")]
    pub map_size: usize,
    /// Whether the store lives in its own subdirectory at `path` (true)
    /// or `path` names the environment file/directory directly (false).
    #[serde(default)]
    pub subdir: bool,
    /// Worker fan-out for per-predicate parallel seeks. `0` disables fan-out
    /// and runs everything on the calling thread.
    #[serde(default)]
    pub n_jobs: usize,
    /// Page size used by the step pipeline's pull-based iteration.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

const fn default_open_mode() -> DbOpenMode {
    DbOpenMode::ReadWrite
}

const fn default_max_readers() -> u32 {
    2048
}

const fn default_map_size() -> usize {
    16 * 1024 * 1024 * 1024
}

const fn default_page_size() -> usize {
    4096
}

impl Config {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open_mode: default_open_mode(),
            max_readers: default_max_readers(),
            map_size: default_map_size(),
            subdir: false,
            n_jobs: 0,
            page_size: default_page_size(),
        }
    }

    #[must_use]
    pub const fn with_open_mode(mut self, mode: DbOpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    #[must_use]
    pub const fn with_max_readers(mut self, max_readers: u32) -> Self {
        self.max_readers = max_readers;
        self
    }

    #[must_use]
    pub const fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = n_jobs;
        self
    }
}
