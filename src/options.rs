#![forbid(unsafe_code)]
//! Store configuration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::types::page::{DEFAULT_PAGE_SIZE, PAGE_HDR_LEN};

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read store config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The TOML was malformed.
    #[error("failed to parse store config: {source}")]
    Parse {
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value was out of range.
    #[error("invalid store config: {0}")]
    Invalid(&'static str),
}

/// When commit forces the log to disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Write and fsync the log on every commit.
    #[default]
    Full,
    /// Write the log on commit without fsync.
    Normal,
    /// Leave the log buffered until a checkpoint or page write forces it.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }
}

/// Settings for deferred space reclamation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReclaimOptions {
    /// Spawn a background thread that drains the reclaim queue.
    pub background: bool,
    /// How many times a busy request is retried before it is dropped.
    pub max_attempts: u32,
    /// How long the worker sleeps when the queue is empty.
    pub idle_wait_ms: u64,
}

impl Default for ReclaimOptions {
    fn default() -> Self {
        Self {
            background: false,
            max_attempts: 5,
            idle_wait_ms: 100,
        }
    }
}

impl ReclaimOptions {
    /// Idle wait as a duration.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }
}

/// Options used when opening a [`crate::RawStore`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Page size in bytes for newly created containers.
    pub page_size: u32,
    /// Pages tracked by one allocation page.
    pub alloc_extent_pages: u32,
    /// Percentage of a page a single column may take before it is treated
    /// as a long column.
    pub overflow_threshold: u8,
    /// Log durability at commit.
    pub synchronous: Synchronous,
    /// Reclamation worker settings.
    pub reclaim: ReclaimOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            alloc_extent_pages: 512,
            overflow_threshold: 50,
            synchronous: Synchronous::Full,
            reclaim: ReclaimOptions::default(),
        }
    }
}

impl StoreOptions {
    /// Sets the page size.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets how many pages one allocation page tracks.
    pub fn alloc_extent_pages(mut self, pages: u32) -> Self {
        self.alloc_extent_pages = pages;
        self
    }

    /// Sets the long-column threshold percentage.
    pub fn overflow_threshold(mut self, percent: u8) -> Self {
        self.overflow_threshold = percent;
        self
    }

    /// Sets the commit durability mode.
    pub fn synchronous(mut self, mode: Synchronous) -> Self {
        self.synchronous = mode;
        self
    }

    /// Enables or disables the background reclaim thread.
    pub fn background_reclaim(mut self, enabled: bool) -> Self {
        self.reclaim.background = enabled;
        self
    }

    /// Sets the reclaim retry limit.
    pub fn reclaim_max_attempts(mut self, attempts: u32) -> Self {
        self.reclaim.max_attempts = attempts;
        self
    }

    /// Parses options from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let options: StoreOptions =
            toml::from_str(src).map_err(|source| ConfigError::Parse { source })?;
        options.validate()?;
        Ok(options)
    }

    /// Reads and parses a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < 512 || (self.page_size as usize) <= PAGE_HDR_LEN * 4 {
            return Err(ConfigError::Invalid("page_size must be at least 512"));
        }
        if self.alloc_extent_pages == 0 {
            return Err(ConfigError::Invalid("alloc_extent_pages must be positive"));
        }
        // One status byte per tracked page must fit in the allocation page.
        if self.alloc_extent_pages as usize + 64 > self.page_size as usize - PAGE_HDR_LEN {
            return Err(ConfigError::Invalid(
                "alloc_extent_pages does not fit in one page",
            ));
        }
        if self.overflow_threshold == 0 || self.overflow_threshold > 100 {
            return Err(ConfigError::Invalid("overflow_threshold must be in 1..=100"));
        }
        Ok(())
    }
}
