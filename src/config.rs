//! Decoder configuration.
//!
//! Defaults can be overridden from the environment:
//! - `REGIONVIEW_THUMB_WIDTH` target width of the placeholder thumbnail
//! - `REGIONVIEW_MAX_BLOCKS` tile blocks along the longest image side
//! - `REGIONVIEW_QUEUE_CAPACITY` pending region requests per decoder
//! - `REGIONVIEW_TILE_CACHE_MB` tile cache budget

use thiserror::Error;
use tracing::warn;

use crate::sampling::cache::DEFAULT_TILE_CACHE_MB;
use crate::sampling::queue::DEFAULT_QUEUE_CAPACITY;

/// Default target width for the placeholder thumbnail.
pub const DEFAULT_THUMB_WIDTH: u32 = 720;

/// Default number of tile blocks along the longest side.
pub const DEFAULT_MAX_BLOCKS: u32 = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Thumbnails are sampled so they stay at least this wide.
    pub thumbnail_width: u32,
    /// Tile blocks along the longest side of the oriented image.
    pub max_block_count: u32,
    /// Pending requests kept before the oldest is evicted.
    pub queue_capacity: usize,
    /// Tile cache budget in megabytes.
    pub tile_cache_mb: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            thumbnail_width: DEFAULT_THUMB_WIDTH,
            max_block_count: DEFAULT_MAX_BLOCKS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tile_cache_mb: DEFAULT_TILE_CACHE_MB,
        }
    }
}

impl DecoderConfig {
    pub fn builder() -> DecoderConfigBuilder {
        DecoderConfigBuilder::new()
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Unparsable or zero values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = positive_var(&lookup, "REGIONVIEW_THUMB_WIDTH") {
            self.thumbnail_width = v;
        }
        if let Some(v) = positive_var(&lookup, "REGIONVIEW_MAX_BLOCKS") {
            self.max_block_count = v;
        }
        if let Some(v) = positive_var(&lookup, "REGIONVIEW_QUEUE_CAPACITY") {
            self.queue_capacity = v;
        }
        if let Some(v) = positive_var(&lookup, "REGIONVIEW_TILE_CACHE_MB") {
            self.tile_cache_mb = v;
        }
        self
    }
}

fn positive_var<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => Some(v),
        _ => {
            warn!(name, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

/// Builder for [`DecoderConfig`] that rejects zero-sized settings.
pub struct DecoderConfigBuilder {
    config: DecoderConfig,
}

impl DecoderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DecoderConfig::default(),
        }
    }

    pub fn thumbnail_width(mut self, width: u32) -> Self {
        self.config.thumbnail_width = width;
        self
    }

    pub fn max_block_count(mut self, count: u32) -> Self {
        self.config.max_block_count = count;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn tile_cache_mb(mut self, mb: usize) -> Self {
        self.config.tile_cache_mb = mb;
        self
    }

    pub fn build(self) -> Result<DecoderConfig, ConfigError> {
        let config = self.config;
        if config.thumbnail_width == 0 {
            return Err(ConfigError::Zero {
                name: "thumbnail_width",
            });
        }
        if config.max_block_count == 0 {
            return Err(ConfigError::Zero {
                name: "max_block_count",
            });
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::Zero {
                name: "queue_capacity",
            });
        }
        Ok(config)
    }
}

impl Default for DecoderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
