//! Store configuration, persisted as TOML.
//!
//! Every field has a serde default, so a config file only needs the values
//! it changes and a missing file means "all defaults".

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::combine::ConceptFilter;
use crate::error::{ConfigError, ConfigResult};
use crate::index::BackendKind;
use crate::segment::DEFAULT_SHARD_COUNT;

/// Languages whose concepts the combiner keeps.
const COMMON_LANGUAGES: &[&str] = &[
    "en", "fr", "de", "it", "es", "ru", "pt", "ja", "zh", "nl", "fi", "pl", "bg", "sv", "cs", "sh",
    "sl", "ar", "ca", "hu", "se", "is", "ro", "el", "lv", "ms", "tr", "da", "ga", "vi", "ko", "hy",
    "gl", "oc", "fo", "gd", "fa", "ast", "hsb", "ka", "he", "no", "sq", "mg", "nrf", "sk", "lt",
    "et", "te", "mk", "nv", "hi", "ur", "af", "sa", "th", "fil", "eu", "rup", "uk", "cy", "be",
    "ta", "ku", "az", "kk", "sw", "la", "grc", "xcl", "fro", "ang", "non", "gv", "mul", "eo",
    "io", "vo",
];

/// Placeholder names that never make a useful node.
const BAD_NAMES: &[&str] = &[
    "something", "someone", "somebody", "anything", "anyone", "nothing", "-", "?",
];

pub fn default_languages() -> Vec<String> {
    COMMON_LANGUAGES.iter().map(|s| s.to_string()).collect()
}

pub fn default_deny_list() -> Vec<String> {
    BAD_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_segment_base() -> String {
    "assertions".into()
}
fn default_shard_count() -> u32 {
    DEFAULT_SHARD_COUNT
}
fn default_segment_capacity() -> usize {
    1_000_000
}
fn default_segments_per_shard() -> u32 {
    1_000
}
fn default_index_batch_size() -> usize {
    100_000
}

/// Settings for building and serving one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store root; `None` means the XDG data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// File name stem of accepted segments.
    #[serde(default = "default_segment_base")]
    pub segment_base: String,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Records per segment.
    #[serde(default = "default_segment_capacity")]
    pub segment_capacity: usize,
    /// Segment ids reserved for each shard; shard `k` writes ids
    /// `k * segments_per_shard ..`.
    #[serde(default = "default_segments_per_shard")]
    pub segments_per_shard: u32,
    #[serde(default)]
    pub index_backend: BackendKind,
    /// Index entries per write transaction.
    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_deny_list")]
    pub deny_list: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            segment_base: default_segment_base(),
            shard_count: default_shard_count(),
            segment_capacity: default_segment_capacity(),
            segments_per_shard: default_segments_per_shard(),
            index_backend: BackendKind::default(),
            index_batch_size: default_index_batch_size(),
            languages: default_languages(),
            deny_list: default_deny_list(),
        }
    }
}

impl StoreConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let write_err = |e: std::io::Error| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            field: "<root>".into(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(write_err)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |field: &str, message: &str| ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        };
        if self.segment_base.is_empty() || self.segment_base.contains(['/', '\\']) {
            return Err(invalid("segment_base", "must be a non-empty file name stem"));
        }
        if self.shard_count == 0 {
            return Err(invalid("shard_count", "must be at least 1"));
        }
        if self.segment_capacity == 0 {
            return Err(invalid("segment_capacity", "must be at least 1"));
        }
        if self.segments_per_shard == 0 {
            return Err(invalid("segments_per_shard", "must be at least 1"));
        }
        if self.shard_count.checked_mul(self.segments_per_shard).is_none() {
            return Err(invalid(
                "segments_per_shard",
                "shard_count * segments_per_shard must fit in a 32-bit segment id",
            ));
        }
        if self.index_batch_size == 0 {
            return Err(invalid("index_batch_size", "must be at least 1"));
        }
        Ok(())
    }

    /// Segment ids shard `shard` may write, first to last.
    pub fn shard_segments(&self, shard: u32) -> std::ops::RangeInclusive<u32> {
        let first = shard.saturating_mul(self.segments_per_shard);
        first..=first.saturating_add(self.segments_per_shard.max(1) - 1)
    }

    /// The combiner's validity predicate for these settings.
    pub fn concept_filter(&self) -> ConceptFilter {
        ConceptFilter::new(self.languages.iter().cloned(), self.deny_list.iter().cloned())
    }
}
