//! XDG-compliant path resolution and the on-disk layout of a store.
//!
//! A store root holds four directories:
//!
//! ```text
//! <root>/segments/   sealed accepted segments
//! <root>/rejects/    sealed reject segments
//! <root>/shards/     raw rows distributed by shard
//! <root>/index/      prefix index + manifest
//! ```

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

const APP_DIR: &str = "edgestore";

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(edgestore::paths::no_home),
        help("Set the HOME environment variable, or pass --data-dir explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(edgestore::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no store at {path}")]
    #[diagnostic(
        code(edgestore::paths::store_not_found),
        help("Create it with `edgestore init`, or point --data-dir at an existing store.")
    )]
    StoreNotFound { path: String },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Global XDG directories for edgestore.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// `$XDG_CONFIG_HOME/edgestore/`
    pub config_dir: PathBuf,
    /// `$XDG_DATA_HOME/edgestore/`
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join(APP_DIR);

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join(APP_DIR);

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// `config_dir/config.toml`
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Layout of the default store under the data directory.
    pub fn default_store(&self) -> StorePaths {
        StorePaths::new(&self.data_dir)
    }
}

/// Directory layout of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub root: PathBuf,
    pub segments_dir: PathBuf,
    pub rejects_dir: PathBuf,
    pub shards_dir: PathBuf,
    pub index_dir: PathBuf,
}

impl StorePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            segments_dir: root.join("segments"),
            rejects_dir: root.join("rejects"),
            shards_dir: root.join("shards"),
            index_dir: root.join("index"),
        }
    }

    /// Create all store directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [
            &self.root,
            &self.segments_dir,
            &self.rejects_dir,
            &self.shards_dir,
            &self.index_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Whether `init` has run here.
    pub fn exists(&self) -> bool {
        self.segments_dir.is_dir() && self.index_dir.is_dir()
    }

    /// Fail with [`PathError::StoreNotFound`] unless the store exists.
    pub fn require(&self) -> PathResult<&Self> {
        if self.exists() {
            Ok(self)
        } else {
            Err(PathError::StoreNotFound {
                path: self.root.display().to_string(),
            })
        }
    }

    /// `root/store.toml`
    pub fn config_file(&self) -> PathBuf {
        self.root.join("store.toml")
    }
}
