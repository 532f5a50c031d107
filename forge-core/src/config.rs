use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ForgeResult;

/// Backend implementation selected for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Git,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub kind: BackendKind,
    pub path: Option<PathBuf>,
    /// Prefix prepended to commit links, e.g. `/p/project/code/`
    pub url_prefix: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Git,
            path: None,
            url_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum commits fetched for one graph; 0 means unbounded
    pub fetch_limit: usize,
    pub short_id_len: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 2000,
            short_id_len: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub page_size: usize,
    pub log_page_size: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            log_page_size: 25,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Seconds a ready/error status is kept; 0 keeps it forever
    pub status_ttl_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: 3600,
        }
    }
}

impl TaskConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.status_ttl_secs > 0).then(|| Duration::from_secs(self.status_ttl_secs))
    }
}

/// Top-level configuration, usually read from `forge-scm.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub repository: RepositoryConfig,
    pub graph: GraphConfig,
    pub diff: DiffConfig,
    pub archive: ArchiveConfig,
    pub tasks: TaskConfig,
}

impl ForgeConfig {
    pub fn load(path: &Path) -> ForgeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ForgeResult<Self> {
        Ok(toml::from_str(content)?)
    }
}
