//! Which paths under the watch root are log files

use glob::Pattern;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::config::WatchConfig;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    max_depth: usize,
    extensions: Vec<String>,
    ignore: Vec<Pattern>,
}

impl WatchFilter {
    pub fn new(root: &Path, config: &WatchConfig) -> SyncResult<Self> {
        let ignore = config
            .ignore
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| SyncError::Config(format!("invalid ignore pattern '{}': {}", p, e)))
            })
            .collect::<SyncResult<Vec<_>>>()?;

        Ok(Self {
            root: root.to_path_buf(),
            max_depth: config.max_depth,
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Name- and depth-based check; works for paths that no longer exist.
    pub fn accepts(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };

        let depth = relative.components().count();
        if depth == 0 || depth > self.max_depth {
            return false;
        }

        // Hidden files and anything under a hidden directory
        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            return false;
        }

        let Some(name) = path.file_name().and_then(OsStr::to_str) else {
            return false;
        };
        if self.ignore.iter().any(|p| p.matches(name)) {
            return false;
        }

        path.extension()
            .and_then(OsStr::to_str)
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}
