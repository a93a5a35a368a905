//! Persistence for the local bookmark tree.
//!
//! Stores the tree and the `{id, version}` of the remote document it was last
//! synchronized with, so conditional writes survive restarts.

use anyhow::{Context, Result};
use bookmark_sync::{RemoteInfo, Root};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Everything the CLI keeps between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalState {
    pub root: Root,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteInfo>,
    /// Local edits not yet written to the remote document
    #[serde(default, skip_serializing_if = "is_false")]
    pub dirty: bool,
    /// Categories the last sync stopped on, until a sync goes through
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_conflicts: Vec<String>,
}

impl LocalState {
    /// Load state from disk. A missing file yields an empty tree.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state: LocalState = serde_json::from_str(&contents)
            .with_context(|| format!("Corrupt state file {}", path.display()))?;
        Ok(state)
    }

    /// Save state to disk, replacing the previous file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Remote document id this tree was last synchronized with.
    pub fn document_id(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.id.as_str())
    }

    pub fn has_open_conflict(&self) -> bool {
        !self.open_conflicts.is_empty()
    }

    /// Adopt a tree that now matches the remote document.
    pub fn synced(&mut self, root: Root, remote: RemoteInfo) {
        self.root = root;
        self.remote = Some(remote);
        self.dirty = false;
        self.open_conflicts.clear();
    }
}
