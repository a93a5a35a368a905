//! Three-way merge of two bookmark trees at category granularity.
//!
//! The common ancestor is not stored; instead each category's latest change
//! time is compared with the local `last_sync` to tell which side touched it.
//! Categories are matched by their sync key, so a rename on one side still
//! pairs with the original name on the other.

use crate::model::{Category, Root, RootMetadata, TreeNode, TREE_VERSION};
use crate::BookmarkId;

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("Unresolved conflicts in: {}", .0.join(", "))]
    Unresolved(Vec<String>),
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Which version of a conflicting category to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Local,
    Remote,
}

/// Chosen side per conflicting category, keyed by `MergeConflict::category`.
pub type Resolutions = HashMap<String, Side>;

/// A category changed differently on both sides since the last sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    /// Sync key of the category (its name at the last sync)
    pub category: String,
    pub local: Arc<Category>,
    pub remote: Arc<Category>,
    pub local_last_modified: u64,
    pub remote_last_modified: u64,
}

impl MergeConflict {
    /// Whether one side deleted the category.
    pub fn is_delete_vs_modify(&self) -> bool {
        self.local.is_deleted() != self.remote.is_deleted()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Merged tree, without the conflicting categories
    pub merged: Root,
    pub conflicts: Vec<MergeConflict>,
}

impl MergeResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn conflict_names(&self) -> Vec<String> {
        self.conflicts.iter().map(|c| c.category.clone()).collect()
    }
}

/// Merge `local` and `remote`, where `last_sync` is the local tree's last
/// successful synchronization (0 if it never synced).
pub fn merge(local: &Root, remote: &Root, last_sync: u64) -> MergeResult {
    merge_with(local, remote, last_sync, |_| None)
}

/// Merge like [`merge`], settling every conflict with the given resolutions.
///
/// Resolutions naming categories that are not in conflict are ignored.
pub fn resolve_conflicts(
    local: &Root,
    remote: &Root,
    last_sync: u64,
    resolutions: &Resolutions,
) -> Result<Root> {
    let mut used = HashSet::new();
    let result = merge_with(local, remote, last_sync, |conflict| {
        let side = resolutions.get(&conflict.category).copied();
        if side.is_some() {
            used.insert(conflict.category.clone());
        }
        side
    });

    if result.has_conflicts() {
        return Err(MergeError::Unresolved(result.conflict_names()));
    }
    for name in resolutions.keys().filter(|name| !used.contains(*name)) {
        debug!("Ignoring resolution for non-conflicting category '{}'", name);
    }
    Ok(result.merged)
}

enum Outcome {
    Take(Arc<Category>),
    Drop,
    Conflict(MergeConflict),
}

fn merge_with(
    local: &Root,
    remote: &Root,
    last_sync: u64,
    mut choose: impl FnMut(&MergeConflict) -> Option<Side>,
) -> MergeResult {
    let remote_by_key: HashMap<&str, &Arc<Category>> = remote
        .categories
        .iter()
        .map(|c| (c.sync_key(), c))
        .collect();
    let local_keys: HashSet<&str> = local.categories.iter().map(|c| c.sync_key()).collect();

    let outcomes = local
        .categories
        .iter()
        .map(|l| match remote_by_key.get(l.sync_key()) {
            Some(r) => merge_category(l, r, last_sync),
            None => one_sided(l, last_sync),
        })
        .chain(
            remote
                .categories
                .iter()
                .filter(|r| !local_keys.contains(r.sync_key()))
                .map(|r| one_sided(r, last_sync)),
        );

    let mut categories = Vec::new();
    let mut conflicts = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Take(category) => categories.push(category),
            Outcome::Drop => {}
            Outcome::Conflict(conflict) => match choose(&conflict) {
                Some(Side::Local) => categories.push(conflict.local),
                Some(Side::Remote) => categories.push(conflict.remote),
                None => conflicts.push(conflict),
            },
        }
    }

    drop_stale_copies(&mut categories);

    let metadata = match (&local.metadata, &remote.metadata) {
        (None, None) => None,
        _ => Some(RootMetadata {
            last_modified: local.last_modified().max(remote.last_modified()),
            last_sync: local.last_sync(),
        }),
    };
    let merged = Root {
        version: TREE_VERSION,
        categories,
        metadata,
    }
    .settled(Some(last_sync));

    if !conflicts.is_empty() {
        debug!(
            "Merge left {} conflicting categories: {:?}",
            conflicts.len(),
            conflicts.iter().map(|c| &c.category).collect::<Vec<_>>()
        );
    }
    MergeResult { merged, conflicts }
}

/// A category present on only one side.
fn one_sided(category: &Arc<Category>, last_sync: u64) -> Outcome {
    if category.is_deleted() && category.latest_change() <= last_sync {
        Outcome::Drop
    } else {
        Outcome::Take(category.clone())
    }
}

/// Keep only the newest live copy of a bookmark that ended up in more than
/// one category, as happens when a moved bookmark's source and destination
/// are taken from different sides.
fn drop_stale_copies(categories: &mut [Arc<Category>]) {
    let mut newest: HashMap<BookmarkId, (u64, [usize; 3])> = HashMap::new();
    let mut stale = Vec::new();
    for (c, category) in categories.iter().enumerate().filter(|(_, c)| !c.is_deleted()) {
        for (b, bundle) in category.bundles.iter().enumerate().filter(|(_, b)| !b.is_deleted()) {
            for (k, bookmark) in bundle.bookmarks.iter().enumerate() {
                if bookmark.is_deleted() {
                    continue;
                }
                let here = (bookmark.last_modified(), [c, b, k]);
                match newest.entry(bookmark.id.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(here);
                    }
                    Entry::Occupied(mut slot) if here.0 > slot.get().0 => {
                        stale.push(slot.insert(here).1);
                    }
                    Entry::Occupied(_) => stale.push(here.1),
                }
            }
        }
    }

    // Back to front so the remaining positions stay valid
    stale.sort_unstable();
    for [c, b, k] in stale.into_iter().rev() {
        let category = Arc::make_mut(&mut categories[c]);
        let name = category.name.clone();
        let bundle = Arc::make_mut(&mut category.bundles[b]);
        let dropped = bundle.bookmarks.remove(k);
        debug!(
            "Dropped stale copy of bookmark {} from '{}/{}'",
            dropped.id, name, bundle.name
        );
    }
}

fn merge_category(local: &Arc<Category>, remote: &Arc<Category>, last_sync: u64) -> Outcome {
    let local_at = local.latest_change();
    let remote_at = remote.latest_change();

    match (local_at > last_sync, remote_at > last_sync) {
        (false, false) => Outcome::Take(remote.clone()),
        (true, false) => Outcome::Take(local.clone()),
        (false, true) => Outcome::Take(remote.clone()),
        (true, true) if local.same_content(remote) => {
            if remote_at > local_at {
                Outcome::Take(remote.clone())
            } else {
                Outcome::Take(local.clone())
            }
        }
        (true, true) => Outcome::Conflict(MergeConflict {
            category: local.sync_key().to_string(),
            local: local.clone(),
            remote: remote.clone(),
            local_last_modified: local_at,
            remote_last_modified: remote_at,
        }),
    }
}
