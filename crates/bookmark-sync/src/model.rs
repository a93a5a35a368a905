//! Bookmark tree: the immutable value model (Root → Category → Bundle → Bookmark).
//!
//! Children are held behind `Arc` so that a new tree produced by a mutation
//! shares every untouched subtree with the tree it was derived from. Nothing
//! in here has interior mutability; to change a tree, clone it (cheap) and
//! use `Arc::make_mut` on the path to the node being changed.
//!
//! Deleted nodes are kept as tombstones (`is_deleted`) until they are settled
//! by a conflict-free merge or an explicit compaction, so a concurrent edit
//! against a deleted node is still visible to the merge.

use crate::BookmarkId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// The only tree format version understood by this crate.
pub const TREE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unsupported tree version: {0}")]
    UnsupportedVersion(u32),

    #[error("Duplicate category: {0}")]
    DuplicateCategory(String),

    #[error("Duplicate bundle '{bundle}' in category '{category}'")]
    DuplicateBundle { category: String, bundle: String },

    #[error("Duplicate bookmark id: {0}")]
    DuplicateBookmark(BookmarkId),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Per-node bookkeeping used by the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    /// Milliseconds since epoch of the last mutation of this node
    pub last_modified: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<u64>,
    /// Tombstone marker
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_deleted: bool,
    /// Name this node had at the last synchronization (categories only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl NodeMetadata {
    pub fn modified_at(millis: u64) -> Self {
        Self {
            last_modified: millis,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootMetadata {
    pub last_modified: u64,
    /// Last successful synchronization with the remote document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<u64>,
}

/// Shared accessors for nodes carrying `NodeMetadata`.
pub trait TreeNode {
    fn metadata(&self) -> Option<&NodeMetadata>;

    fn is_deleted(&self) -> bool {
        self.metadata().is_some_and(|m| m.is_deleted)
    }

    /// `last_modified` of this node alone, 0 when unknown.
    fn last_modified(&self) -> u64 {
        self.metadata().map_or(0, |m| m.last_modified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: BookmarkId,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeMetadata>,
}

impl TreeNode for Bookmark {
    fn metadata(&self) -> Option<&NodeMetadata> {
        self.metadata.as_ref()
    }
}

impl Bookmark {
    /// Equality of user-visible content, ignoring metadata.
    pub fn same_content(&self, other: &Bookmark) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.url == other.url
            && self.tags == other.tags
            && self.notes == other.notes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub name: String,
    #[serde(default)]
    pub bookmarks: Vec<Arc<Bookmark>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeMetadata>,
}

impl TreeNode for Bundle {
    fn metadata(&self) -> Option<&NodeMetadata> {
        self.metadata.as_ref()
    }
}

impl Bundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bookmarks: Vec::new(),
            metadata: None,
        }
    }

    pub fn live_bookmarks(&self) -> impl Iterator<Item = &Arc<Bookmark>> {
        self.bookmarks.iter().filter(|b| !b.is_deleted())
    }

    pub fn bookmark(&self, id: &BookmarkId) -> Option<&Arc<Bookmark>> {
        self.live_bookmarks().find(|b| &b.id == id)
    }

    /// Latest `last_modified` anywhere in this bundle, tombstones included.
    pub fn latest_change(&self) -> u64 {
        self.bookmarks
            .iter()
            .map(|b| b.last_modified())
            .fold(self.last_modified(), u64::max)
    }

    pub fn same_content(&self, other: &Bundle) -> bool {
        match (self.is_deleted(), other.is_deleted()) {
            (true, true) => true,
            (false, false) => {
                self.name == other.name
                    && same_live(
                        self.live_bookmarks(),
                        other.live_bookmarks(),
                        Bookmark::same_content,
                    )
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub bundles: Vec<Arc<Bundle>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeMetadata>,
}

impl TreeNode for Category {
    fn metadata(&self) -> Option<&NodeMetadata> {
        self.metadata.as_ref()
    }
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bundles: Vec::new(),
            metadata: None,
        }
    }

    pub fn live_bundles(&self) -> impl Iterator<Item = &Arc<Bundle>> {
        self.bundles.iter().filter(|b| !b.is_deleted())
    }

    pub fn bundle(&self, name: &str) -> Option<&Arc<Bundle>> {
        self.live_bundles().find(|b| b.name == name)
    }

    /// Name this category is matched by during a merge.
    ///
    /// A category renamed since the last synchronization is still known to
    /// other clients by its old name.
    pub fn sync_key(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.renamed_from.as_deref())
            .unwrap_or(&self.name)
    }

    /// Latest `last_modified` anywhere in this category's subtree.
    pub fn latest_change(&self) -> u64 {
        self.bundles
            .iter()
            .map(|b| b.latest_change())
            .fold(self.last_modified(), u64::max)
    }

    pub fn same_content(&self, other: &Category) -> bool {
        match (self.is_deleted(), other.is_deleted()) {
            (true, true) => true,
            (false, false) => {
                self.name == other.name
                    && same_live(self.live_bundles(), other.live_bundles(), Bundle::same_content)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    pub version: u32,
    #[serde(default)]
    pub categories: Vec<Arc<Category>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RootMetadata>,
}

impl Default for Root {
    fn default() -> Self {
        Self::empty()
    }
}

impl Root {
    pub fn empty() -> Self {
        Self {
            version: TREE_VERSION,
            categories: Vec::new(),
            metadata: None,
        }
    }

    pub fn live_categories(&self) -> impl Iterator<Item = &Arc<Category>> {
        self.categories.iter().filter(|c| !c.is_deleted())
    }

    pub fn category(&self, name: &str) -> Option<&Arc<Category>> {
        self.live_categories().find(|c| c.name == name)
    }

    pub fn last_sync(&self) -> Option<u64> {
        self.metadata.as_ref().and_then(|m| m.last_sync)
    }

    pub fn last_modified(&self) -> u64 {
        self.metadata.as_ref().map_or(0, |m| m.last_modified)
    }

    /// Structural equality of the live trees, ignoring metadata and tombstones.
    pub fn same_content(&self, other: &Root) -> bool {
        same_live(
            self.live_categories(),
            other.live_categories(),
            Category::same_content,
        )
    }

    /// Return a tree that is guaranteed to carry root metadata.
    pub fn with_metadata(&self, now: u64) -> Root {
        if self.metadata.is_some() {
            return self.clone();
        }
        Root {
            metadata: Some(RootMetadata {
                last_modified: now,
                last_sync: None,
            }),
            ..self.clone()
        }
    }

    /// Record a successful synchronization at `now`.
    ///
    /// Sets `last_sync` on the root and `last_synced` on every live bookmark.
    pub fn mark_synced(&self, now: u64) -> Root {
        let mut next = self.with_metadata(now);
        if let Some(meta) = next.metadata.as_mut() {
            meta.last_sync = Some(now);
        }
        for category in next.categories.iter_mut().filter(|c| !c.is_deleted()) {
            let category = Arc::make_mut(category);
            for bundle in category.bundles.iter_mut().filter(|b| !b.is_deleted()) {
                let bundle = Arc::make_mut(bundle);
                for bookmark in bundle.bookmarks.iter_mut().filter(|b| !b.is_deleted()) {
                    let bookmark = Arc::make_mut(bookmark);
                    bookmark
                        .metadata
                        .get_or_insert_with(NodeMetadata::default)
                        .last_synced = Some(now);
                }
            }
        }
        next
    }

    /// Drop tombstones and clear rename origins whose last change is at or
    /// before `cutoff`. With `None` every marker is settled.
    pub fn settled(&self, cutoff: Option<u64>) -> Root {
        let is_settled = |t: u64| cutoff.is_none_or(|c| t <= c);
        let mut next = self.clone();
        next.categories
            .retain(|c| !(c.is_deleted() && is_settled(c.latest_change())));
        for category in &mut next.categories {
            settle_category(category, &is_settled);
        }
        next
    }

    /// Check the structural invariants of a tree loaded from elsewhere.
    pub fn validate(&self) -> Result<()> {
        if self.version != TREE_VERSION {
            return Err(ValidationError::UnsupportedVersion(self.version));
        }

        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        let mut ids = HashSet::new();
        for category in &self.categories {
            if !names.insert(category.name.as_str()) {
                return Err(ValidationError::DuplicateCategory(category.name.clone()));
            }
            if !keys.insert(category.sync_key()) {
                return Err(ValidationError::DuplicateCategory(
                    category.sync_key().to_string(),
                ));
            }

            let mut bundle_names = HashSet::new();
            for bundle in &category.bundles {
                if !bundle_names.insert(bundle.name.as_str()) {
                    return Err(ValidationError::DuplicateBundle {
                        category: category.name.clone(),
                        bundle: bundle.name.clone(),
                    });
                }
                if category.is_deleted() || bundle.is_deleted() {
                    continue;
                }
                for bookmark in bundle.live_bookmarks() {
                    if !ids.insert(&bookmark.id) {
                        return Err(ValidationError::DuplicateBookmark(bookmark.id.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn settle_category(category: &mut Arc<Category>, is_settled: &impl Fn(u64) -> bool) {
    let settled_bundle = |b: &Arc<Bundle>| b.is_deleted() && is_settled(b.latest_change());
    let settled_bookmark = |b: &Arc<Bookmark>| b.is_deleted() && is_settled(b.last_modified());

    let stale_origin = category
        .metadata
        .as_ref()
        .is_some_and(|m| m.renamed_from.is_some())
        && is_settled(category.latest_change());
    let has_tombstones = category
        .bundles
        .iter()
        .any(|b| settled_bundle(b) || b.bookmarks.iter().any(settled_bookmark));
    if !stale_origin && !has_tombstones {
        return;
    }

    let category = Arc::make_mut(category);
    if stale_origin {
        if let Some(meta) = category.metadata.as_mut() {
            meta.renamed_from = None;
        }
    }
    category.bundles.retain(|b| !settled_bundle(b));
    for bundle in &mut category.bundles {
        if bundle.bookmarks.iter().any(settled_bookmark) {
            Arc::make_mut(bundle)
                .bookmarks
                .retain(|b| !settled_bookmark(b));
        }
    }
}

fn same_live<'a, T: 'a>(
    mut a: impl Iterator<Item = &'a Arc<T>>,
    mut b: impl Iterator<Item = &'a Arc<T>>,
    eq: impl Fn(&T, &T) -> bool,
) -> bool {
    loop {
        match (a.next(), b.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if eq(&**x, &**y) => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bookmark(id: &str, title: &str) -> Arc<Bookmark> {
        Arc::new(Bookmark {
            id: id.parse().unwrap(),
            title: title.into(),
            url: format!("https://example.com/{}", id),
            tags: vec![],
            notes: None,
            metadata: Some(NodeMetadata::modified_at(10)),
        })
    }

    fn tombstone(mut meta: NodeMetadata, at: u64) -> Option<NodeMetadata> {
        meta.is_deleted = true;
        meta.last_modified = at;
        Some(meta)
    }

    fn sample() -> Root {
        let bundle = Bundle {
            name: "Rust".into(),
            bookmarks: vec![bookmark("a", "Book"), bookmark("b", "Blog")],
            metadata: Some(NodeMetadata::modified_at(10)),
        };
        let category = Category {
            name: "Dev".into(),
            bundles: vec![Arc::new(bundle)],
            metadata: Some(NodeMetadata::modified_at(5)),
        };
        Root {
            version: TREE_VERSION,
            categories: vec![Arc::new(category)],
            metadata: None,
        }
    }

    #[test]
    fn test_latest_change_covers_subtree() {
        let root = sample();
        assert_eq!(root.categories[0].last_modified(), 5);
        assert_eq!(root.categories[0].latest_change(), 10);
    }

    #[test]
    fn test_same_content_ignores_metadata_and_tombstones() {
        let a = sample();
        let mut b = sample();
        let category = Arc::make_mut(&mut b.categories[0]);
        category.metadata = Some(NodeMetadata::modified_at(999));
        let bundle = Arc::make_mut(&mut category.bundles[0]);
        bundle.bookmarks.push(Arc::new(Bookmark {
            metadata: tombstone(NodeMetadata::default(), 50),
            ..(*bookmark("c", "Gone")).clone()
        }));
        assert!(a.same_content(&b));

        let bundle = Arc::make_mut(&mut Arc::make_mut(&mut b.categories[0]).bundles[0]);
        Arc::make_mut(&mut bundle.bookmarks[0]).title = "Changed".into();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_clone_and_make_mut_leave_original_untouched() {
        let original = sample();
        let mut next = original.clone();
        Arc::make_mut(&mut next.categories[0]).name = "Ops".into();
        assert_eq!(original.categories[0].name, "Dev");
        assert_eq!(next.categories[0].name, "Ops");
        // Untouched subtrees stay shared
        assert!(Arc::ptr_eq(
            &original.categories[0].bundles[0],
            &next.categories[0].bundles[0]
        ));
    }

    #[test]
    fn test_sync_key_prefers_rename_origin() {
        let mut category = Category::new("Y");
        assert_eq!(category.sync_key(), "Y");
        category.metadata = Some(NodeMetadata {
            renamed_from: Some("X".into()),
            ..NodeMetadata::modified_at(1)
        });
        assert_eq!(category.sync_key(), "X");
    }

    #[test]
    fn test_settled_drops_old_tombstones_only() {
        let mut root = sample();
        let mut old = Category::new("Old");
        old.metadata = tombstone(NodeMetadata::default(), 20);
        let mut fresh = Category::new("Fresh");
        fresh.metadata = tombstone(NodeMetadata::default(), 80);
        root.categories.push(Arc::new(old));
        root.categories.push(Arc::new(fresh));

        let settled = root.settled(Some(50));
        let names: Vec<_> = settled.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Dev", "Fresh"]);

        let compacted = root.settled(None);
        assert_eq!(compacted.categories.len(), 1);
    }

    #[test]
    fn test_settled_clears_rename_origin_and_nested_tombstones() {
        let mut root = sample();
        let category = Arc::make_mut(&mut root.categories[0]);
        category.metadata = Some(NodeMetadata {
            renamed_from: Some("Development".into()),
            ..NodeMetadata::modified_at(30)
        });
        let bundle = Arc::make_mut(&mut category.bundles[0]);
        let removed = Arc::make_mut(&mut bundle.bookmarks[1]);
        removed.metadata = tombstone(NodeMetadata::default(), 40);

        let settled = root.settled(Some(50));
        assert_eq!(settled.categories[0].sync_key(), "Dev");
        assert_eq!(settled.categories[0].bundles[0].bookmarks.len(), 1);
        // Original keeps its markers
        assert_eq!(root.categories[0].sync_key(), "Development");
    }

    #[test]
    fn test_mark_synced_stamps_root_and_bookmarks() {
        let root = sample().mark_synced(500);
        assert_eq!(root.last_sync(), Some(500));
        let bookmark = &root.categories[0].bundles[0].bookmarks[0];
        assert_eq!(bookmark.metadata.as_ref().unwrap().last_synced, Some(500));
        assert_eq!(bookmark.last_modified(), 10);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        assert!(sample().validate().is_ok());

        let mut dup_category = sample();
        dup_category
            .categories
            .push(Arc::new(Category::new("Dev")));
        assert_eq!(
            dup_category.validate(),
            Err(ValidationError::DuplicateCategory("Dev".into()))
        );

        let mut dup_id = sample();
        let category = Arc::make_mut(&mut dup_id.categories[0]);
        let mut other = Bundle::new("Other");
        other.bookmarks.push(bookmark("a", "Copy"));
        category.bundles.push(Arc::new(other));
        assert!(matches!(
            dup_id.validate(),
            Err(ValidationError::DuplicateBookmark(_))
        ));

        let mut wrong_version = sample();
        wrong_version.version = 2;
        assert_eq!(
            wrong_version.validate(),
            Err(ValidationError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_serde_roundtrip_json() {
        let root = sample().with_metadata(7);
        let json = serde_json::to_string(&root).unwrap();
        assert!(json.contains("\"lastModified\":7"));
        let back: Root = serde_json::from_str(&json).unwrap();
        assert_eq!(back, root);
    }
}
