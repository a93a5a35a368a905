//! TreeEntity: pure mutation API over the bookmark tree.
//!
//! Every operation takes the current `Root` by reference and returns either a
//! brand-new `Root` or a typed failure. Work happens on a cheap clone of the
//! input; on failure that clone is simply dropped, so the caller's tree is
//! never partially mutated.
//!
//! Each successful mutation stamps `last_modified` on the node it touched and
//! on nothing above it. Removals leave tombstones behind instead of dropping
//! nodes.

use crate::clock::{Clock, SystemClock};
use crate::model::{Bookmark, Bundle, Category, NodeMetadata, Root, TreeNode};
use crate::search::{Search, SearchFilter, Stats};
use crate::BookmarkId;

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Duplicate(String),
}

pub type Result<T> = std::result::Result<T, EntityError>;

/// Fields for a bookmark that does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookmarkDraft {
    pub title: String,
    pub url: String,
    pub tags: Vec<String>,
    pub notes: Option<String>,
}

impl BookmarkDraft {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Partial update for an existing bookmark. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookmarkPatch {
    pub title: Option<String>,
    pub url: Option<String>,
    pub tags: Option<Vec<String>>,
    /// `Some(None)` clears the notes
    pub notes: Option<Option<String>>,
}

/// Mutation and query entry point for bookmark trees.
#[derive(Clone)]
pub struct TreeEntity {
    clock: Arc<dyn Clock>,
}

impl Default for TreeEntity {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl TreeEntity {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    // ------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------

    pub fn add_category(&self, root: &Root, name: &str) -> Result<Root> {
        let name = clean_name("category", name)?;
        if root.category(&name).is_some() || is_pending_origin(root, &name, None) {
            return Err(EntityError::Duplicate(format!("category '{}'", name)));
        }

        let now = self.now();
        let mut category = Category::new(name.clone());
        category.metadata = Some(NodeMetadata::modified_at(now));

        let mut next = root.clone();
        match next
            .categories
            .iter()
            .position(|c| c.is_deleted() && c.name == name)
        {
            // Re-adding a deleted name revives it in place
            Some(idx) => {
                let previous = next.categories[idx].last_modified();
                category.metadata = Some(NodeMetadata::modified_at(now.max(previous + 1)));
                next.categories[idx] = Arc::new(category);
            }
            None => next.categories.push(Arc::new(category)),
        }
        Ok(next)
    }

    pub fn remove_category(&self, root: &Root, name: &str) -> Result<Root> {
        let mut next = root.clone();
        let idx = live_category_index(&next, name)?;
        let category = Arc::make_mut(&mut next.categories[idx]);
        self.bury(&mut category.metadata);
        Ok(next)
    }

    pub fn rename_category(&self, root: &Root, old: &str, new: &str) -> Result<Root> {
        let idx = live_category_index(root, old)?;
        let new = clean_name("category", new)?;
        if new == old {
            return Ok(root.clone());
        }
        if root.category(&new).is_some() || is_pending_origin(root, &new, Some(idx)) {
            return Err(EntityError::Duplicate(format!("category '{}'", new)));
        }

        let mut next = root.clone();
        // A deleted category with the target name is replaced
        let buried = next
            .categories
            .iter()
            .position(|c| c.is_deleted() && c.name == new);
        let buried_at = buried.map_or(0, |i| next.categories[i].latest_change());

        let category = Arc::make_mut(&mut next.categories[idx]);
        let origin = category.sync_key().to_string();
        category.name = new.clone();
        self.stamp_after(&mut category.metadata, buried_at);
        if let Some(meta) = category.metadata.as_mut() {
            meta.renamed_from = (origin != new).then_some(origin);
        }
        if let Some(i) = buried {
            next.categories.remove(i);
        }
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Bundles
    // ------------------------------------------------------------------

    pub fn add_bundle(&self, root: &Root, category: &str, name: &str) -> Result<Root> {
        let name = clean_name("bundle", name)?;
        let mut next = root.clone();
        let now = self.now();
        let cat = category_mut(&mut next, category)?;
        if cat.bundle(&name).is_some() {
            return Err(EntityError::Duplicate(format!(
                "bundle '{}' in '{}'",
                name, category
            )));
        }

        let mut bundle = Bundle::new(name.clone());
        match cat
            .bundles
            .iter()
            .position(|b| b.is_deleted() && b.name == name)
        {
            Some(idx) => {
                let previous = cat.bundles[idx].last_modified();
                bundle.metadata = Some(NodeMetadata::modified_at(now.max(previous + 1)));
                cat.bundles[idx] = Arc::new(bundle);
            }
            None => {
                bundle.metadata = Some(NodeMetadata::modified_at(now));
                cat.bundles.push(Arc::new(bundle));
            }
        }
        Ok(next)
    }

    pub fn remove_bundle(&self, root: &Root, category: &str, name: &str) -> Result<Root> {
        let mut next = root.clone();
        let bundle = bundle_mut(&mut next, category, name)?;
        self.bury(&mut bundle.metadata);
        Ok(next)
    }

    pub fn rename_bundle(&self, root: &Root, category: &str, old: &str, new: &str) -> Result<Root> {
        let new = clean_name("bundle", new)?;
        let mut next = root.clone();
        let cat = category_mut(&mut next, category)?;
        let idx = cat
            .bundles
            .iter()
            .position(|b| !b.is_deleted() && b.name == old)
            .ok_or_else(|| EntityError::NotFound(format!("bundle '{}' in '{}'", old, category)))?;
        if new == old {
            return Ok(root.clone());
        }
        if cat.bundle(&new).is_some() {
            return Err(EntityError::Duplicate(format!(
                "bundle '{}' in '{}'",
                new, category
            )));
        }

        let buried = cat
            .bundles
            .iter()
            .position(|b| b.is_deleted() && b.name == new);
        let buried_at = buried.map_or(0, |i| cat.bundles[i].latest_change());

        let bundle = Arc::make_mut(&mut cat.bundles[idx]);
        bundle.name = new;
        self.stamp_after(&mut bundle.metadata, buried_at);
        if let Some(i) = buried {
            cat.bundles.remove(i);
        }
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Bookmarks
    // ------------------------------------------------------------------

    pub fn add_bookmark(
        &self,
        root: &Root,
        category: &str,
        bundle: &str,
        draft: BookmarkDraft,
    ) -> Result<Root> {
        self.add_bookmarks(root, category, bundle, [draft])
    }

    /// Add several bookmarks at once. Either all are added or none.
    pub fn add_bookmarks(
        &self,
        root: &Root,
        category: &str,
        bundle: &str,
        drafts: impl IntoIterator<Item = BookmarkDraft>,
    ) -> Result<Root> {
        let now = self.now();
        let bookmarks = drafts
            .into_iter()
            .map(|draft| {
                let mut bookmark = validated_bookmark(draft)?;
                bookmark.metadata = Some(NodeMetadata::modified_at(now));
                Ok(Arc::new(bookmark))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut next = root.clone();
        bundle_mut(&mut next, category, bundle)?
            .bookmarks
            .extend(bookmarks);
        Ok(next)
    }

    pub fn update_bookmark(
        &self,
        root: &Root,
        category: &str,
        bundle: &str,
        id: &BookmarkId,
        patch: BookmarkPatch,
    ) -> Result<Root> {
        let mut next = root.clone();
        let target = bookmark_mut(&mut next, category, bundle, id)?;

        let mut updated = target.clone();
        if let Some(title) = patch.title {
            updated.title = title;
        }
        if let Some(url) = patch.url {
            updated.url = url;
        }
        if let Some(tags) = patch.tags {
            updated.tags = tags;
        }
        if let Some(notes) = patch.notes {
            updated.notes = notes;
        }
        let mut updated = validated_bookmark(BookmarkDraft {
            title: updated.title,
            url: updated.url,
            tags: updated.tags,
            notes: updated.notes,
        })
        .map(|b| Bookmark {
            id: target.id.clone(),
            metadata: target.metadata.clone(),
            ..b
        })?;
        self.stamp(&mut updated.metadata);
        *target = updated;
        Ok(next)
    }

    pub fn remove_bookmark(
        &self,
        root: &Root,
        category: &str,
        bundle: &str,
        id: &BookmarkId,
    ) -> Result<Root> {
        let mut next = root.clone();
        let target = bookmark_mut(&mut next, category, bundle, id)?;
        self.bury(&mut target.metadata);
        Ok(next)
    }

    /// Move a bookmark to another bundle, keeping its id.
    ///
    /// The source keeps a tombstone so the move is visible to a merge of the
    /// source category.
    pub fn move_bookmark(
        &self,
        root: &Root,
        id: &BookmarkId,
        to_category: &str,
        to_bundle: &str,
    ) -> Result<Root> {
        let (from_category, from_bundle) = root
            .live_categories()
            .flat_map(|c| c.live_bundles().map(move |b| (c, b)))
            .find(|(_, b)| b.bookmark(id).is_some())
            .map(|(c, b)| (c.name.clone(), b.name.clone()))
            .ok_or_else(|| EntityError::NotFound(format!("bookmark {}", id)))?;
        if from_category == to_category && from_bundle == to_bundle {
            return Ok(root.clone());
        }

        let mut next = root.clone();
        // Resolve the target first so a bad destination fails before any change
        bundle_mut(&mut next, to_category, to_bundle)?;

        let source = bookmark_mut(&mut next, &from_category, &from_bundle, id)?;
        let mut moved = source.clone();
        self.bury(&mut source.metadata);
        moved.metadata = None;
        self.stamp(&mut moved.metadata);

        bundle_mut(&mut next, to_category, to_bundle)?
            .bookmarks
            .push(Arc::new(moved));
        Ok(next)
    }

    /// Physically remove every tombstone and forget pending rename origins.
    pub fn compact(&self, root: &Root) -> Root {
        root.settled(None)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Lazily iterate over live bookmarks matching `filter`.
    ///
    /// The returned iterator is `Clone`; cloning it before consuming restarts
    /// the search from the same position.
    pub fn search<'a>(&self, root: &'a Root, filter: &'a SearchFilter) -> Search<'a> {
        Search::new(root, filter)
    }

    pub fn stats(&self, root: &Root) -> Stats {
        Stats::of(root)
    }

    // ------------------------------------------------------------------
    // Stamping helpers
    // ------------------------------------------------------------------

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Advance `last_modified`, strictly past its previous value.
    fn stamp(&self, metadata: &mut Option<NodeMetadata>) {
        let now = self.now();
        let meta = metadata.get_or_insert_with(NodeMetadata::default);
        meta.last_modified = now.max(meta.last_modified + 1);
    }

    fn bury(&self, metadata: &mut Option<NodeMetadata>) {
        self.stamp(metadata);
        if let Some(meta) = metadata.as_mut() {
            meta.is_deleted = true;
        }
    }

    /// Stamp a node that takes the place of a tombstone last changed at
    /// `buried_at`, so it orders after the deletion.
    fn stamp_after(&self, metadata: &mut Option<NodeMetadata>, buried_at: u64) {
        let meta = metadata.get_or_insert_with(NodeMetadata::default);
        meta.last_modified = meta.last_modified.max(buried_at);
        self.stamp(metadata);
    }
}

/// Whether `name` is still the sync key of a renamed category.
fn is_pending_origin(root: &Root, name: &str, except: Option<usize>) -> bool {
    root.categories
        .iter()
        .enumerate()
        .any(|(i, c)| Some(i) != except && c.name != name && c.sync_key() == name)
}

fn live_category_index(root: &Root, name: &str) -> Result<usize> {
    root.categories
        .iter()
        .position(|c| !c.is_deleted() && c.name == name)
        .ok_or_else(|| EntityError::NotFound(format!("category '{}'", name)))
}

fn category_mut<'r>(root: &'r mut Root, name: &str) -> Result<&'r mut Category> {
    let idx = live_category_index(root, name)?;
    Ok(Arc::make_mut(&mut root.categories[idx]))
}

fn bundle_mut<'r>(root: &'r mut Root, category: &str, name: &str) -> Result<&'r mut Bundle> {
    let cat = category_mut(root, category)?;
    let idx = cat
        .bundles
        .iter()
        .position(|b| !b.is_deleted() && b.name == name)
        .ok_or_else(|| EntityError::NotFound(format!("bundle '{}' in '{}'", name, category)))?;
    Ok(Arc::make_mut(&mut cat.bundles[idx]))
}

fn bookmark_mut<'r>(
    root: &'r mut Root,
    category: &str,
    bundle: &str,
    id: &BookmarkId,
) -> Result<&'r mut Bookmark> {
    let bundle_ref = bundle_mut(root, category, bundle)?;
    let idx = bundle_ref
        .bookmarks
        .iter()
        .position(|b| !b.is_deleted() && &b.id == id)
        .ok_or_else(|| EntityError::NotFound(format!("bookmark {} in '{}'", id, bundle)))?;
    Ok(Arc::make_mut(&mut bundle_ref.bookmarks[idx]))
}

fn clean_name(kind: &str, name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EntityError::Validation(format!("{} name is empty", kind)));
    }
    if name.contains(['\n', '\r']) {
        return Err(EntityError::Validation(format!(
            "{} name must be a single line",
            kind
        )));
    }
    Ok(name.to_string())
}

fn validated_bookmark(draft: BookmarkDraft) -> Result<Bookmark> {
    let title = draft.title.trim().to_string();
    if title.is_empty() {
        return Err(EntityError::Validation("bookmark title is empty".into()));
    }
    if title.contains(['\n', '\r']) || title.contains("](") {
        return Err(EntityError::Validation(format!(
            "bookmark title '{}' contains a line break or ']('",
            title
        )));
    }

    let url = draft.url.trim().to_string();
    if url.contains(char::is_whitespace) {
        return Err(EntityError::Validation(format!("malformed url '{}'", url)));
    }
    url::Url::parse(&url)
        .map_err(|e| EntityError::Validation(format!("malformed url '{}': {}", url, e)))?;

    let mut tags: Vec<String> = Vec::with_capacity(draft.tags.len());
    for tag in draft.tags {
        let tag = tag.trim();
        if tag.is_empty() || tag.contains([',', '\n', '\r']) {
            return Err(EntityError::Validation(format!("invalid tag '{}'", tag)));
        }
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }

    let notes = match draft.notes {
        Some(notes) if notes.contains(['\n', '\r']) => {
            return Err(EntityError::Validation("notes must be a single line".into()));
        }
        Some(notes) if notes.trim().is_empty() => None,
        Some(notes) => Some(notes.trim().to_string()),
        None => None,
    };

    Ok(Bookmark {
        id: BookmarkId::generate(),
        title,
        url,
        tags,
        notes,
        metadata: None,
    })
}
