//! Read-only queries over a bookmark tree: filtered search and counts.

use crate::model::{Bookmark, Bundle, Category, Root, TreeNode};
use std::collections::HashSet;
use std::sync::Arc;

/// Search criteria. An empty filter matches every live bookmark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    /// Lowercased free-text query
    query: Option<String>,
    /// Lowercased tag fragments that must all be present
    tags: Vec<String>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive substring over title, url, notes and tags.
    pub fn query(mut self, query: &str) -> Self {
        let query = query.trim();
        self.query = (!query.is_empty()).then(|| query.to_lowercase());
        self
    }

    /// Require a tag containing `tag` (case-insensitive substring).
    pub fn tag(mut self, tag: &str) -> Self {
        let tag = tag.trim();
        if !tag.is_empty() {
            self.tags.push(tag.to_lowercase());
        }
        self
    }

    pub fn matches(&self, bookmark: &Bookmark) -> bool {
        let tags: Vec<String> = bookmark.tags.iter().map(|t| t.to_lowercase()).collect();

        let query_ok = self.query.as_deref().is_none_or(|q| {
            bookmark.title.to_lowercase().contains(q)
                || bookmark.url.to_lowercase().contains(q)
                || bookmark
                    .notes
                    .as_deref()
                    .is_some_and(|n| n.to_lowercase().contains(q))
                || tags.iter().any(|t| t.contains(q))
        });

        query_ok
            && self
                .tags
                .iter()
                .all(|wanted| tags.iter().any(|t| t.contains(wanted.as_str())))
    }
}

/// A matching bookmark together with where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit<'a> {
    pub bookmark: &'a Arc<Bookmark>,
    pub category: &'a str,
    pub bundle: &'a str,
}

/// Lazy depth-first walk over the live tree yielding matches.
#[derive(Debug, Clone)]
pub struct Search<'a> {
    root: &'a Root,
    filter: &'a SearchFilter,
    category: usize,
    bundle: usize,
    bookmark: usize,
}

impl<'a> Search<'a> {
    pub(crate) fn new(root: &'a Root, filter: &'a SearchFilter) -> Self {
        Self {
            root,
            filter,
            category: 0,
            bundle: 0,
            bookmark: 0,
        }
    }

    fn next_category(&mut self) {
        self.category += 1;
        self.bundle = 0;
        self.bookmark = 0;
    }

    fn next_bundle(&mut self) {
        self.bundle += 1;
        self.bookmark = 0;
    }
}

impl<'a> Iterator for Search<'a> {
    type Item = SearchHit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let root: &'a Root = self.root;
        while let Some(category) = root.categories.get(self.category) {
            if category.is_deleted() {
                self.next_category();
                continue;
            }
            let Some(bundle) = category.bundles.get(self.bundle) else {
                self.next_category();
                continue;
            };
            if bundle.is_deleted() {
                self.next_bundle();
                continue;
            }
            let Some(bookmark) = bundle.bookmarks.get(self.bookmark) else {
                self.next_bundle();
                continue;
            };
            self.bookmark += 1;
            if !bookmark.is_deleted() && self.filter.matches(bookmark) {
                return Some(SearchHit {
                    bookmark,
                    category: &category.name,
                    bundle: &bundle.name,
                });
            }
        }
        None
    }
}

/// Counts over the live tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub categories: usize,
    pub bundles: usize,
    pub bookmarks: usize,
    /// Distinct tags (case-sensitive)
    pub tags: usize,
}

impl Stats {
    pub fn of(root: &Root) -> Self {
        let categories: Vec<&Arc<Category>> = root.live_categories().collect();
        let bundles: Vec<&Arc<Bundle>> = categories.iter().flat_map(|c| c.live_bundles()).collect();
        let mut tags = HashSet::new();
        let mut bookmarks = 0;
        for bookmark in bundles.iter().flat_map(|b| b.live_bookmarks()) {
            bookmarks += 1;
            tags.extend(bookmark.tags.iter().map(String::as_str));
        }
        Self {
            categories: categories.len(),
            bundles: bundles.len(),
            bookmarks,
            tags: tags.len(),
        }
    }
}
