//! Document codec: conversion between a bookmark tree and its textual form.
//!
//! The document is markdown-flavoured and line oriented:
//!
//! ```markdown
//! <!-- meta: {"version":1,"lastModified":1700000000000,"lastSync":1700000000000} -->
//!
//! # Dev
//! <!-- meta: {"lastModified":1700000000000} -->
//! ## Rust
//! <!-- meta: {"lastModified":1700000000000} -->
//! - [The Book](https://doc.rust-lang.org/book/)
//!   <!-- meta: {"id":"6f1c…","lastModified":1700000000000} -->
//!   - tags: rust, docs
//!   - notes: Start here
//!
//! ```
//!
//! `<!-- meta: … -->` comment lines carry ids, timestamps and tombstones as
//! JSON and attach to the node opened just before them. Markdown renderers
//! hide them, and documents written by hand may leave them out entirely.

use crate::model::{Bookmark, Bundle, Category, NodeMetadata, Root, RootMetadata, TREE_VERSION};
use crate::BookmarkId;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

const META_PREFIX: &str = "<!-- meta: ";
const META_SUFFIX: &str = " -->";
const TAGS_PREFIX: &str = "- tags:";
const NOTES_PREFIX: &str = "- notes:";

/// Document generated for a tree without categories.
pub const EMPTY_PLACEHOLDER: &str = "<!-- No bookmarks yet. Add a category to get started. -->";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid metadata on line {line}: {source}")]
    Metadata {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported document version: {0}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, CodecError>;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Payload of a `<!-- meta: … -->` line. Every field is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<BookmarkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_sync: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_synced: Option<u64>,
    #[serde(default, alias = "isDeleted", skip_serializing_if = "is_false")]
    deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    renamed_from: Option<String>,
}

impl MetaLine {
    fn for_node(meta: &NodeMetadata) -> Self {
        Self {
            last_modified: Some(meta.last_modified),
            last_synced: meta.last_synced,
            deleted: meta.is_deleted,
            renamed_from: meta.renamed_from.clone(),
            ..Default::default()
        }
    }

    fn into_node(self) -> Option<NodeMetadata> {
        let present = self.last_modified.is_some()
            || self.last_synced.is_some()
            || self.deleted
            || self.renamed_from.is_some();
        present.then(|| NodeMetadata {
            last_modified: self.last_modified.unwrap_or(0),
            last_synced: self.last_synced,
            is_deleted: self.deleted,
            renamed_from: self.renamed_from,
        })
    }

    fn render(&self, indent: &str) -> String {
        // Serializing plain strings and integers cannot fail
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{}{}{}{}", indent, META_PREFIX, json, META_SUFFIX)
    }
}

/// Serialize a tree to its document form.
///
/// Deterministic: equal trees always produce identical documents.
pub fn generate(root: &Root) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(meta) = &root.metadata {
        let line = MetaLine {
            version: Some(root.version),
            last_modified: Some(meta.last_modified),
            last_sync: meta.last_sync,
            ..Default::default()
        };
        lines.push(line.render(""));
        lines.push(String::new());
    }

    if root.categories.is_empty() {
        lines.push(EMPTY_PLACEHOLDER.to_string());
    }

    for category in &root.categories {
        lines.push(format!("# {}", category.name));
        if let Some(meta) = &category.metadata {
            lines.push(MetaLine::for_node(meta).render(""));
        }
        if category.bundles.is_empty() {
            lines.push(String::new());
        }
        for bundle in &category.bundles {
            lines.push(format!("## {}", bundle.name));
            if let Some(meta) = &bundle.metadata {
                lines.push(MetaLine::for_node(meta).render(""));
            }
            for bookmark in &bundle.bookmarks {
                push_bookmark(&mut lines, bookmark);
            }
            lines.push(String::new());
        }
    }

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn push_bookmark(lines: &mut Vec<String>, bookmark: &Bookmark) {
    lines.push(format!("- [{}]({})", bookmark.title, bookmark.url));

    let mut meta = bookmark
        .metadata
        .as_ref()
        .map(MetaLine::for_node)
        .unwrap_or_default();
    meta.id = Some(bookmark.id.clone());
    lines.push(meta.render("  "));

    if !bookmark.tags.is_empty() {
        lines.push(format!("  {} {}", TAGS_PREFIX, bookmark.tags.join(", ")));
    }
    if let Some(notes) = bookmark.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        lines.push(format!("  {} {}", NOTES_PREFIX, notes));
    }
}

/// Parse a document into a tree.
///
/// Unknown lines and malformed bookmark lines are skipped, as is a bookmark
/// whose metadata line is broken. Bookmarks without an id get a freshly
/// generated one. Broken root, category or bundle metadata is an error.
pub fn parse(content: &str) -> Result<Root> {
    let mut parser = Parser::new();
    for (idx, raw) in content.lines().enumerate() {
        parser.line(idx + 1, raw)?;
    }
    Ok(parser.finish())
}

/// Which node a metadata line attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Root,
    Category,
    Bundle,
    Bookmark,
}

struct Parser {
    root: Root,
    category: Option<Category>,
    bundle: Option<Bundle>,
    bookmark: Option<Bookmark>,
    last_opened: Cursor,
}

impl Parser {
    fn new() -> Self {
        Self {
            root: Root::empty(),
            category: None,
            bundle: None,
            bookmark: None,
            last_opened: Cursor::Root,
        }
    }

    fn line(&mut self, number: usize, raw: &str) -> Result<()> {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let trimmed = line.trim_start();

        if line.trim().is_empty() {
            self.flush_bookmark();
        } else if let Some(name) = line.strip_prefix("## ") {
            self.flush_bundle();
            if self.category.is_some() {
                self.bundle = Some(Bundle::new(name));
                self.last_opened = Cursor::Bundle;
            } else {
                trace!("line {}: bundle outside of a category, skipping", number);
            }
        } else if let Some(name) = line.strip_prefix("# ") {
            self.flush_category();
            self.category = Some(Category::new(name));
            self.last_opened = Cursor::Category;
        } else if let Some(json) = trimmed
            .strip_prefix(META_PREFIX)
            .and_then(|rest| rest.strip_suffix(META_SUFFIX))
        {
            match serde_json::from_str::<MetaLine>(json) {
                Ok(meta) => self.apply_meta(meta)?,
                Err(e) if self.last_opened == Cursor::Bookmark => {
                    trace!("line {}: bad bookmark metadata ({}), dropping bookmark", number, e);
                    self.bookmark = None;
                    self.last_opened = Cursor::Bundle;
                }
                Err(source) => return Err(CodecError::Metadata { line: number, source }),
            }
        } else if let Some(rest) = line.strip_prefix("- ") {
            self.flush_bookmark();
            match (parse_link(rest), self.bundle.is_some()) {
                (Some((title, url)), true) => {
                    self.bookmark = Some(Bookmark {
                        id: BookmarkId::generate(),
                        title: title.to_string(),
                        url: url.to_string(),
                        tags: Vec::new(),
                        notes: None,
                        metadata: None,
                    });
                    self.last_opened = Cursor::Bookmark;
                }
                _ => trace!("line {}: malformed or orphaned bookmark, skipping", number),
            }
        } else if let (Some(tags), Some(bookmark)) =
            (trimmed.strip_prefix(TAGS_PREFIX), self.bookmark.as_mut())
        {
            bookmark.tags.clear();
            for tag in tags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if !bookmark.tags.iter().any(|t| t == tag) {
                    bookmark.tags.push(tag.to_string());
                }
            }
        } else if let (Some(notes), Some(bookmark)) =
            (trimmed.strip_prefix(NOTES_PREFIX), self.bookmark.as_mut())
        {
            let notes = notes.trim();
            bookmark.notes = (!notes.is_empty()).then(|| notes.to_string());
        } else {
            trace!("line {}: unrecognized, skipping", number);
        }
        Ok(())
    }

    fn apply_meta(&mut self, meta: MetaLine) -> Result<()> {
        match self.last_opened {
            Cursor::Root => {
                if let Some(version) = meta.version {
                    if version != TREE_VERSION {
                        return Err(CodecError::UnsupportedVersion(version));
                    }
                }
                if meta.last_modified.is_some() || meta.last_sync.is_some() {
                    self.root.metadata = Some(RootMetadata {
                        last_modified: meta.last_modified.unwrap_or(0),
                        last_sync: meta.last_sync,
                    });
                }
            }
            Cursor::Category => {
                if let Some(category) = self.category.as_mut() {
                    category.metadata = meta.into_node();
                }
            }
            Cursor::Bundle => {
                if let Some(bundle) = self.bundle.as_mut() {
                    bundle.metadata = meta.into_node();
                }
            }
            Cursor::Bookmark => {
                if let Some(bookmark) = self.bookmark.as_mut() {
                    if let Some(id) = meta.id.clone() {
                        bookmark.id = id;
                    }
                    bookmark.metadata = meta.into_node();
                }
            }
        }
        Ok(())
    }

    fn flush_bookmark(&mut self) {
        if let Some(bookmark) = self.bookmark.take() {
            if let Some(bundle) = self.bundle.as_mut() {
                bundle.bookmarks.push(Arc::new(bookmark));
            }
            self.last_opened = Cursor::Bundle;
        }
    }

    fn flush_bundle(&mut self) {
        self.flush_bookmark();
        if let Some(bundle) = self.bundle.take() {
            if let Some(category) = self.category.as_mut() {
                category.bundles.push(Arc::new(bundle));
            }
        }
    }

    fn flush_category(&mut self) {
        self.flush_bundle();
        if let Some(category) = self.category.take() {
            self.root.categories.push(Arc::new(category));
        }
    }

    fn finish(mut self) -> Root {
        self.flush_category();
        self.root
    }
}

/// Split `[title](url)` into its parts.
fn parse_link(rest: &str) -> Option<(&str, &str)> {
    let inner = rest.strip_prefix('[')?;
    let split = inner.find("](")?;
    let title = &inner[..split];
    let url = inner[split + 2..].strip_suffix(')')?;
    if title.is_empty() || url.is_empty() {
        return None;
    }
    Some((title, url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::{BookmarkDraft, TreeEntity};
    use crate::model::TreeNode;

    fn sample() -> Root {
        let entity = TreeEntity::new(Arc::new(ManualClock::new(1_700_000_000_000)));
        let root = entity.add_category(&Root::empty(), "Dev").unwrap();
        let root = entity.add_bundle(&root, "Dev", "Rust").unwrap();
        let root = entity
            .add_bookmarks(
                &root,
                "Dev",
                "Rust",
                [
                    BookmarkDraft::new("The Book", "https://doc.rust-lang.org/book/")
                        .with_tags(["rust", "docs"])
                        .with_notes("Start here"),
                    BookmarkDraft::new("Tokio", "https://tokio.rs"),
                ],
            )
            .unwrap();
        let root = entity.add_bundle(&root, "Dev", "Empty").unwrap();
        let root = entity.add_category(&root, "Later").unwrap();
        let root = entity.add_category(&root, "Gone").unwrap();
        let root = entity.remove_category(&root, "Gone").unwrap();
        root.mark_synced(1_700_000_000_500)
    }

    #[test]
    fn test_generate_layout() {
        let entity = TreeEntity::new(Arc::new(ManualClock::new(5)));
        let root = entity.add_category(&Root::empty(), "Dev").unwrap();
        let root = entity.add_bundle(&root, "Dev", "Rust").unwrap();
        let root = entity
            .add_bookmark(
                &root,
                "Dev",
                "Rust",
                BookmarkDraft::new("Book", "https://a.example")
                    .with_tags(["a", "b", "c"])
                    .with_notes("hi"),
            )
            .unwrap()
            .with_metadata(5);
        let id = root.categories[0].bundles[0].bookmarks[0].id.clone();

        let expected = format!(
            "<!-- meta: {{\"version\":1,\"lastModified\":5}} -->\n\
             \n\
             # Dev\n\
             <!-- meta: {{\"lastModified\":5}} -->\n\
             ## Rust\n\
             <!-- meta: {{\"lastModified\":5}} -->\n\
             - [Book](https://a.example)\n  \
             <!-- meta: {{\"id\":\"{}\",\"lastModified\":5}} -->\n  \
             - tags: a, b, c\n  \
             - notes: hi",
            id
        );
        assert_eq!(generate(&root), expected);
    }

    #[test]
    fn test_empty_root_generates_placeholder() {
        assert_eq!(generate(&Root::empty()), EMPTY_PLACEHOLDER);
        let parsed = parse(EMPTY_PLACEHOLDER).unwrap();
        assert!(parsed.categories.is_empty());
    }

    #[test]
    fn test_generation_is_idempotent_through_parse() {
        let root = sample();
        let once = generate(&root);
        let twice = generate(&parse(&once).unwrap());
        assert_eq!(once, twice);

        let empty_with_meta = Root::empty().with_metadata(42);
        let once = generate(&empty_with_meta);
        assert_eq!(generate(&parse(&once).unwrap()), once);
    }

    #[test]
    fn test_parse_restores_structure_and_metadata() {
        let root = sample();
        let parsed = parse(&generate(&root)).unwrap();
        assert_eq!(parsed, root);
        assert!(parsed.categories[2].is_deleted());
        assert_eq!(parsed.last_sync(), Some(1_700_000_000_500));
    }

    #[test]
    fn test_parse_hand_written_document() {
        let doc = "# Reading\n\
                   ## Articles\n\
                   - [Rust blog](https://blog.rust-lang.org)\n  \
                   - tags: rust, news\n\
                   - not a bookmark line\n\
                   - [Second](https://example.com/a_(b))\n  \
                   - notes: parens in url\n\
                   \n\
                   random text\n\
                   ## Videos\n";
        let root = parse(doc).unwrap();
        assert!(root.metadata.is_none());
        let category = root.category("Reading").unwrap();
        let articles = category.bundle("Articles").unwrap();
        assert_eq!(articles.bookmarks.len(), 2);
        assert_eq!(articles.bookmarks[0].tags, vec!["rust", "news"]);
        assert_eq!(articles.bookmarks[1].url, "https://example.com/a_(b)");
        assert_eq!(articles.bookmarks[1].notes.as_deref(), Some("parens in url"));
        assert_ne!(articles.bookmarks[0].id, articles.bookmarks[1].id);
        assert!(category.bundle("Videos").unwrap().bookmarks.is_empty());
    }

    #[test]
    fn test_parse_skips_orphans() {
        let doc = "- [Orphan](https://example.com)\n## No category\n# Cat\n- [Also orphan](https://x.example)";
        let root = parse(doc).unwrap();
        assert_eq!(root.categories.len(), 1);
        assert!(root.categories[0].bundles.is_empty());
    }

    #[test]
    fn test_parse_drops_bookmark_with_bad_metadata() {
        let doc = "# Dev\n## Rust\n- [Good](https://good.example)\n\
                   - [Bad](https://bad.example)\n  <!-- meta: {\"id\":\"has space\"} -->\n  - tags: lost\n\
                   - [Stamp](https://stamp.example)\n  <!-- meta: {\"lastModified\":\"soon\"} -->\n\
                   - [After](https://after.example)";
        let root = parse(doc).unwrap();
        let titles: Vec<_> = root.categories[0].bundles[0]
            .bookmarks
            .iter()
            .map(|b| b.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Good", "After"]);
        assert!(root.categories[0].bundles[0].bookmarks.iter().all(|b| b.tags.is_empty()));
    }

    #[test]
    fn test_parse_dedups_tags() {
        let doc = "# Dev\n## Rust\n- [T](https://t.example)\n  - tags: b, a, b,  a ,";
        let root = parse(doc).unwrap();
        assert_eq!(root.categories[0].bundles[0].bookmarks[0].tags, vec!["b", "a"]);
    }

    #[test]
    fn test_parse_rejects_broken_metadata_and_versions() {
        let err = parse("# Cat\n<!-- meta: {not json} -->").unwrap_err();
        assert!(matches!(err, CodecError::Metadata { line: 2, .. }));

        let err = parse("<!-- meta: {\"version\":2} -->").unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_parse_keeps_ids_and_handles_crlf() {
        let doc = "# A\r\n## B\r\n- [T](https://t.example)\r\n  <!-- meta: {\"id\":\"fixed-id\"} -->\r\n";
        let root = parse(doc).unwrap();
        let bookmark = &root.categories[0].bundles[0].bookmarks[0];
        assert_eq!(bookmark.id.as_str(), "fixed-id");
        assert!(bookmark.metadata.is_none());
    }
}
