//! bookmark-sync: Hierarchical bookmark trees synchronized through a versioned remote document.
//!
//! This crate provides the core functionality for:
//! - An immutable Root → Category → Bundle → Bookmark tree and its mutation API
//! - Converting trees to and from a markdown-flavoured document
//! - Three-way merging of trees at category granularity with conflict reporting
//! - Optimistic-concurrency persistence through the `RemoteStore` trait
//! - Polling a remote document for changes

pub mod bookmark_id;
pub mod clock;
pub mod codec;
pub mod coordinator;
pub mod detector;
pub mod entity;
pub mod events;
pub mod merge;
pub mod model;
pub mod search;
pub mod store;

pub use bookmark_id::{BookmarkId, BookmarkIdError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{generate, parse, CodecError};
pub use coordinator::{ConflictHooks, SyncCoordinator, SyncError, SyncOutcome};
pub use detector::{ChangeDetector, DetectorConfig, DetectorState, RemoteChange};
pub use entity::{BookmarkDraft, BookmarkPatch, EntityError, TreeEntity};
pub use events::{EventBus, Subscription, SyncEvent};
pub use merge::{merge, resolve_conflicts, MergeConflict, MergeError, MergeResult, Resolutions, Side};
pub use model::{Bookmark, Bundle, Category, NodeMetadata, Root, RootMetadata, TreeNode, ValidationError};
pub use search::{SearchFilter, SearchHit, Stats};
pub use store::{InMemoryStore, RemoteDocument, RemoteInfo, RemoteStore, StoreError, Version};
