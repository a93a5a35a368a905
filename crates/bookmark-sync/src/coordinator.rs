//! SyncCoordinator: load, save and merge-synchronize a tree with a remote document.
//!
//! The coordinator owns the link between one local tree and one remote
//! document: it remembers the last version token it saw for that document
//! (the base for conditional writes) and whether local edits are pending.
//! Write operations take `&mut self`, so a coordinator never has two writes
//! in flight.

use crate::clock::{Clock, SystemClock};
use crate::codec::{self, CodecError};
use crate::detector::{ChangeDetector, DetectorConfig, RemoteChange};
use crate::entity::{self, EntityError, TreeEntity};
use crate::events::{EventBus, SyncEvent};
use crate::merge::{self, MergeConflict, MergeError, MergeResult, Resolutions};
use crate::model::{Root, ValidationError};
use crate::store::{RemoteInfo, RemoteStore, StoreError, Version};

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Description given to documents created without one.
pub const DEFAULT_DESCRIPTION: &str = "Bookmarks";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote store error: {0}")]
    Store(#[from] StoreError),

    #[error("Could not parse remote document: {0}")]
    Parse(#[from] CodecError),

    #[error("Invalid tree: {0}")]
    Validation(#[from] ValidationError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("No known base version for document {0}; load or sync it first")]
    MissingBaseVersion(String),
}

impl SyncError {
    /// Whether the remote changed since this coordinator last saw it.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_conflict())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Collaborator callbacks for conflict handling.
#[derive(Clone)]
pub struct ConflictHooks {
    /// Called with the conflicts of a sync that stopped on them
    pub on_conflict: Arc<dyn Fn(&[MergeConflict]) + Send + Sync>,
    /// True while conflicts are waiting for the user; suppresses change
    /// notifications from detectors built by the coordinator
    pub has_open_conflict: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl ConflictHooks {
    pub fn new(
        on_conflict: impl Fn(&[MergeConflict]) + Send + Sync + 'static,
        has_open_conflict: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_conflict: Arc::new(on_conflict),
            has_open_conflict: Arc::new(has_open_conflict),
        }
    }

    /// Hooks that ignore conflicts and never report one as open.
    pub fn none() -> Self {
        Self::new(|_| {}, || false)
    }
}

impl Default for ConflictHooks {
    fn default() -> Self {
        Self::none()
    }
}

/// Result of a synchronization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No remote document existed; a new one was created from the local tree.
    Created { root: Root, info: RemoteInfo },
    /// Trees were merged and the result written to the remote document.
    Synced { root: Root, info: RemoteInfo },
    /// Conflicting categories need a decision; nothing was written.
    Conflicts(Vec<MergeConflict>),
}

impl SyncOutcome {
    /// The tree to keep locally, unless the sync stopped on conflicts.
    pub fn root(&self) -> Option<&Root> {
        match self {
            SyncOutcome::Created { root, .. } | SyncOutcome::Synced { root, .. } => Some(root),
            SyncOutcome::Conflicts(_) => None,
        }
    }

    pub fn info(&self) -> Option<&RemoteInfo> {
        match self {
            SyncOutcome::Created { info, .. } | SyncOutcome::Synced { info, .. } => Some(info),
            SyncOutcome::Conflicts(_) => None,
        }
    }
}

pub struct SyncCoordinator<S> {
    store: Arc<S>,
    entity: TreeEntity,
    clock: Arc<dyn Clock>,
    hooks: ConflictHooks,
    events: Option<Arc<EventBus>>,
    description: String,
    /// Last `{id, version}` read or written by this coordinator
    remote: Option<RemoteInfo>,
    dirty: bool,
}

impl<S: RemoteStore + 'static> SyncCoordinator<S> {
    pub fn new(store: Arc<S>, hooks: ConflictHooks) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            entity: TreeEntity::new(Arc::clone(&clock)),
            clock,
            hooks,
            events: None,
            description: DEFAULT_DESCRIPTION.to_string(),
            remote: None,
            dirty: false,
        }
    }

    /// Use `clock` for sync timestamps and for mutations made through `mutate`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.entity = TreeEntity::new(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Resume from a previously persisted `{id, version}` pair.
    pub fn with_remote_info(mut self, info: RemoteInfo) -> Self {
        self.remote = Some(info);
        self
    }

    /// Description used when this coordinator creates a document.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn entity(&self) -> &TreeEntity {
        &self.entity
    }

    /// Whether the tree changed locally since the last load, save or sync.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn remote_info(&self) -> Option<&RemoteInfo> {
        self.remote.as_ref()
    }

    /// Apply a tree mutation, marking local changes as pending on success.
    pub fn mutate<F>(&mut self, root: &Root, f: F) -> entity::Result<Root>
    where
        F: FnOnce(&TreeEntity, &Root) -> std::result::Result<Root, EntityError>,
    {
        let next = f(&self.entity, root)?;
        self.dirty = true;
        Ok(next)
    }

    /// Read, parse and validate a remote document.
    pub async fn load(&mut self, id: &str) -> Result<Root> {
        let doc = self.store.read(id).await?;
        let root = codec::parse(&doc.content)?;
        root.validate()?;

        info!("Loaded {} at version {}", id, doc.version);
        self.emit(SyncEvent::Loaded {
            document_id: id.to_string(),
            version: doc.version.to_string(),
            timestamp: self.now(),
        });
        self.remember(id, doc.version);
        Ok(root)
    }

    /// Write `root` as is, without merging.
    ///
    /// With an `id` the write is conditioned on the last version this
    /// coordinator saw for that document; without one a new document is
    /// created. `last_sync` is left untouched.
    pub async fn save(
        &mut self,
        root: &Root,
        id: Option<&str>,
        description: Option<&str>,
    ) -> Result<RemoteInfo> {
        root.validate()?;
        let content = codec::generate(root);

        let info = match id {
            Some(id) => {
                let base = self.base_version(id)?;
                let version = self.store.update(id, &content, &base).await?;
                RemoteInfo {
                    id: id.to_string(),
                    version,
                }
            }
            None => {
                let description = description.unwrap_or(self.description.as_str());
                self.store.create(description, &content).await?
            }
        };

        info!("Saved {} at version {}", info.id, info.version);
        self.emit(SyncEvent::Saved {
            document_id: info.id.clone(),
            version: info.version.to_string(),
            timestamp: self.now(),
        });
        self.remember(&info.id, info.version.clone());
        Ok(info)
    }

    /// Merge `root` with the remote document and write the result back.
    ///
    /// Creates the document when `id` is absent or no longer exists. Stops
    /// without writing when the merge produces conflicts.
    pub async fn sync(&mut self, root: &Root, id: Option<&str>) -> Result<SyncOutcome> {
        let local = root.with_metadata(self.now());

        let existing = match id {
            Some(id) => self.store.exists(id).await?.then_some(id),
            None => None,
        };
        let Some(id) = existing else {
            if let Some(id) = id {
                warn!("Remote document {} no longer exists, creating a new one", id);
            }
            return self.create_fresh(&local).await;
        };

        let doc = self.store.read(id).await?;
        let remote = codec::parse(&doc.content)?;
        remote.validate()?;

        let last_sync = local.last_sync().unwrap_or(0);
        let result = merge::merge(&local, &remote, last_sync);
        if result.has_conflicts() {
            let categories = result.conflict_names();
            warn!("Sync of {} stopped on conflicts in {:?}", id, categories);
            (self.hooks.on_conflict)(result.conflicts.as_slice());
            self.emit(SyncEvent::ConflictsDetected {
                document_id: id.to_string(),
                categories,
                timestamp: self.now(),
            });
            return Ok(SyncOutcome::Conflicts(result.conflicts));
        }

        let (root, info) = self.persist_merged(result.merged, id, doc.version).await?;
        Ok(SyncOutcome::Synced { root, info })
    }

    /// Merge with the remote document, settling conflicts with `resolutions`.
    pub async fn sync_with_conflict_resolution(
        &mut self,
        root: &Root,
        resolutions: &Resolutions,
        id: &str,
    ) -> Result<SyncOutcome> {
        let local = root.with_metadata(self.now());
        let doc = self.store.read(id).await?;
        let remote = codec::parse(&doc.content)?;
        remote.validate()?;

        let last_sync = local.last_sync().unwrap_or(0);
        let merged = merge::resolve_conflicts(&local, &remote, last_sync, resolutions)?;
        let (root, info) = self.persist_merged(merged, id, doc.version).await?;
        Ok(SyncOutcome::Synced { root, info })
    }

    /// Merge with the remote document without writing anything.
    pub async fn check_conflicts(&self, root: &Root, id: &str) -> Result<MergeResult> {
        let doc = self.store.read(id).await?;
        let remote = codec::parse(&doc.content)?;
        remote.validate()?;
        Ok(merge::merge(root, &remote, root.last_sync().unwrap_or(0)))
    }

    /// Build a detector for `id` that stays quiet while a conflict is open.
    pub fn change_detector(
        &self,
        id: &str,
        config: DetectorConfig,
        on_change: impl Fn(&RemoteChange) + Send + Sync + 'static,
    ) -> ChangeDetector {
        let store: Arc<dyn RemoteStore> = self.store.clone();
        ChangeDetector::new(store, id, config, on_change)
            .with_veto(Arc::clone(&self.hooks.has_open_conflict))
    }

    async fn create_fresh(&mut self, local: &Root) -> Result<SyncOutcome> {
        let root = local.mark_synced(self.now());
        root.validate()?;
        let info = self
            .store
            .create(&self.description, &codec::generate(&root))
            .await?;

        info!("Created {} at version {}", info.id, info.version);
        self.emit(SyncEvent::Synced {
            document_id: info.id.clone(),
            version: info.version.to_string(),
            timestamp: self.now(),
        });
        self.remember(&info.id, info.version.clone());
        Ok(SyncOutcome::Created { root, info })
    }

    async fn persist_merged(
        &mut self,
        merged: Root,
        id: &str,
        base: Version,
    ) -> Result<(Root, RemoteInfo)> {
        merged.validate()?;
        let root = merged.mark_synced(self.now());
        let version = self
            .store
            .update(id, &codec::generate(&root), &base)
            .await?;
        let info = RemoteInfo {
            id: id.to_string(),
            version,
        };

        info!("Synced {} at version {}", id, info.version);
        self.emit(SyncEvent::Synced {
            document_id: id.to_string(),
            version: info.version.to_string(),
            timestamp: self.now(),
        });
        self.remember(id, info.version.clone());
        Ok((root, info))
    }

    fn base_version(&self, id: &str) -> Result<Version> {
        self.remote
            .as_ref()
            .filter(|r| r.id == id)
            .map(|r| r.version.clone())
            .ok_or_else(|| SyncError::MissingBaseVersion(id.to_string()))
    }

    fn remember(&mut self, id: &str, version: Version) {
        debug!("Base version for {} is now {}", id, version);
        self.remote = Some(RemoteInfo {
            id: id.to_string(),
            version,
        });
        self.dirty = false;
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}
