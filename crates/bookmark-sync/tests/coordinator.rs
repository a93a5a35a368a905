//! End-to-end tests for bookmark-sync.
//!
//! Several devices, each with its own coordinator, share one in-memory
//! store and exchange edits through the remote document.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bookmark_sync::{
    BookmarkDraft, BookmarkId, ConflictHooks, DetectorConfig, InMemoryStore, ManualClock, MergeConflict,
    Resolutions, Root, Side, SyncCoordinator, SyncError, SyncOutcome, TreeEntity,
    ValidationError,
};

/// One device: a coordinator plus the tree it keeps locally.
struct Device {
    sync: SyncCoordinator<InMemoryStore>,
    root: Root,
}

impl Device {
    fn new(store: &Arc<InMemoryStore>, clock: &Arc<ManualClock>) -> Self {
        Self::with_hooks(store, clock, ConflictHooks::none())
    }

    fn with_hooks(store: &Arc<InMemoryStore>, clock: &Arc<ManualClock>, hooks: ConflictHooks) -> Self {
        Self {
            sync: SyncCoordinator::new(Arc::clone(store), hooks).with_clock(clock.clone()),
            root: Root::empty(),
        }
    }

    fn edit(
        &mut self,
        f: impl FnOnce(&TreeEntity, &Root) -> Result<Root, bookmark_sync::EntityError>,
    ) {
        self.root = self.sync.mutate(&self.root, f).expect("edit failed");
    }

    /// Sync and keep the resulting tree; panics on conflicts.
    async fn sync(&mut self, id: Option<&str>) -> String {
        match self.sync.sync(&self.root, id).await.expect("sync failed") {
            SyncOutcome::Created { root, info } | SyncOutcome::Synced { root, info } => {
                self.root = root;
                info.id
            }
            SyncOutcome::Conflicts(conflicts) => panic!("unexpected conflicts: {:?}", conflicts),
        }
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.root.live_categories().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }
}

/// Device A creates the document with a "Dev" category; device B loads it.
async fn shared_base(
    store: &Arc<InMemoryStore>,
    clock: &Arc<ManualClock>,
) -> (Device, Device, String) {
    let mut a = Device::new(store, clock);
    a.edit(|e, r| e.add_category(r, "Dev"));
    let id = a.sync(None).await;

    let mut b = Device::new(store, clock);
    b.root = b.sync.load(&id).await.unwrap();
    (a, b, id)
}

#[tokio::test]
async fn test_added_category_reaches_other_device() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let mut a = Device::new(&store, &clock);
    a.edit(|e, r| e.add_category(r, "Dev"));
    a.edit(|e, r| e.add_bundle(r, "Dev", "Rust"));
    a.edit(|e, r| {
        e.add_bookmark(
            r,
            "Dev",
            "Rust",
            BookmarkDraft::new("The Book", "https://doc.rust-lang.org/book/").with_tags(["rust"]),
        )
    });
    let id = a.sync(None).await;

    let mut b = Device::new(&store, &clock);
    let loaded = b.sync.load(&id).await.unwrap();
    let category = loaded.category("Dev").expect("Dev should exist");
    assert!(category.bundles.iter().any(|bundle| bundle.name == "Rust"));
    // Ids survive the trip through the document
    assert_eq!(loaded, a.root);
}

#[tokio::test]
async fn test_stale_save_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let (mut a, mut b, id) = shared_base(&store, &clock).await;

    a.edit(|e, r| e.add_category(r, "From A"));
    a.sync.save(&a.root, Some(&id), None).await.unwrap();
    let written = store.content(&id);

    b.edit(|e, r| e.add_category(r, "From B"));
    let err = b.sync.save(&b.root, Some(&id), None).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(b.sync.is_dirty());
    assert_eq!(store.content(&id), written);
}

#[tokio::test]
async fn test_concurrent_additions_converge() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let (mut a, mut b, id) = shared_base(&store, &clock).await;

    clock.set(2_000);
    a.edit(|e, r| e.add_category(r, "A"));
    b.edit(|e, r| e.add_category(r, "B"));
    assert!(b.sync.is_dirty());

    a.sync(Some(&id)).await;
    clock.set(3_000);
    b.sync(Some(&id)).await;
    assert!(!b.sync.is_dirty());
    clock.set(4_000);
    a.sync(Some(&id)).await;

    assert_eq!(a.names(), vec!["A", "B", "Dev"]);
    assert_eq!(b.names(), a.names());
    assert_eq!(a.root.last_sync(), Some(4_000));
}

#[tokio::test]
async fn test_deletion_propagates() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let (mut a, mut b, id) = shared_base(&store, &clock).await;

    clock.set(2_000);
    a.edit(|e, r| e.remove_category(r, "Dev"));
    a.sync(Some(&id)).await;

    clock.set(3_000);
    b.sync(Some(&id)).await;
    assert!(b.names().is_empty());
}

#[tokio::test]
async fn test_conflicting_renames_then_resolution() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let (mut a, _, id) = shared_base(&store, &clock).await;

    let reported: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let hooks = ConflictHooks::new(
        move |conflicts: &[MergeConflict]| {
            sink.lock()
                .unwrap()
                .extend(conflicts.iter().map(|c| c.category.clone()))
        },
        || false,
    );
    let mut b = Device::with_hooks(&store, &clock, hooks);
    b.root = b.sync.load(&id).await.unwrap();

    clock.set(2_000);
    a.edit(|e, r| e.rename_category(r, "Dev", "Code"));
    a.sync(Some(&id)).await;

    clock.set(3_000);
    b.edit(|e, r| e.rename_category(r, "Dev", "Tools"));
    let before = store.content(&id);
    let outcome = b.sync.sync(&b.root, Some(&id)).await.unwrap();
    let SyncOutcome::Conflicts(conflicts) = outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].category, "Dev");
    assert_eq!(conflicts[0].local.name, "Tools");
    assert_eq!(conflicts[0].remote.name, "Code");
    assert_eq!(*reported.lock().unwrap(), vec!["Dev".to_string()]);
    assert_eq!(store.content(&id), before);
    assert!(b.sync.is_dirty());

    let check = b.sync.check_conflicts(&b.root, &id).await.unwrap();
    assert_eq!(check.conflict_names(), vec!["Dev"]);

    let resolutions = Resolutions::from([("Dev".to_string(), Side::Local)]);
    let outcome = b
        .sync
        .sync_with_conflict_resolution(&b.root, &resolutions, &id)
        .await
        .unwrap();
    b.root = outcome.root().cloned().unwrap();
    assert_eq!(b.names(), vec!["Tools"]);

    clock.set(4_000);
    a.sync(Some(&id)).await;
    assert_eq!(a.names(), vec!["Tools"]);
}

#[tokio::test]
async fn test_unresolved_conflicts_are_an_error() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let (mut a, mut b, id) = shared_base(&store, &clock).await;

    clock.set(2_000);
    a.edit(|e, r| e.rename_category(r, "Dev", "Code"));
    a.sync(Some(&id)).await;
    b.edit(|e, r| e.rename_category(r, "Dev", "Tools"));

    let err = b
        .sync
        .sync_with_conflict_resolution(&b.root, &Resolutions::new(), &id)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Merge(_)));
}

/// Categories holding a live copy of bookmark `id`.
fn holders(root: &Root, id: &BookmarkId) -> Vec<String> {
    root.live_categories()
        .filter(|c| c.live_bundles().any(|b| b.bookmark(id).is_some()))
        .map(|c| c.name.clone())
        .collect()
}

#[tokio::test]
async fn test_keeping_local_side_of_moved_bookmark_source() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let mut a = Device::new(&store, &clock);
    a.edit(|e, r| e.add_category(r, "Dev"));
    a.edit(|e, r| e.add_bundle(r, "Dev", "Rust"));
    a.edit(|e, r| e.add_bookmark(r, "Dev", "Rust", BookmarkDraft::new("Tokio", "https://tokio.rs")));
    a.edit(|e, r| e.add_category(r, "Read"));
    a.edit(|e, r| e.add_bundle(r, "Read", "Later"));
    let id = a.sync(None).await;
    let bookmark = a.root.categories[0].bundles[0].bookmarks[0].id.clone();

    let mut b = Device::new(&store, &clock);
    b.root = b.sync.load(&id).await.unwrap();

    clock.set(2_000);
    a.edit(|e, r| e.move_bookmark(r, &bookmark, "Read", "Later"));
    a.sync(Some(&id)).await;

    clock.set(3_000);
    b.edit(|e, r| e.add_bundle(r, "Dev", "Go"));
    let outcome = b.sync.sync(&b.root, Some(&id)).await.unwrap();
    let SyncOutcome::Conflicts(conflicts) = outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].category, "Dev");

    let resolutions = Resolutions::from([("Dev".to_string(), Side::Local)]);
    let outcome = b
        .sync
        .sync_with_conflict_resolution(&b.root, &resolutions, &id)
        .await
        .expect("resolution should persist");
    b.root = outcome.root().cloned().unwrap();
    assert!(b.root.category("Dev").unwrap().bundle("Go").is_some());
    assert_eq!(holders(&b.root, &bookmark), vec!["Read"]);

    clock.set(4_000);
    a.sync(Some(&id)).await;
    assert!(a.root.category("Dev").unwrap().bundle("Go").is_some());
    assert_eq!(holders(&a.root, &bookmark), vec!["Read"]);
}

#[tokio::test]
async fn test_colliding_names_are_never_persisted() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let (mut a, mut b, id) = shared_base(&store, &clock).await;

    clock.set(2_000);
    a.edit(|e, r| e.add_category(r, "X"));
    a.sync(Some(&id)).await;

    b.edit(|e, r| e.rename_category(r, "Dev", "X"));
    let before = store.content(&id);
    let err = b.sync.sync(&b.root, Some(&id)).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(ValidationError::DuplicateCategory(name)) if name == "X"
    ));
    assert_eq!(store.content(&id), before);
}

#[tokio::test(start_paused = true)]
async fn test_detector_stays_quiet_while_conflict_is_open() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let (mut a, _, id) = shared_base(&store, &clock).await;

    let open = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&open);
    let watcher = Device::with_hooks(
        &store,
        &clock,
        ConflictHooks::new(|_| {}, move || flag.load(Ordering::SeqCst)),
    );
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    let config = DetectorConfig {
        poll_interval: Duration::from_secs(5),
    };
    let mut detector = watcher.sync.change_detector(&id, config, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    detector.start().await;

    a.edit(|e, r| e.add_category(r, "Quiet"));
    a.sync(Some(&id)).await;
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(changes.load(Ordering::SeqCst), 0);

    open.store(false, Ordering::SeqCst);
    a.edit(|e, r| e.add_category(r, "Loud"));
    a.sync(Some(&id)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    detector.stop();
}
