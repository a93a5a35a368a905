//! bookmarks: Command-line bookmark manager synchronized through a GitHub Gist.
//!
//! The tree lives in a local state file; `sync` merges it with the gist so
//! several machines can edit the same collection.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bookmark_sync::{
    codec, BookmarkDraft, BookmarkId, ConflictHooks, DetectorConfig, MergeConflict, Resolutions,
    Root, SearchFilter, Side, SyncCoordinator, SyncOutcome, TreeEntity, TreeNode,
};
use bookmarks::{Config, GistStore, LocalState, DEFAULT_API_BASE};

#[derive(Parser, Debug)]
#[command(name = "bookmarks")]
#[command(about = "Bookmarks synchronized through a GitHub Gist")]
struct Args {
    /// GitHub token with the gist scope
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Gist id holding the bookmark document
    #[arg(long, env = "BOOKMARKS_GIST_ID")]
    gist: Option<String>,

    /// Path to the local state file
    #[arg(long, env = "BOOKMARKS_STATE")]
    state: Option<String>,

    /// GitHub API base URL
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the bookmark document
    Show,
    /// Count categories, bundles, bookmarks and tags
    Stats,
    /// Search bookmarks by text and tags
    Search {
        query: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    AddCategory {
        name: String,
    },
    RemoveCategory {
        name: String,
    },
    RenameCategory {
        old: String,
        new: String,
    },
    AddBundle {
        category: String,
        name: String,
    },
    RemoveBundle {
        category: String,
        name: String,
    },
    RenameBundle {
        category: String,
        old: String,
        new: String,
    },
    /// Add a bookmark to a bundle
    Add {
        category: String,
        bundle: String,
        title: String,
        url: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove a bookmark by id
    Remove {
        id: String,
    },
    /// Move a bookmark to another bundle
    Move {
        id: String,
        category: String,
        bundle: String,
    },
    /// Drop tombstones and pending rename markers
    Compact,
    /// Merge with the gist and write the result back
    Sync,
    /// Sync, settling conflicting categories
    Resolve {
        /// Keep the local version of this category
        #[arg(long = "keep-local")]
        local: Vec<String>,
        /// Keep the remote version of this category
        #[arg(long = "keep-remote")]
        remote: Vec<String>,
    },
    /// Report conflicts a sync would hit, without writing
    Check,
    /// Replace the local tree with the gist's content
    Pull,
    /// Overwrite the gist with the local tree (creates one if needed)
    Push {
        #[arg(long)]
        description: Option<String>,
    },
    /// Watch the gist for changes until Ctrl+C
    Watch {
        /// Seconds between checks
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
}

type Coordinator = SyncCoordinator<GistStore>;

/// Conflicts are reported through logs; a conflict counts as open while
/// the state file at `path` still lists one.
fn conflict_hooks(path: PathBuf) -> ConflictHooks {
    ConflictHooks::new(
        |conflicts: &[MergeConflict]| {
            for conflict in conflicts {
                warn!(
                    "Conflict in '{}': local '{}'{} vs remote '{}'{}",
                    conflict.category,
                    conflict.local.name,
                    if conflict.local.is_deleted() { " (deleted)" } else { "" },
                    conflict.remote.name,
                    if conflict.remote.is_deleted() { " (deleted)" } else { "" },
                );
            }
        },
        move || {
            LocalState::load(&path)
                .map(|state| state.has_open_conflict())
                .unwrap_or(false)
        },
    )
}

fn coordinator(config: &Config, state: &LocalState) -> Result<Coordinator> {
    let store = GistStore::new(config.require_token()?, &config.api_base)?;
    let mut sync = SyncCoordinator::new(Arc::new(store), conflict_hooks(config.state_path.clone()));
    if let Some(info) = state.remote.clone() {
        sync = sync.with_remote_info(info);
    }
    Ok(sync)
}

fn document_id(config: &Config, state: &LocalState) -> Option<String> {
    config
        .gist_id
        .clone()
        .or_else(|| state.document_id().map(str::to_string))
}

fn require_document_id(config: &Config, state: &LocalState) -> Result<String> {
    document_id(config, state)
        .ok_or_else(|| anyhow!("No gist known yet; pass --gist or run `bookmarks sync` first"))
}

/// Category and bundle holding the live bookmark `id`.
fn locate(root: &Root, id: &BookmarkId) -> Option<(String, String)> {
    root.live_categories()
        .flat_map(|c| c.live_bundles().map(move |b| (c, b)))
        .find(|(_, b)| b.bookmark(id).is_some())
        .map(|(c, b)| (c.name.clone(), b.name.clone()))
}

fn print_conflicts(conflicts: &[MergeConflict]) {
    println!("{} conflicting categories:", conflicts.len());
    for conflict in conflicts {
        println!(
            "  {}: local '{}' (changed {}) vs remote '{}' (changed {})",
            conflict.category,
            conflict.local.name,
            conflict.local_last_modified,
            conflict.remote.name,
            conflict.remote_last_modified,
        );
    }
    println!("Settle them with `bookmarks resolve --keep-local <name>` or `--keep-remote <name>`.");
}

/// Apply a tree edit, mark it pending and persist the state.
///
/// Edits work offline, so they go through the entity directly instead of
/// a coordinator that needs a token.
fn edit(
    state: &mut LocalState,
    path: &Path,
    f: impl FnOnce(&TreeEntity, &Root) -> Result<Root, bookmark_sync::EntityError>,
) -> Result<()> {
    let entity = TreeEntity::default();
    state.root = f(&entity, &state.root)?;
    state.dirty = true;
    state.save(path)
}

/// Persist the result of a sync. Conflicts are recorded as open before the
/// command fails, so a running watcher holds off until they are resolved.
fn apply_outcome(state: &mut LocalState, path: &Path, outcome: SyncOutcome) -> Result<()> {
    match outcome {
        SyncOutcome::Created { root, info } => {
            println!("Created gist {}", info.id);
            state.synced(root, info);
            state.save(path)
        }
        SyncOutcome::Synced { root, info } => {
            println!("Synced with gist {} ({})", info.id, info.version);
            state.synced(root, info);
            state.save(path)
        }
        SyncOutcome::Conflicts(conflicts) => {
            print_conflicts(&conflicts);
            state.open_conflicts = conflicts.iter().map(|c| c.category.clone()).collect();
            state.save(path)?;
            bail!("sync stopped on conflicts; nothing was written")
        }
    }
}

async fn watch(config: &Config, state: &LocalState, interval: u64) -> Result<()> {
    let sync = coordinator(config, state)?;
    let id = require_document_id(config, state)?;
    let (change_tx, mut change_rx) = mpsc::unbounded_channel();
    let detector_config = DetectorConfig {
        poll_interval: Duration::from_secs(interval.max(1)),
    };
    let mut detector = sync.change_detector(&id, detector_config, move |change| {
        // Receiver dropped means we are shutting down
        let _ = change_tx.send(change.clone());
    });
    detector.start().await;
    info!("Watching gist {}. Press Ctrl+C to stop.", id);

    loop {
        tokio::select! {
            Some(change) = change_rx.recv() => {
                println!(
                    "Gist {} changed: {} -> {}",
                    change.document_id,
                    change.previous.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
                    change.current
                );
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    detector.stop();
    info!("Stopped watching");
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = Config::new(args.token, args.gist, args.state, Some(args.api_base))?;
    let path = config.state_path.clone();
    let mut state = LocalState::load(&path)?;

    match args.command {
        Command::Show => println!("{}", codec::generate(&state.root)),
        Command::Stats => {
            let stats = TreeEntity::default().stats(&state.root);
            println!("categories: {}", stats.categories);
            println!("bundles:    {}", stats.bundles);
            println!("bookmarks:  {}", stats.bookmarks);
            println!("tags:       {}", stats.tags);
            println!("pending:    {}", if state.dirty { "yes" } else { "no" });
            if state.has_open_conflict() {
                println!("conflicts:  {}", state.open_conflicts.join(", "));
            }
        }
        Command::Search { query, tags } => {
            let filter = tags
                .iter()
                .fold(SearchFilter::new().query(query.as_deref().unwrap_or("")), |f, t| {
                    f.tag(t)
                });
            let entity = TreeEntity::default();
            for hit in entity.search(&state.root, &filter) {
                println!(
                    "{}  {} / {}  {} <{}>",
                    hit.bookmark.id, hit.category, hit.bundle, hit.bookmark.title, hit.bookmark.url
                );
            }
        }
        Command::AddCategory { name } => edit(&mut state, &path, |e, r| e.add_category(r, &name))?,
        Command::RemoveCategory { name } => {
            edit(&mut state, &path, |e, r| e.remove_category(r, &name))?
        }
        Command::RenameCategory { old, new } => {
            edit(&mut state, &path, |e, r| e.rename_category(r, &old, &new))?
        }
        Command::AddBundle { category, name } => {
            edit(&mut state, &path, |e, r| e.add_bundle(r, &category, &name))?
        }
        Command::RemoveBundle { category, name } => {
            edit(&mut state, &path, |e, r| e.remove_bundle(r, &category, &name))?
        }
        Command::RenameBundle { category, old, new } => edit(&mut state, &path, |e, r| {
            e.rename_bundle(r, &category, &old, &new)
        })?,
        Command::Add {
            category,
            bundle,
            title,
            url,
            tags,
            notes,
        } => {
            let mut draft = BookmarkDraft::new(title, url).with_tags(tags);
            draft.notes = notes;
            edit(&mut state, &path, |e, r| e.add_bookmark(r, &category, &bundle, draft))?
        }
        Command::Remove { id } => {
            let id: BookmarkId = id.parse()?;
            let (category, bundle) =
                locate(&state.root, &id).ok_or_else(|| anyhow!("No bookmark with id {}", id))?;
            edit(&mut state, &path, |e, r| e.remove_bookmark(r, &category, &bundle, &id))?
        }
        Command::Move {
            id,
            category,
            bundle,
        } => {
            let id: BookmarkId = id.parse()?;
            edit(&mut state, &path, |e, r| e.move_bookmark(r, &id, &category, &bundle))?
        }
        Command::Compact => edit(&mut state, &path, |e, r| Ok(e.compact(r)))?,
        Command::Sync => {
            let mut sync = coordinator(&config, &state)?;
            let id = document_id(&config, &state);
            let outcome = sync.sync(&state.root, id.as_deref()).await?;
            apply_outcome(&mut state, &path, outcome)?;
        }
        Command::Resolve { local, remote } => {
            let mut sync = coordinator(&config, &state)?;
            let id = require_document_id(&config, &state)?;
            let resolutions: Resolutions = local
                .into_iter()
                .map(|name| (name, Side::Local))
                .chain(remote.into_iter().map(|name| (name, Side::Remote)))
                .collect();
            let outcome = sync
                .sync_with_conflict_resolution(&state.root, &resolutions, &id)
                .await?;
            apply_outcome(&mut state, &path, outcome)?;
        }
        Command::Check => {
            let sync = coordinator(&config, &state)?;
            let id = require_document_id(&config, &state)?;
            let result = sync.check_conflicts(&state.root, &id).await?;
            if result.has_conflicts() {
                print_conflicts(&result.conflicts);
            } else {
                println!("No conflicts; `bookmarks sync` will merge cleanly.");
            }
        }
        Command::Pull => {
            let mut sync = coordinator(&config, &state)?;
            let id = require_document_id(&config, &state)?;
            let root = sync.load(&id).await?;
            match sync.remote_info().cloned() {
                Some(info) => state.synced(root, info),
                None => state.root = root,
            }
            state.save(&path)?;
            println!("Pulled gist {}", id);
        }
        Command::Push { description } => {
            let mut sync = coordinator(&config, &state)?;
            let id = document_id(&config, &state);
            let info = sync
                .save(&state.root, id.as_deref(), description.as_deref())
                .await?;
            println!("Pushed to gist {} ({})", info.id, info.version);
            let root = state.root.clone();
            state.synced(root, info);
            state.save(&path)?;
        }
        Command::Watch { interval } => watch(&config, &state, interval).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,bookmarks=debug,bookmark_sync=debug"
    } else {
        "info,bookmarks=info,bookmark_sync=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run(args).await
}
