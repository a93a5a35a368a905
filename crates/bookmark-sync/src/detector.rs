//! ChangeDetector: polls a remote document's version and reports changes.
//!
//! The detector owns one tokio task per run. Polls are sequential: each tick
//! awaits its version check before the next tick is taken, and ticks missed
//! while a check was slow are skipped rather than bunched up.

use crate::store::{RemoteStore, Version};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between version checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    pub poll_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Running,
}

/// A version change observed on the remote document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub document_id: String,
    /// Last version seen before this change
    pub previous: Option<Version>,
    pub current: Version,
}

pub type ChangeCallback = Arc<dyn Fn(&RemoteChange) + Send + Sync>;

/// Returns true while change notifications should be held back.
pub type ChangeVeto = Arc<dyn Fn() -> bool + Send + Sync>;

struct Run {
    /// Cleared by `stop`; checked under its lock before every callback
    active: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

pub struct ChangeDetector {
    store: Arc<dyn RemoteStore>,
    document_id: String,
    config: DetectorConfig,
    on_change: ChangeCallback,
    veto: Option<ChangeVeto>,
    known: Arc<Mutex<Option<Version>>>,
    run: Option<Run>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChangeDetector {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        document_id: impl Into<String>,
        config: DetectorConfig,
        on_change: impl Fn(&RemoteChange) + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            document_id: document_id.into(),
            config,
            on_change: Arc::new(on_change),
            veto: None,
            known: Arc::new(Mutex::new(None)),
            run: None,
        }
    }

    /// Hold back notifications while `veto` returns true.
    ///
    /// Suppressed versions are still recorded, so they are not reported later.
    pub fn with_veto(mut self, veto: ChangeVeto) -> Self {
        self.veto = Some(veto);
        self
    }

    pub fn state(&self) -> DetectorState {
        if self.run.is_some() {
            DetectorState::Running
        } else {
            DetectorState::Idle
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Last version observed, if any.
    pub fn known_version(&self) -> Option<Version> {
        lock(&self.known).clone()
    }

    /// Record the current version and start polling. No-op while running.
    pub async fn start(&mut self) {
        if self.run.is_some() {
            return;
        }

        match self.store.current_version(&self.document_id).await {
            Ok(version) => {
                debug!("Detector baseline for {}: {}", self.document_id, version);
                *lock(&self.known) = Some(version);
            }
            Err(e) => warn!(
                "Could not read initial version of {}: {}",
                self.document_id, e
            ),
        }

        let active = Arc::new(Mutex::new(true));
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.store),
            self.document_id.clone(),
            self.config.poll_interval,
            Arc::clone(&self.known),
            Arc::clone(&self.on_change),
            self.veto.clone(),
            Arc::clone(&active),
        ));
        self.run = Some(Run { active, task });
        info!(
            "Watching {} every {:?}",
            self.document_id, self.config.poll_interval
        );
    }

    /// Stop polling. Waits for a callback in progress; none fires afterwards.
    ///
    /// Must not be called from inside the change callback.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            *lock(&run.active) = false;
            run.task.abort();
            debug!("Stopped watching {}", self.document_id);
        }
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    store: Arc<dyn RemoteStore>,
    document_id: String,
    period: Duration,
    known: Arc<Mutex<Option<Version>>>,
    on_change: ChangeCallback,
    veto: Option<ChangeVeto>,
    active: Arc<Mutex<bool>>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let version = match store.current_version(&document_id).await {
            Ok(version) => version,
            Err(e) => {
                warn!("Version check for {} failed: {}", document_id, e);
                continue;
            }
        };
        let check = Check {
            document_id: &document_id,
            known: &known,
            on_change: &on_change,
            veto: veto.as_ref(),
        };
        if !check.observe(&active, version) {
            break;
        }
    }
}

struct Check<'a> {
    document_id: &'a str,
    known: &'a Mutex<Option<Version>>,
    on_change: &'a ChangeCallback,
    veto: Option<&'a ChangeVeto>,
}

impl Check<'_> {
    /// Record `version`, notifying on change. Returns false once stopped.
    fn observe(&self, active: &Mutex<bool>, version: Version) -> bool {
        let active = lock(active);
        if !*active {
            return false;
        }

        let previous = {
            let mut known = lock(self.known);
            if known.as_ref() == Some(&version) {
                return true;
            }
            known.replace(version.clone())
        };

        if previous.is_none() {
            debug!("Recorded first version of {}: {}", self.document_id, version);
            return true;
        }
        if self.veto.is_some_and(|veto| veto()) {
            debug!(
                "Change to {} suppressed while a conflict is open",
                self.document_id
            );
            return true;
        }

        info!("Remote change detected on {}: {}", self.document_id, version);
        (self.on_change)(&RemoteChange {
            document_id: self.document_id.to_string(),
            previous,
            current: version,
        });
        true
    }
}
