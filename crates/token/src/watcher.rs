//! USB token watcher.
//!
//! # States
//!
//! ```text
//!            candidate seen             stable for debounce
//! NoToken ─────────────────▶ Settling ───────────────────▶ TokenPresent
//!    ▲                           │                               │
//!    └───── gone before settle ──┘◀────────── removed ───────────┘
//! ```
//!
//! `Settling` is internal: subscribers only ever see `Inserted` and
//! `Removed`. A volume that appears and disappears inside the debounce
//! window produces no events at all. Removal is reported on the first poll
//! that misses the volume, and the handle is invalidated in the shared
//! [`TokenPresence`] before the event goes out.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokensign_core::config::TokenConfig;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::enumerator::{MountRootEnumerator, MountedVolume, TokenCriteria, TokenEnumerator};
use crate::error::{Result, TokenError};
use crate::presence::{TokenHandle, TokenPresence};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Transition delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "token", rename_all = "snake_case")]
pub enum TokenEvent {
    Inserted(TokenHandle),
    Removed(TokenHandle),
}

/// Externally visible watcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchState {
    NoToken,
    TokenPresent,
}

#[derive(Debug)]
enum State {
    NoToken,
    Settling { volume: MountedVolume, since: Instant },
    TokenPresent(TokenHandle),
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub ignore_preexisting: bool,
}

impl From<&TokenConfig> for WatcherOptions {
    fn from(config: &TokenConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            debounce: Duration::from_millis(config.debounce_ms),
            ignore_preexisting: config.ignore_preexisting,
        }
    }
}

/// Polls an enumerator and tracks the single current token.
pub struct TokenWatcher {
    enumerator: Arc<dyn TokenEnumerator>,
    criteria: TokenCriteria,
    options: WatcherOptions,
    presence: TokenPresence,
    events: broadcast::Sender<TokenEvent>,
    state: State,
    primed: bool,
    ignored: HashSet<PathBuf>,
    insertions: u64,
}

impl TokenWatcher {
    pub fn new(
        enumerator: Arc<dyn TokenEnumerator>,
        criteria: TokenCriteria,
        options: WatcherOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            enumerator,
            criteria,
            options,
            presence: TokenPresence::new(),
            events,
            state: State::NoToken,
            primed: false,
            ignored: HashSet::new(),
            insertions: 0,
        }
    }

    /// Watcher over the configured mount roots and marker.
    pub fn from_config(config: &TokenConfig) -> Self {
        Self::new(
            Arc::new(MountRootEnumerator::from_config(config)),
            TokenCriteria::from_config(config),
            WatcherOptions::from(config),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    pub fn presence(&self) -> TokenPresence {
        self.presence.clone()
    }

    pub fn state(&self) -> WatchState {
        match self.state {
            State::TokenPresent(_) => WatchState::TokenPresent,
            State::NoToken | State::Settling { .. } => WatchState::NoToken,
        }
    }

    /// Take one snapshot and advance the state machine.
    ///
    /// Returns the events emitted by this poll, which are also broadcast.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<TokenEvent>> {
        let snapshot = self.enumerator.snapshot()?;

        if !self.primed {
            self.primed = true;
            if self.options.ignore_preexisting {
                self.ignored = snapshot.iter().map(|v| v.mount_path.clone()).collect();
                debug!(count = self.ignored.len(), "Ignoring volumes present at start-up");
            }
        }
        // A pre-existing volume that goes away counts as new when it returns.
        self.ignored
            .retain(|path| snapshot.iter().any(|v| &v.mount_path == path));

        let candidates: Vec<MountedVolume> = snapshot
            .into_iter()
            .filter(|v| !self.ignored.contains(&v.mount_path))
            .filter(|v| self.criteria.matches(v))
            .collect();

        let mut emitted = Vec::new();

        if let State::TokenPresent(handle) = &self.state {
            if !candidates.iter().any(|v| v.mount_path == handle.mount_path) {
                let removed = self
                    .presence
                    .mark_removed(&handle.device_id)
                    .unwrap_or_else(|| {
                        let mut gone = handle.clone();
                        gone.present = false;
                        gone
                    });
                info!(device = %removed.device_id, "Token removed");
                emitted.push(TokenEvent::Removed(removed));
                self.state = State::NoToken;
            }
        }

        if let State::Settling { volume, .. } = &self.state {
            if !candidates.iter().any(|v| v.mount_path == volume.mount_path) {
                debug!(device = %volume.device_id, "Volume vanished while settling");
                self.state = State::NoToken;
            }
        }

        if matches!(self.state, State::NoToken) {
            if let Some(volume) = candidates.into_iter().next() {
                debug!(device = %volume.device_id, "Candidate volume appeared");
                self.state = State::Settling { volume, since: now };
            }
        }

        if let State::Settling { volume, since } = &self.state {
            if now.saturating_duration_since(*since) >= self.options.debounce {
                self.insertions += 1;
                let handle =
                    TokenHandle::new(volume.device_id.clone(), volume.mount_path.clone(), self.insertions);
                info!(
                    device = %handle.device_id,
                    mount = %handle.mount_path.display(),
                    "Token inserted"
                );
                self.presence.mark_inserted(handle.clone());
                emitted.push(TokenEvent::Inserted(handle.clone()));
                self.state = State::TokenPresent(handle);
            }
        }

        for event in &emitted {
            // No subscribers is fine.
            let _ = self.events.send(event.clone());
        }
        Ok(emitted)
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    ///
    /// Enumeration failures are logged and retried on the next tick.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.options.poll_interval.as_millis() as u64,
            "Token watcher started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(tokio::time::Instant::now().into_std()) {
                        warn!(error = %e, "Volume enumeration failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Token watcher stopped");
        Ok(())
    }

    /// Run on the tokio runtime.
    pub fn spawn(self) -> WatcherHandle {
        let (shutdown, rx) = watch::channel(false);
        let events = self.events.clone();
        let presence = self.presence.clone();
        let task = tokio::spawn(self.run(rx));
        WatcherHandle {
            shutdown,
            task,
            events,
            presence,
        }
    }
}

/// Handle to a spawned watcher.
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    events: broadcast::Sender<TokenEvent>,
    presence: TokenPresence,
}

impl WatcherHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    pub fn presence(&self) -> TokenPresence {
        self.presence.clone()
    }

    /// Resolve with the current token, or the next one inserted.
    ///
    /// `None` waits forever. On timeout the error is `TokenAbsent`.
    pub async fn wait_for_token(&self, timeout: Option<Duration>) -> Result<TokenHandle> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                if let Some(handle) = self.presence.current() {
                    return Ok(handle);
                }
                match events.recv().await {
                    Ok(TokenEvent::Inserted(handle)) => return Ok(handle),
                    Ok(TokenEvent::Removed(_)) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TokenError::WatcherClosed)
                    }
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| TokenError::TokenAbsent)?,
            None => wait.await,
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Token watcher task failed");
                Err(TokenError::WatcherClosed)
            }
        }
    }
}
