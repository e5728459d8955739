//! Decides when sync cycles run.
//!
//! The scheduler owns no sync logic. It reacts to host lifecycle events
//! (connectivity, foreground/background, manual requests) and to its own
//! timers, and asks a [`SyncDriver`] to run a cycle. Failed cycles are retried
//! with exponential backoff until `max_retries` is reached; after that it
//! waits for the next external trigger.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use super::engine::SyncError;
use super::state::{SyncMode, SyncResult};
use crate::clock::SharedClock;
use crate::config::SyncSettings;

/// Something that can run a sync cycle on request.
pub trait SyncDriver: Send + Sync + 'static {
    fn sync(&self, mode: SyncMode) -> impl Future<Output = Result<SyncResult, SyncError>> + Send;

    /// Completion time of the last successful full sync.
    fn last_full_sync_at(&self) -> impl Future<Output = Option<DateTime<Utc>>> + Send;

    /// Connectivity changed; drivers may publish this to observers.
    fn network_changed(&self, _online: bool) {}
}

/// Host lifecycle events fed into the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    NetworkChanged { online: bool },
    AppForegrounded,
    AppBackgrounded,
    SyncNow(SyncMode),
    Shutdown,
}

/// Cloneable sender side of the scheduler's event queue.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Queue an event; returns `false` once the scheduler has stopped.
    pub fn send(&self, event: SchedulerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn network_changed(&self, online: bool) -> bool {
        self.send(SchedulerEvent::NetworkChanged { online })
    }

    pub fn foregrounded(&self) -> bool {
        self.send(SchedulerEvent::AppForegrounded)
    }

    pub fn backgrounded(&self) -> bool {
        self.send(SchedulerEvent::AppBackgrounded)
    }

    pub fn sync_now(&self, mode: SyncMode) -> bool {
        self.send(SchedulerEvent::SyncNow(mode))
    }

    pub fn shutdown(&self) -> bool {
        self.send(SchedulerEvent::Shutdown)
    }
}

#[derive(Debug, Clone, Copy)]
struct Triggers {
    auto_sync_interval: Duration,
    network_settle_delay: Duration,
    full_sync_freshness: Duration,
    sync_on_foreground: bool,
    sync_on_network_restore: bool,
    auto_sync_enabled: bool,
}

/// Backoff position within a run of failed cycles.
///
/// The n-th retry waits `base * 2^n`, capped, optionally jittered down to half.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    base: Duration,
    cap: Duration,
    jitter: bool,
    max_attempts: u32,
    attempt: u32,
}

impl RetryState {
    fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            base: settings.retry_interval,
            cap: settings.max_retry_delay,
            jitter: settings.backoff_jitter,
            max_attempts: settings.max_retries,
            attempt: 0,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next retry; `None` once the budget is spent, which starts a new run.
    fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            self.attempt = 0;
            return None;
        }
        let nominal = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt += 1;
        Some(if self.jitter {
            rng.gen_range(nominal / 2..=nominal)
        } else {
            nominal
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSync {
    at: Instant,
    mode: SyncMode,
}

/// Event loop that turns lifecycle events and timers into sync cycles.
pub struct SyncScheduler<D> {
    driver: Arc<D>,
    clock: SharedClock,
    rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    triggers: Triggers,
    retry: RetryState,
    online: bool,
    foreground: bool,
    next_periodic: Option<Instant>,
    pending: Option<PendingSync>,
}

impl<D: SyncDriver> SyncScheduler<D> {
    /// Build a scheduler and the handle used to feed it events.
    ///
    /// The scheduler starts online and foregrounded; use
    /// [`SyncScheduler::with_initial_state`] when the host knows otherwise.
    pub fn new(
        driver: Arc<D>,
        settings: &SyncSettings,
        clock: SharedClock,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            driver,
            clock,
            rx,
            triggers: Triggers {
                auto_sync_interval: settings.auto_sync_interval,
                network_settle_delay: settings.network_settle_delay,
                full_sync_freshness: settings.full_sync_freshness,
                sync_on_foreground: settings.sync_on_foreground,
                sync_on_network_restore: settings.sync_on_network_restore,
                auto_sync_enabled: settings.auto_sync_enabled,
            },
            retry: RetryState::from_settings(settings),
            online: true,
            foreground: true,
            next_periodic: None,
            pending: None,
        };
        (scheduler, SchedulerHandle { tx })
    }

    #[must_use]
    pub const fn with_initial_state(mut self, online: bool, foreground: bool) -> Self {
        self.online = online;
        self.foreground = foreground;
        self
    }

    /// Run until `Shutdown` arrives or every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(
            online = self.online,
            foreground = self.foreground,
            "Sync scheduler started"
        );
        self.reschedule_periodic(Instant::now());

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                () = sleep_or_wait(deadline) => self.fire_due().await,
            }
        }

        tracing::info!("Sync scheduler stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.pending.map(|pending| pending.at), self.next_periodic) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn handle_event(&mut self, event: SchedulerEvent) -> bool {
        tracing::debug!(?event, "Scheduler event");
        let now = Instant::now();
        match event {
            SchedulerEvent::NetworkChanged { online } => {
                self.driver.network_changed(online);
                let restored = online && !self.online;
                self.online = online;
                if !online {
                    self.pending = None;
                } else if restored && self.triggers.sync_on_network_restore {
                    self.retry.reset();
                    self.schedule(now + self.triggers.network_settle_delay, SyncMode::Quick);
                }
                self.reschedule_periodic(now);
            }
            SchedulerEvent::AppForegrounded => {
                let was_background = !self.foreground;
                self.foreground = true;
                if was_background && self.online && self.triggers.sync_on_foreground {
                    let mode = self.foreground_mode().await;
                    self.retry.reset();
                    self.run_cycle(mode).await;
                }
                self.reschedule_periodic(Instant::now());
            }
            SchedulerEvent::AppBackgrounded => {
                self.foreground = false;
                self.pending = None;
                self.next_periodic = None;
            }
            SchedulerEvent::SyncNow(mode) => {
                self.retry.reset();
                self.pending = None;
                self.run_cycle(mode).await;
            }
            SchedulerEvent::Shutdown => return false,
        }
        true
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        if let Some(pending) = self.pending.filter(|pending| pending.at <= now) {
            self.pending = None;
            self.run_cycle(pending.mode).await;
        } else if self.next_periodic.is_some_and(|at| at <= now) {
            tracing::debug!("Periodic sync due");
            self.run_cycle(SyncMode::Quick).await;
        }
    }

    async fn foreground_mode(&self) -> SyncMode {
        let freshness = chrono::Duration::from_std(self.triggers.full_sync_freshness)
            .unwrap_or(chrono::Duration::MAX);
        match self.driver.last_full_sync_at().await {
            Some(at) if self.clock.now().signed_duration_since(at) < freshness => SyncMode::Quick,
            _ => SyncMode::Full,
        }
    }

    async fn run_cycle(&mut self, mode: SyncMode) {
        match self.driver.sync(mode).await {
            Ok(result) if result.has_retryable_failures() => {
                self.schedule_retry(mode, "some records failed to sync");
            }
            Ok(_) => self.retry.reset(),
            Err(SyncError::SyncInProgress) => {
                tracing::debug!("Skipped trigger; a cycle is already running");
            }
            Err(SyncError::AuthExpired(message)) => {
                tracing::warn!("Sync paused until credentials are renewed: {}", message);
                self.retry.reset();
                self.pending = None;
            }
            Err(error) if error.is_retryable() => self.schedule_retry(mode, &error.to_string()),
            Err(error) => {
                tracing::warn!("Sync failed and will not be retried: {}", error);
                self.retry.reset();
            }
        }
        self.reschedule_periodic(Instant::now());
    }

    fn schedule_retry(&mut self, mode: SyncMode, reason: &str) {
        if !self.online {
            return;
        }
        let Some(delay) = self.retry.next_delay(&mut rand::thread_rng()) else {
            tracing::warn!(
                attempts = self.retry.max_attempts,
                "Giving up automatic sync retries: {}",
                reason
            );
            return;
        };
        tracing::info!(
            attempt = self.retry.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Retrying sync: {}",
            reason
        );
        self.schedule(Instant::now() + delay, mode);
    }

    fn schedule(&mut self, at: Instant, mode: SyncMode) {
        self.pending = match self.pending {
            Some(existing) if existing.at <= at => Some(PendingSync {
                at: existing.at,
                mode: upgrade(existing.mode, mode),
            }),
            Some(existing) => Some(PendingSync {
                at,
                mode: upgrade(existing.mode, mode),
            }),
            None => Some(PendingSync { at, mode }),
        };
    }

    fn reschedule_periodic(&mut self, now: Instant) {
        self.next_periodic = (self.online && self.foreground && self.triggers.auto_sync_enabled)
            .then(|| now + self.triggers.auto_sync_interval);
    }
}

const fn upgrade(a: SyncMode, b: SyncMode) -> SyncMode {
    match (a, b) {
        (SyncMode::Full, _) | (_, SyncMode::Full) => SyncMode::Full,
        _ => SyncMode::Quick,
    }
}

async fn sleep_or_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
