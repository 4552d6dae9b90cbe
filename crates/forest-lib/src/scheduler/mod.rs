//! Daily monitoring at a fixed local time of day
//!
//! Each armed [`ScheduleEntry`] owns a timer task that sleeps until the next
//! occurrence of its fire time and then starts a run. Entry lifecycle:
//!
//! ```text
//! Idle -> Armed -> Running -> Armed ...
//!           \         \
//!            `---------`--> Stopped
//! ```
//!
//! There is at most one armed entry per [`TargetKey`]; arming again replaces
//! the previous entry. Runs for one target are serialised by a lock that
//! outlives entry replacement, so a replaced entry's in-flight run and the new
//! entry's first run never overlap.

mod clock;

pub use clock::{next_fire_after, Clock, LocalClock, OffsetClock};

use crate::error::PipelineError;
use crate::models::{Coordinate, Credential, ObservationRequest, StoredRecord};
use crate::observability::{PipelineMetrics, StructuredLogger};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

pub use async_trait::async_trait;

/// Longest single sleep before the wall clock is read again
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Something the scheduler can run for a target and day
#[async_trait]
pub trait ScheduledRun: Send + Sync {
    async fn run(&self, request: &ObservationRequest) -> Result<StoredRecord, PipelineError>;
}

/// What to do when a fire arrives while the previous run is still going
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Drop the new fire
    #[default]
    Skip,
    /// Wait for the in-flight run, then run once
    Queue,
}

/// Whole-run retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per fire, including the first
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 30,
            max_backoff_secs: 600,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let secs = self
            .initial_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub retry: RetryPolicy,
    pub overrun: OverrunPolicy,
    /// Days subtracted from the fire date to pick the imagery date
    pub lag_days: u32,
}

/// Recurring daily observation of one site
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub coordinate: Coordinate,
    pub credential: Credential,
    /// Local time of day
    pub fire_time: NaiveTime,
}

impl ScheduleEntry {
    pub fn new(coordinate: Coordinate, credential: Credential, fire_time: NaiveTime) -> Self {
        Self {
            coordinate,
            credential,
            fire_time,
        }
    }

    pub fn target(&self) -> TargetKey {
        let (lat_e6, lon_e6) = self.coordinate.key();
        TargetKey {
            lat_e6,
            lon_e6,
            credential: self.credential.clone(),
        }
    }
}

/// Identity of a monitored target: site plus credential
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    lat_e6: i64,
    lon_e6: i64,
    credential: Credential,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.6}, {:.6})",
            self.lat_e6 as f64 / crate::models::COORDINATE_SCALE,
            self.lon_e6 as f64 / crate::models::COORDINATE_SCALE
        )
    }
}

/// Observable state of a target's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Idle,
    Armed,
    Running,
    Stopped,
}

/// Result of [`MonitorScheduler::arm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed,
    Replaced,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduler has been shut down")]
    ShutDown,
}

#[derive(Debug, Default)]
struct EntryGate {
    stopped: bool,
    running: usize,
}

/// Shared state of one armed entry
struct EntryContext {
    entry: ScheduleEntry,
    target: TargetKey,
    runner: Arc<dyn ScheduledRun>,
    clock: Arc<dyn Clock>,
    config: ScheduleConfig,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    gate: Mutex<EntryGate>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl EntryContext {
    /// Mark the entry stopped; true if it was live
    fn stop(&self) -> bool {
        let was_live = {
            let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            let was_live = !gate.stopped;
            gate.stopped = true;
            was_live
        };
        self.cancel.cancel();
        was_live
    }

    /// Admit one run attempt unless the entry has been stopped
    fn admit(&self) -> bool {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.stopped {
            return false;
        }
        gate.running += 1;
        true
    }

    fn release(&self) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        gate.running = gate.running.saturating_sub(1);
    }

    fn state(&self) -> EntryState {
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.stopped {
            EntryState::Stopped
        } else if gate.running > 0 {
            EntryState::Running
        } else {
            EntryState::Armed
        }
    }

    fn is_live(&self) -> bool {
        !self.gate.lock().unwrap_or_else(PoisonError::into_inner).stopped
    }
}

struct TargetSlot {
    run_lock: Arc<tokio::sync::Mutex<()>>,
    entry: Option<Arc<EntryContext>>,
}

/// Arms and fires daily schedule entries
pub struct MonitorScheduler {
    runner: Arc<dyn ScheduledRun>,
    clock: Arc<dyn Clock>,
    config: ScheduleConfig,
    targets: Mutex<HashMap<TargetKey, TargetSlot>>,
    tracker: TaskTracker,
    shut_down: Mutex<bool>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    generation: AtomicU64,
}

impl MonitorScheduler {
    pub fn new(runner: Arc<dyn ScheduledRun>, clock: Arc<dyn Clock>, config: ScheduleConfig) -> Self {
        Self {
            runner,
            clock,
            config,
            targets: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shut_down: Mutex::new(false),
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::default(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Arm `entry`, replacing any live entry for the same target
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&self, entry: ScheduleEntry) -> Result<ArmOutcome, ScheduleError> {
        if *self.shut_down.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(ScheduleError::ShutDown);
        }

        let target = entry.target();
        let fire_time = entry.fire_time;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let (replaced, armed) = {
            let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = targets.entry(target.clone()).or_insert_with(|| TargetSlot {
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
                entry: None,
            });

            let replaced = slot.entry.take().map(|old| old.stop()).unwrap_or(false);

            let ctx = Arc::new(EntryContext {
                entry,
                target: target.clone(),
                runner: Arc::clone(&self.runner),
                clock: Arc::clone(&self.clock),
                config: self.config,
                run_lock: Arc::clone(&slot.run_lock),
                gate: Mutex::new(EntryGate::default()),
                cancel: CancellationToken::new(),
                tracker: self.tracker.clone(),
                metrics: self.metrics.clone(),
                logger: self.logger.clone(),
            });
            slot.entry = Some(Arc::clone(&ctx));
            self.tracker.spawn(timer_loop(ctx));

            (replaced, count_live(&targets))
        };

        debug!(site = %target, generation, "Timer task spawned");
        self.metrics.set_armed_entries(armed);
        self.logger
            .log_entry_armed(&target.to_string(), &fire_time.format("%H:%M:%S").to_string(), replaced);

        Ok(if replaced {
            ArmOutcome::Replaced
        } else {
            ArmOutcome::Armed
        })
    }

    /// Stop the entry for `target`; an in-flight run is left to finish
    pub fn cancel(&self, target: &TargetKey) -> bool {
        let (stopped, armed) = {
            let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            let stopped = targets
                .get(target)
                .and_then(|slot| slot.entry.as_ref())
                .map(|ctx| ctx.stop())
                .unwrap_or(false);
            (stopped, count_live(&targets))
        };

        if stopped {
            self.metrics.set_armed_entries(armed);
            self.logger.log_entry_cancelled(&target.to_string());
        }
        stopped
    }

    pub fn state(&self, target: &TargetKey) -> EntryState {
        let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        targets
            .get(target)
            .and_then(|slot| slot.entry.as_ref())
            .map(|ctx| ctx.state())
            .unwrap_or(EntryState::Idle)
    }

    pub fn armed_count(&self) -> usize {
        count_live(&self.targets.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Stop every entry; no fire starts after this returns
    pub fn stop_all(&self) {
        let stopped: Vec<TargetKey> = {
            let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            targets
                .values()
                .filter_map(|slot| slot.entry.as_ref())
                .filter(|ctx| ctx.stop())
                .map(|ctx| ctx.target.clone())
                .collect()
        };

        self.metrics.set_armed_entries(0);
        for target in stopped {
            self.logger.log_entry_cancelled(&target.to_string());
        }
    }

    /// Stop everything and wait for in-flight runs to finish
    pub async fn shutdown(&self) {
        *self.shut_down.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.stop_all();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Scheduler stopped");
    }
}

impl Drop for MonitorScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn count_live(targets: &HashMap<TargetKey, TargetSlot>) -> usize {
    targets
        .values()
        .filter_map(|slot| slot.entry.as_ref())
        .filter(|ctx| ctx.is_live())
        .count()
}

/// Sleep until the wall clock reaches `deadline`; false if cancelled first
async fn sleep_until_wall(clock: &dyn Clock, deadline: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    loop {
        let remaining = match (deadline - clock.now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return !cancel.is_cancelled(),
        };

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(remaining.min(MAX_SLEEP)) => {}
        }
    }
}

async fn timer_loop(ctx: Arc<EntryContext>) {
    loop {
        let fire_at = ctx.clock.next_fire(ctx.clock.now(), ctx.entry.fire_time);
        debug!(site = %ctx.target, fire_at = %fire_at, "Next fire scheduled");

        if !sleep_until_wall(ctx.clock.as_ref(), fire_at, &ctx.cancel).await {
            break;
        }

        let fire_date = ctx.clock.local_date(fire_at);
        ctx.tracker.spawn(fire(Arc::clone(&ctx), fire_date));
    }
    debug!(site = %ctx.target, "Timer task exiting");
}

async fn acquire_run_lock(ctx: &EntryContext) -> Option<OwnedMutexGuard<()>> {
    match ctx.config.overrun {
        OverrunPolicy::Skip => match Arc::clone(&ctx.run_lock).try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                ctx.metrics.inc_skipped_fires();
                ctx.logger.log_fire_skipped(&ctx.target.to_string());
                None
            }
        },
        OverrunPolicy::Queue => tokio::select! {
            guard = Arc::clone(&ctx.run_lock).lock_owned() => Some(guard),
            _ = ctx.cancel.cancelled() => None,
        },
    }
}

async fn fire(ctx: Arc<EntryContext>, fire_date: NaiveDate) {
    if ctx.cancel.is_cancelled() {
        return;
    }
    let Some(_guard) = acquire_run_lock(&ctx).await else {
        return;
    };

    let date = fire_date
        .checked_sub_days(Days::new(u64::from(ctx.config.lag_days)))
        .unwrap_or(fire_date);
    let request = ObservationRequest::new(ctx.entry.coordinate, date, ctx.entry.credential.clone());
    let key = request.key();
    let retry = ctx.config.retry;

    let mut attempt = 1;
    loop {
        if !ctx.admit() {
            debug!(key = %key, "Entry stopped before run started");
            break;
        }
        let result = ctx.runner.run(&request).await;
        ctx.release();

        let err = match result {
            Ok(_) => break,
            Err(err) => err,
        };
        ctx.logger.log_failure(&key, &err, attempt);

        if !err.is_retryable() || attempt >= retry.max_attempts.max(1) {
            break;
        }

        let delay = retry.backoff(attempt);
        debug!(key = %key, attempt, delay_secs = delay.as_secs(), "Retrying run");
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
