//! Per-tier scheduling loops.
//!
//! Each priority tier runs its own task: it wakes on a timer, on a
//! [`Notify`] (new CRITICAL work, connectivity restored, operator action)
//! or on shutdown, and drains its tier through the engine while batches
//! keep making progress.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use driftsync_common::Priority;

use crate::backoff::Backoff;
use crate::batch::BatchResult;
use crate::engine::SyncEngine;
use crate::events::EngineEvent;
use crate::network::ConnectivityState;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often an idle tier looks for work.
    pub tick_interval: Duration,
    /// How often the network is actively probed; `None` disables the
    /// sampler and relies on recorded measurements.
    pub sample_interval: Option<Duration>,
    /// Upper bound on batches processed by one `drain_all`.
    pub max_batches_per_drain: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            sample_interval: Some(Duration::from_secs(10)),
            max_batches_per_drain: 64,
        }
    }
}

/// State of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierState {
    Idle,
    Draining,
    Backoff,
}

/// A tier's state machine plus its backoff counter.
#[derive(Debug, Clone)]
pub struct Tier {
    pub state: TierState,
    pub backoff: Backoff,
}

impl Default for Tier {
    fn default() -> Self {
        Self {
            state: TierState::Idle,
            backoff: Backoff::default(),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A batch of this tier is already in flight.
    Busy,
    /// The tier is waiting out its backoff.
    BackingOff,
    /// Current connectivity does not allow this tier.
    NotAllowed(ConnectivityState),
    /// Nothing ready to send.
    Empty,
    /// A batch was processed.
    Processed(BatchResult),
}

impl TickOutcome {
    /// Whether another tick right away could do more work.
    pub fn made_progress(&self) -> bool {
        match self {
            TickOutcome::Processed(result) => {
                (!result.committed.is_empty() || !result.failed.is_empty())
                    && !result.had_network_failure()
            }
            _ => false,
        }
    }
}

/// Running scheduler tasks.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Spawn one loop per tier, the connectivity watcher and, if configured,
    /// the network sampler.
    pub(crate) fn spawn(engine: Arc<SyncEngine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = engine.config().scheduler.clone();
        let mut tasks = Vec::new();

        for priority in Priority::DRAIN_ORDER {
            tasks.push(tokio::spawn(run_tier(
                engine.clone(),
                priority,
                config.tick_interval,
                shutdown_rx.clone(),
            )));
        }

        tasks.push(tokio::spawn(watch_connectivity(
            engine.clone(),
            shutdown_rx.clone(),
        )));

        if let Some(period) = config.sample_interval {
            tasks.push(tokio::spawn(
                engine.monitor().clone().run_sampler(period, shutdown_rx),
            ));
        }

        info!("Scheduler started with {} tasks", tasks.len());
        Self { shutdown_tx, tasks }
    }

    /// Signal every task and wait for it to finish. In-flight batches
    /// complete first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Scheduler task failed: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_tier(
    engine: Arc<SyncEngine>,
    priority: Priority,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let wake: Arc<Notify> = engine.waker(priority);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("Tier {} loop started", priority);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {
                debug!("Tier {} woken", priority);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        loop {
            match engine.tick(priority).await {
                Ok(outcome) if outcome.made_progress() && !*shutdown.borrow() => continue,
                Ok(_) => break,
                Err(e) => {
                    error!("Tier {} tick failed: {}", priority, e);
                    break;
                }
            }
        }
    }
    debug!("Tier {} loop stopped", priority);
}

async fn watch_connectivity(engine: Arc<SyncEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut states = engine.monitor().subscribe();
    let mut last = *states.borrow_and_update();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *states.borrow_and_update();
                if now == last {
                    continue;
                }
                engine.events().emit(EngineEvent::ConnectivityChanged { from: last, to: now });
                if !last.is_online() && now.is_online() {
                    engine.wake_all();
                }
                last = now;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
