//! Machine liveness detection.
//!
//! Every tick compares each machine's `last_seen` with the offline threshold,
//! flips `status` on a transition and notifies the owner once per transition.
//! The offline marker table records "already notified"; delivery is
//! at-least-once across crashes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::models::{Machine, MachineStatus};
use crate::db::services::machine_service;
use crate::db::{DbError, DbPool};
use crate::notifications::dispatcher::{DispatchError, NotificationDispatcher};
use crate::notifications::models::Notification;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Database error: {0}")]
    Persistence(#[from] DbError),
    #[error("Notification error: {0}")]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub tick_interval: Duration,
    pub offline_threshold: chrono::Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            offline_threshold: chrono::Duration::minutes(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessTransition {
    Unchanged,
    /// The machine has never reported.
    NeverSeen,
    /// Online to offline. `notified` is false when a marker already existed.
    WentOffline { notified: bool },
    /// Offline without a marker, left behind by a crash before notifying.
    OfflineRenotified,
    CameOnline,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub went_offline: usize,
    pub came_online: usize,
    pub errors: usize,
}

pub struct HeartbeatMonitor {
    pool: DbPool,
    dispatcher: Arc<NotificationDispatcher>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(pool: DbPool, dispatcher: Arc<NotificationDispatcher>, config: HeartbeatConfig) -> Self {
        Self {
            pool,
            dispatcher,
            config,
        }
    }

    /// Runs until `cancel` fires. A tick in progress completes before exit.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            offline_threshold_secs = self.config.offline_threshold.num_seconds(),
            "Heartbeat monitor started."
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Heartbeat monitor stopping.");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_tick(Utc::now()).await {
                        Ok(summary) => {
                            if summary.went_offline > 0 || summary.came_online > 0 || summary.errors > 0 {
                                info!(
                                    checked = summary.checked,
                                    went_offline = summary.went_offline,
                                    came_online = summary.came_online,
                                    errors = summary.errors,
                                    "Heartbeat tick finished."
                                );
                            } else {
                                debug!(checked = summary.checked, "Heartbeat tick finished.");
                            }
                        }
                        Err(e) => error!(error = %e, "Heartbeat tick failed."),
                    }
                }
            }
        }
    }

    /// Checks every machine once as of `now`. A failing machine does not stop the rest.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickSummary, HeartbeatError> {
        let machines = machine_service::list_machines(&self.pool).await?;
        let mut summary = TickSummary::default();

        for machine in &machines {
            summary.checked += 1;
            match self.check_machine(machine, now).await {
                Ok(LivenessTransition::WentOffline { .. } | LivenessTransition::OfflineRenotified) => {
                    summary.went_offline += 1
                }
                Ok(LivenessTransition::CameOnline) => summary.came_online += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.errors += 1;
                    error!(machine_id = machine.id, error = %e, "Failed to check machine liveness.");
                }
            }
        }
        Ok(summary)
    }

    pub async fn check_machine(
        &self,
        machine: &Machine,
        now: DateTime<Utc>,
    ) -> Result<LivenessTransition, HeartbeatError> {
        let Some(last_seen) = machine.last_seen else {
            return Ok(LivenessTransition::NeverSeen);
        };
        let is_stale = now.signed_duration_since(last_seen) > self.config.offline_threshold;

        match (is_stale, machine.status) {
            (true, MachineStatus::Online) => {
                let flipped = machine_service::mark_offline_if_unseen_since(&self.pool, machine.id, last_seen).await?;
                if !flipped {
                    return Ok(LivenessTransition::Unchanged);
                }
                warn!(machine_id = machine.id, %last_seen, "Machine went offline.");

                if machine_service::get_marker(&self.pool, machine.id).await?.is_some() {
                    return Ok(LivenessTransition::WentOffline { notified: false });
                }
                self.notify_offline(machine, now).await?;
                Ok(LivenessTransition::WentOffline { notified: true })
            }
            (true, MachineStatus::Offline) => {
                if machine_service::get_marker(&self.pool, machine.id).await?.is_some() {
                    return Ok(LivenessTransition::Unchanged);
                }
                info!(machine_id = machine.id, "Offline machine has no notification marker, notifying.");
                self.notify_offline(machine, now).await?;
                Ok(LivenessTransition::OfflineRenotified)
            }
            (false, MachineStatus::Offline) => {
                let flipped =
                    machine_service::set_status(&self.pool, machine.id, MachineStatus::Offline, MachineStatus::Online)
                        .await?;
                if !flipped {
                    return Ok(LivenessTransition::Unchanged);
                }
                info!(machine_id = machine.id, "Machine is back online.");

                let notification = Notification::machine_online(machine, now);
                if let Err(e) = self.dispatcher.fan_out(machine.user_id, &notification).await {
                    error!(machine_id = machine.id, error = %e, "Failed to send recovery notification.");
                }
                machine_service::delete_marker(&self.pool, machine.id).await?;
                Ok(LivenessTransition::CameOnline)
            }
            (false, MachineStatus::Online) => Ok(LivenessTransition::Unchanged),
        }
    }

    /// Notifies first, then records the marker. A crash in between repeats the
    /// notification on the next tick.
    async fn notify_offline(&self, machine: &Machine, now: DateTime<Utc>) -> Result<(), HeartbeatError> {
        let notification = Notification::machine_offline(machine, now);
        self.dispatcher.fan_out(machine.user_id, &notification).await?;
        machine_service::create_marker(&self.pool, machine.id, now).await?;
        Ok(())
    }
}
