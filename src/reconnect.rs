//! Automatic reconnection after an unexpected disconnect.
//!
//! The manager is driven by status events. A qualifying transition into
//! `Disconnected` schedules one delayed [`Reconnectable::reconnect`] call; a
//! failed attempt schedules the next one with a longer delay. At most one
//! attempt is ever scheduled or running.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::BackoffStrategy;
use crate::error::Result;
use crate::session::{ConnectionStatus, StatusEvent};

/// Whatever the manager brings back up; implemented by the session.
#[async_trait]
pub trait Reconnectable: Send + Sync + 'static {
    async fn reconnect(&self) -> Result<()>;

    /// Whether a connection is up right now, however it got there.
    fn is_connected(&self) -> bool;
}

struct Scheduled {
    task: JoinHandle<()>,
    at: SystemTime,
}

#[derive(Default)]
struct ScheduleState {
    enabled: bool,
    stopped: bool,
    attempt: u32,
    in_flight: bool,
    scheduled: Option<Scheduled>,
}

impl ScheduleState {
    fn cancel(&mut self) {
        if let Some(scheduled) = self.scheduled.take() {
            scheduled.task.abort();
            debug!("Scheduled reconnection cancelled");
        }
    }
}

pub struct ReconnectionManager {
    target: Weak<dyn Reconnectable>,
    backoff: Arc<dyn BackoffStrategy>,
    runtime: Handle,
    state: Mutex<ScheduleState>,
}

impl ReconnectionManager {
    pub fn new(
        target: Weak<dyn Reconnectable>,
        backoff: Arc<dyn BackoffStrategy>,
        enabled: bool,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            backoff,
            runtime,
            state: Mutex::new(ScheduleState {
                enabled,
                ..ScheduleState::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Disabling cancels a pending attempt; the current connection is untouched.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.enabled = enabled;
        if !enabled {
            state.cancel();
        }
        info!(enabled, "Automatic reconnection toggled");
    }

    /// When the scheduled attempt fires, if one is scheduled.
    pub fn next_attempt(&self) -> Option<SystemTime> {
        self.lock().scheduled.as_ref().map(|s| s.at)
    }

    /// Number of consecutive failed attempts since the last success.
    pub fn attempt(&self) -> u32 {
        self.lock().attempt
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Cancel everything for good. The manager is not reusable afterwards.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        state.cancel();
    }

    /// Feed one status transition.
    pub fn on_status(self: &Arc<Self>, event: &StatusEvent) {
        match event.current {
            ConnectionStatus::Disconnected => self.on_disconnected(event),
            ConnectionStatus::Connected => {
                // Delivered late: the connection it reports is already gone
                if self.target.upgrade().is_some_and(|t| !t.is_connected()) {
                    debug!("Stale connected event ignored");
                    return;
                }
                let mut state = self.lock();
                state.cancel();
                // A reconnect in flight resets the counter itself once login succeeds
                if !state.in_flight {
                    state.attempt = 0;
                }
            }
            ConnectionStatus::Closed => self.stop(),
            ConnectionStatus::Connecting | ConnectionStatus::Closing => {}
        }
    }

    fn on_disconnected(self: &Arc<Self>, event: &StatusEvent) {
        if event.previous != ConnectionStatus::Connected {
            return;
        }
        if let Some(cause) = &event.cause {
            if !cause.is_retriable() {
                info!(cause = %cause, "Disconnect is final, not reconnecting");
                return;
            }
        }
        if self.target.upgrade().is_some_and(|t| t.is_connected()) {
            debug!("Stale disconnected event ignored");
            return;
        }
        let mut state = self.lock();
        if !state.enabled || state.stopped || state.in_flight || state.scheduled.is_some() {
            return;
        }
        self.schedule(&mut state);
    }

    fn schedule(self: &Arc<Self>, state: &mut ScheduleState) {
        let attempt = state.attempt;
        let delay = self.backoff.next_delay(attempt);
        let at = SystemTime::now() + delay;
        info!(attempt, delay_secs = delay.as_secs(), "Reconnection scheduled");

        let manager = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.fire(attempt).await;
            }
        });
        state.scheduled = Some(Scheduled { task, at });
    }

    async fn fire(self: Arc<Self>, attempt: u32) {
        let target = self.target.upgrade();
        {
            let mut state = self.lock();
            // The timer handle is ours; dropping it must not abort this task
            state.scheduled = None;
            if !state.enabled || state.stopped {
                return;
            }
            match &target {
                None => {
                    debug!("Reconnection target is gone");
                    return;
                }
                Some(target) if target.is_connected() => {
                    info!(attempt, "Already connected, reconnection skipped");
                    state.attempt = 0;
                    return;
                }
                Some(_) => state.in_flight = true,
            }
        }
        let Some(target) = target else {
            return;
        };

        info!(attempt, "Reconnecting");
        let started = std::time::Instant::now();
        let result = target.reconnect().await;

        let mut state = self.lock();
        state.in_flight = false;
        match result {
            Ok(()) => {
                info!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "Reconnected");
                state.attempt = 0;
            }
            // Someone else connected while this attempt waited its turn
            Err(e) if target.is_connected() => {
                info!(attempt, error = %e, "Connection already up, no further attempts");
                state.attempt = 0;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnection attempt failed");
                state.attempt = state.attempt.saturating_add(1);
                if state.enabled && !state.stopped && state.scheduled.is_none() {
                    self.schedule(&mut state);
                }
            }
        }
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.lock().cancel();
    }
}
