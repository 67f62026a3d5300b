use std::sync::Arc;
use std::time::Duration;

use somnus_core::alarm::AlarmManager;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::server::AppState;

/// Background loops owned by the daemon: alarm evaluation and recorder polling.
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(state: AppState, poll_interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(alarm_loop(
                state.alarms.clone(),
                poll_interval,
                cancel.child_token(),
            )),
            tokio::spawn(recording_loop(state, poll_interval, cancel.child_token())),
        ];
        info!(interval_ms = poll_interval.as_millis() as u64, "scheduler started");
        Self { cancel, handles }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

async fn alarm_loop(alarms: Arc<AlarmManager>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                alarms.tick(chrono::Local::now().naive_local()).await;
            }
            _ = cancel.cancelled() => {
                debug!("alarm loop shutting down");
                break;
            }
        }
    }
}

/// Surface recorder errors while nobody is polling the HTTP API.
async fn recording_loop(state: AppState, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = state.recording.lock().await.poll();
                state.sync_shell(status);
            }
            _ = cancel.cancelled() => {
                debug!("recording loop shutting down");
                break;
            }
        }
    }
}
