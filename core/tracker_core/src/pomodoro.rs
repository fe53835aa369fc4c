use serde::Serialize;
use std::{sync::Arc, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::info;

use crate::{notify::Notifier, settings, store::Store};

const TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PomodoroStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Stopped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PomodoroState {
    pub status: PomodoroStatus,
    pub target_ms: u64,
    pub remaining_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PomodoroError {
    AlreadyRunning,
    InvalidDuration,
}

impl PomodoroError {
    pub fn code(&self) -> &'static str {
        match self {
            PomodoroError::AlreadyRunning => "already_running",
            PomodoroError::InvalidDuration => "invalid_seconds",
        }
    }
}

/// Focus countdown. The only operation in the service that can be cancelled.
#[derive(Clone)]
pub struct Pomodoro {
    state: Arc<Mutex<PomodoroState>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    store: Store,
    notifier: Notifier,
}

impl Pomodoro {
    pub fn new(store: Store, notifier: Notifier) -> Self {
        Self {
            state: Arc::new(Mutex::new(PomodoroState::default())),
            ticker: Arc::new(Mutex::new(None)),
            store,
            notifier,
        }
    }

    pub async fn snapshot(&self) -> PomodoroState {
        self.state.lock().await.clone()
    }

    /// Starts a countdown of `seconds`, or of the configured focus timer.
    pub async fn start(&self, seconds: Option<u64>) -> Result<PomodoroState, PomodoroError> {
        let seconds = match seconds {
            Some(0) => return Err(PomodoroError::InvalidDuration),
            Some(s) => s,
            None => settings::load_or_default(&self.store).await.focus_timer_seconds,
        };

        let mut ticker = self.ticker.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.status == PomodoroStatus::Running {
                return Err(PomodoroError::AlreadyRunning);
            }
            let target_ms = seconds.saturating_mul(1000);
            *state = PomodoroState {
                status: PomodoroStatus::Running,
                target_ms,
                remaining_ms: target_ms,
                started_at: Some(OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()),
            };
            state.clone()
        };

        let this = self.clone();
        *ticker = Some(tokio::spawn(async move { this.run().await }));
        info!("pomodoro started for {seconds}s");
        Ok(snapshot)
    }

    /// Cancels a running countdown. No completion notification is raised.
    pub async fn stop(&self) -> PomodoroState {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
        let mut state = self.state.lock().await;
        if state.status == PomodoroStatus::Running {
            state.status = PomodoroStatus::Stopped;
            info!("pomodoro stopped with {}ms remaining", state.remaining_ms);
        }
        state.clone()
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(TICK);
        interval.tick().await;
        loop {
            interval.tick().await;
            let done = {
                let mut state = self.state.lock().await;
                if state.status != PomodoroStatus::Running {
                    return;
                }
                state.remaining_ms = state.remaining_ms.saturating_sub(TICK.as_millis() as u64);
                if state.remaining_ms == 0 {
                    state.status = PomodoroStatus::Completed;
                }
                state.remaining_ms == 0
            };
            if done {
                let enabled = settings::load_or_default(&self.store).await.notifications_enabled;
                self.notifier
                    .raise(
                        enabled,
                        "Focus Session Complete!",
                        "Great job! You completed a focus session. Take a short break.",
                    )
                    .await;
                info!("pomodoro completed");
                return;
            }
        }
    }
}
