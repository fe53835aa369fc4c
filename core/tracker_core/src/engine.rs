use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    aggregate::{Aggregator, Committed},
    domain,
    focus::{self, FocusDecision},
    goals::GoalAlert,
    notify::Notifier,
    rollover,
    session::{ActiveSession, Commit, OpenOutcome, SessionTracker},
    settings::{self, Settings},
    signal::{IdleState, Signal, TabDirectory, WINDOW_ID_NONE},
};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub min_commit_ms: u64,
    pub blocked_page_url: String,
}

/// Outbound request for the browser side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NavigateTab { tab_id: i64, url: String },
}

/// What handling one signal did.
#[derive(Debug, Default, Serialize)]
pub struct SignalOutcome {
    pub session: Option<ActiveSession>,
    pub commits: Vec<Committed>,
    pub alerts: Vec<GoalAlert>,
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepted: Option<String>,
    #[serde(skip)]
    pub unrecognized: bool,
}

/// Single writer of the session state.
///
/// Callers hand every signal to [`Engine::handle`] one at a time, in arrival
/// order; the engine is never shared between concurrent handlers.
pub struct Engine {
    tracker: SessionTracker,
    tabs: TabDirectory,
    aggregator: Aggregator,
    notifier: Notifier,
    config: EngineConfig,
}

impl Engine {
    pub fn new(aggregator: Aggregator, notifier: Notifier, config: EngineConfig) -> Self {
        Self {
            tracker: SessionTracker::new(config.min_commit_ms),
            tabs: TabDirectory::default(),
            aggregator,
            notifier,
            config,
        }
    }

    pub fn current(&self) -> Option<&ActiveSession> {
        self.tracker.current()
    }

    pub async fn handle(&mut self, signal: Signal, now: DateTime<Local>) -> SignalOutcome {
        let mut out = SignalOutcome::default();
        self.tabs.observe(&signal);
        debug!("signal {}", signal.kind());

        match signal {
            Signal::TabActivated { tab_id, url, .. } => {
                let url = non_empty(url).or_else(|| self.tabs.url_of(tab_id));
                if let Some(url) = non_empty(url) {
                    self.open_url(&url, Some(tab_id), now, &mut out).await;
                }
            }
            Signal::TabUpdated { tab_id, status, tab } => {
                if status.as_deref() == Some("complete") && tab.active {
                    let url = non_empty(tab.url).or_else(|| self.tabs.url_of(tab_id));
                    if let Some(url) = non_empty(url) {
                        self.open_url(&url, Some(tab_id), now, &mut out).await;
                    }
                }
            }
            Signal::WindowFocusChanged {
                window_id,
                active_tab,
            } => match window_id.filter(|w| *w != WINDOW_ID_NONE) {
                None => self.close(now, None, &mut out).await,
                Some(w) => {
                    let resolved = active_tab
                        .and_then(|t| t.url.clone().map(|u| (t.id, u)))
                        .or_else(|| self.tabs.active_tab(Some(w)));
                    if let Some((tab_id, url)) = resolved {
                        self.open_url(&url, Some(tab_id), now, &mut out).await;
                    }
                }
            },
            Signal::IdleStateChanged { state, active_tab } => match state {
                IdleState::Idle | IdleState::Locked => self.close(now, None, &mut out).await,
                IdleState::Active => {
                    let resolved = active_tab
                        .and_then(|t| t.url.clone().map(|u| (t.id, u)))
                        .or_else(|| self.tabs.active_tab(None));
                    if let Some((tab_id, url)) = resolved {
                        self.open_url(&url, Some(tab_id), now, &mut out).await;
                    }
                }
            },
            Signal::AlarmFired { name } => {
                if name == rollover::DAILY_RESET_ALARM {
                    rollover::run_once(&self.aggregator, now).await;
                } else {
                    debug!("ignoring alarm {name}");
                }
            }
            Signal::ForegroundPageHidden {
                url,
                elapsed_ms,
                tab_id,
            }
            | Signal::ForegroundPageUnloading {
                url,
                elapsed_ms,
                tab_id,
            } => {
                // A page the user already left may report late; only the page
                // of the open session may close it.
                let owns_session = self.tracker.current().is_some_and(|s| {
                    s.subject == domain::normalize(&url)
                        && match (tab_id, s.tab_id) {
                            (Some(page), Some(session)) => page == session,
                            _ => true,
                        }
                });
                if owns_session {
                    self.close(now, Some(elapsed_ms), &mut out).await;
                } else {
                    debug!("ignoring stale page signal from {url}");
                }
            }
            Signal::UserInactive { .. } => self.close(now, None, &mut out).await,
            Signal::Unrecognized => {
                warn!("unrecognized signal");
                out.unrecognized = true;
            }
        }

        out.session = self.tracker.current().cloned();
        out
    }

    /// Closes the open session, if any. Used on shutdown.
    pub async fn shutdown(&mut self, now: DateTime<Local>) -> SignalOutcome {
        let mut out = SignalOutcome::default();
        self.close(now, None, &mut out).await;
        out
    }

    async fn open_url(
        &mut self,
        url: &str,
        tab_id: Option<i64>,
        now: DateTime<Local>,
        out: &mut SignalOutcome,
    ) {
        if domain::is_internal_url(url, Some(&self.config.blocked_page_url)) {
            self.close(now, None, out).await;
            return;
        }
        let subject = domain::normalize(url);
        let settings = settings::load_or_default(self.aggregator.store()).await;

        let decision = focus::decide(&subject, &settings, &self.config.blocked_page_url);
        if let FocusDecision::Intercept {
            subject,
            redirect_url,
        } = decision
        {
            self.close(now, None, out).await;
            info!("focus mode intercepted {subject}");
            let (title, body) = focus::blocked_notification(&subject);
            self.notifier
                .raise(settings.notifications_enabled, title, &body)
                .await;
            if let Some(tab_id) = tab_id {
                out.actions.push(Action::NavigateTab {
                    tab_id,
                    url: redirect_url,
                });
            }
            out.intercepted = Some(subject);
            return;
        }

        match self.tracker.open(&subject, tab_id, now.timestamp_millis()) {
            OpenOutcome::AlreadyActive => {}
            OpenOutcome::Opened { closed } => {
                if let Some(c) = closed {
                    self.record(c, &settings, now, out).await;
                }
            }
        }
    }

    async fn close(&mut self, now: DateTime<Local>, observed_ms: Option<i64>, out: &mut SignalOutcome) {
        let Some(c) = self.tracker.close_observed(now.timestamp_millis(), observed_ms) else {
            return;
        };
        let settings = settings::load_or_default(self.aggregator.store()).await;
        self.record(c, &settings, now, out).await;
    }

    /// Commits to the store. A failed write loses this one data point only.
    async fn record(
        &mut self,
        c: Commit,
        settings: &Settings,
        now: DateTime<Local>,
        out: &mut SignalOutcome,
    ) {
        let committed = match self
            .aggregator
            .commit(&c.subject, c.duration_ms, now.date_naive(), settings)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                error!("dropping {}ms for {}: {err}", c.duration_ms, c.subject);
                return;
            }
        };
        if let Some(alert) = &committed.alert {
            self.notifier
                .raise(settings.notifications_enabled, alert.title(), &alert.body())
                .await;
            out.alerts.push(alert.clone());
        }
        out.commits.push(committed);
    }
}

/// Tabs without a URL yet (new tab, still loading) report an empty one.
fn non_empty(url: Option<String>) -> Option<String> {
    url.filter(|u| !u.trim().is_empty())
}
