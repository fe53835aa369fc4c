use serde::Serialize;

/// Visits shorter than this are navigation noise and never committed.
pub const MIN_COMMIT_MS: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub subject: String,
    pub started_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    NoSession,
    Active(ActiveSession),
}

/// Elapsed time to be added to the aggregate for `subject`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub subject: String,
    pub duration_ms: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Same subject already active; the running timer was kept.
    AlreadyActive,
    /// A new session started. `closed` is the commit of the session it
    /// replaced, if that one was long enough to count.
    Opened { closed: Option<Commit> },
}

/// Owns the single current session. Time is passed in by the caller so the
/// machine itself never reads a clock.
#[derive(Debug)]
pub struct SessionTracker {
    state: SessionState,
    min_commit_ms: u64,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(MIN_COMMIT_MS)
    }
}

impl SessionTracker {
    pub fn new(min_commit_ms: u64) -> Self {
        Self {
            state: SessionState::NoSession,
            min_commit_ms,
        }
    }

    pub fn current(&self) -> Option<&ActiveSession> {
        match &self.state {
            SessionState::Active(s) => Some(s),
            SessionState::NoSession => None,
        }
    }

    pub fn open(&mut self, subject: &str, tab_id: Option<i64>, now_ms: i64) -> OpenOutcome {
        if let SessionState::Active(active) = &mut self.state {
            if active.subject == subject {
                if tab_id.is_some() {
                    active.tab_id = tab_id;
                }
                return OpenOutcome::AlreadyActive;
            }
        }
        let closed = self.close(now_ms);
        self.state = SessionState::Active(ActiveSession {
            subject: subject.to_string(),
            started_at_ms: now_ms,
            tab_id,
        });
        OpenOutcome::Opened { closed }
    }

    pub fn close(&mut self, now_ms: i64) -> Option<Commit> {
        self.close_observed(now_ms, None)
    }

    /// Closes the session, preferring a duration measured by the page itself.
    ///
    /// The observed duration never exceeds the time this session has been
    /// open, so time already attributed elsewhere (or lost to idle) is not
    /// counted twice. A clock that went backwards yields zero.
    pub fn close_observed(&mut self, now_ms: i64, observed_ms: Option<i64>) -> Option<Commit> {
        let SessionState::Active(active) = std::mem::take(&mut self.state) else {
            return None;
        };
        let elapsed = now_ms.saturating_sub(active.started_at_ms).max(0) as u64;
        let duration_ms = match observed_ms {
            Some(o) => (o.max(0) as u64).min(elapsed),
            None => elapsed,
        };
        if duration_ms < self.min_commit_ms {
            return None;
        }
        Some(Commit {
            subject: active.subject,
            duration_ms,
        })
    }
}
