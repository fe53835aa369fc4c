use serde::Serialize;

use crate::settings::Settings;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FocusDecision {
    Allow,
    Intercept {
        subject: String,
        redirect_url: String,
    },
}

/// Gate run before a session may open for `subject`.
pub fn decide(subject: &str, settings: &Settings, blocked_page_url: &str) -> FocusDecision {
    if !settings.focus_mode_enabled || !settings.blocked_sites.contains(subject) {
        return FocusDecision::Allow;
    }
    FocusDecision::Intercept {
        subject: subject.to_string(),
        redirect_url: blocked_page_url.to_string(),
    }
}

pub fn blocked_notification(subject: &str) -> (&'static str, String) {
    (
        "Focus Mode Active",
        format!("Access to {subject} is blocked during focus mode."),
    )
}
