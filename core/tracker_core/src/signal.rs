use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Browser-side id used for "no window has focus".
pub const WINDOW_ID_NONE: i64 = -1;

const MAX_TRACKED_TABS: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TabSnapshot {
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "windowId")]
    pub window_id: Option<i64>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// Every environment notification the tracker reacts to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    TabActivated {
        #[serde(alias = "tabId")]
        tab_id: i64,
        #[serde(default)]
        url: Option<String>,
        #[serde(default, alias = "windowId")]
        window_id: Option<i64>,
    },
    TabUpdated {
        #[serde(alias = "tabId")]
        tab_id: i64,
        #[serde(default)]
        status: Option<String>,
        tab: TabSnapshot,
    },
    WindowFocusChanged {
        #[serde(default, alias = "windowId")]
        window_id: Option<i64>,
        #[serde(default, alias = "activeTab")]
        active_tab: Option<TabSnapshot>,
    },
    IdleStateChanged {
        state: IdleState,
        #[serde(default, alias = "activeTab")]
        active_tab: Option<TabSnapshot>,
    },
    AlarmFired {
        name: String,
    },
    ForegroundPageHidden {
        url: String,
        #[serde(alias = "elapsedMs", alias = "timeSpent")]
        elapsed_ms: i64,
        #[serde(default, alias = "tabId")]
        tab_id: Option<i64>,
    },
    ForegroundPageUnloading {
        url: String,
        #[serde(alias = "elapsedMs", alias = "timeSpent")]
        elapsed_ms: i64,
        #[serde(default, alias = "tabId")]
        tab_id: Option<i64>,
    },
    UserInactive {
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(other)]
    Unrecognized,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::TabActivated { .. } => "tab_activated",
            Signal::TabUpdated { .. } => "tab_updated",
            Signal::WindowFocusChanged { .. } => "window_focus_changed",
            Signal::IdleStateChanged { .. } => "idle_state_changed",
            Signal::AlarmFired { .. } => "alarm_fired",
            Signal::ForegroundPageHidden { .. } => "foreground_page_hidden",
            Signal::ForegroundPageUnloading { .. } => "foreground_page_unloading",
            Signal::UserInactive { .. } => "user_inactive",
            Signal::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidTs,
    InvalidSignal,
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::InvalidTs => "invalid_ts",
            ParseError::InvalidSignal => "invalid_signal",
        }
    }
}

/// Decodes a wire signal. An unknown `type` decodes to
/// [`Signal::Unrecognized`]; a known type with a bad body is an error.
pub fn parse(payload: Value) -> Result<Signal, ParseError> {
    if let Some(ts) = payload.get("ts") {
        let ok = ts
            .as_str()
            .map(|s| OffsetDateTime::parse(s, &Rfc3339).is_ok())
            .unwrap_or(false);
        if !ok {
            return Err(ParseError::InvalidTs);
        }
    }
    serde_json::from_value(payload).map_err(|_| ParseError::InvalidSignal)
}

#[derive(Clone, Debug, Default)]
struct TabInfo {
    url: Option<String>,
    window_id: Option<i64>,
}

/// Last known URL and window of each tab, and the active tab of each window.
///
/// Lets signals that only name a tab or a window resolve to a URL.
#[derive(Debug, Default)]
pub struct TabDirectory {
    tabs: HashMap<i64, TabInfo>,
    active_by_window: HashMap<i64, i64>,
    focused_window: Option<i64>,
}

impl TabDirectory {
    pub fn observe(&mut self, signal: &Signal) {
        match signal {
            Signal::TabActivated {
                tab_id,
                url,
                window_id,
            } => {
                self.record(*tab_id, url.clone(), *window_id);
                if let Some(w) = window_id {
                    self.active_by_window.insert(*w, *tab_id);
                    self.focused_window = Some(*w);
                }
            }
            Signal::TabUpdated { tab, .. } => self.record_snapshot(tab),
            Signal::WindowFocusChanged {
                window_id,
                active_tab,
            } => {
                self.focused_window = window_id.filter(|w| *w != WINDOW_ID_NONE);
                if let Some(tab) = active_tab {
                    let mut tab = tab.clone();
                    tab.active = true;
                    if tab.window_id.is_none() {
                        tab.window_id = self.focused_window;
                    }
                    self.record_snapshot(&tab);
                }
            }
            Signal::IdleStateChanged {
                active_tab: Some(tab),
                ..
            } => self.record_snapshot(tab),
            _ => {}
        }
        self.prune();
    }

    pub fn url_of(&self, tab_id: i64) -> Option<String> {
        self.tabs.get(&tab_id).and_then(|t| t.url.clone())
    }

    /// Active tab of `window`, or of the last focused window.
    pub fn active_tab(&self, window: Option<i64>) -> Option<(i64, String)> {
        let window = window.or(self.focused_window)?;
        let tab_id = *self.active_by_window.get(&window)?;
        Some((tab_id, self.url_of(tab_id)?))
    }

    fn record_snapshot(&mut self, tab: &TabSnapshot) {
        self.record(tab.id, tab.url.clone(), tab.window_id);
        if tab.active {
            if let Some(w) = tab.window_id {
                self.active_by_window.insert(w, tab.id);
            }
        }
    }

    fn record(&mut self, tab_id: i64, url: Option<String>, window_id: Option<i64>) {
        let info = self.tabs.entry(tab_id).or_default();
        if url.is_some() {
            info.url = url;
        }
        if window_id.is_some() {
            info.window_id = window_id;
        }
    }

    fn prune(&mut self) {
        if self.tabs.len() <= MAX_TRACKED_TABS {
            return;
        }
        let keep: Vec<i64> = self.active_by_window.values().copied().collect();
        self.tabs.retain(|id, _| keep.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_known_signal() {
        let cases = [
            json!({"type": "tab_activated", "tab_id": 1, "url": "https://a.com"}),
            json!({"type": "tab_updated", "tabId": 1, "status": "complete",
                   "tab": {"id": 1, "url": "https://a.com", "windowId": 3, "active": true}}),
            json!({"type": "window_focus_changed", "window_id": null}),
            json!({"type": "idle_state_changed", "state": "locked"}),
            json!({"type": "alarm_fired", "name": "dailyReset"}),
            json!({"type": "foreground_page_hidden", "url": "https://a.com", "timeSpent": 4000}),
            json!({"type": "foreground_page_unloading", "url": "https://a.com", "elapsed_ms": 4000}),
            json!({"type": "user_inactive", "url": "https://a.com"}),
        ];
        for c in cases {
            let s = parse(c.clone()).unwrap_or_else(|e| panic!("{c}: {e:?}"));
            assert_ne!(s, Signal::Unrecognized, "{c}");
        }
    }

    #[test]
    fn page_signals_carry_optional_tab_id() {
        assert_eq!(
            parse(json!({"type": "foreground_page_hidden", "url": "https://a.com",
                         "elapsedMs": 10, "tabId": 9})),
            Ok(Signal::ForegroundPageHidden {
                url: "https://a.com".into(),
                elapsed_ms: 10,
                tab_id: Some(9),
            })
        );
        assert!(matches!(
            parse(json!({"type": "foreground_page_unloading", "url": "https://a.com", "timeSpent": 10})),
            Ok(Signal::ForegroundPageUnloading { tab_id: None, .. })
        ));
    }

    #[test]
    fn unknown_type_is_unrecognized_not_an_error() {
        assert_eq!(
            parse(json!({"type": "tab_removed", "tab_id": 4})),
            Ok(Signal::Unrecognized)
        );
    }

    #[test]
    fn bad_body_or_ts_is_rejected() {
        assert_eq!(
            parse(json!({"type": "tab_activated"})),
            Err(ParseError::InvalidSignal)
        );
        assert_eq!(
            parse(json!({"type": "user_inactive", "ts": "yesterday"})),
            Err(ParseError::InvalidTs)
        );
        assert!(parse(json!({"type": "user_inactive", "ts": "2026-10-19T10:00:00Z"})).is_ok());
    }

    #[test]
    fn directory_resolves_tabs_and_windows() {
        let mut d = TabDirectory::default();
        d.observe(&Signal::TabUpdated {
            tab_id: 7,
            status: Some("complete".into()),
            tab: TabSnapshot {
                id: 7,
                url: Some("https://a.com/x".into()),
                window_id: Some(2),
                active: true,
            },
        });
        d.observe(&Signal::WindowFocusChanged {
            window_id: Some(2),
            active_tab: None,
        });
        assert_eq!(d.url_of(7).as_deref(), Some("https://a.com/x"));
        assert_eq!(d.active_tab(None), Some((7, "https://a.com/x".to_string())));

        d.observe(&Signal::WindowFocusChanged {
            window_id: Some(WINDOW_ID_NONE),
            active_tab: None,
        });
        assert_eq!(d.active_tab(None), None);
        assert_eq!(d.active_tab(Some(2)).map(|t| t.0), Some(7));
    }
}
