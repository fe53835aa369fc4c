use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};

use crate::{
    domain,
    error::{Result, TrackerError},
    goals::AlertPolicy,
    store::{Scope, Store},
};

const KEY_CATEGORIES: &str = "categories";
const KEY_GOALS: &str = "goals";
const KEY_BLOCKED_SITES: &str = "blockedSites";
const KEY_FOCUS_MODE: &str = "focusModeEnabled";
const KEY_NOTIFICATIONS: &str = "notificationsEnabled";
const KEY_GOAL_ALERT_POLICY: &str = "goalAlertPolicy";
const KEY_FOCUS_TIMER: &str = "focusTimer";

const ALL_KEYS: &[&str] = &[
    KEY_CATEGORIES,
    KEY_GOALS,
    KEY_BLOCKED_SITES,
    KEY_FOCUS_MODE,
    KEY_NOTIFICATIONS,
    KEY_GOAL_ALERT_POLICY,
    KEY_FOCUS_TIMER,
];

pub const DEFAULT_FOCUS_TIMER_SECONDS: u64 = 25 * 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Category {
    Productive,
    #[default]
    Neutral,
    Distracting,
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "productive" => Category::Productive,
            "distracting" => Category::Distracting,
            _ => Category::Neutral,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub categories: BTreeMap<String, Category>,
    /// Daily limit in minutes per domain.
    pub goals: BTreeMap<String, u64>,
    pub blocked_sites: BTreeSet<String>,
    pub focus_mode_enabled: bool,
    pub notifications_enabled: bool,
    pub goal_alert_policy: AlertPolicy,
    #[serde(rename = "focusTimer")]
    pub focus_timer_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            categories: BTreeMap::new(),
            goals: BTreeMap::new(),
            blocked_sites: BTreeSet::new(),
            focus_mode_enabled: false,
            notifications_enabled: true,
            goal_alert_policy: AlertPolicy::default(),
            focus_timer_seconds: DEFAULT_FOCUS_TIMER_SECONDS,
        }
    }
}

impl Settings {
    /// What a fresh install starts with.
    pub fn seeded() -> Self {
        let mut categories = BTreeMap::new();
        for d in ["github.com", "stackoverflow.com"] {
            categories.insert(d.to_string(), Category::Productive);
        }
        for d in ["youtube.com", "facebook.com", "twitter.com", "instagram.com"] {
            categories.insert(d.to_string(), Category::Distracting);
        }
        Self {
            categories,
            ..Self::default()
        }
    }

    pub fn category_of(&self, subject: &str) -> Category {
        self.categories.get(subject).copied().unwrap_or_default()
    }

    fn to_entries(&self) -> Result<Vec<(String, Value)>> {
        Ok(vec![
            (KEY_CATEGORIES.into(), serde_json::to_value(&self.categories)?),
            (KEY_GOALS.into(), serde_json::to_value(&self.goals)?),
            (KEY_BLOCKED_SITES.into(), serde_json::to_value(&self.blocked_sites)?),
            (KEY_FOCUS_MODE.into(), Value::Bool(self.focus_mode_enabled)),
            (KEY_NOTIFICATIONS.into(), Value::Bool(self.notifications_enabled)),
            (
                KEY_GOAL_ALERT_POLICY.into(),
                serde_json::to_value(self.goal_alert_policy)?,
            ),
            (KEY_FOCUS_TIMER.into(), Value::from(self.focus_timer_seconds)),
        ])
    }
}

/// Partial update; absent fields are left alone. Also the shape of the
/// `settings` object inside an import document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default)]
    pub categories: Option<BTreeMap<String, Category>>,
    #[serde(default)]
    pub goals: Option<BTreeMap<String, u64>>,
    #[serde(default)]
    pub blocked_sites: Option<BTreeSet<String>>,
    #[serde(default)]
    pub focus_mode_enabled: Option<bool>,
    #[serde(default)]
    pub notifications_enabled: Option<bool>,
    #[serde(default)]
    pub goal_alert_policy: Option<AlertPolicy>,
    #[serde(default, rename = "focusTimer")]
    pub focus_timer_seconds: Option<u64>,
}

impl SettingsUpdate {
    pub fn apply(self, settings: &mut Settings) {
        if let Some(v) = self.categories {
            settings.categories = v
                .into_iter()
                .map(|(d, c)| (domain::normalize_entry(&d), c))
                .filter(|(d, _)| !d.is_empty())
                .collect();
        }
        if let Some(v) = self.goals {
            settings.goals = v
                .into_iter()
                .map(|(d, m)| (domain::normalize_entry(&d), m))
                .filter(|(d, _)| !d.is_empty())
                .collect();
        }
        if let Some(v) = self.blocked_sites {
            settings.blocked_sites = v
                .iter()
                .map(|d| domain::normalize_entry(d))
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Some(v) = self.focus_mode_enabled {
            settings.focus_mode_enabled = v;
        }
        if let Some(v) = self.notifications_enabled {
            settings.notifications_enabled = v;
        }
        if let Some(v) = self.goal_alert_policy {
            settings.goal_alert_policy = v;
        }
        if let Some(v) = self.focus_timer_seconds {
            settings.focus_timer_seconds = v.max(1);
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsExport {
    pub categories: BTreeMap<String, Category>,
    pub settings: Settings,
    pub export_date: String,
}

#[derive(Debug, Deserialize)]
struct SettingsImport {
    #[serde(default)]
    categories: Option<BTreeMap<String, Category>>,
    #[serde(default)]
    settings: Option<SettingsUpdate>,
}

/// Reads settings, seeding the defaults when the settings scope is empty.
///
/// Each field is decoded on its own: a missing or malformed value falls back
/// to its default without discarding the rest.
pub async fn load_or_init(store: &Store) -> Result<Settings> {
    if store.is_empty(Scope::Sync).await? {
        let seeded = Settings::seeded();
        store.set(Scope::Sync, seeded.to_entries()?).await?;
        info!("seeded default settings");
        return Ok(seeded);
    }

    let mut raw = store.get(Scope::Sync, ALL_KEYS).await?;
    let defaults = Settings::default();
    Ok(Settings {
        categories: field(&mut raw, KEY_CATEGORIES, defaults.categories),
        goals: field(&mut raw, KEY_GOALS, defaults.goals),
        blocked_sites: field(&mut raw, KEY_BLOCKED_SITES, defaults.blocked_sites),
        focus_mode_enabled: field(&mut raw, KEY_FOCUS_MODE, defaults.focus_mode_enabled),
        notifications_enabled: field(&mut raw, KEY_NOTIFICATIONS, defaults.notifications_enabled),
        goal_alert_policy: field(&mut raw, KEY_GOAL_ALERT_POLICY, defaults.goal_alert_policy),
        focus_timer_seconds: field(&mut raw, KEY_FOCUS_TIMER, defaults.focus_timer_seconds),
    })
}

/// Like [`load_or_init`], but never fails: store errors are logged and the
/// defaults are used for this one read.
pub async fn load_or_default(store: &Store) -> Settings {
    match load_or_init(store).await {
        Ok(s) => s,
        Err(err) => {
            warn!("settings load failed, using defaults: {err}");
            Settings::default()
        }
    }
}

pub async fn save(store: &Store, settings: &Settings) -> Result<()> {
    store.set(Scope::Sync, settings.to_entries()?).await
}

pub async fn update(store: &Store, update: SettingsUpdate) -> Result<Settings> {
    let mut settings = load_or_init(store).await?;
    update.apply(&mut settings);
    save(store, &settings).await?;
    Ok(settings)
}

pub async fn set_focus_mode(store: &Store, enabled: bool) -> Result<()> {
    store
        .set(Scope::Sync, vec![(KEY_FOCUS_MODE.into(), Value::Bool(enabled))])
        .await
}

pub async fn export(store: &Store) -> Result<SettingsExport> {
    let settings = load_or_init(store).await?;
    Ok(SettingsExport {
        categories: settings.categories.clone(),
        settings,
        export_date: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
    })
}

/// Applies an exported document. Top-level `categories` wins over
/// `settings.categories` when both are present.
pub async fn import(store: &Store, doc: Value) -> Result<Settings> {
    if !doc.is_object() {
        return Err(TrackerError::InvalidImport("expected a JSON object"));
    }
    let doc: SettingsImport = serde_json::from_value(doc)?;
    let mut update = doc.settings.unwrap_or_default();
    if let Some(categories) = doc.categories {
        update.categories = Some(categories);
    }
    self::update(store, update).await
}

/// Clears both scopes. Defaults are re-seeded on the next settings read.
pub async fn clear_all(store: &Store) -> Result<()> {
    let settings_removed = store.clear(Scope::Sync).await?;
    let data_removed = store.clear(Scope::Local).await?;
    info!("cleared all data ({settings_removed} settings keys, {data_removed} data keys)");
    Ok(())
}

fn field<T: DeserializeOwned>(
    raw: &mut std::collections::HashMap<String, Value>,
    key: &str,
    default: T,
) -> T {
    match raw.remove(key) {
        None | Some(Value::Null) => default,
        Some(v) => serde_json::from_value(v).unwrap_or_else(|err| {
            warn!("settings field {key} malformed, using default: {err}");
            default
        }),
    }
}
