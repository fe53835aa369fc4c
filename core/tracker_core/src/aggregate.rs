use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{
    error::{Result, TrackerError},
    goals::{self, GoalAlert},
    settings::{Category, Settings},
    store::{Scope, Store},
};

pub const HISTORY_PREFIX: &str = "history_";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStat {
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub visits: u64,
    #[serde(default)]
    pub category: Category,
}

/// Time per domain for one local calendar day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    pub date: NaiveDate,
    #[serde(default)]
    pub total_time: u64,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteStat>,
}

impl DailyAggregate {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_time: 0,
            sites: BTreeMap::new(),
        }
    }

    pub fn productive_time(&self) -> u64 {
        self.sites
            .values()
            .filter(|s| s.category == Category::Productive)
            .map(|s| s.time)
            .sum()
    }

    /// Sites ordered by time spent, longest first.
    pub fn top_sites(&self) -> Vec<(&str, &SiteStat)> {
        let mut v: Vec<_> = self.sites.iter().map(|(d, s)| (d.as_str(), s)).collect();
        v.sort_by(|a, b| b.1.time.cmp(&a.1.time).then_with(|| a.0.cmp(b.0)));
        v
    }
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn history_key(date: NaiveDate) -> String {
    format!("{HISTORY_PREFIX}{}", date_key(date))
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| TrackerError::InvalidDate(s.to_string()))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Committed {
    pub subject: String,
    pub duration_ms: u64,
    pub date: NaiveDate,
    pub stat: SiteStat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<GoalAlert>,
}

/// Sole writer of daily aggregates.
///
/// Read-modify-write of a date's aggregate spans two store calls, so every
/// mutation of a date holds that date's lock for the whole sequence.
#[derive(Clone)]
pub struct Aggregator {
    store: Store,
    date_locks: Arc<Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>>,
}

impl Aggregator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            date_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Serializes all writers of `date`. Entries for dates nobody holds are
    /// pruned on each acquisition.
    pub async fn lock_date(&self, date: NaiveDate) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.date_locks.lock().await;
            locks.retain(|d, l| *d == date || Arc::strong_count(l) > 1);
            locks.entry(date).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn load(&self, date: NaiveDate) -> Result<Option<DailyAggregate>> {
        load_from(&self.store, &date_key(date), date).await
    }

    pub async fn load_history(&self, date: NaiveDate) -> Result<Option<DailyAggregate>> {
        load_from(&self.store, &history_key(date), date).await
    }

    /// Dates with an archived aggregate, oldest first.
    pub async fn history_dates(&self) -> Result<Vec<NaiveDate>> {
        let keys = self.store.keys_with_prefix(Scope::Local, HISTORY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(HISTORY_PREFIX))
            .filter_map(|d| parse_date(d).ok())
            .collect())
    }

    /// Adds `duration_ms` to `subject` on `date`, counts one visit, persists,
    /// then evaluates the subject's goal against the refreshed stat.
    pub async fn commit(
        &self,
        subject: &str,
        duration_ms: u64,
        date: NaiveDate,
        settings: &Settings,
    ) -> Result<Committed> {
        let _guard = self.lock_date(date).await;

        let mut day = self
            .load(date)
            .await?
            .unwrap_or_else(|| DailyAggregate::empty(date));
        let stat = day
            .sites
            .entry(subject.to_string())
            .or_insert_with(|| SiteStat {
                time: 0,
                visits: 0,
                category: settings.category_of(subject),
            });
        stat.time = stat.time.saturating_add(duration_ms);
        stat.visits += 1;
        let stat = stat.clone();
        day.total_time = day.sites.values().map(|s| s.time).sum();

        self.store
            .set(Scope::Local, vec![(date_key(date), serde_json::to_value(&day)?)])
            .await?;
        debug!(
            "committed {duration_ms}ms to {subject} on {} (site {}ms, day {}ms)",
            date_key(date),
            stat.time,
            day.total_time
        );

        let alert = goals::evaluate(subject, &stat, duration_ms, settings);
        Ok(Committed {
            subject: subject.to_string(),
            duration_ms,
            date,
            stat,
            alert,
        })
    }
}

async fn load_from(store: &Store, key: &str, date: NaiveDate) -> Result<Option<DailyAggregate>> {
    let Some(raw) = store.get_one(Scope::Local, key).await? else {
        return Ok(None);
    };
    Ok(Some(decode_aggregate(raw, date)))
}

/// A malformed stored value decodes as an empty day, and
/// the total is recomputed from the sites that did decode.
fn decode_aggregate(raw: serde_json::Value, date: NaiveDate) -> DailyAggregate {
    let mut day = DailyAggregate::empty(date);
    if let Some(sites) = raw.get("sites").and_then(|v| v.as_object()) {
        for (domain, v) in sites {
            match serde_json::from_value::<SiteStat>(v.clone()) {
                Ok(stat) => {
                    day.sites.insert(domain.clone(), stat);
                }
                Err(err) => tracing::warn!("dropping malformed site entry {domain}: {err}"),
            }
        }
    }
    day.total_time = day.sites.values().map(|s| s.time).sum();
    day
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[tokio::test]
    async fn commits_accumulate_time_and_visits() {
        let agg = Aggregator::new(Store::open_in_memory().unwrap());
        let s = Settings::default();
        agg.commit("a.com", 5000, d(), &s).await.unwrap();
        let c = agg.commit("a.com", 3000, d(), &s).await.unwrap();
        assert_eq!(c.stat.time, 8000);
        assert_eq!(c.stat.visits, 2);

        let day = agg.load(d()).await.unwrap().unwrap();
        assert_eq!(day.sites["a.com"].time, 8000);
        assert_eq!(day.sites["a.com"].visits, 2);
        assert_eq!(day.total_time, 8000);
    }

    #[tokio::test]
    async fn total_is_sum_of_sites_and_category_comes_from_settings() {
        let agg = Aggregator::new(Store::open_in_memory().unwrap());
        let s = Settings::seeded();
        agg.commit("github.com", 4000, d(), &s).await.unwrap();
        agg.commit("youtube.com", 2500, d(), &s).await.unwrap();
        agg.commit("example.com", 1000, d(), &s).await.unwrap();

        let day = agg.load(d()).await.unwrap().unwrap();
        assert_eq!(day.total_time, 7500);
        assert_eq!(day.sites["github.com"].category, Category::Productive);
        assert_eq!(day.sites["youtube.com"].category, Category::Distracting);
        assert_eq!(day.sites["example.com"].category, Category::Neutral);
        assert_eq!(day.productive_time(), 4000);
        assert_eq!(day.top_sites()[0].0, "github.com");
    }

    #[tokio::test]
    async fn concurrent_commits_for_one_date_are_not_lost() {
        let agg = Aggregator::new(Store::open_in_memory().unwrap());
        let s = Arc::new(Settings::default());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let agg = agg.clone();
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                agg.commit("a.com", 1000, d(), &s).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let day = agg.load(d()).await.unwrap().unwrap();
        assert_eq!(day.sites["a.com"].visits, 20);
        assert_eq!(day.total_time, 20_000);
    }

    #[tokio::test]
    async fn commit_evaluates_goal() {
        let agg = Aggregator::new(Store::open_in_memory().unwrap());
        let mut s = Settings::default();
        s.goals.insert("a.com".into(), 10);
        let c = agg.commit("a.com", 599_000, d(), &s).await.unwrap();
        assert!(c.alert.is_none());
        let c = agg.commit("a.com", 2_000, d(), &s).await.unwrap();
        assert_eq!(c.alert.unwrap().limit_minutes, 10);
    }

    #[tokio::test]
    async fn malformed_stored_aggregate_is_repaired_on_commit() {
        let store = Store::open_in_memory().unwrap();
        store
            .set(
                Scope::Local,
                vec![(
                    "2026-10-19".into(),
                    json!({"totalTime": "garbage", "sites": {"a.com": {"time": 1000, "visits": 1}, "b.com": 7}}),
                )],
            )
            .await
            .unwrap();
        let agg = Aggregator::new(store);
        agg.commit("a.com", 1000, d(), &Settings::default()).await.unwrap();
        let day = agg.load(d()).await.unwrap().unwrap();
        assert_eq!(day.sites.len(), 1);
        assert_eq!(day.total_time, 2000);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let store = Store::open_in_memory().unwrap();
        let agg = Aggregator::new(store.clone());
        store.break_for_test().await;
        assert!(agg.commit("a.com", 1000, d(), &Settings::default()).await.is_err());
    }

    #[test]
    fn keys_use_iso_dates() {
        assert_eq!(date_key(d()), "2026-10-19");
        assert_eq!(history_key(d()), "history_2026-10-19");
        assert_eq!(parse_date("2026-10-19").unwrap(), d());
        assert!(parse_date("Mon Oct 19 2026").is_err());
    }
}
