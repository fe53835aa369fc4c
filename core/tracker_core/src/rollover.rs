use chrono::{DateTime, Days, Local, NaiveDate, TimeZone};
use std::time::Duration;
use tracing::{error, info};

use crate::{
    aggregate::{date_key, history_key, Aggregator},
    error::Result,
    store::Scope,
};

pub const DAILY_RESET_ALARM: &str = "dailyReset";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub fn yesterday(now: DateTime<Local>) -> NaiveDate {
    let today = now.date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

/// Time from `now` to the next local midnight.
pub fn until_next_midnight(now: DateTime<Local>) -> Duration {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0));
    let next = tomorrow.and_then(|t| Local.from_local_datetime(&t).earliest());
    match next {
        Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
        None => DAY,
    }
}

/// Copies the aggregate of `date` verbatim into history.
///
/// Returns whether there was anything to archive. Running it again for the
/// same date rewrites the same value.
pub async fn archive_day(aggregator: &Aggregator, date: NaiveDate) -> Result<bool> {
    let _guard = aggregator.lock_date(date).await;
    let store = aggregator.store();
    let Some(raw) = store.get_one(Scope::Local, &date_key(date)).await? else {
        return Ok(false);
    };
    store
        .set(Scope::Local, vec![(history_key(date), raw)])
        .await?;
    Ok(true)
}

/// Archives yesterday relative to `now`, logging instead of failing.
pub async fn run_once(aggregator: &Aggregator, now: DateTime<Local>) -> bool {
    let date = yesterday(now);
    match archive_day(aggregator, date).await {
        Ok(true) => {
            info!("archived {} into history", date_key(date));
            true
        }
        Ok(false) => {
            info!("nothing to archive for {}", date_key(date));
            false
        }
        Err(err) => {
            error!("rollover for {} failed: {err}", date_key(date));
            false
        }
    }
}

/// Fires at the next local midnight, then every 24h.
pub async fn run_timer(aggregator: Aggregator) {
    let first = tokio::time::Instant::now() + until_next_midnight(Local::now());
    let mut ticker = tokio::time::interval_at(first, DAY);
    info!("daily rollover scheduled in {}s", until_next_midnight(Local::now()).as_secs());
    loop {
        ticker.tick().await;
        run_once(&aggregator, Local::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{settings::Settings, store::Store};
    use chrono::Timelike;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, 0, 0).earliest().unwrap()
    }

    #[test]
    fn yesterday_crosses_month_boundary() {
        assert_eq!(
            yesterday(at(2026, 11, 1, 0)),
            NaiveDate::from_ymd_opt(2026, 10, 31).unwrap()
        );
    }

    #[test]
    fn next_midnight_is_within_a_day() {
        let now = at(2026, 10, 19, 12);
        let wait = until_next_midnight(now);
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(25 * 3600));
        let fired = now + chrono::Duration::from_std(wait).unwrap();
        assert_eq!(fired.hour(), 0);
        assert_eq!(fired.date_naive(), NaiveDate::from_ymd_opt(2026, 10, 20).unwrap());
    }

    #[tokio::test]
    async fn archiving_twice_leaves_one_identical_entry() {
        let store = Store::open_in_memory().unwrap();
        let agg = Aggregator::new(store.clone());
        let day = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        agg.commit("a.com", 5000, day, &Settings::default()).await.unwrap();

        assert!(archive_day(&agg, day).await.unwrap());
        assert!(archive_day(&agg, day).await.unwrap());

        let keys = store.keys_with_prefix(Scope::Local, "history_").await.unwrap();
        assert_eq!(keys, vec!["history_2026-10-18"]);
        assert_eq!(agg.history_dates().await.unwrap(), vec![day]);
        assert_eq!(agg.load_history(day).await.unwrap(), agg.load(day).await.unwrap());
        // The live aggregate is left in place.
        assert!(agg.load(day).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nothing_to_archive_for_an_empty_day() {
        let agg = Aggregator::new(Store::open_in_memory().unwrap());
        assert!(!run_once(&agg, at(2026, 10, 19, 0)).await);
    }
}
