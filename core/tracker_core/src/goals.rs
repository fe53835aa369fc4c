use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{DailyAggregate, SiteStat},
    settings::Settings,
};

const MS_PER_MINUTE: u64 = 60_000;

/// When an over-limit site raises an alert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPolicy {
    /// Every commit while the site is over its limit.
    #[default]
    Level,
    /// Only the commit that takes the site over its limit.
    Edge,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GoalAlert {
    pub subject: String,
    pub minutes_spent: u64,
    pub limit_minutes: u64,
}

impl GoalAlert {
    pub fn title(&self) -> &'static str {
        "Goal Exceeded"
    }

    pub fn body(&self) -> String {
        format!(
            "You've spent {} minutes on {}. Your goal was {} minutes.",
            self.minutes_spent, self.subject, self.limit_minutes
        )
    }
}

/// Checks `stat` (already including the commit of `committed_ms`) against the
/// configured limit for `subject`.
pub fn evaluate(
    subject: &str,
    stat: &SiteStat,
    committed_ms: u64,
    settings: &Settings,
) -> Option<GoalAlert> {
    let limit_minutes = *settings.goals.get(subject)?;
    let limit_ms = limit_minutes.saturating_mul(MS_PER_MINUTE);
    if stat.time <= limit_ms {
        return None;
    }
    if settings.goal_alert_policy == AlertPolicy::Edge {
        let before = stat.time.saturating_sub(committed_ms);
        if before > limit_ms {
            return None;
        }
    }
    Some(GoalAlert {
        subject: subject.to_string(),
        minutes_spent: round_minutes(stat.time),
        limit_minutes,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GoalProgress {
    pub domain: String,
    pub limit_minutes: u64,
    pub time_spent_ms: u64,
    pub goal_time_ms: u64,
    /// Capped at 100.
    pub percentage: f64,
    pub exceeded: bool,
}

pub fn progress(settings: &Settings, day: &DailyAggregate) -> Vec<GoalProgress> {
    settings
        .goals
        .iter()
        .map(|(domain, &limit_minutes)| {
            let time_spent_ms = day.sites.get(domain).map(|s| s.time).unwrap_or(0);
            let goal_time_ms = limit_minutes.saturating_mul(MS_PER_MINUTE);
            let percentage = if goal_time_ms == 0 {
                100.0
            } else {
                (time_spent_ms as f64 / goal_time_ms as f64 * 100.0).min(100.0)
            };
            GoalProgress {
                domain: domain.clone(),
                limit_minutes,
                time_spent_ms,
                goal_time_ms,
                percentage,
                exceeded: time_spent_ms > goal_time_ms,
            }
        })
        .collect()
}

fn round_minutes(ms: u64) -> u64 {
    (ms + MS_PER_MINUTE / 2) / MS_PER_MINUTE
}
