//! Engagement statistics and interaction pattern analysis

use crate::models::{Counters, Interaction, InteractionType};
use chrono::{NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Interaction counts for a fact and the weighted engagement score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementStats {
    pub like: u64,
    pub dislike: u64,
    pub share: u64,
    pub read: u64,
    pub view: u64,
    pub total: u64,
    pub engagement_score: f64,
}

impl EngagementStats {
    /// Stats from a fact's running counters, which cover its whole history
    pub fn from_counters(counters: &Counters) -> Self {
        let mut stats = Self {
            like: counters.likes,
            dislike: counters.dislikes,
            share: counters.shares,
            read: counters.reads,
            view: counters.views,
            ..Default::default()
        };
        stats.total = InteractionType::ALL
            .into_iter()
            .map(|kind| stats.count(kind))
            .sum();
        stats.engagement_score = InteractionType::ALL
            .into_iter()
            .map(|kind| kind.weight() * stats.count(kind) as f64)
            .sum();
        stats
    }

    pub fn count(&self, kind: InteractionType) -> u64 {
        match kind {
            InteractionType::Like => self.like,
            InteractionType::Dislike => self.dislike,
            InteractionType::Share => self.share,
            InteractionType::Read => self.read,
            InteractionType::View => self.view,
        }
    }
}

/// Stats over an explicit set of ledger entries
pub fn engagement_stats(interactions: &[Interaction]) -> EngagementStats {
    let mut counters = Counters::default();
    for interaction in interactions {
        let slot = match interaction.kind {
            InteractionType::Like => &mut counters.likes,
            InteractionType::Dislike => &mut counters.dislikes,
            InteractionType::Share => &mut counters.shares,
            InteractionType::Read => &mut counters.reads,
            InteractionType::View => &mut counters.views,
        };
        *slot += 1;
    }
    EngagementStats::from_counters(&counters)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionPatterns {
    /// Interactions per UTC hour of day, index 0..24
    pub by_hour: Vec<u32>,
    /// Interactions per UTC calendar day
    pub by_day: BTreeMap<NaiveDate, u32>,
    /// Consecutive active days ending at the most recent active day
    pub streak_days: u32,
    pub total: usize,
}

pub fn analyze_patterns(interactions: &[Interaction]) -> InteractionPatterns {
    let mut by_hour = vec![0u32; 24];
    let mut by_day = BTreeMap::new();
    for interaction in interactions {
        by_hour[interaction.timestamp.hour() as usize] += 1;
        *by_day.entry(interaction.timestamp.date_naive()).or_insert(0) += 1;
    }

    let streak_days = day_streak(by_day.keys().rev().copied());
    InteractionPatterns {
        by_hour,
        by_day,
        streak_days,
        total: interactions.len(),
    }
}

/// Walk distinct days from most recent backward while each step is at most one day
pub fn day_streak(days_descending: impl IntoIterator<Item = NaiveDate>) -> u32 {
    let mut days = days_descending.into_iter();
    let Some(mut previous) = days.next() else {
        return 0;
    };
    let mut streak = 1;
    for day in days {
        if (previous - day).num_days() > 1 {
            break;
        }
        streak += 1;
        previous = day;
    }
    streak
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(day: u32, hour: u32, kind: InteractionType) -> Interaction {
        Interaction::new(
            "u1",
            "f1",
            kind,
            Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_share_stats() {
        let stats = engagement_stats(&[at(1, 9, InteractionType::Share)]);
        assert_eq!(stats.share, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.engagement_score, 5.0);
    }

    #[test]
    fn test_mixed_stats_use_weights() {
        let stats = engagement_stats(&[
            at(1, 9, InteractionType::Like),
            at(1, 9, InteractionType::Dislike),
            at(1, 9, InteractionType::View),
        ]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.engagement_score, 1.5);
    }

    #[test]
    fn test_patterns_and_streak() {
        let patterns = analyze_patterns(&[
            at(10, 8, InteractionType::Read),
            at(10, 8, InteractionType::Like),
            at(9, 21, InteractionType::Read),
            at(8, 7, InteractionType::View),
            at(5, 7, InteractionType::View),
        ]);
        assert_eq!(patterns.by_hour[8], 2);
        assert_eq!(patterns.by_hour[7], 2);
        assert_eq!(patterns.by_day.len(), 4);
        assert_eq!(patterns.streak_days, 3);
        assert_eq!(patterns.total, 5);
    }

    #[test]
    fn test_empty_history_has_no_streak() {
        assert_eq!(analyze_patterns(&[]).streak_days, 0);
    }
}
