//! Per-person statistics calculator (jockeys, trainers, owners).
//!
//! Walks each people table in keyset pages, aggregates that page's race
//! history in one grouped query, derives the ratio and recency features in
//! memory, and upserts the statistics rows. Recomputation is idempotent:
//! rows are replaced wholesale by entity id.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::db::models::{PeopleAggRow, PeopleKind, PeopleStats};
use crate::db::queries::{Repository, STATS_PAGE_SIZE};
use crate::errors::AppError;
use crate::stats::win_rate;

/// Summary of one calculator pass, serialised into the run log.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StatsRunSummary {
    pub entities_processed: usize,
    pub rows_written: usize,
    pub failed_batches: usize,
}

pub struct PeopleStatsCalculator<'a> {
    repo: &'a Repository,
}

impl<'a> PeopleStatsCalculator<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Recompute statistics for every entity of the given kind that has at
    /// least one completed run.
    pub async fn run(
        &self,
        kind: PeopleKind,
        today: NaiveDate,
    ) -> Result<StatsRunSummary, AppError> {
        let mut summary = StatsRunSummary::default();
        let mut after: Option<String> = None;
        let computed_at = Utc::now();

        loop {
            let ids = self.repo.people_ids_page(kind, after.as_deref()).await?;
            if ids.is_empty() {
                break;
            }

            let aggregates = self.repo.people_aggregates(kind, &ids, today).await?;
            let rows: Vec<PeopleStats> = aggregates
                .iter()
                .map(|agg| build_people_stats(agg, today, computed_at))
                .collect();

            let outcome = self.repo.upsert_people_stats(kind, &rows).await;
            summary.entities_processed += ids.len();
            summary.rows_written += outcome.rows_written;
            summary.failed_batches += outcome.failed_batches;

            if (ids.len() as i64) < STATS_PAGE_SIZE {
                break;
            }
            after = ids.last().cloned();
        }

        tracing::info!(
            "StatisticsCalculators: {} done, {} entities, {} rows, {} failed batches",
            kind.stats_table(),
            summary.entities_processed,
            summary.rows_written,
            summary.failed_batches,
        );
        Ok(summary)
    }
}

/// Derive the full statistics row from one aggregate row.
pub fn build_people_stats(
    agg: &PeopleAggRow,
    today: NaiveDate,
    computed_at: DateTime<Utc>,
) -> PeopleStats {
    PeopleStats {
        entity_id: agg.entity_id.clone(),
        total_rides: agg.total_rides,
        wins: agg.wins,
        places: agg.places,
        seconds: agg.seconds,
        thirds: agg.thirds,
        win_rate: win_rate(agg.wins, agg.total_rides),
        rides_14d: agg.rides_14d,
        wins_14d: agg.wins_14d,
        win_rate_14d: win_rate(agg.wins_14d, agg.rides_14d),
        rides_30d: agg.rides_30d,
        wins_30d: agg.wins_30d,
        win_rate_30d: win_rate(agg.wins_30d, agg.rides_30d),
        last_ride_date: agg.last_ride_date,
        last_win_date: agg.last_win_date,
        days_since_last_ride: agg
            .last_ride_date
            .map(|d| (today - d).num_days() as i32),
        days_since_last_win: agg.last_win_date.map(|d| (today - d).num_days() as i32),
        computed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn agg(entity_id: &str) -> PeopleAggRow {
        PeopleAggRow {
            entity_id: entity_id.to_string(),
            total_rides: 0,
            wins: 0,
            places: 0,
            seconds: 0,
            thirds: 0,
            rides_14d: 0,
            wins_14d: 0,
            rides_30d: 0,
            wins_30d: 0,
            last_ride_date: None,
            last_win_date: None,
        }
    }

    #[test]
    fn test_win_rate_rounding_in_row() {
        let mut row = agg("jky_1");
        row.total_rides = 3;
        row.wins = 1;
        let stats = build_people_stats(&row, NaiveDate::from_ymd_opt(2025, 10, 23).unwrap(), Utc::now());
        assert_eq!(stats.win_rate, Some(Decimal::from_str("33.33").unwrap()));
    }

    #[test]
    fn test_zero_window_rates_are_null() {
        let mut row = agg("jky_1");
        row.total_rides = 10;
        row.wins = 2;
        // No activity in the rolling windows
        let stats = build_people_stats(&row, NaiveDate::from_ymd_opt(2025, 10, 23).unwrap(), Utc::now());
        assert_eq!(stats.win_rate, Some(Decimal::from(20)));
        assert_eq!(stats.win_rate_14d, None);
        assert_eq!(stats.win_rate_30d, None);
    }

    #[test]
    fn test_recency_deltas() {
        let today = NaiveDate::from_ymd_opt(2025, 10, 23).unwrap();
        let mut row = agg("trn_1");
        row.total_rides = 5;
        row.wins = 1;
        row.last_ride_date = NaiveDate::from_ymd_opt(2025, 10, 20);
        row.last_win_date = NaiveDate::from_ymd_opt(2025, 9, 23);
        let stats = build_people_stats(&row, today, Utc::now());
        assert_eq!(stats.days_since_last_ride, Some(3));
        assert_eq!(stats.days_since_last_win, Some(30));
    }

    #[test]
    fn test_never_won_leaves_win_recency_null() {
        let mut row = agg("own_1");
        row.total_rides = 4;
        row.last_ride_date = NaiveDate::from_ymd_opt(2025, 10, 1);
        let stats = build_people_stats(&row, NaiveDate::from_ymd_opt(2025, 10, 23).unwrap(), Utc::now());
        assert_eq!(stats.last_win_date, None);
        assert_eq!(stats.days_since_last_win, None);
        assert_eq!(stats.win_rate, Some(Decimal::ZERO));
    }
}
