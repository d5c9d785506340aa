//! Group-by calculators over the results: jockey-trainer combinations and
//! per-distance / per-venue specialist rows.
//!
//! These are plain grouped aggregations with a qualification threshold:
//! weekly recomputations require 10 runs for a row to qualify, daily
//! recomputations use the lower threshold of 5. Each table is replaced
//! wholesale inside one transaction, so recomputation is idempotent.

use chrono::Utc;

use crate::db::models::{EntityCombination, PerformanceBucket};
use crate::db::queries::Repository;
use crate::errors::AppError;
use crate::stats::people::StatsRunSummary;
use crate::stats::win_rate;

/// Qualification threshold for the weekly recomputation.
pub const WEEKLY_MIN_RUNS: i64 = 10;
/// Qualification threshold for the daily recomputation.
pub const DAILY_MIN_RUNS: i64 = 5;

/// Distance band for a race distance in metres. Mirrors the SQL grouping
/// expression used by the repository; bands are in rounded furlongs.
pub fn distance_band(distance_m: i32) -> &'static str {
    let furlongs = (distance_m as f64 / 201.168).round() as i64;
    match furlongs {
        i64::MIN..=6 => "5-6f",
        7..=8 => "7-8f",
        9..=12 => "9-12f",
        _ => "13f+",
    }
}

pub struct CombinationCalculator<'a> {
    repo: &'a Repository,
}

impl<'a> CombinationCalculator<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Recompute jockey-trainer combination rows above the threshold.
    pub async fn run_combinations(&self, min_runs: i64) -> Result<StatsRunSummary, AppError> {
        let computed_at = Utc::now();
        let aggregates = self.repo.combination_aggregates(min_runs).await?;
        let rows: Vec<EntityCombination> = aggregates
            .iter()
            .map(|a| EntityCombination {
                jockey_id: a.jockey_id.clone(),
                trainer_id: a.trainer_id.clone(),
                runs: a.runs,
                wins: a.wins,
                places: a.places,
                win_rate: win_rate(a.wins, a.runs),
                computed_at,
            })
            .collect();

        let written = self.repo.replace_entity_combinations(&rows).await?;
        tracing::info!(
            "StatisticsCalculators: {} jockey-trainer combinations (>= {} runs)",
            written,
            min_runs,
        );
        Ok(StatsRunSummary {
            entities_processed: rows.len(),
            rows_written: written,
            failed_batches: 0,
        })
    }

    /// Recompute the distance-specialist table.
    pub async fn run_distance(&self, min_runs: i64) -> Result<StatsRunSummary, AppError> {
        let aggregates = self.repo.distance_bucket_aggregates(min_runs).await?;
        self.replace_buckets("ra_performance_by_distance", aggregates)
            .await
    }

    /// Recompute the venue-specialist table.
    pub async fn run_venue(&self, min_runs: i64) -> Result<StatsRunSummary, AppError> {
        let aggregates = self.repo.venue_bucket_aggregates(min_runs).await?;
        self.replace_buckets("ra_performance_by_venue", aggregates)
            .await
    }

    async fn replace_buckets(
        &self,
        table: &'static str,
        aggregates: Vec<crate::db::models::BucketAggRow>,
    ) -> Result<StatsRunSummary, AppError> {
        let computed_at = Utc::now();
        let rows: Vec<PerformanceBucket> = aggregates
            .iter()
            .map(|a| PerformanceBucket {
                horse_id: a.horse_id.clone(),
                bucket: a.bucket.clone(),
                runs: a.runs,
                wins: a.wins,
                places: a.places,
                win_rate: win_rate(a.wins, a.runs),
                computed_at,
            })
            .collect();

        let written = self.repo.replace_performance_buckets(table, &rows).await?;
        tracing::info!("StatisticsCalculators: {} rows into {}", written, table);
        Ok(StatsRunSummary {
            entities_processed: rows.len(),
            rows_written: written,
            failed_batches: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_band_boundaries() {
        // 6f = 1207 m, 7f = 1408 m, 8f = 1609 m, 12f = 2414 m, 13f = 2615 m
        assert_eq!(distance_band(1207), "5-6f");
        assert_eq!(distance_band(1408), "7-8f");
        assert_eq!(distance_band(1609), "7-8f");
        assert_eq!(distance_band(2414), "9-12f");
        assert_eq!(distance_band(2615), "13f+");
    }

    #[test]
    fn test_distance_band_rounds_like_sql() {
        // 1300 m is 6.46 furlongs → rounds to 6 → sprint band, matching
        // ROUND((distance_m / 201.168)::numeric) in the SQL expression.
        assert_eq!(distance_band(1300), "5-6f");
        // 1310 m is 6.51 furlongs → rounds to 7
        assert_eq!(distance_band(1310), "7-8f");
    }

    #[test]
    fn test_thresholds() {
        assert!(WEEKLY_MIN_RUNS > DAILY_MIN_RUNS);
        assert_eq!(WEEKLY_MIN_RUNS, 10);
        assert_eq!(DAILY_MIN_RUNS, 5);
    }
}
