//! Per-runner history features.
//!
//! For every runner the calculator derives features from that horse's runs
//! strictly before the runner's race date: career counters, a recent-form
//! string, and last-run recency. Backfill passes every runner once;
//! incremental runs restrict recomputation to runners whose race date
//! falls inside the lookback window (prior history still spans the
//! horse's whole record).

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

use crate::db::models::{HorseRunRow, RunnerKeyRow, RunnerStats};
use crate::db::queries::{Repository, STATS_PAGE_SIZE};
use crate::errors::AppError;
use crate::stats::people::StatsRunSummary;
use crate::stats::win_rate;

/// Runs shown in the recent-form string.
const RECENT_FORM_LENGTH: usize = 5;

pub struct RunnerStatsCalculator<'a> {
    repo: &'a Repository,
}

impl<'a> RunnerStatsCalculator<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Recompute runner statistics. `since = None` is the full backfill
    /// pass; `Some(date)` recomputes only runners racing on or after it.
    pub async fn run(&self, since: Option<NaiveDate>) -> Result<StatsRunSummary, AppError> {
        let mut summary = StatsRunSummary::default();
        let mut after: Option<String> = None;
        let computed_at = Utc::now();

        loop {
            let horse_ids = self.repo.horse_ids_with_runs_page(after.as_deref()).await?;
            if horse_ids.is_empty() {
                break;
            }

            let history = self.repo.horse_run_history(&horse_ids).await?;
            let keys = self.repo.runner_keys(&horse_ids, since).await?;
            let rows = build_runner_stats(&keys, &history, computed_at);

            let outcome = self.repo.upsert_runner_stats(&rows).await;
            summary.entities_processed += keys.len();
            summary.rows_written += outcome.rows_written;
            summary.failed_batches += outcome.failed_batches;

            if (horse_ids.len() as i64) < STATS_PAGE_SIZE {
                break;
            }
            after = horse_ids.last().cloned();
        }

        tracing::info!(
            "StatisticsCalculators: runner statistics done, {} runners, {} failed batches",
            summary.entities_processed,
            summary.failed_batches,
        );
        Ok(summary)
    }
}

/// Derive one statistics row per runner key from the horses' run history.
/// `history` must be ordered by horse then race date (the query guarantees
/// this).
pub fn build_runner_stats(
    keys: &[RunnerKeyRow],
    history: &[HorseRunRow],
    computed_at: DateTime<Utc>,
) -> Vec<RunnerStats> {
    let mut by_horse: HashMap<&str, Vec<&HorseRunRow>> = HashMap::new();
    for run in history {
        by_horse.entry(&run.horse_id).or_default().push(run);
    }

    keys.iter()
        .map(|key| {
            let prior: Vec<&HorseRunRow> = by_horse
                .get(key.horse_id.as_str())
                .map(|runs| {
                    runs.iter()
                        .filter(|r| r.race_date < key.race_date)
                        .copied()
                        .collect()
                })
                .unwrap_or_default();

            let career_runs = prior.len() as i64;
            let career_wins = prior.iter().filter(|r| r.position == Some(1)).count() as i64;
            let career_places = prior
                .iter()
                .filter(|r| matches!(r.position, Some(p) if p <= 3))
                .count() as i64;

            let recent_form = if prior.is_empty() {
                None
            } else {
                Some(
                    prior
                        .iter()
                        .rev()
                        .take(RECENT_FORM_LENGTH)
                        .map(|r| form_char(r))
                        .collect::<String>(),
                )
            };

            let days_since_last_run = prior
                .last()
                .map(|r| (key.race_date - r.race_date).num_days() as i32);

            RunnerStats {
                race_id: key.race_id.clone(),
                horse_id: key.horse_id.clone(),
                race_date: key.race_date,
                career_runs,
                career_wins,
                career_places,
                win_rate: win_rate(career_wins, career_runs),
                recent_form,
                days_since_last_run,
                computed_at,
            }
        })
        .collect()
}

/// One character per run, racing-form style: 1-9 for the finishing
/// position, 0 for tenth or worse, D for a disqualification, P for any
/// other non-completion.
fn form_char(run: &HorseRunRow) -> char {
    match run.position {
        Some(p @ 1..=9) => char::from_digit(p as u32, 10).unwrap_or('0'),
        Some(_) => '0',
        None if run.disqualified == Some(true) => 'D',
        None => 'P',
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn run(horse: &str, date: &str, position: Option<i32>) -> HorseRunRow {
        HorseRunRow {
            horse_id: horse.to_string(),
            race_date: date.parse().unwrap(),
            position,
            disqualified: Some(false),
        }
    }

    fn key(race: &str, horse: &str, date: &str) -> RunnerKeyRow {
        RunnerKeyRow {
            race_id: race.to_string(),
            horse_id: horse.to_string(),
            race_date: date.parse().unwrap(),
        }
    }

    #[test]
    fn test_only_strictly_prior_runs_count() {
        let history = vec![
            run("hrs_1", "2025-01-01", Some(1)),
            run("hrs_1", "2025-02-01", Some(4)),
            run("hrs_1", "2025-03-01", Some(2)),
        ];
        // Runner on the same date as the second run: only the first counts
        let keys = vec![key("rac_b", "hrs_1", "2025-02-01")];

        let stats = build_runner_stats(&keys, &history, Utc::now());
        assert_eq!(stats[0].career_runs, 1);
        assert_eq!(stats[0].career_wins, 1);
    }

    #[test]
    fn test_first_run_has_empty_history() {
        let history = vec![run("hrs_1", "2025-02-01", Some(3))];
        let keys = vec![key("rac_a", "hrs_1", "2025-02-01")];

        let stats = build_runner_stats(&keys, &history, Utc::now());
        assert_eq!(stats[0].career_runs, 0);
        assert_eq!(stats[0].win_rate, None);
        assert_eq!(stats[0].recent_form, None);
        assert_eq!(stats[0].days_since_last_run, None);
    }

    #[test]
    fn test_recent_form_newest_first_and_capped() {
        let history = vec![
            run("hrs_1", "2025-01-01", Some(6)),
            run("hrs_1", "2025-02-01", Some(1)),
            run("hrs_1", "2025-03-01", None),
            run("hrs_1", "2025-04-01", Some(12)),
            run("hrs_1", "2025-05-01", Some(2)),
            run("hrs_1", "2025-06-01", Some(3)),
        ];
        let keys = vec![key("rac_z", "hrs_1", "2025-07-01")];

        let stats = build_runner_stats(&keys, &history, Utc::now());
        // Newest first: 3, 2, 0 (12th), P (non-finisher), 1 — capped at 5
        assert_eq!(stats[0].recent_form.as_deref(), Some("320P1"));
    }

    #[test]
    fn test_counters_and_rate() {
        let history = vec![
            run("hrs_1", "2025-01-01", Some(1)),
            run("hrs_1", "2025-02-01", Some(2)),
            run("hrs_1", "2025-03-01", Some(7)),
            run("hrs_1", "2025-04-01", None),
        ];
        let keys = vec![key("rac_z", "hrs_1", "2025-05-01")];

        let stats = build_runner_stats(&keys, &history, Utc::now());
        let s = &stats[0];
        assert_eq!(s.career_runs, 4, "non-finishers count as runs");
        assert_eq!(s.career_wins, 1);
        assert_eq!(s.career_places, 2, "non-finishers never place");
        assert_eq!(s.win_rate, Some(Decimal::from(25)));
        assert_eq!(s.days_since_last_run, Some(30));
    }

    #[test]
    fn test_disqualified_form_char() {
        let mut dsq = run("hrs_1", "2025-01-01", None);
        dsq.disqualified = Some(true);
        let history = vec![dsq];
        let keys = vec![key("rac_z", "hrs_1", "2025-02-01")];

        let stats = build_runner_stats(&keys, &history, Utc::now());
        assert_eq!(stats[0].recent_form.as_deref(), Some("D"));
    }
}
