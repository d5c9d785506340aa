//! Orchestrates fetchers and calculators by mode.
//!
//! The controller owns the job plan: backfill drives month-sized chunks
//! through the checkpoint store, daily covers the rolling last-3-days
//! window, manual runs one named fetcher, and scheduled consults the
//! declared schedule table. Dependency ordering is fixed: reference
//! entities before transactional rows, races before runners, results after
//! the races they reference, statistics only after a completed
//! transactional pass.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Utc, Weekday};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::db::models::{AncestorKind, PeopleKind};
use crate::db::queries::Repository;
use crate::errors::AppError;
use crate::services::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::services::masters;
use crate::services::racing_api::RacingApi;
use crate::services::races::RaceFetcher;
use crate::services::results::ResultsFetcher;
use crate::services::schedule::{due_jobs, ScheduledJob};
use crate::stats::combinations::{CombinationCalculator, DAILY_MIN_RUNS, WEEKLY_MIN_RUNS};
use crate::stats::pedigree::PedigreeCalculator;
use crate::stats::people::PeopleStatsCalculator;
use crate::stats::runners::RunnerStatsCalculator;

/// Checkpoint job name for the historical backfill.
const BACKFILL_JOB: &str = "backfill_events";
/// Rolling window covered by the daily and scheduled transactional sync.
const DAILY_LOOKBACK_DAYS: i64 = 3;
/// Window for incremental runner-statistics recomputation.
const RUNNER_STATS_LOOKBACK_DAYS: i64 = 30;
/// Soft per-chunk duration ceiling; exceeding it is logged, not fatal.
const CHUNK_SOFT_CEILING_SECS: u64 = 600;
/// Window applied by `--test` smoke runs.
const TEST_WINDOW_DAYS: i64 = 7;

/// Tables accepted by the manual mode.
pub const MANUAL_TABLES: &[&str] = &[
    "courses",
    "bookmakers",
    "jockeys",
    "trainers",
    "owners",
    "races",
    "results",
    "statistics",
];

/// Final status of a run, as written into the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Complete,
    Partial,
    Aborted,
}

/// Per-run JSON summary written under the log directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl RunReport {
    /// 0 = complete, 1 = partial failure. Aborted runs surface their
    /// underlying error instead of a report.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Complete => 0,
            _ => 1,
        }
    }
}

pub struct Controller {
    api: Arc<dyn RacingApi>,
    repo: Repository,
    checkpoints: CheckpointStore,
    regions: Vec<String>,
    log_dir: PathBuf,
    test_mode: bool,
}

impl Controller {
    pub fn new(
        api: Arc<dyn RacingApi>,
        repo: Repository,
        checkpoints: CheckpointStore,
        regions: Vec<String>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            repo,
            checkpoints,
            regions,
            log_dir: log_dir.into(),
            test_mode: false,
        }
    }

    /// Shrink processed windows for smoke runs (`--test`).
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    // -----------------------------------------------------------------------
    // Modes
    // -----------------------------------------------------------------------

    /// Historical backfill over month-sized chunks with checkpointed
    /// resume. `end` defaults to today.
    pub async fn backfill(
        &self,
        start: NaiveDate,
        end: Option<NaiveDate>,
    ) -> Result<RunReport, AppError> {
        let started_at = Utc::now();
        let result = self.backfill_inner(start, end).await;
        self.finalize("backfill", started_at, result).await
    }

    async fn backfill_inner(
        &self,
        start: NaiveDate,
        end: Option<NaiveDate>,
    ) -> Result<(RunStatus, serde_json::Value), AppError> {
        let end = end.unwrap_or_else(|| Utc::now().date_naive());
        let start = if self.test_mode {
            start.max(end - Duration::days(TEST_WINDOW_DAYS - 1))
        } else {
            start
        };
        let chunks = month_chunks(start, end)?;
        let total_chunks = chunks.len() as u32;

        let completed = match self.checkpoints.load(BACKFILL_JOB).await? {
            Some(record) => {
                tracing::info!(
                    "Backfill: resuming after chunk {}/{} (last end date {})",
                    record.last_completed_chunk,
                    record.total_chunks,
                    record.last_chunk_end_date,
                );
                record.last_completed_chunk
            }
            None => 0,
        };

        let mut status = RunStatus::Complete;
        let mut chunk_reports = Vec::new();

        for (idx, (chunk_from, chunk_to)) in chunks.iter().enumerate() {
            let chunk_no = idx as u32 + 1;
            if chunk_no <= completed {
                continue;
            }

            tracing::info!(
                "Backfill: chunk {}/{} ({}..{})",
                chunk_no,
                total_chunks,
                chunk_from,
                chunk_to,
            );
            let chunk_started = Instant::now();

            let races = RaceFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
                .fetch(*chunk_from, *chunk_to)
                .await?;
            let results = ResultsFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
                .fetch(*chunk_from, *chunk_to)
                .await?;

            let elapsed = chunk_started.elapsed();
            if elapsed.as_secs() > CHUNK_SOFT_CEILING_SECS {
                tracing::warn!(
                    "Backfill: chunk {} took {}s (soft ceiling {}s)",
                    chunk_no,
                    elapsed.as_secs(),
                    CHUNK_SOFT_CEILING_SECS,
                );
            }

            chunk_reports.push(serde_json::json!({
                "chunk": chunk_no,
                "from": chunk_from,
                "to": chunk_to,
                "races": races,
                "results": results,
            }));

            // A chunk with any failed batch does not advance the
            // checkpoint; it stays the next chunk to process on restart.
            let failed = races.failed_batches + results.failed_batches;
            if failed > 0 {
                tracing::error!(
                    "Backfill: chunk {} finished with {} failed batches, stopping",
                    chunk_no,
                    failed,
                );
                status = RunStatus::Partial;
                break;
            }

            self.checkpoints
                .advance(&CheckpointRecord {
                    job: BACKFILL_JOB.to_string(),
                    last_completed_chunk: chunk_no,
                    total_chunks,
                    last_chunk_end_date: *chunk_to,
                    timestamp: Utc::now(),
                })
                .await?;
        }

        self.verify_invariants().await?;
        Ok((status, serde_json::json!({ "chunks": chunk_reports })))
    }

    /// Daily sync: due master fetchers, then races + results over the
    /// last-3-days window.
    pub async fn daily(&self) -> Result<RunReport, AppError> {
        let started_at = Utc::now();
        let result = self.daily_inner().await;
        self.finalize("daily", started_at, result).await
    }

    async fn daily_inner(&self) -> Result<(RunStatus, serde_json::Value), AppError> {
        let today = Local::now().date_naive();
        let mut details = serde_json::Map::new();
        let mut failed_batches = 0;

        // Masters due today by cadence: people weekly on Sunday,
        // reference monthly on the 1st.
        if today.weekday() == Weekday::Sun {
            let mut people = Vec::new();
            for kind in [PeopleKind::Jockey, PeopleKind::Trainer, PeopleKind::Owner] {
                let summary =
                    masters::fetch_people(self.api.as_ref(), &self.repo, kind, &self.regions)
                        .await?;
                failed_batches += summary.failed_batches;
                people.push(summary);
            }
            details.insert("people_masters".into(), serde_json::json!(people));
        }
        if today.day() == 1 {
            let courses =
                masters::fetch_courses(self.api.as_ref(), &self.repo, &self.regions).await?;
            let bookmakers = masters::fetch_bookmakers(self.api.as_ref(), &self.repo).await?;
            failed_batches += courses.iter().map(|s| s.failed_batches).sum::<usize>()
                + bookmakers.failed_batches;
            details.insert("reference_masters".into(), serde_json::json!(courses));
            details.insert("bookmakers".into(), serde_json::json!(bookmakers));
        }

        let window_from = today - Duration::days(DAILY_LOOKBACK_DAYS);
        let races = RaceFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
            .fetch(window_from, today)
            .await?;
        let results = ResultsFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
            .fetch(window_from, today)
            .await?;
        failed_batches += races.failed_batches + results.failed_batches;
        details.insert("races".into(), serde_json::json!(races));
        details.insert("results".into(), serde_json::json!(results));

        self.verify_invariants().await?;
        let status = if failed_batches == 0 {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };
        Ok((status, serde_json::Value::Object(details)))
    }

    /// Run a single named fetcher over an explicit window.
    pub async fn manual(
        &self,
        table: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<RunReport, AppError> {
        let started_at = Utc::now();
        let result = self.manual_inner(table, date_from, date_to).await;
        self.finalize(&format!("manual:{table}"), started_at, result)
            .await
    }

    async fn manual_inner(
        &self,
        table: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<(RunStatus, serde_json::Value), AppError> {
        let (date_from, date_to) = if self.test_mode {
            (date_from.max(date_to - Duration::days(TEST_WINDOW_DAYS - 1)), date_to)
        } else {
            (date_from, date_to)
        };

        let (failed, details) = match table {
            "courses" => {
                let summaries =
                    masters::fetch_courses(self.api.as_ref(), &self.repo, &self.regions).await?;
                (
                    summaries.iter().map(|s| s.failed_batches).sum::<usize>(),
                    serde_json::json!(summaries),
                )
            }
            "bookmakers" => {
                let summary = masters::fetch_bookmakers(self.api.as_ref(), &self.repo).await?;
                (summary.failed_batches, serde_json::json!(summary))
            }
            "jockeys" | "trainers" | "owners" => {
                let kind = match table {
                    "jockeys" => PeopleKind::Jockey,
                    "trainers" => PeopleKind::Trainer,
                    _ => PeopleKind::Owner,
                };
                let summary =
                    masters::fetch_people(self.api.as_ref(), &self.repo, kind, &self.regions)
                        .await?;
                (summary.failed_batches, serde_json::json!(summary))
            }
            "races" => {
                let summary = RaceFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
                    .fetch(date_from, date_to)
                    .await?;
                (summary.failed_batches, serde_json::json!(summary))
            }
            "results" => {
                let summary = ResultsFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
                    .fetch(date_from, date_to)
                    .await?;
                (summary.failed_batches, serde_json::json!(summary))
            }
            "statistics" => {
                // Full recomputation at the weekly thresholds.
                let details = self.run_statistics(None, WEEKLY_MIN_RUNS).await?;
                (0, details)
            }
            other => {
                return Err(AppError::Config(format!(
                    "unknown table '{other}'; expected one of {MANUAL_TABLES:?}"
                )));
            }
        };

        let status = if failed == 0 {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };
        Ok((status, details))
    }

    /// Consult the schedule table and run exactly the jobs that are due.
    pub async fn scheduled(&self) -> Result<RunReport, AppError> {
        let started_at = Utc::now();
        let result = self.scheduled_inner().await;
        self.finalize("scheduled", started_at, result).await
    }

    async fn scheduled_inner(&self) -> Result<(RunStatus, serde_json::Value), AppError> {
        let now = Local::now().naive_local();
        let today = now.date();
        let due = due_jobs(now);
        if due.is_empty() {
            tracing::info!("Controller: nothing due at {}", now);
            return Ok((RunStatus::Complete, serde_json::json!({ "due": [] })));
        }

        let mut details = serde_json::Map::new();
        let mut failed_batches = 0;

        for job in due {
            match job {
                ScheduledJob::TransactionalSync => {
                    let from = today - Duration::days(DAILY_LOOKBACK_DAYS);
                    let races = RaceFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
                        .fetch(from, today)
                        .await?;
                    let results =
                        ResultsFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
                            .fetch(from, today)
                            .await?;
                    failed_batches += races.failed_batches + results.failed_batches;
                    details.insert("transactional_sync".into(), serde_json::json!({
                        "races": races,
                        "results": results,
                    }));
                }
                ScheduledJob::HorseRefresh => {
                    // Today's racecards re-observe every declared horse and
                    // enrich the newly seen ones.
                    let summary = RaceFetcher::new(self.api.as_ref(), &self.repo, &self.regions)
                        .fetch(today, today)
                        .await?;
                    failed_batches += summary.failed_batches;
                    details.insert("horse_refresh".into(), serde_json::json!(summary));
                }
                ScheduledJob::Statistics => {
                    // Weekly thresholds on Sunday, daily thresholds otherwise.
                    let (since, min_runs) = if today.weekday() == Weekday::Sun {
                        (None, WEEKLY_MIN_RUNS)
                    } else {
                        (
                            Some(today - Duration::days(RUNNER_STATS_LOOKBACK_DAYS)),
                            DAILY_MIN_RUNS,
                        )
                    };
                    let stats = self.run_statistics(since, min_runs).await?;
                    details.insert("statistics".into(), stats);
                }
                ScheduledJob::PeopleMasters => {
                    let mut people = Vec::new();
                    for kind in [PeopleKind::Jockey, PeopleKind::Trainer, PeopleKind::Owner] {
                        let summary = masters::fetch_people(
                            self.api.as_ref(),
                            &self.repo,
                            kind,
                            &self.regions,
                        )
                        .await?;
                        failed_batches += summary.failed_batches;
                        people.push(summary);
                    }
                    details.insert("people_masters".into(), serde_json::json!(people));
                }
                ScheduledJob::ReferenceMasters => {
                    let courses =
                        masters::fetch_courses(self.api.as_ref(), &self.repo, &self.regions)
                            .await?;
                    let bookmakers =
                        masters::fetch_bookmakers(self.api.as_ref(), &self.repo).await?;
                    failed_batches += courses.iter().map(|s| s.failed_batches).sum::<usize>()
                        + bookmakers.failed_batches;
                    details.insert("reference_masters".into(), serde_json::json!(courses));
                    details.insert("bookmakers".into(), serde_json::json!(bookmakers));
                }
            }
        }

        let status = if failed_batches == 0 {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };
        Ok((status, serde_json::Value::Object(details)))
    }

    /// Configuration probe: one rate-limited API call, no writes.
    pub async fn check(&self) -> Result<RunReport, AppError> {
        let started_at = Utc::now();
        let courses = self.api.get_courses(&self.regions).await?;
        let latest = self.repo.latest_race_date().await?;
        let details = serde_json::json!({
            "api_reachable": true,
            "courses_visible": courses.len(),
            "latest_race_date": latest,
        });
        self.finalize("check", started_at, Ok((RunStatus::Complete, details)))
            .await
    }

    // -----------------------------------------------------------------------
    // Statistics phase
    // -----------------------------------------------------------------------

    /// Run every calculator. Reads exclusively from the repository; the
    /// schedule guarantees no transactional fetch is running concurrently.
    async fn run_statistics(
        &self,
        runner_since: Option<NaiveDate>,
        min_runs: i64,
    ) -> Result<serde_json::Value, AppError> {
        let today = Local::now().date_naive();
        let mut details = serde_json::Map::new();

        let people = PeopleStatsCalculator::new(&self.repo);
        for kind in [PeopleKind::Jockey, PeopleKind::Trainer, PeopleKind::Owner] {
            let summary = people.run(kind, today).await?;
            details.insert(kind.stats_table().into(), serde_json::json!(summary));
        }

        let pedigree = PedigreeCalculator::new(&self.repo);
        for kind in [AncestorKind::Sire, AncestorKind::Dam, AncestorKind::Damsire] {
            let summary = pedigree.run(kind).await?;
            details.insert(kind.table().into(), serde_json::json!(summary));
        }

        let runners = RunnerStatsCalculator::new(&self.repo);
        let summary = runners.run(runner_since).await?;
        details.insert("ra_runner_statistics".into(), serde_json::json!(summary));

        let combos = CombinationCalculator::new(&self.repo);
        let combinations = combos.run_combinations(min_runs).await?;
        details.insert("ra_entity_combinations".into(), serde_json::json!(combinations));
        let distance = combos.run_distance(min_runs).await?;
        details.insert("ra_performance_by_distance".into(), serde_json::json!(distance));
        let venue = combos.run_venue(min_runs).await?;
        details.insert("ra_performance_by_venue".into(), serde_json::json!(venue));

        Ok(serde_json::Value::Object(details))
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    async fn verify_invariants(&self) -> Result<(), AppError> {
        let orphans = self.repo.count_orphan_runners().await?;
        if orphans > 0 {
            return Err(AppError::InvariantViolation(format!(
                "{orphans} runner rows lack a race or horse row"
            )));
        }
        Ok(())
    }

    /// Build the run report, persist the JSON summary, and pass the
    /// original error through for aborted runs.
    async fn finalize(
        &self,
        mode: &str,
        started_at: DateTime<Utc>,
        result: Result<(RunStatus, serde_json::Value), AppError>,
    ) -> Result<RunReport, AppError> {
        let (status, details, error) = match result {
            Ok((status, details)) => (status, details, None),
            Err(e) => (
                RunStatus::Aborted,
                serde_json::json!({ "error": e.to_string() }),
                Some(e),
            ),
        };

        let report = RunReport {
            mode: mode.to_string(),
            status,
            started_at,
            finished_at: Utc::now(),
            details,
        };
        self.write_run_log(&report).await;

        match error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Persist the per-run summary; a log-write failure is reported but
    /// never fails the run itself.
    async fn write_run_log(&self, report: &RunReport) {
        let file_name = format!(
            "{}_{}.json",
            report.mode.replace(':', "_"),
            report.started_at.format("%Y%m%dT%H%M%SZ"),
        );
        let path = self.log_dir.join(file_name);

        let write = async {
            tokio::fs::create_dir_all(&self.log_dir).await?;
            let body = serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{}".to_string());
            tokio::fs::write(&path, body).await
        };
        match write.await {
            Ok(()) => tracing::info!("Controller: run summary written to {}", path.display()),
            Err(e) => tracing::warn!(
                "Controller: failed to write run summary {}: {}",
                path.display(),
                e,
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk planning
// ---------------------------------------------------------------------------

/// Split a date range into month-sized chunks. The first and last chunks
/// are clipped to the range; every other chunk spans a whole calendar
/// month.
pub fn month_chunks(
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<(NaiveDate, NaiveDate)>, AppError> {
    if start > end {
        return Err(AppError::Config(format!(
            "start date {start} is after end date {end}"
        )));
    }

    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let chunk_end = last_day_of_month(cursor).min(end);
        chunks.push((cursor, chunk_end));
        cursor = chunk_end + Duration::days(1);
    }
    Ok(chunks)
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    // The 1st of the following month always exists
    NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or(date)
        .pred_opt()
        .unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_month_chunks_whole_months() {
        let chunks = month_chunks(date("2015-01-01"), date("2015-03-31")).unwrap();
        assert_eq!(
            chunks,
            vec![
                (date("2015-01-01"), date("2015-01-31")),
                (date("2015-02-01"), date("2015-02-28")),
                (date("2015-03-01"), date("2015-03-31")),
            ]
        );
    }

    #[test]
    fn test_month_chunks_clips_partial_ends() {
        let chunks = month_chunks(date("2015-01-15"), date("2015-03-10")).unwrap();
        assert_eq!(chunks.first().unwrap().0, date("2015-01-15"));
        assert_eq!(chunks.first().unwrap().1, date("2015-01-31"));
        assert_eq!(chunks.last().unwrap().0, date("2015-03-01"));
        assert_eq!(chunks.last().unwrap().1, date("2015-03-10"));
    }

    #[test]
    fn test_month_chunks_ten_year_window() {
        let chunks = month_chunks(date("2015-01-01"), date("2024-12-31")).unwrap();
        assert_eq!(chunks.len(), 120);
        // Contiguous and non-overlapping
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1 + Duration::days(1), pair[1].0);
        }
    }

    #[test]
    fn test_month_chunks_single_day() {
        let chunks = month_chunks(date("2020-02-29"), date("2020-02-29")).unwrap();
        assert_eq!(chunks, vec![(date("2020-02-29"), date("2020-02-29"))]);
    }

    #[test]
    fn test_month_chunks_inverted_range_is_config_error() {
        let err = month_chunks(date("2020-02-01"), date("2020-01-01")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_leap_february() {
        let chunks = month_chunks(date("2020-02-01"), date("2020-03-01")).unwrap();
        assert_eq!(chunks[0], (date("2020-02-01"), date("2020-02-29")));
    }

    #[test]
    fn test_resume_skips_completed_chunks() {
        // Chunk replay arithmetic: with 11 chunks recorded complete, the
        // next processed chunk is number 12, and chunk 11 is not re-fetched.
        let chunks = month_chunks(date("2015-01-01"), date("2015-12-31")).unwrap();
        let completed: u32 = 11;
        let pending: Vec<u32> = chunks
            .iter()
            .enumerate()
            .map(|(idx, _)| idx as u32 + 1)
            .filter(|chunk_no| *chunk_no > completed)
            .collect();
        assert_eq!(pending, vec![12]);
    }

    #[test]
    fn test_run_report_exit_codes() {
        let report = |status| RunReport {
            mode: "daily".into(),
            status,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            details: serde_json::json!({}),
        };
        assert_eq!(report(RunStatus::Complete).exit_code(), 0);
        assert_eq!(report(RunStatus::Partial).exit_code(), 1);
        assert_eq!(report(RunStatus::Aborted).exit_code(), 1);
    }
}
