//! Results fetcher: updates post-race columns on existing races and runner
//! rows, and maintains the canonical per-runner result records.
//!
//! Runner updates are column-level partial patches so pre-race fields that
//! are absent from the results response survive. Positions are
//! canonicalised before they touch the warehouse: integers 1..N for
//! finishers, NULL for non-finishers and disqualifications (the raw string
//! is kept on the result record).

use chrono::NaiveDate;
use serde::Serialize;

use crate::db::models::{RaceResult, RacePostFields, RunnerResultPatch};
use crate::db::queries::Repository;
use crate::errors::AppError;
use crate::helpers::{parse_currency_amount, parse_decimal_lenient, parse_fractional_price};
use crate::services::racing_api::{RaceResultDoc, ResultRunnerDoc, RacingApi};
use crate::stats::position::{parse_position, Position};

/// Per-run summary of one results pass, serialised into the run log.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ResultsSummary {
    pub races_updated: usize,
    pub runners_updated: usize,
    pub failed_batches: usize,
}

/// Fetches results for a date range and applies them.
pub struct ResultsFetcher<'a> {
    api: &'a dyn RacingApi,
    repo: &'a Repository,
    regions: &'a [String],
}

impl<'a> ResultsFetcher<'a> {
    pub fn new(api: &'a dyn RacingApi, repo: &'a Repository, regions: &'a [String]) -> Self {
        Self { api, repo, regions }
    }

    pub async fn fetch(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<ResultsSummary, AppError> {
        let docs = self
            .api
            .get_results(date_from, date_to, self.regions)
            .await?;
        tracing::info!(
            "ResultsFetcher: {} result documents for {}..{}",
            docs.len(),
            date_from,
            date_to,
        );

        let mut summary = ResultsSummary::default();
        let mut patches = Vec::new();
        let mut records = Vec::new();

        for doc in &docs {
            let (race_fields, mut race_patches, mut race_records) = normalize_result(doc);

            // The race update and its runner rows stand or fall together:
            // a failed race update leaves the whole document for the next
            // attempt instead of writing runners against a race that still
            // says has_result = false.
            if let Err(e) = self.repo.apply_race_result_fields(&race_fields).await {
                tracing::error!(
                    "ResultsFetcher: race {} post-race update failed: {}",
                    doc.race_id,
                    e,
                );
                summary.failed_batches += 1;
                continue;
            }
            summary.races_updated += 1;
            patches.append(&mut race_patches);
            records.append(&mut race_records);
        }

        let outcome = self.repo.apply_runner_results(&patches).await;
        summary.runners_updated = outcome.rows_written;
        summary.failed_batches += outcome.failed_batches;

        let outcome = self.repo.upsert_race_results(&records).await;
        summary.failed_batches += outcome.failed_batches;

        tracing::info!(
            "ResultsFetcher: {} races updated, {} runner results, {} failed batches",
            summary.races_updated,
            summary.runners_updated,
            summary.failed_batches,
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Map a results document into the race patch, runner patches, and
/// canonical result records. Runner entries without a horse id are skipped.
pub fn normalize_result(
    doc: &RaceResultDoc,
) -> (RacePostFields, Vec<RunnerResultPatch>, Vec<RaceResult>) {
    let race_fields = RacePostFields {
        race_id: doc.race_id.clone(),
        winning_time: doc.winning_time_detail.clone(),
        tote_win: doc.tote_win.clone(),
        tote_place: doc.tote_pl.clone(),
        comments: doc.comments.clone(),
    };

    let mut patches = Vec::with_capacity(doc.runners.len());
    let mut records = Vec::with_capacity(doc.runners.len());

    for runner in &doc.runners {
        let Some(horse_id) = runner.horse_id.clone() else {
            tracing::warn!(
                "ResultsFetcher: race {} has a runner without horse_id, skipping entry",
                doc.race_id,
            );
            continue;
        };
        let (patch, record) = normalize_result_runner(&doc.race_id, horse_id, runner);
        patches.push(patch);
        records.push(record);
    }

    (race_fields, patches, records)
}

fn normalize_result_runner(
    race_id: &str,
    horse_id: String,
    doc: &ResultRunnerDoc,
) -> (RunnerResultPatch, RaceResult) {
    let parsed = doc.position.as_deref().and_then(parse_position);
    let position = parsed.and_then(Position::as_finish);
    let disqualified = matches!(parsed, Some(Position::Disqualified));

    let distance_beaten = doc
        .ovr_btn
        .as_deref()
        .or(doc.btn.as_deref())
        .and_then(parse_decimal_lenient);
    // Prefer the decimal price the API sends; fall back to deriving it
    // from the fractional string when sp_dec is missing or unparsable.
    let starting_price_decimal = doc
        .sp_dec
        .as_deref()
        .and_then(parse_decimal_lenient)
        .or_else(|| doc.sp.as_deref().and_then(parse_fractional_price));
    let prize_won = doc
        .prize
        .as_deref()
        .and_then(parse_currency_amount)
        .map(|(amount, _)| amount);

    let patch = RunnerResultPatch {
        race_id: race_id.to_string(),
        horse_id: horse_id.clone(),
        horse_name: doc.horse.clone(),
        draw: doc.draw,
        position,
        distance_beaten,
        prize_won,
        starting_price: doc.sp.clone(),
        starting_price_decimal,
        finish_time: doc.time.clone(),
        comment: doc.comment.clone(),
    };

    let record = RaceResult {
        race_id: race_id.to_string(),
        horse_id,
        position_raw: doc.position.clone(),
        position,
        disqualified,
        distance_beaten,
        starting_price: doc.sp.clone(),
        starting_price_decimal,
        prize_won,
        finish_time: doc.time.clone(),
        comment: doc.comment.clone(),
    };

    (patch, record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn sample_doc() -> RaceResultDoc {
        serde_json::from_value(serde_json::json!({
            "race_id": "rac_1",
            "date": "2025-10-23",
            "course_id": "crs_1",
            "course": "Ascot",
            "winning_time_detail": "2m 5.32s",
            "tote_win": "4.50",
            "tote_pl": "1.80 2.10",
            "runners": [
                {
                    "horse_id": "hrs_1",
                    "horse": "Nightfall",
                    "position": "1",
                    "sp": "9/4",
                    "sp_dec": "3.25",
                    "ovr_btn": "0",
                    "time": "2m 5.32s",
                    "prize": "£7,800"
                },
                {
                    "horse_id": "hrs_2",
                    "horse": "Dawn Raid",
                    "position": 2,
                    "ovr_btn": "1.75"
                },
                {
                    "horse_id": "hrs_3",
                    "horse": "Faller",
                    "position": "F"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_result_race_fields() {
        let (fields, patches, records) = normalize_result(&sample_doc());
        assert_eq!(fields.race_id, "rac_1");
        assert_eq!(fields.winning_time.as_deref(), Some("2m 5.32s"));
        assert_eq!(fields.tote_win.as_deref(), Some("4.50"));
        assert_eq!(patches.len(), 3);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_positions_are_canonicalised() {
        let (_, patches, records) = normalize_result(&sample_doc());
        assert_eq!(patches[0].position, Some(1));
        assert_eq!(patches[1].position, Some(2), "numeric position accepted");
        // The faller keeps a NULL position but the raw code survives
        assert_eq!(patches[2].position, None);
        assert_eq!(records[2].position_raw.as_deref(), Some("F"));
        assert!(!records[2].disqualified);
    }

    #[test]
    fn test_prices_and_margins_parse() {
        let (_, patches, _) = normalize_result(&sample_doc());
        assert_eq!(patches[0].starting_price.as_deref(), Some("9/4"));
        assert_eq!(
            patches[0].starting_price_decimal,
            Some(Decimal::from_str("3.25").unwrap())
        );
        assert_eq!(
            patches[0].prize_won,
            Some(Decimal::from(7_800)),
            "currency prize parses to an amount"
        );
        assert_eq!(
            patches[1].distance_beaten,
            Some(Decimal::from_str("1.75").unwrap())
        );
    }

    #[test]
    fn test_decimal_price_derived_from_fraction_when_sp_dec_missing() {
        let doc: RaceResultDoc = serde_json::from_value(serde_json::json!({
            "race_id": "rac_4",
            "date": "2025-10-23",
            "runners": [
                { "horse_id": "hrs_1", "position": "1", "sp": "9/4" },
                { "horse_id": "hrs_2", "position": "2", "sp": "5/2", "sp_dec": "-" }
            ]
        }))
        .unwrap();
        let (_, patches, _) = normalize_result(&doc);
        assert_eq!(
            patches[0].starting_price_decimal,
            Some(Decimal::from_str("3.25").unwrap()),
            "missing sp_dec falls back to the fractional price"
        );
        assert_eq!(
            patches[1].starting_price_decimal,
            Some(Decimal::from_str("3.5").unwrap()),
            "unparsable sp_dec falls back to the fractional price"
        );
    }

    #[test]
    fn test_disqualification_flag() {
        let doc: RaceResultDoc = serde_json::from_value(serde_json::json!({
            "race_id": "rac_2",
            "date": "2025-10-23",
            "runners": [
                { "horse_id": "hrs_9", "position": "DSQ" }
            ]
        }))
        .unwrap();
        let (_, patches, records) = normalize_result(&doc);
        assert_eq!(patches[0].position, None);
        assert!(records[0].disqualified);
    }

    #[test]
    fn test_runner_without_horse_id_is_skipped() {
        let doc: RaceResultDoc = serde_json::from_value(serde_json::json!({
            "race_id": "rac_3",
            "date": "2025-10-23",
            "runners": [
                { "horse": "Anonymous", "position": "1" },
                { "horse_id": "hrs_1", "position": "2" }
            ]
        }))
        .unwrap();
        let (_, patches, _) = normalize_result(&doc);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].horse_id, "hrs_1");
    }
}
