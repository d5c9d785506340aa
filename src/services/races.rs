//! Racecard fetcher: pulls pro racecards for a date range and writes races,
//! runners, and every embedded secondary entity under upsert semantics.
//!
//! Writes are ordered so that a failure mid-stream never leaves a runner
//! without its race or horse: each parent table's batches commit before the
//! child's (courses → people → horses → pedigree → ancestors → races →
//! runners).

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::db::models::{AncestorKind, PeopleKind, Race, Runner};
use crate::db::queries::{BatchOutcome, Repository};
use crate::errors::AppError;
use crate::helpers::{parse_currency_amount, parse_distance_metres, parse_weight_lbs};
use crate::services::extractor::{
    enrich_new_horses, extract_entities, resolve_ancestor_back_refs,
};
use crate::services::racing_api::{RacecardDoc, RacecardRunnerDoc, RacingApi};

/// Per-run summary of one fetch pass, serialised into the run log.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct FetchSummary {
    pub races_fetched: usize,
    pub runners_fetched: usize,
    pub horses_discovered: usize,
    pub horses_enriched: usize,
    pub failed_batches: usize,
}

impl FetchSummary {
    pub fn absorb_outcome(&mut self, outcome: BatchOutcome) {
        self.failed_batches += outcome.failed_batches;
    }
}

/// Fetches racecards for a date range and persists them.
pub struct RaceFetcher<'a> {
    api: &'a dyn RacingApi,
    repo: &'a Repository,
    regions: &'a [String],
}

impl<'a> RaceFetcher<'a> {
    pub fn new(api: &'a dyn RacingApi, repo: &'a Repository, regions: &'a [String]) -> Self {
        Self { api, repo, regions }
    }

    pub async fn fetch(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<FetchSummary, AppError> {
        let docs = self
            .api
            .get_racecards_pro(date_from, date_to, self.regions)
            .await?;
        tracing::info!(
            "RaceFetcher: {} racecards for {}..{}",
            docs.len(),
            date_from,
            date_to,
        );

        let mut summary = FetchSummary::default();

        // Normalise race documents; a document that fails normalisation is
        // skipped, logged with its id, and counted as a failed batch.
        let mut races = Vec::with_capacity(docs.len());
        let mut runners = Vec::new();
        for doc in &docs {
            match normalize_racecard(doc) {
                Ok((race, race_runners)) => {
                    races.push(race);
                    runners.extend(race_runners);
                }
                Err(e) => {
                    tracing::warn!("RaceFetcher: skipping document: {}", e);
                    summary.failed_batches += 1;
                }
            }
        }
        summary.races_fetched = races.len();
        summary.runners_fetched = runners.len();

        // Extract entities and enrich newly discovered horses.
        let mut entities = extract_entities(&docs);
        let known = self.repo.existing_horse_ids(&entities.horse_ids()).await?;
        let enrichment = enrich_new_horses(self.api, &known, &mut entities).await;
        summary.horses_discovered = enrichment.discovered;
        summary.horses_enriched = enrichment.enriched;
        resolve_ancestor_back_refs(self.repo, &mut entities).await?;

        // Parent tables first.
        let courses: Vec<_> = entities.courses.values().cloned().collect();
        summary.absorb_outcome(self.repo.upsert_courses(&courses).await);

        for (kind, map) in [
            (PeopleKind::Jockey, &entities.jockeys),
            (PeopleKind::Trainer, &entities.trainers),
            (PeopleKind::Owner, &entities.owners),
        ] {
            let rows: Vec<_> = map.values().cloned().collect();
            summary.absorb_outcome(self.repo.upsert_people(kind, &rows).await);
        }

        // Ancestors before horses so horse rows never reference a missing
        // sire/dam/damsire id.
        for (kind, map) in [
            (AncestorKind::Sire, &entities.sires),
            (AncestorKind::Dam, &entities.dams),
            (AncestorKind::Damsire, &entities.damsires),
        ] {
            let rows: Vec<_> = map.values().cloned().collect();
            summary.absorb_outcome(self.repo.upsert_ancestors(kind, &rows).await);
        }

        let horses: Vec<_> = entities.horses.values().cloned().collect();
        summary.absorb_outcome(self.repo.upsert_horses(&horses).await);

        let pedigrees: Vec<_> = entities.pedigrees.values().cloned().collect();
        summary.absorb_outcome(self.repo.upsert_pedigrees(&pedigrees).await);

        // Transactional rows last: races before runners.
        summary.absorb_outcome(self.repo.upsert_races(&races).await);
        summary.absorb_outcome(self.repo.upsert_runners(&runners).await);

        tracing::info!(
            "RaceFetcher: {} races, {} runners, {} new horses ({} enriched), {} failed batches",
            summary.races_fetched,
            summary.runners_fetched,
            summary.horses_discovered,
            summary.horses_enriched,
            summary.failed_batches,
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Map a racecard document into a race row plus its runner rows.
pub fn normalize_racecard(doc: &RacecardDoc) -> Result<(Race, Vec<Runner>), AppError> {
    let off_time = parse_off_time(doc)?;
    let (prize_money, currency) = match doc.prize.as_deref().and_then(parse_currency_amount) {
        Some((amount, code)) => (Some(amount), Some(code.to_string())),
        None => (None, None),
    };

    let distance_m = doc.distance.as_deref().and_then(parse_distance_metres);
    let distance_furlongs = distance_m.map(|m| {
        (rust_decimal::Decimal::from(m) / rust_decimal::Decimal::new(201_168, 3)).round_dp(1)
    });

    let race = Race {
        race_id: doc.race_id.clone(),
        race_date: doc.date,
        off_time,
        course_id: doc.course_id.clone(),
        course_name: doc.course.clone(),
        region: doc.region.as_ref().map(|r| r.to_lowercase()),
        race_name: doc.race_name.clone(),
        race_class: doc.race_class.clone(),
        pattern: doc.pattern.clone(),
        race_type: doc.race_type.clone(),
        distance: doc.distance.clone(),
        distance_furlongs,
        distance_m,
        going: doc.going.clone(),
        prize_money,
        currency,
        age_band: doc.age_band.clone(),
        rating_band: doc.rating_band.clone(),
        field_size: doc.field_size.or(Some(doc.runners.len() as i32)),
        has_result: false,
        ..Race::default()
    };

    let mut runners = Vec::with_capacity(doc.runners.len());
    for runner_doc in &doc.runners {
        match normalize_runner(&doc.race_id, runner_doc) {
            Some(runner) => runners.push(runner),
            None => {
                return Err(AppError::parse(
                    &doc.race_id,
                    "runner entry is missing `horse_id`",
                ));
            }
        }
    }

    Ok((race, runners))
}

/// The racecard gives an RFC 3339 `off_dt`; documents lacking it fall back
/// to a date-only midnight timestamp rather than failing the race.
fn parse_off_time(doc: &RacecardDoc) -> Result<Option<DateTime<Utc>>, AppError> {
    match doc.off_dt.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| AppError::parse(&doc.race_id, format!("invalid off_dt '{raw}': {e}"))),
        None => Ok(None),
    }
}

fn normalize_runner(race_id: &str, doc: &RacecardRunnerDoc) -> Option<Runner> {
    let horse_id = doc.horse_id.clone()?;
    let weight_lbs = doc
        .lbs
        .or_else(|| doc.weight.as_deref().and_then(parse_weight_lbs));

    Some(Runner {
        race_id: race_id.to_string(),
        horse_id,
        horse_name: doc.horse.clone(),
        cloth_number: doc.number,
        draw: doc.draw,
        age: doc.age,
        weight_lbs,
        headgear: doc.headgear.clone(),
        official_rating: doc.ofr,
        form: doc.form.clone(),
        jockey_id: doc.jockey_id.clone(),
        jockey_name: doc.jockey.clone(),
        jockey_claim_lbs: doc.jockey_claim_lbs,
        trainer_id: doc.trainer_id.clone(),
        trainer_name: doc.trainer.clone(),
        owner_id: doc.owner_id.clone(),
        owner_name: doc.owner.clone(),
        sire_id: doc.sire_id.clone(),
        sire_name: doc.sire.clone(),
        dam_id: doc.dam_id.clone(),
        dam_name: doc.dam.clone(),
        damsire_id: doc.damsire_id.clone(),
        damsire_name: doc.damsire.clone(),
        silk_url: doc.silk_url.clone(),
        ..Runner::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> RacecardDoc {
        serde_json::from_value(serde_json::json!({
            "race_id": "rac_1",
            "date": "2025-10-23",
            "off_dt": "2025-10-23T13:45:00+00:00",
            "course_id": "crs_1",
            "course": "Ascot",
            "region": "GB",
            "race_name": "October Handicap",
            "race_class": "Class 2",
            "type": "Flat",
            "distance": "1m2f",
            "going": "Good",
            "prize": "£12,000",
            "runners": [
                {
                    "horse_id": "hrs_1",
                    "horse": "Nightfall",
                    "age": 4,
                    "draw": 7,
                    "number": 2,
                    "weight": "9-2",
                    "ofr": 88,
                    "jockey_id": "jky_1",
                    "jockey": "A Rider",
                    "trainer_id": "trn_1",
                    "trainer": "J Gosden",
                    "sire_id": "sir_9",
                    "sire": "Dark Angel"
                },
                {
                    "horse_id": "hrs_2",
                    "horse": "Dawn Raid",
                    "lbs": 126
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_racecard_maps_race_fields() {
        let (race, runners) = normalize_racecard(&sample_doc()).unwrap();

        assert_eq!(race.race_id, "rac_1");
        assert_eq!(race.region.as_deref(), Some("gb"));
        assert_eq!(race.distance.as_deref(), Some("1m2f"));
        assert_eq!(race.distance_m, Some(2012));
        assert_eq!(
            race.distance_furlongs,
            Some(rust_decimal::Decimal::new(100, 1)),
            "1m2f is 10.0 furlongs"
        );
        assert_eq!(race.prize_money, Some(rust_decimal::Decimal::from(12_000)));
        assert_eq!(race.currency.as_deref(), Some("GBP"));
        assert!(!race.has_result);
        assert_eq!(race.field_size, Some(2));
        assert_eq!(runners.len(), 2);
    }

    #[test]
    fn test_normalize_runner_weight_conventions() {
        let (_, runners) = normalize_racecard(&sample_doc()).unwrap();
        // Stones-pounds string: 9-2 → 9*14+2
        assert_eq!(runners[0].weight_lbs, Some(128));
        // Direct pounds value passes through
        assert_eq!(runners[1].weight_lbs, Some(126));
    }

    #[test]
    fn test_normalize_runner_denormalises_pedigree() {
        let (_, runners) = normalize_racecard(&sample_doc()).unwrap();
        assert_eq!(runners[0].sire_id.as_deref(), Some("sir_9"));
        assert_eq!(runners[0].sire_name.as_deref(), Some("Dark Angel"));
    }

    #[test]
    fn test_runner_without_horse_id_fails_the_document() {
        let mut doc = sample_doc();
        doc.runners[1].horse_id = None;
        let err = normalize_racecard(&doc).unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
    }

    #[test]
    fn test_invalid_off_dt_is_a_parse_error() {
        let mut doc = sample_doc();
        doc.off_dt = Some("not-a-timestamp".into());
        let err = normalize_racecard(&doc).unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
    }

    #[test]
    fn test_missing_off_dt_is_tolerated() {
        let mut doc = sample_doc();
        doc.off_dt = None;
        let (race, _) = normalize_racecard(&doc).unwrap();
        assert_eq!(race.off_time, None);
    }
}
