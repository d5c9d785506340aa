//! Entity extraction and on-demand horse enrichment.
//!
//! Race documents embed every secondary entity this system tracks: people
//! (jockey/trainer/owner), the horse itself, and its pedigree (sire, dam,
//! damsire). Extraction walks a batch of racecards, deduplicates by primary
//! key, and applies a fixed tie-break policy: the first non-empty value
//! wins for names, the most complete value wins for every other field, and
//! a non-empty value is never overwritten by an empty one.
//!
//! Horses not yet present in the warehouse are enriched with one call to
//! the horse detail endpoint each; a failed enrichment keeps the base row
//! from the race document.

use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};

use crate::db::models::{Ancestor, AncestorKind, Course, Horse, HorsePedigree, Person};
use crate::db::queries::Repository;
use crate::services::racing_api::{HorseProDoc, RacecardDoc, RacingApi};

/// Concurrent in-flight enrichment requests. The shared rate limiter still
/// bounds the externally visible request rate.
const ENRICHMENT_CONCURRENCY: usize = 4;

/// Entities pulled out of a batch of race documents, deduplicated by
/// primary key (pedigrees are keyed by horse id).
#[derive(Debug, Default)]
pub struct ExtractedEntities {
    pub courses: HashMap<String, Course>,
    pub jockeys: HashMap<String, Person>,
    pub trainers: HashMap<String, Person>,
    pub owners: HashMap<String, Person>,
    pub horses: HashMap<String, Horse>,
    pub pedigrees: HashMap<String, HorsePedigree>,
    pub sires: HashMap<String, Ancestor>,
    pub dams: HashMap<String, Ancestor>,
    pub damsires: HashMap<String, Ancestor>,
}

impl ExtractedEntities {
    pub fn horse_ids(&self) -> Vec<String> {
        self.horses.keys().cloned().collect()
    }

    fn ancestors_mut(&mut self, kind: AncestorKind) -> &mut HashMap<String, Ancestor> {
        match kind {
            AncestorKind::Sire => &mut self.sires,
            AncestorKind::Dam => &mut self.dams,
            AncestorKind::Damsire => &mut self.damsires,
        }
    }
}

/// Counters from the enrichment pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentOutcome {
    /// Horses in the batch not previously known to the warehouse.
    pub discovered: usize,
    /// Horses successfully enriched via the detail endpoint.
    pub enriched: usize,
    /// Enrichment calls that failed; the base row is still persisted.
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

/// First non-empty value wins.
fn keep_first_name(existing: &mut String, candidate: &str) {
    if existing.is_empty() && !candidate.is_empty() {
        *existing = candidate.to_string();
    }
}

/// Most complete wins: fill the slot only while it is empty.
fn fill<T>(slot: &mut Option<T>, candidate: Option<T>) {
    if slot.is_none() {
        *slot = candidate;
    }
}

fn merge_person(entry: &mut Person, name: &str, location: Option<&str>) {
    keep_first_name(&mut entry.name, name);
    fill(&mut entry.location, location.map(str::to_string));
}

fn merge_horse(entry: &mut Horse, candidate: Horse) {
    keep_first_name(&mut entry.name, &candidate.name);
    fill(&mut entry.sex, candidate.sex);
    fill(&mut entry.sex_code, candidate.sex_code);
    fill(&mut entry.dob, candidate.dob);
    fill(&mut entry.colour, candidate.colour);
    fill(&mut entry.region, candidate.region);
    fill(&mut entry.sire_id, candidate.sire_id);
    fill(&mut entry.dam_id, candidate.dam_id);
    fill(&mut entry.damsire_id, candidate.damsire_id);
}

fn merge_pedigree(entry: &mut HorsePedigree, candidate: HorsePedigree) {
    fill(&mut entry.sire_id, candidate.sire_id);
    fill(&mut entry.sire_name, candidate.sire_name);
    fill(&mut entry.dam_id, candidate.dam_id);
    fill(&mut entry.dam_name, candidate.dam_name);
    fill(&mut entry.damsire_id, candidate.damsire_id);
    fill(&mut entry.damsire_name, candidate.damsire_name);
    fill(&mut entry.breeder, candidate.breeder);
    fill(&mut entry.region, candidate.region);
}

fn merge_ancestor(
    map: &mut HashMap<String, Ancestor>,
    id: &str,
    name: Option<&str>,
    region: Option<&str>,
) {
    let entry = map.entry(id.to_string()).or_insert_with(|| Ancestor {
        id: id.to_string(),
        ..Ancestor::default()
    });
    if entry.name.is_none() {
        if let Some(candidate) = name {
            if !candidate.is_empty() {
                entry.name = Some(candidate.to_string());
            }
        }
    }
    fill(&mut entry.region, region.map(str::to_string));
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Pull all secondary entities out of a batch of racecard documents.
pub fn extract_entities(docs: &[RacecardDoc]) -> ExtractedEntities {
    let mut entities = ExtractedEntities::default();

    for doc in docs {
        if let (Some(course_id), Some(course_name)) = (&doc.course_id, &doc.course) {
            entities
                .courses
                .entry(course_id.clone())
                .and_modify(|c| keep_first_name(&mut c.name, course_name))
                .or_insert_with(|| Course {
                    id: course_id.clone(),
                    name: course_name.clone(),
                    region_code: doc.region.as_ref().map(|r| r.to_lowercase()),
                    region: None,
                    latitude: None,
                    longitude: None,
                });
        }

        for runner in &doc.runners {
            extract_people(&mut entities, runner);
            extract_horse(&mut entities, doc, runner);
        }
    }

    entities
}

fn extract_people(
    entities: &mut ExtractedEntities,
    runner: &crate::services::racing_api::RacecardRunnerDoc,
) {
    if let (Some(id), Some(name)) = (&runner.jockey_id, &runner.jockey) {
        let entry = entities
            .jockeys
            .entry(id.clone())
            .or_insert_with(|| Person {
                id: id.clone(),
                name: String::new(),
                location: None,
            });
        merge_person(entry, name, None);
    }
    if let (Some(id), Some(name)) = (&runner.trainer_id, &runner.trainer) {
        let entry = entities
            .trainers
            .entry(id.clone())
            .or_insert_with(|| Person {
                id: id.clone(),
                name: String::new(),
                location: None,
            });
        merge_person(entry, name, runner.trainer_location.as_deref());
    }
    if let (Some(id), Some(name)) = (&runner.owner_id, &runner.owner) {
        let entry = entities.owners.entry(id.clone()).or_insert_with(|| Person {
            id: id.clone(),
            name: String::new(),
            location: None,
        });
        merge_person(entry, name, None);
    }
}

fn extract_horse(
    entities: &mut ExtractedEntities,
    doc: &RacecardDoc,
    runner: &crate::services::racing_api::RacecardRunnerDoc,
) {
    let Some(horse_id) = &runner.horse_id else {
        return;
    };

    let candidate = Horse {
        id: horse_id.clone(),
        name: runner.horse.clone().unwrap_or_default(),
        sex: runner.sex.clone(),
        sex_code: runner.sex_code.clone(),
        dob: runner.dob,
        colour: runner.colour.clone(),
        region: runner.region.clone().or_else(|| doc.region.clone()),
        sire_id: runner.sire_id.clone(),
        dam_id: runner.dam_id.clone(),
        damsire_id: runner.damsire_id.clone(),
    };
    entities
        .horses
        .entry(horse_id.clone())
        .and_modify(|h| merge_horse(h, candidate.clone()))
        .or_insert(candidate);

    if let Some(id) = &runner.sire_id {
        merge_ancestor(&mut entities.sires, id, runner.sire.as_deref(), None);
    }
    if let Some(id) = &runner.dam_id {
        merge_ancestor(&mut entities.dams, id, runner.dam.as_deref(), None);
    }
    if let Some(id) = &runner.damsire_id {
        merge_ancestor(&mut entities.damsires, id, runner.damsire.as_deref(), None);
    }

    // One pedigree row per horse that has any pedigree id
    if runner.sire_id.is_some() || runner.dam_id.is_some() || runner.damsire_id.is_some() {
        let candidate = HorsePedigree {
            horse_id: horse_id.clone(),
            sire_id: runner.sire_id.clone(),
            sire_name: runner.sire.clone(),
            dam_id: runner.dam_id.clone(),
            dam_name: runner.dam.clone(),
            damsire_id: runner.damsire_id.clone(),
            damsire_name: runner.damsire.clone(),
            breeder: runner.breeder.clone(),
            region: runner.region.clone(),
        };
        entities
            .pedigrees
            .entry(horse_id.clone())
            .and_modify(|p| merge_pedigree(p, candidate.clone()))
            .or_insert(candidate);
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Merge a horse detail document into the extracted batch.
fn apply_horse_pro(entities: &mut ExtractedEntities, doc: &HorseProDoc) {
    let candidate = Horse {
        id: doc.id.clone(),
        name: doc.name.clone().unwrap_or_default(),
        sex: doc.sex.clone(),
        sex_code: doc.sex_code.clone(),
        dob: doc.dob,
        colour: doc.colour.clone(),
        region: doc.region.clone(),
        sire_id: doc.sire_id.clone(),
        dam_id: doc.dam_id.clone(),
        damsire_id: doc.damsire_id.clone(),
    };
    entities
        .horses
        .entry(doc.id.clone())
        .and_modify(|h| merge_horse(h, candidate.clone()))
        .or_insert(candidate);

    if let Some(id) = &doc.sire_id {
        merge_ancestor(&mut entities.sires, id, doc.sire.as_deref(), None);
    }
    if let Some(id) = &doc.dam_id {
        merge_ancestor(&mut entities.dams, id, doc.dam.as_deref(), None);
    }
    if let Some(id) = &doc.damsire_id {
        merge_ancestor(&mut entities.damsires, id, doc.damsire.as_deref(), None);
    }

    if doc.sire_id.is_some() || doc.dam_id.is_some() || doc.damsire_id.is_some() {
        let candidate = HorsePedigree {
            horse_id: doc.id.clone(),
            sire_id: doc.sire_id.clone(),
            sire_name: doc.sire.clone(),
            dam_id: doc.dam_id.clone(),
            dam_name: doc.dam.clone(),
            damsire_id: doc.damsire_id.clone(),
            damsire_name: doc.damsire.clone(),
            breeder: doc.breeder.clone(),
            region: doc.region.clone(),
        };
        entities
            .pedigrees
            .entry(doc.id.clone())
            .and_modify(|p| merge_pedigree(p, candidate.clone()))
            .or_insert(candidate);
    }
}

/// Enrich horses not in `known_ids` via the detail endpoint, once each.
pub async fn enrich_new_horses(
    api: &dyn RacingApi,
    known_ids: &HashSet<String>,
    entities: &mut ExtractedEntities,
) -> EnrichmentOutcome {
    let new_ids: Vec<String> = entities
        .horses
        .keys()
        .filter(|id| !known_ids.contains(*id))
        .cloned()
        .collect();

    let mut outcome = EnrichmentOutcome {
        discovered: new_ids.len(),
        ..EnrichmentOutcome::default()
    };

    let mut fetches = stream::iter(new_ids)
        .map(|id| async move { (id.clone(), api.get_horse_pro(&id).await) })
        .buffer_unordered(ENRICHMENT_CONCURRENCY);

    while let Some((id, result)) = fetches.next().await {
        match result {
            Ok(doc) => {
                apply_horse_pro(entities, &doc);
                outcome.enriched += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "EntityExtractor: enrichment of horse {} failed, keeping base row: {}",
                    id,
                    e,
                );
                outcome.failed += 1;
            }
        }
    }

    outcome
}

/// Resolve ancestor back-references: when the ancestor itself raced in
/// covered regions its name matches a horse row, and the ancestor row gets
/// a `horse_id`. Missing matches are expected (foreign stallions).
pub async fn resolve_ancestor_back_refs(
    repo: &Repository,
    entities: &mut ExtractedEntities,
) -> Result<(), crate::errors::AppError> {
    for kind in [AncestorKind::Sire, AncestorKind::Dam, AncestorKind::Damsire] {
        let lookups: Vec<(String, String, Option<String>)> = entities
            .ancestors_mut(kind)
            .values()
            .filter(|a| a.horse_id.is_none())
            .filter_map(|a| {
                a.name
                    .clone()
                    .map(|name| (a.id.clone(), name, a.region.clone()))
            })
            .collect();

        for (id, name, region) in lookups {
            let resolved = repo
                .lookup_horse_id_by_name(&name, region.as_deref())
                .await?;
            if let Some(horse_id) = resolved {
                if let Some(entry) = entities.ancestors_mut(kind).get_mut(&id) {
                    entry.horse_id = Some(horse_id);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::racing_api::RacecardRunnerDoc;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    fn runner(horse_id: &str, horse: &str) -> RacecardRunnerDoc {
        RacecardRunnerDoc {
            horse_id: Some(horse_id.to_string()),
            horse: Some(horse.to_string()),
            ..RacecardRunnerDoc::default()
        }
    }

    fn racecard(race_id: &str, runners: Vec<RacecardRunnerDoc>) -> RacecardDoc {
        serde_json::from_value::<RacecardDoc>(serde_json::json!({
            "race_id": race_id,
            "date": "2025-10-23",
        }))
        .map(|mut doc| {
            doc.runners = runners;
            doc
        })
        .unwrap()
    }

    #[test]
    fn test_extract_deduplicates_by_id() {
        let mut r1 = runner("hrs_1", "Nightfall");
        r1.jockey_id = Some("jky_1".into());
        r1.jockey = Some("A Rider".into());
        let mut r2 = runner("hrs_1", "Nightfall");
        r2.jockey_id = Some("jky_1".into());
        r2.jockey = Some("A Rider".into());

        let docs = vec![racecard("rac_1", vec![r1]), racecard("rac_2", vec![r2])];
        let entities = extract_entities(&docs);

        assert_eq!(entities.horses.len(), 1);
        assert_eq!(entities.jockeys.len(), 1);
    }

    #[test]
    fn test_first_non_empty_name_wins() {
        let mut anonymous = runner("hrs_1", "");
        anonymous.trainer_id = Some("trn_1".into());
        anonymous.trainer = Some("".into());
        let mut named = runner("hrs_1", "Nightfall");
        named.trainer_id = Some("trn_1".into());
        named.trainer = Some("J Gosden".into());

        // Empty first: the later non-empty value fills the slot
        let docs = vec![racecard("rac_1", vec![anonymous.clone(), named.clone()])];
        let entities = extract_entities(&docs);
        assert_eq!(entities.horses["hrs_1"].name, "Nightfall");
        assert_eq!(entities.trainers["trn_1"].name, "J Gosden");

        // Non-empty first: the later empty value must not overwrite it
        let docs = vec![racecard("rac_1", vec![named, anonymous])];
        let entities = extract_entities(&docs);
        assert_eq!(entities.horses["hrs_1"].name, "Nightfall");
        assert_eq!(entities.trainers["trn_1"].name, "J Gosden");
    }

    #[test]
    fn test_most_complete_fields_win() {
        let mut sparse = runner("hrs_1", "Nightfall");
        sparse.sex_code = None;
        let mut complete = runner("hrs_1", "Nightfall");
        complete.sex_code = Some("G".into());
        complete.dob = NaiveDate::from_ymd_opt(2020, 3, 25);

        let docs = vec![racecard("rac_1", vec![sparse, complete])];
        let entities = extract_entities(&docs);
        let horse = &entities.horses["hrs_1"];
        assert_eq!(horse.sex_code.as_deref(), Some("G"));
        assert_eq!(horse.dob, NaiveDate::from_ymd_opt(2020, 3, 25));
    }

    #[test]
    fn test_pedigree_row_only_with_pedigree_ids() {
        let plain = runner("hrs_1", "Nightfall");
        let mut pedigreed = runner("hrs_2", "Dawn Raid");
        pedigreed.sire_id = Some("sir_9".into());
        pedigreed.sire = Some("Dark Angel".into());

        let docs = vec![racecard("rac_1", vec![plain, pedigreed])];
        let entities = extract_entities(&docs);

        assert!(!entities.pedigrees.contains_key("hrs_1"));
        let pedigree = &entities.pedigrees["hrs_2"];
        assert_eq!(pedigree.sire_id.as_deref(), Some("sir_9"));
        assert_eq!(entities.sires["sir_9"].name.as_deref(), Some("Dark Angel"));
    }

    #[test]
    fn test_trainer_location_kept_when_present() {
        let mut with_location = runner("hrs_1", "Nightfall");
        with_location.trainer_id = Some("trn_1".into());
        with_location.trainer = Some("J Gosden".into());
        with_location.trainer_location = Some("Newmarket".into());
        let mut without_location = runner("hrs_2", "Dawn Raid");
        without_location.trainer_id = Some("trn_1".into());
        without_location.trainer = Some("J Gosden".into());

        let docs = vec![racecard("rac_1", vec![with_location, without_location])];
        let entities = extract_entities(&docs);
        assert_eq!(
            entities.trainers["trn_1"].location.as_deref(),
            Some("Newmarket")
        );
    }

    // --- enrichment ---

    /// Mock API: serves one horse detail document, errors for everything else.
    struct SingleHorseApi {
        doc: HorseProDoc,
    }

    #[async_trait]
    impl RacingApi for SingleHorseApi {
        async fn get_courses(
            &self,
            _: &[String],
        ) -> Result<Vec<crate::services::racing_api::CourseDoc>, crate::errors::AppError> {
            unimplemented!("not used by enrichment")
        }
        async fn get_bookmakers(
            &self,
        ) -> Result<Vec<crate::services::racing_api::BookmakerDoc>, crate::errors::AppError>
        {
            unimplemented!("not used by enrichment")
        }
        async fn get_jockeys(
            &self,
            _: &[String],
        ) -> Result<Vec<crate::services::racing_api::PersonDoc>, crate::errors::AppError>
        {
            unimplemented!("not used by enrichment")
        }
        async fn get_trainers(
            &self,
            _: &[String],
        ) -> Result<Vec<crate::services::racing_api::PersonDoc>, crate::errors::AppError>
        {
            unimplemented!("not used by enrichment")
        }
        async fn get_owners(
            &self,
            _: &[String],
        ) -> Result<Vec<crate::services::racing_api::PersonDoc>, crate::errors::AppError>
        {
            unimplemented!("not used by enrichment")
        }
        async fn get_racecards_pro(
            &self,
            _: NaiveDate,
            _: NaiveDate,
            _: &[String],
        ) -> Result<Vec<RacecardDoc>, crate::errors::AppError> {
            unimplemented!("not used by enrichment")
        }
        async fn get_results(
            &self,
            _: NaiveDate,
            _: NaiveDate,
            _: &[String],
        ) -> Result<Vec<crate::services::racing_api::RaceResultDoc>, crate::errors::AppError>
        {
            unimplemented!("not used by enrichment")
        }
        async fn get_horse_pro(
            &self,
            horse_id: &str,
        ) -> Result<HorseProDoc, crate::errors::AppError> {
            if horse_id == self.doc.id {
                Ok(self.doc.clone())
            } else {
                Err(crate::errors::AppError::Fetch(format!(
                    "unknown horse {horse_id}"
                )))
            }
        }
    }

    #[tokio::test]
    async fn test_enrichment_of_new_horse() {
        // Runner references a horse unknown to the repository; the detail
        // endpoint supplies dob, sex code and sire. The horse row gains the
        // fields, the pedigree row gains the sire id, and a sire row exists.
        let docs = vec![racecard("rac_1", vec![runner("hrs_X", "Mystery Colt")])];
        let mut entities = extract_entities(&docs);

        let api = SingleHorseApi {
            doc: HorseProDoc {
                id: "hrs_X".into(),
                dob: NaiveDate::from_ymd_opt(2020, 3, 25),
                sex_code: Some("G".into()),
                sire_id: Some("sir_Y".into()),
                sire: Some("Dark Angel".into()),
                ..HorseProDoc::default()
            },
        };

        let outcome = enrich_new_horses(&api, &HashSet::new(), &mut entities).await;

        assert_eq!(outcome.discovered, 1);
        assert_eq!(outcome.enriched, 1);
        assert_eq!(outcome.failed, 0);

        let horse = &entities.horses["hrs_X"];
        assert_eq!(horse.dob, NaiveDate::from_ymd_opt(2020, 3, 25));
        assert_eq!(horse.sex_code.as_deref(), Some("G"));
        assert_eq!(horse.sire_id.as_deref(), Some("sir_Y"));
        assert_eq!(
            entities.pedigrees["hrs_X"].sire_id.as_deref(),
            Some("sir_Y")
        );
        assert!(entities.sires.contains_key("sir_Y"));
    }

    #[tokio::test]
    async fn test_known_horses_are_not_enriched() {
        let docs = vec![racecard("rac_1", vec![runner("hrs_known", "Old Friend")])];
        let mut entities = extract_entities(&docs);

        let api = SingleHorseApi {
            doc: HorseProDoc {
                id: "hrs_other".into(),
                ..HorseProDoc::default()
            },
        };
        let known: HashSet<String> = ["hrs_known".to_string()].into_iter().collect();

        let outcome = enrich_new_horses(&api, &known, &mut entities).await;
        assert_eq!(outcome.discovered, 0);
        assert_eq!(outcome.enriched, 0);
    }

    #[tokio::test]
    async fn test_failed_enrichment_keeps_base_row() {
        let docs = vec![racecard("rac_1", vec![runner("hrs_missing", "Ghost")])];
        let mut entities = extract_entities(&docs);

        let api = SingleHorseApi {
            doc: HorseProDoc {
                id: "hrs_other".into(),
                ..HorseProDoc::default()
            },
        };

        let outcome = enrich_new_horses(&api, &HashSet::new(), &mut entities).await;
        assert_eq!(outcome.discovered, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(entities.horses["hrs_missing"].name, "Ghost");
    }
}
