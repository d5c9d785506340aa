//! Upsert-based persistence over the warehouse tables.
//!
//! Every write is an upsert keyed by the entity's primary key (composite
//! for runners and race results). Writes are grouped into batches of 100
//! rows, one transaction per batch; a failing batch is retried once after
//! a short pause and then skipped with the failure counted, so the chunk
//! it belongs to is not marked complete and the next backfill attempt
//! retries it.

use chrono::NaiveDate;
use futures::future::BoxFuture;
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::Duration;

use super::models::{
    Ancestor, AncestorGroupRow, AncestorKind, AncestorTotalsRow, Bookmaker, BucketAggRow,
    ComboAggRow, Course, EntityCombination, Horse, HorsePedigree, HorseRunRow, PedigreeStats,
    PeopleAggRow, PeopleKind, PeopleStats, PerformanceBucket, Person, Race, RaceResult,
    RacePostFields, Region, Runner, RunnerKeyRow, RunnerResultPatch, RunnerStats,
};
use crate::errors::AppError;

/// Rows per write transaction.
pub(crate) const WRITE_BATCH_SIZE: usize = 100;
/// Pause before the single batch retry (milliseconds).
const BATCH_RETRY_PAUSE_MS: u64 = 500;
/// Keyset page size for the statistics calculators.
pub(crate) const STATS_PAGE_SIZE: i64 = 500;

/// Distance band boundaries, shared by the SQL grouping expression and the
/// Rust mirror in `stats::combinations`. Bands are in rounded furlongs:
/// 5-6f sprint, 7-8f mile, 9-12f middle, 13f+ staying.
const DISTANCE_BAND_SQL: &str = "\
    CASE \
      WHEN ra.distance_m IS NULL THEN NULL \
      WHEN ROUND((ra.distance_m / 201.168)::numeric) <= 6 THEN '5-6f' \
      WHEN ROUND((ra.distance_m / 201.168)::numeric) <= 8 THEN '7-8f' \
      WHEN ROUND((ra.distance_m / 201.168)::numeric) <= 12 THEN '9-12f' \
      ELSE '13f+' \
    END";

/// Outcome of a batched write: rows that committed and batches that failed
/// both attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub rows_written: usize,
    pub failed_batches: usize,
}

impl BatchOutcome {
    pub fn absorb(&mut self, other: BatchOutcome) {
        self.rows_written += other.rows_written;
        self.failed_batches += other.failed_batches;
    }
}

/// Run `write_chunk` over `rows` in batches of [`WRITE_BATCH_SIZE`], with
/// one retry per failing batch.
async fn run_batched<'a, T>(
    label: &str,
    rows: &'a [T],
    write_chunk: impl Fn(&'a [T]) -> BoxFuture<'a, Result<(), sqlx::Error>>,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for chunk in rows.chunks(WRITE_BATCH_SIZE) {
        let mut result = write_chunk(chunk).await;
        if result.is_err() {
            tokio::time::sleep(Duration::from_millis(BATCH_RETRY_PAUSE_MS)).await;
            result = write_chunk(chunk).await;
        }
        match result {
            Ok(()) => outcome.rows_written += chunk.len(),
            Err(e) => {
                tracing::error!(
                    "Repository: {} batch of {} rows failed after retry: {}",
                    label,
                    chunk.len(),
                    e,
                );
                outcome.failed_batches += 1;
            }
        }
    }
    outcome
}

/// Wraps the relational store. The store exclusively owns every entity;
/// fetchers own no state beyond the documents they are processing.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // -----------------------------------------------------------------------
    // Reference entities
    // -----------------------------------------------------------------------

    pub async fn upsert_courses(&self, rows: &[Course]) -> BatchOutcome {
        run_batched("courses", rows, |chunk| {
            Box::pin(self.write_courses_chunk(chunk))
        })
        .await
    }

    async fn write_courses_chunk(&self, rows: &[Course]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for c in rows {
            sqlx::query(
                "INSERT INTO ra_mst_courses (id, name, region_code, region, latitude, longitude)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO UPDATE SET
                     name = EXCLUDED.name,
                     region_code = EXCLUDED.region_code,
                     region = EXCLUDED.region,
                     latitude = COALESCE(EXCLUDED.latitude, ra_mst_courses.latitude),
                     longitude = COALESCE(EXCLUDED.longitude, ra_mst_courses.longitude)",
            )
            .bind(&c.id)
            .bind(&c.name)
            .bind(&c.region_code)
            .bind(&c.region)
            .bind(c.latitude)
            .bind(c.longitude)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn upsert_bookmakers(&self, rows: &[Bookmaker]) -> BatchOutcome {
        run_batched("bookmakers", rows, |chunk| {
            Box::pin(self.write_bookmakers_chunk(chunk))
        })
        .await
    }

    async fn write_bookmakers_chunk(&self, rows: &[Bookmaker]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for b in rows {
            sqlx::query(
                "INSERT INTO ra_mst_bookmakers (id, name, code, kind, is_active)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET
                     name = EXCLUDED.name,
                     code = EXCLUDED.code,
                     kind = EXCLUDED.kind,
                     is_active = EXCLUDED.is_active",
            )
            .bind(&b.id)
            .bind(&b.name)
            .bind(&b.code)
            .bind(&b.kind)
            .bind(b.is_active)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn upsert_regions(&self, rows: &[Region]) -> BatchOutcome {
        run_batched("regions", rows, |chunk| {
            Box::pin(self.write_regions_chunk(chunk))
        })
        .await
    }

    async fn write_regions_chunk(&self, rows: &[Region]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO ra_mst_regions (code, name)
                 VALUES ($1, $2)
                 ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name",
            )
            .bind(&r.code)
            .bind(&r.name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    // -----------------------------------------------------------------------
    // People entities
    // -----------------------------------------------------------------------

    pub async fn upsert_people(&self, kind: PeopleKind, rows: &[Person]) -> BatchOutcome {
        run_batched(kind.table(), rows, |chunk| {
            Box::pin(self.write_people_chunk(kind, chunk))
        })
        .await
    }

    /// Name updates never replace a non-empty name with an empty one, and
    /// trainer `location` keeps its first non-empty observation.
    async fn write_people_chunk(
        &self,
        kind: PeopleKind,
        rows: &[Person],
    ) -> Result<(), sqlx::Error> {
        let table = kind.table();
        let sql = format!(
            "INSERT INTO {table} (id, name, location)
             VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET
                 name = COALESCE(NULLIF(EXCLUDED.name, ''), {table}.name),
                 location = COALESCE({table}.location, EXCLUDED.location)"
        );
        let mut tx = self.pool.begin().await?;
        for p in rows {
            sqlx::query(&sql)
                .bind(&p.id)
                .bind(&p.name)
                .bind(&p.location)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    // -----------------------------------------------------------------------
    // Horse graph
    // -----------------------------------------------------------------------

    pub async fn upsert_horses(&self, rows: &[Horse]) -> BatchOutcome {
        run_batched("horses", rows, |chunk| {
            Box::pin(self.write_horses_chunk(chunk))
        })
        .await
    }

    async fn write_horses_chunk(&self, rows: &[Horse]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for h in rows {
            sqlx::query(
                "INSERT INTO ra_mst_horses
                     (id, name, sex, sex_code, dob, colour, region, sire_id, dam_id, damsire_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (id) DO UPDATE SET
                     name = COALESCE(NULLIF(EXCLUDED.name, ''), ra_mst_horses.name),
                     sex = COALESCE(EXCLUDED.sex, ra_mst_horses.sex),
                     sex_code = COALESCE(EXCLUDED.sex_code, ra_mst_horses.sex_code),
                     dob = COALESCE(EXCLUDED.dob, ra_mst_horses.dob),
                     colour = COALESCE(EXCLUDED.colour, ra_mst_horses.colour),
                     region = COALESCE(EXCLUDED.region, ra_mst_horses.region),
                     sire_id = COALESCE(EXCLUDED.sire_id, ra_mst_horses.sire_id),
                     dam_id = COALESCE(EXCLUDED.dam_id, ra_mst_horses.dam_id),
                     damsire_id = COALESCE(EXCLUDED.damsire_id, ra_mst_horses.damsire_id)",
            )
            .bind(&h.id)
            .bind(&h.name)
            .bind(&h.sex)
            .bind(&h.sex_code)
            .bind(h.dob)
            .bind(&h.colour)
            .bind(&h.region)
            .bind(&h.sire_id)
            .bind(&h.dam_id)
            .bind(&h.damsire_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn upsert_pedigrees(&self, rows: &[HorsePedigree]) -> BatchOutcome {
        run_batched("pedigrees", rows, |chunk| {
            Box::pin(self.write_pedigrees_chunk(chunk))
        })
        .await
    }

    async fn write_pedigrees_chunk(&self, rows: &[HorsePedigree]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for p in rows {
            sqlx::query(
                "INSERT INTO ra_mst_horse_pedigree
                     (horse_id, sire_id, sire_name, dam_id, dam_name,
                      damsire_id, damsire_name, breeder, region)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (horse_id) DO UPDATE SET
                     sire_id = COALESCE(EXCLUDED.sire_id, ra_mst_horse_pedigree.sire_id),
                     sire_name = COALESCE(EXCLUDED.sire_name, ra_mst_horse_pedigree.sire_name),
                     dam_id = COALESCE(EXCLUDED.dam_id, ra_mst_horse_pedigree.dam_id),
                     dam_name = COALESCE(EXCLUDED.dam_name, ra_mst_horse_pedigree.dam_name),
                     damsire_id = COALESCE(EXCLUDED.damsire_id, ra_mst_horse_pedigree.damsire_id),
                     damsire_name = COALESCE(EXCLUDED.damsire_name, ra_mst_horse_pedigree.damsire_name),
                     breeder = COALESCE(EXCLUDED.breeder, ra_mst_horse_pedigree.breeder),
                     region = COALESCE(EXCLUDED.region, ra_mst_horse_pedigree.region)",
            )
            .bind(&p.horse_id)
            .bind(&p.sire_id)
            .bind(&p.sire_name)
            .bind(&p.dam_id)
            .bind(&p.dam_name)
            .bind(&p.damsire_id)
            .bind(&p.damsire_name)
            .bind(&p.breeder)
            .bind(&p.region)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn upsert_ancestors(&self, kind: AncestorKind, rows: &[Ancestor]) -> BatchOutcome {
        run_batched(kind.table(), rows, |chunk| {
            Box::pin(self.write_ancestors_chunk(kind, chunk))
        })
        .await
    }

    async fn write_ancestors_chunk(
        &self,
        kind: AncestorKind,
        rows: &[Ancestor],
    ) -> Result<(), sqlx::Error> {
        let table = kind.table();
        let sql = format!(
            "INSERT INTO {table} (id, name, region, horse_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                 name = COALESCE(NULLIF(EXCLUDED.name, ''), {table}.name),
                 region = COALESCE(EXCLUDED.region, {table}.region),
                 horse_id = COALESCE(EXCLUDED.horse_id, {table}.horse_id)"
        );
        let mut tx = self.pool.begin().await?;
        for a in rows {
            sqlx::query(&sql)
                .bind(&a.id)
                .bind(&a.name)
                .bind(&a.region)
                .bind(&a.horse_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    // -----------------------------------------------------------------------
    // Transactional entities
    // -----------------------------------------------------------------------

    /// Racecard-sourced race upsert. Post-race columns and `has_result` are
    /// deliberately not touched so a re-fetch of the racecard never erases
    /// an already-applied result.
    pub async fn upsert_races(&self, rows: &[Race]) -> BatchOutcome {
        run_batched("races", rows, |chunk| {
            Box::pin(self.write_races_chunk(chunk))
        })
        .await
    }

    async fn write_races_chunk(&self, rows: &[Race]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO ra_races
                     (race_id, race_date, off_time, course_id, course_name, region,
                      race_name, race_class, pattern, race_type,
                      distance, distance_furlongs, distance_m, going,
                      prize_money, currency, age_band, rating_band, field_size, has_result)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                         $11, $12, $13, $14, $15, $16, $17, $18, $19, FALSE)
                 ON CONFLICT (race_id) DO UPDATE SET
                     race_date = EXCLUDED.race_date,
                     off_time = EXCLUDED.off_time,
                     course_id = EXCLUDED.course_id,
                     course_name = EXCLUDED.course_name,
                     region = EXCLUDED.region,
                     race_name = EXCLUDED.race_name,
                     race_class = EXCLUDED.race_class,
                     pattern = EXCLUDED.pattern,
                     race_type = EXCLUDED.race_type,
                     distance = EXCLUDED.distance,
                     distance_furlongs = EXCLUDED.distance_furlongs,
                     distance_m = EXCLUDED.distance_m,
                     going = EXCLUDED.going,
                     prize_money = EXCLUDED.prize_money,
                     currency = EXCLUDED.currency,
                     age_band = EXCLUDED.age_band,
                     rating_band = EXCLUDED.rating_band,
                     field_size = EXCLUDED.field_size",
            )
            .bind(&r.race_id)
            .bind(r.race_date)
            .bind(r.off_time)
            .bind(&r.course_id)
            .bind(&r.course_name)
            .bind(&r.region)
            .bind(&r.race_name)
            .bind(&r.race_class)
            .bind(&r.pattern)
            .bind(&r.race_type)
            .bind(&r.distance)
            .bind(r.distance_furlongs)
            .bind(r.distance_m)
            .bind(&r.going)
            .bind(r.prize_money)
            .bind(&r.currency)
            .bind(&r.age_band)
            .bind(&r.rating_band)
            .bind(r.field_size)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn upsert_runners(&self, rows: &[Runner]) -> BatchOutcome {
        run_batched("runners", rows, |chunk| {
            Box::pin(self.write_runners_chunk(chunk))
        })
        .await
    }

    async fn write_runners_chunk(&self, rows: &[Runner]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO ra_runners
                     (race_id, horse_id, horse_name, cloth_number, draw, age, weight_lbs,
                      headgear, official_rating, form, jockey_id, jockey_name,
                      jockey_claim_lbs, trainer_id, trainer_name, owner_id, owner_name,
                      sire_id, sire_name, dam_id, dam_name, damsire_id, damsire_name,
                      silk_url)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                         $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
                 ON CONFLICT (race_id, horse_id) DO UPDATE SET
                     horse_name = COALESCE(NULLIF(EXCLUDED.horse_name, ''), ra_runners.horse_name),
                     cloth_number = COALESCE(EXCLUDED.cloth_number, ra_runners.cloth_number),
                     draw = COALESCE(EXCLUDED.draw, ra_runners.draw),
                     age = COALESCE(EXCLUDED.age, ra_runners.age),
                     weight_lbs = COALESCE(EXCLUDED.weight_lbs, ra_runners.weight_lbs),
                     headgear = COALESCE(EXCLUDED.headgear, ra_runners.headgear),
                     official_rating = COALESCE(EXCLUDED.official_rating, ra_runners.official_rating),
                     form = COALESCE(EXCLUDED.form, ra_runners.form),
                     jockey_id = COALESCE(EXCLUDED.jockey_id, ra_runners.jockey_id),
                     jockey_name = COALESCE(EXCLUDED.jockey_name, ra_runners.jockey_name),
                     jockey_claim_lbs = COALESCE(EXCLUDED.jockey_claim_lbs, ra_runners.jockey_claim_lbs),
                     trainer_id = COALESCE(EXCLUDED.trainer_id, ra_runners.trainer_id),
                     trainer_name = COALESCE(EXCLUDED.trainer_name, ra_runners.trainer_name),
                     owner_id = COALESCE(EXCLUDED.owner_id, ra_runners.owner_id),
                     owner_name = COALESCE(EXCLUDED.owner_name, ra_runners.owner_name),
                     sire_id = COALESCE(EXCLUDED.sire_id, ra_runners.sire_id),
                     sire_name = COALESCE(EXCLUDED.sire_name, ra_runners.sire_name),
                     dam_id = COALESCE(EXCLUDED.dam_id, ra_runners.dam_id),
                     dam_name = COALESCE(EXCLUDED.dam_name, ra_runners.dam_name),
                     damsire_id = COALESCE(EXCLUDED.damsire_id, ra_runners.damsire_id),
                     damsire_name = COALESCE(EXCLUDED.damsire_name, ra_runners.damsire_name),
                     silk_url = COALESCE(EXCLUDED.silk_url, ra_runners.silk_url)",
            )
            .bind(&r.race_id)
            .bind(&r.horse_id)
            .bind(&r.horse_name)
            .bind(r.cloth_number)
            .bind(r.draw)
            .bind(r.age)
            .bind(r.weight_lbs)
            .bind(&r.headgear)
            .bind(r.official_rating)
            .bind(&r.form)
            .bind(&r.jockey_id)
            .bind(&r.jockey_name)
            .bind(r.jockey_claim_lbs)
            .bind(&r.trainer_id)
            .bind(&r.trainer_name)
            .bind(&r.owner_id)
            .bind(&r.owner_name)
            .bind(&r.sire_id)
            .bind(&r.sire_name)
            .bind(&r.dam_id)
            .bind(&r.dam_name)
            .bind(&r.damsire_id)
            .bind(&r.damsire_name)
            .bind(&r.silk_url)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Apply post-race columns to a race and flip `has_result` on.
    pub async fn apply_race_result_fields(
        &self,
        fields: &RacePostFields,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE ra_races SET
                 has_result = TRUE,
                 winning_time = $2,
                 tote_win = $3,
                 tote_place = $4,
                 comments = $5
             WHERE race_id = $1",
        )
        .bind(&fields.race_id)
        .bind(&fields.winning_time)
        .bind(&fields.tote_win)
        .bind(&fields.tote_place)
        .bind(&fields.comments)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Column-level partial runner update from a results document. Pre-race
    /// fields absent from the results response keep their existing values;
    /// a result for an unseen runner still inserts a valid (race, horse) row.
    pub async fn apply_runner_results(&self, rows: &[RunnerResultPatch]) -> BatchOutcome {
        run_batched("runner results", rows, |chunk| {
            Box::pin(self.write_runner_results_chunk(chunk))
        })
        .await
    }

    async fn write_runner_results_chunk(
        &self,
        rows: &[RunnerResultPatch],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO ra_runners
                     (race_id, horse_id, horse_name, draw, position, distance_beaten,
                      prize_won, starting_price, starting_price_decimal, finish_time, comment)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (race_id, horse_id) DO UPDATE SET
                     horse_name = COALESCE(NULLIF(EXCLUDED.horse_name, ''), ra_runners.horse_name),
                     draw = COALESCE(EXCLUDED.draw, ra_runners.draw),
                     position = EXCLUDED.position,
                     distance_beaten = EXCLUDED.distance_beaten,
                     prize_won = EXCLUDED.prize_won,
                     starting_price = EXCLUDED.starting_price,
                     starting_price_decimal = EXCLUDED.starting_price_decimal,
                     finish_time = EXCLUDED.finish_time,
                     comment = EXCLUDED.comment",
            )
            .bind(&r.race_id)
            .bind(&r.horse_id)
            .bind(&r.horse_name)
            .bind(r.draw)
            .bind(r.position)
            .bind(r.distance_beaten)
            .bind(r.prize_won)
            .bind(&r.starting_price)
            .bind(r.starting_price_decimal)
            .bind(&r.finish_time)
            .bind(&r.comment)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn upsert_race_results(&self, rows: &[RaceResult]) -> BatchOutcome {
        run_batched("race results", rows, |chunk| {
            Box::pin(self.write_race_results_chunk(chunk))
        })
        .await
    }

    async fn write_race_results_chunk(&self, rows: &[RaceResult]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO ra_race_results
                     (race_id, horse_id, position_raw, position, disqualified,
                      distance_beaten, starting_price, starting_price_decimal,
                      prize_won, finish_time, comment)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (race_id, horse_id) DO UPDATE SET
                     position_raw = EXCLUDED.position_raw,
                     position = EXCLUDED.position,
                     disqualified = EXCLUDED.disqualified,
                     distance_beaten = EXCLUDED.distance_beaten,
                     starting_price = EXCLUDED.starting_price,
                     starting_price_decimal = EXCLUDED.starting_price_decimal,
                     prize_won = EXCLUDED.prize_won,
                     finish_time = EXCLUDED.finish_time,
                     comment = EXCLUDED.comment",
            )
            .bind(&r.race_id)
            .bind(&r.horse_id)
            .bind(&r.position_raw)
            .bind(r.position)
            .bind(r.disqualified)
            .bind(r.distance_beaten)
            .bind(&r.starting_price)
            .bind(r.starting_price_decimal)
            .bind(r.prize_won)
            .bind(&r.finish_time)
            .bind(&r.comment)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    // -----------------------------------------------------------------------
    // Lookup queries
    // -----------------------------------------------------------------------

    /// Which of the candidate horse ids are already known. Used by the
    /// entity extractor to enrich only newly discovered horses.
    pub async fn existing_horse_ids(
        &self,
        candidate_ids: &[String],
    ) -> Result<HashSet<String>, AppError> {
        if candidate_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM ra_mst_horses WHERE id = ANY($1)")
                .bind(candidate_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Resolve an ancestor's own racing record by name (and region when
    /// known). Missing matches are expected for foreign stallions.
    pub async fn lookup_horse_id_by_name(
        &self,
        name: &str,
        region: Option<&str>,
    ) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM ra_mst_horses
             WHERE LOWER(name) = LOWER($1)
               AND ($2::text IS NULL OR region = $2)
             ORDER BY id
             LIMIT 1",
        )
        .bind(name)
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// Runner integrity probe: runners whose race or horse row is missing.
    /// A non-zero count is an invariant violation and aborts the job.
    pub async fn count_orphan_runners(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*)
             FROM ra_runners r
             LEFT JOIN ra_races ra ON ra.race_id = r.race_id
             LEFT JOIN ra_mst_horses h ON h.id = r.horse_id
             WHERE ra.race_id IS NULL OR h.id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Most recent race date in the warehouse (freshness probe).
    pub async fn latest_race_date(&self) -> Result<Option<NaiveDate>, AppError> {
        let row: (Option<NaiveDate>,) = sqlx::query_as("SELECT MAX(race_date) FROM ra_races")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // -----------------------------------------------------------------------
    // Aggregation reads for the statistics calculators
    // -----------------------------------------------------------------------

    /// Keyset page of entity ids for a people table.
    pub async fn people_ids_page(
        &self,
        kind: PeopleKind,
        after: Option<&str>,
    ) -> Result<Vec<String>, AppError> {
        let sql = format!(
            "SELECT id FROM {} WHERE id > $1 ORDER BY id LIMIT $2",
            kind.table()
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(after.unwrap_or(""))
            .bind(STATS_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Career and rolling-window counters for a page of people. Only races
    /// with a result count as activity; non-finishers count as rides but
    /// never as placings.
    pub async fn people_aggregates(
        &self,
        kind: PeopleKind,
        ids: &[String],
        today: NaiveDate,
    ) -> Result<Vec<PeopleAggRow>, AppError> {
        let fk = kind.runner_fk();
        let sql = format!(
            "SELECT r.{fk} AS entity_id,
                    COUNT(*) AS total_rides,
                    COUNT(*) FILTER (WHERE r.position = 1) AS wins,
                    COUNT(*) FILTER (WHERE r.position <= 3) AS places,
                    COUNT(*) FILTER (WHERE r.position = 2) AS seconds,
                    COUNT(*) FILTER (WHERE r.position = 3) AS thirds,
                    COUNT(*) FILTER (WHERE ra.race_date >= $2) AS rides_14d,
                    COUNT(*) FILTER (WHERE ra.race_date >= $2 AND r.position = 1) AS wins_14d,
                    COUNT(*) FILTER (WHERE ra.race_date >= $3) AS rides_30d,
                    COUNT(*) FILTER (WHERE ra.race_date >= $3 AND r.position = 1) AS wins_30d,
                    MAX(ra.race_date) AS last_ride_date,
                    MAX(ra.race_date) FILTER (WHERE r.position = 1) AS last_win_date
             FROM ra_runners r
             JOIN ra_races ra ON ra.race_id = r.race_id
             WHERE ra.has_result
               AND r.{fk} = ANY($1)
             GROUP BY r.{fk}"
        );
        let rows = sqlx::query_as::<_, PeopleAggRow>(&sql)
            .bind(ids)
            .bind(today - chrono::Duration::days(14))
            .bind(today - chrono::Duration::days(30))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn upsert_people_stats(
        &self,
        kind: PeopleKind,
        rows: &[PeopleStats],
    ) -> BatchOutcome {
        run_batched(kind.stats_table(), rows, |chunk| {
            Box::pin(self.write_people_stats_chunk(kind, chunk))
        })
        .await
    }

    async fn write_people_stats_chunk(
        &self,
        kind: PeopleKind,
        rows: &[PeopleStats],
    ) -> Result<(), sqlx::Error> {
        let table = kind.stats_table();
        let sql = format!(
            "INSERT INTO {table}
                 (entity_id, total_rides, wins, places, seconds, thirds, win_rate,
                  rides_14d, wins_14d, win_rate_14d, rides_30d, wins_30d, win_rate_30d,
                  last_ride_date, last_win_date, days_since_last_ride, days_since_last_win,
                  computed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                     $14, $15, $16, $17, $18)
             ON CONFLICT (entity_id) DO UPDATE SET
                 total_rides = EXCLUDED.total_rides,
                 wins = EXCLUDED.wins,
                 places = EXCLUDED.places,
                 seconds = EXCLUDED.seconds,
                 thirds = EXCLUDED.thirds,
                 win_rate = EXCLUDED.win_rate,
                 rides_14d = EXCLUDED.rides_14d,
                 wins_14d = EXCLUDED.wins_14d,
                 win_rate_14d = EXCLUDED.win_rate_14d,
                 rides_30d = EXCLUDED.rides_30d,
                 wins_30d = EXCLUDED.wins_30d,
                 win_rate_30d = EXCLUDED.win_rate_30d,
                 last_ride_date = EXCLUDED.last_ride_date,
                 last_win_date = EXCLUDED.last_win_date,
                 days_since_last_ride = EXCLUDED.days_since_last_ride,
                 days_since_last_win = EXCLUDED.days_since_last_win,
                 computed_at = EXCLUDED.computed_at"
        );
        let mut tx = self.pool.begin().await?;
        for s in rows {
            sqlx::query(&sql)
                .bind(&s.entity_id)
                .bind(s.total_rides)
                .bind(s.wins)
                .bind(s.places)
                .bind(s.seconds)
                .bind(s.thirds)
                .bind(s.win_rate)
                .bind(s.rides_14d)
                .bind(s.wins_14d)
                .bind(s.win_rate_14d)
                .bind(s.rides_30d)
                .bind(s.wins_30d)
                .bind(s.win_rate_30d)
                .bind(s.last_ride_date)
                .bind(s.last_win_date)
                .bind(s.days_since_last_ride)
                .bind(s.days_since_last_win)
                .bind(s.computed_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    /// Keyset page of ancestor ids.
    pub async fn ancestor_ids_page(
        &self,
        kind: AncestorKind,
        after: Option<&str>,
    ) -> Result<Vec<String>, AppError> {
        let sql = format!(
            "SELECT id FROM {} WHERE id > $1 ORDER BY id LIMIT $2",
            kind.table()
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(after.unwrap_or(""))
            .bind(STATS_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Progeny totals for a page of ancestors: distinct offspring, runs,
    /// wins, placings and prize money over races with a result.
    pub async fn ancestor_totals(
        &self,
        kind: AncestorKind,
        ids: &[String],
    ) -> Result<Vec<AncestorTotalsRow>, AppError> {
        let fk = kind.horse_fk();
        let sql = format!(
            "SELECT h.{fk} AS ancestor_id,
                    COUNT(DISTINCT h.id) AS progeny_count,
                    COUNT(ra.race_id) AS runs,
                    COUNT(*) FILTER (WHERE r.position = 1) AS wins,
                    COUNT(*) FILTER (WHERE r.position <= 3) AS places,
                    SUM(r.prize_won) FILTER (WHERE ra.race_id IS NOT NULL) AS earnings
             FROM ra_mst_horses h
             LEFT JOIN ra_runners r ON r.horse_id = h.id
             LEFT JOIN ra_races ra ON ra.race_id = r.race_id AND ra.has_result
             WHERE h.{fk} = ANY($1)
             GROUP BY h.{fk}"
        );
        let rows = sqlx::query_as::<_, AncestorTotalsRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Per-(ancestor, race class) progeny counters.
    pub async fn ancestor_class_groups(
        &self,
        kind: AncestorKind,
        ids: &[String],
    ) -> Result<Vec<AncestorGroupRow>, AppError> {
        let fk = kind.horse_fk();
        let sql = format!(
            "SELECT h.{fk} AS ancestor_id,
                    ra.race_class AS group_name,
                    COUNT(*) AS runs,
                    COUNT(*) FILTER (WHERE r.position = 1) AS wins
             FROM ra_mst_horses h
             JOIN ra_runners r ON r.horse_id = h.id
             JOIN ra_races ra ON ra.race_id = r.race_id
             WHERE ra.has_result
               AND ra.race_class IS NOT NULL
               AND h.{fk} = ANY($1)
             GROUP BY h.{fk}, ra.race_class"
        );
        let rows = sqlx::query_as::<_, AncestorGroupRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Per-(ancestor, distance band) progeny counters.
    pub async fn ancestor_distance_groups(
        &self,
        kind: AncestorKind,
        ids: &[String],
    ) -> Result<Vec<AncestorGroupRow>, AppError> {
        let fk = kind.horse_fk();
        let sql = format!(
            "SELECT h.{fk} AS ancestor_id,
                    {DISTANCE_BAND_SQL} AS group_name,
                    COUNT(*) AS runs,
                    COUNT(*) FILTER (WHERE r.position = 1) AS wins
             FROM ra_mst_horses h
             JOIN ra_runners r ON r.horse_id = h.id
             JOIN ra_races ra ON ra.race_id = r.race_id
             WHERE ra.has_result
               AND ra.distance_m IS NOT NULL
               AND h.{fk} = ANY($1)
             GROUP BY h.{fk}, 2"
        );
        let rows = sqlx::query_as::<_, AncestorGroupRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Write the derived progeny-performance block onto ancestor rows.
    pub async fn update_ancestor_stats(
        &self,
        kind: AncestorKind,
        rows: &[PedigreeStats],
    ) -> BatchOutcome {
        run_batched(kind.table(), rows, |chunk| {
            Box::pin(self.write_ancestor_stats_chunk(kind, chunk))
        })
        .await
    }

    async fn write_ancestor_stats_chunk(
        &self,
        kind: AncestorKind,
        rows: &[PedigreeStats],
    ) -> Result<(), sqlx::Error> {
        let table = kind.table();
        let sql = format!(
            "UPDATE {table} SET
                 progeny_count = $2,
                 progeny_runs = $3,
                 progeny_wins = $4,
                 progeny_places = $5,
                 progeny_earnings = $6,
                 best_class = $7,
                 best_class_win_rate = $8,
                 best_distance = $9,
                 best_distance_win_rate = $10,
                 class_1_name = $11, class_1_runs = $12, class_1_wins = $13, class_1_win_pct = $14,
                 class_2_name = $15, class_2_runs = $16, class_2_wins = $17, class_2_win_pct = $18,
                 class_3_name = $19, class_3_runs = $20, class_3_wins = $21, class_3_win_pct = $22,
                 distance_1_name = $23, distance_1_runs = $24, distance_1_wins = $25, distance_1_win_pct = $26,
                 distance_2_name = $27, distance_2_runs = $28, distance_2_wins = $29, distance_2_win_pct = $30,
                 distance_3_name = $31, distance_3_runs = $32, distance_3_wins = $33, distance_3_win_pct = $34,
                 data_quality_score = $35,
                 stats_computed_at = $36
             WHERE id = $1"
        );
        let mut tx = self.pool.begin().await?;
        for s in rows {
            let mut query = sqlx::query(&sql)
                .bind(&s.ancestor_id)
                .bind(s.progeny_count)
                .bind(s.progeny_runs)
                .bind(s.progeny_wins)
                .bind(s.progeny_places)
                .bind(s.progeny_earnings)
                .bind(&s.best_class)
                .bind(s.best_class_win_rate)
                .bind(&s.best_distance)
                .bind(s.best_distance_win_rate);
            for slot in 0..3 {
                let entry = s.class_breakdown.get(slot);
                query = query
                    .bind(entry.map(|e| e.name.clone()))
                    .bind(entry.map(|e| e.runs))
                    .bind(entry.map(|e| e.wins))
                    .bind(entry.and_then(|e| e.win_pct));
            }
            for slot in 0..3 {
                let entry = s.distance_breakdown.get(slot);
                query = query
                    .bind(entry.map(|e| e.name.clone()))
                    .bind(entry.map(|e| e.runs))
                    .bind(entry.map(|e| e.wins))
                    .bind(entry.and_then(|e| e.win_pct));
            }
            query
                .bind(s.data_quality_score)
                .bind(s.computed_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    /// Keyset page of distinct horse ids that have runners.
    pub async fn horse_ids_with_runs_page(
        &self,
        after: Option<&str>,
    ) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT horse_id FROM ra_runners
             WHERE horse_id > $1
             ORDER BY horse_id
             LIMIT $2",
        )
        .bind(after.unwrap_or(""))
        .bind(STATS_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Completed runs for a set of horses, ordered by horse then date.
    pub async fn horse_run_history(&self, ids: &[String]) -> Result<Vec<HorseRunRow>, AppError> {
        let rows = sqlx::query_as::<_, HorseRunRow>(
            "SELECT r.horse_id,
                    ra.race_date,
                    r.position,
                    rr.disqualified
             FROM ra_runners r
             JOIN ra_races ra ON ra.race_id = r.race_id
             LEFT JOIN ra_race_results rr
                    ON rr.race_id = r.race_id AND rr.horse_id = r.horse_id
             WHERE ra.has_result
               AND r.horse_id = ANY($1)
             ORDER BY r.horse_id, ra.race_date",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All runner identities for a set of horses, optionally restricted to
    /// race dates on or after `since` (incremental recomputation).
    pub async fn runner_keys(
        &self,
        ids: &[String],
        since: Option<NaiveDate>,
    ) -> Result<Vec<RunnerKeyRow>, AppError> {
        let rows = sqlx::query_as::<_, RunnerKeyRow>(
            "SELECT r.race_id, r.horse_id, ra.race_date
             FROM ra_runners r
             JOIN ra_races ra ON ra.race_id = r.race_id
             WHERE r.horse_id = ANY($1)
               AND ($2::date IS NULL OR ra.race_date >= $2)
             ORDER BY r.horse_id, ra.race_date",
        )
        .bind(ids)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_runner_stats(&self, rows: &[RunnerStats]) -> BatchOutcome {
        run_batched("runner statistics", rows, |chunk| {
            Box::pin(self.write_runner_stats_chunk(chunk))
        })
        .await
    }

    async fn write_runner_stats_chunk(&self, rows: &[RunnerStats]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for s in rows {
            sqlx::query(
                "INSERT INTO ra_runner_statistics
                     (race_id, horse_id, race_date, career_runs, career_wins,
                      career_places, win_rate, recent_form, days_since_last_run,
                      computed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (race_id, horse_id) DO UPDATE SET
                     race_date = EXCLUDED.race_date,
                     career_runs = EXCLUDED.career_runs,
                     career_wins = EXCLUDED.career_wins,
                     career_places = EXCLUDED.career_places,
                     win_rate = EXCLUDED.win_rate,
                     recent_form = EXCLUDED.recent_form,
                     days_since_last_run = EXCLUDED.days_since_last_run,
                     computed_at = EXCLUDED.computed_at",
            )
            .bind(&s.race_id)
            .bind(&s.horse_id)
            .bind(s.race_date)
            .bind(s.career_runs)
            .bind(s.career_wins)
            .bind(s.career_places)
            .bind(s.win_rate)
            .bind(&s.recent_form)
            .bind(s.days_since_last_run)
            .bind(s.computed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Joint jockey-trainer counters over races with a result, filtered to
    /// combinations with at least `min_runs` joint runs.
    pub async fn combination_aggregates(
        &self,
        min_runs: i64,
    ) -> Result<Vec<ComboAggRow>, AppError> {
        let rows = sqlx::query_as::<_, ComboAggRow>(
            "SELECT r.jockey_id, r.trainer_id,
                    COUNT(*) AS runs,
                    COUNT(*) FILTER (WHERE r.position = 1) AS wins,
                    COUNT(*) FILTER (WHERE r.position <= 3) AS places
             FROM ra_runners r
             JOIN ra_races ra ON ra.race_id = r.race_id
             WHERE ra.has_result
               AND r.jockey_id IS NOT NULL
               AND r.trainer_id IS NOT NULL
             GROUP BY r.jockey_id, r.trainer_id
             HAVING COUNT(*) >= $1",
        )
        .bind(min_runs)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Replace the combinations table wholesale within one transaction.
    pub async fn replace_entity_combinations(
        &self,
        rows: &[EntityCombination],
    ) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ra_entity_combinations")
            .execute(&mut *tx)
            .await?;
        for c in rows {
            sqlx::query(
                "INSERT INTO ra_entity_combinations
                     (jockey_id, trainer_id, runs, wins, places, win_rate, computed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&c.jockey_id)
            .bind(&c.trainer_id)
            .bind(c.runs)
            .bind(c.wins)
            .bind(c.places)
            .bind(c.win_rate)
            .bind(c.computed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    /// Per-(horse, distance band) counters with at least `min_runs` runs.
    pub async fn distance_bucket_aggregates(
        &self,
        min_runs: i64,
    ) -> Result<Vec<BucketAggRow>, AppError> {
        let sql = format!(
            "SELECT r.horse_id,
                    {DISTANCE_BAND_SQL} AS bucket,
                    COUNT(*) AS runs,
                    COUNT(*) FILTER (WHERE r.position = 1) AS wins,
                    COUNT(*) FILTER (WHERE r.position <= 3) AS places
             FROM ra_runners r
             JOIN ra_races ra ON ra.race_id = r.race_id
             WHERE ra.has_result
               AND ra.distance_m IS NOT NULL
             GROUP BY r.horse_id, 2
             HAVING COUNT(*) >= $1"
        );
        let rows = sqlx::query_as::<_, BucketAggRow>(&sql)
            .bind(min_runs)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Per-(horse, course) counters with at least `min_runs` runs.
    pub async fn venue_bucket_aggregates(
        &self,
        min_runs: i64,
    ) -> Result<Vec<BucketAggRow>, AppError> {
        let rows = sqlx::query_as::<_, BucketAggRow>(
            "SELECT r.horse_id,
                    ra.course_id AS bucket,
                    COUNT(*) AS runs,
                    COUNT(*) FILTER (WHERE r.position = 1) AS wins,
                    COUNT(*) FILTER (WHERE r.position <= 3) AS places
             FROM ra_runners r
             JOIN ra_races ra ON ra.race_id = r.race_id
             WHERE ra.has_result
               AND ra.course_id IS NOT NULL
             GROUP BY r.horse_id, ra.course_id
             HAVING COUNT(*) >= $1",
        )
        .bind(min_runs)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Replace one of the specialist performance tables wholesale.
    pub async fn replace_performance_buckets(
        &self,
        table: &str,
        rows: &[PerformanceBucket],
    ) -> Result<usize, AppError> {
        let delete_sql = format!("DELETE FROM {table}");
        let insert_sql = format!(
            "INSERT INTO {table}
                 (horse_id, bucket, runs, wins, places, win_rate, computed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        );
        let mut tx = self.pool.begin().await?;
        sqlx::query(&delete_sql).execute(&mut *tx).await?;
        for b in rows {
            sqlx::query(&insert_sql)
                .bind(&b.horse_id)
                .bind(&b.bucket)
                .bind(b.runs)
                .bind(b.wins)
                .bind(b.places)
                .bind(b.win_rate)
                .bind(b.computed_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_outcome_absorb() {
        let mut total = BatchOutcome::default();
        total.absorb(BatchOutcome {
            rows_written: 100,
            failed_batches: 0,
        });
        total.absorb(BatchOutcome {
            rows_written: 40,
            failed_batches: 1,
        });
        assert_eq!(total.rows_written, 140);
        assert_eq!(total.failed_batches, 1);
    }

    #[test]
    fn test_distance_band_sql_names_every_band() {
        for band in ["5-6f", "7-8f", "9-12f", "13f+"] {
            assert!(
                DISTANCE_BAND_SQL.contains(band),
                "band {band} missing from grouping expression"
            );
        }
    }
}
