use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A racecourse (`ra_mst_courses`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Course {
    pub id: String,
    pub name: String,
    pub region_code: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A bookmaker (`ra_mst_bookmakers`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bookmaker {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub kind: Option<String>,
    pub is_active: Option<bool>,
}

/// A region (`ra_mst_regions`), keyed by two-letter code.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Region {
    pub code: String,
    pub name: String,
}

/// Which people table a [`Person`] row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeopleKind {
    Jockey,
    Trainer,
    Owner,
}

impl PeopleKind {
    pub fn table(self) -> &'static str {
        match self {
            PeopleKind::Jockey => "ra_mst_jockeys",
            PeopleKind::Trainer => "ra_mst_trainers",
            PeopleKind::Owner => "ra_mst_owners",
        }
    }

    /// Runner column holding this entity's foreign key.
    pub fn runner_fk(self) -> &'static str {
        match self {
            PeopleKind::Jockey => "jockey_id",
            PeopleKind::Trainer => "trainer_id",
            PeopleKind::Owner => "owner_id",
        }
    }

    /// Statistics table for this entity kind.
    pub fn stats_table(self) -> &'static str {
        match self {
            PeopleKind::Jockey => "ra_jockey_statistics",
            PeopleKind::Trainer => "ra_trainer_statistics",
            PeopleKind::Owner => "ra_owner_statistics",
        }
    }
}

/// A jockey, trainer or owner. Only trainers carry `location`, and only
/// when the racecard endpoint exposed it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
}

/// A horse (`ra_mst_horses`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct Horse {
    pub id: String,
    pub name: String,
    pub sex: Option<String>,
    pub sex_code: Option<String>,
    pub dob: Option<NaiveDate>,
    pub colour: Option<String>,
    pub region: Option<String>,
    pub sire_id: Option<String>,
    pub dam_id: Option<String>,
    pub damsire_id: Option<String>,
}

/// Denormalised pedigree row (`ra_mst_horse_pedigree`), at most one per horse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct HorsePedigree {
    pub horse_id: String,
    pub sire_id: Option<String>,
    pub sire_name: Option<String>,
    pub dam_id: Option<String>,
    pub dam_name: Option<String>,
    pub damsire_id: Option<String>,
    pub damsire_name: Option<String>,
    pub breeder: Option<String>,
    pub region: Option<String>,
}

/// Which ancestor table an [`Ancestor`] row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncestorKind {
    Sire,
    Dam,
    Damsire,
}

impl AncestorKind {
    pub fn table(self) -> &'static str {
        match self {
            AncestorKind::Sire => "ra_mst_sires",
            AncestorKind::Dam => "ra_mst_dams",
            AncestorKind::Damsire => "ra_mst_damsires",
        }
    }

    /// Horse column holding this ancestor's foreign key.
    pub fn horse_fk(self) -> &'static str {
        match self {
            AncestorKind::Sire => "sire_id",
            AncestorKind::Dam => "dam_id",
            AncestorKind::Damsire => "damsire_id",
        }
    }
}

/// A sire, dam or damsire row (name-only until statistics are computed).
/// `horse_id` back-references the ancestor's own racing record when it
/// raced in covered regions; foreign stallions stay unresolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct Ancestor {
    pub id: String,
    pub name: Option<String>,
    pub region: Option<String>,
    pub horse_id: Option<String>,
}

/// A race (`ra_races`). Pre-race fields come from the racecard endpoint;
/// post-race fields are only non-null once `has_result` is true.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct Race {
    pub race_id: String,
    pub race_date: NaiveDate,
    pub off_time: Option<DateTime<Utc>>,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub region: Option<String>,
    pub race_name: Option<String>,
    pub race_class: Option<String>,
    pub pattern: Option<String>,
    pub race_type: Option<String>,
    /// Distance exactly as the API rendered it ("1m2f").
    pub distance: Option<String>,
    pub distance_furlongs: Option<Decimal>,
    pub distance_m: Option<i32>,
    pub going: Option<String>,
    pub prize_money: Option<Decimal>,
    pub currency: Option<String>,
    pub age_band: Option<String>,
    pub rating_band: Option<String>,
    pub field_size: Option<i32>,
    pub has_result: bool,
    // Post-race
    pub winning_time: Option<String>,
    pub tote_win: Option<String>,
    pub tote_place: Option<String>,
    pub comments: Option<String>,
}

/// A runner (`ra_runners`), keyed by (race_id, horse_id). People and
/// pedigree names are denormalised copies populated at write time from the
/// same batch; the canonical rows live in their own tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct Runner {
    pub race_id: String,
    pub horse_id: String,
    pub horse_name: Option<String>,
    pub cloth_number: Option<i32>,
    pub draw: Option<i32>,
    pub age: Option<i32>,
    pub weight_lbs: Option<i32>,
    pub headgear: Option<String>,
    pub official_rating: Option<i32>,
    pub form: Option<String>,
    pub jockey_id: Option<String>,
    pub jockey_name: Option<String>,
    pub jockey_claim_lbs: Option<i32>,
    pub trainer_id: Option<String>,
    pub trainer_name: Option<String>,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub sire_id: Option<String>,
    pub sire_name: Option<String>,
    pub dam_id: Option<String>,
    pub dam_name: Option<String>,
    pub damsire_id: Option<String>,
    pub damsire_name: Option<String>,
    pub silk_url: Option<String>,
    // Post-race
    pub position: Option<i32>,
    pub distance_beaten: Option<Decimal>,
    pub prize_won: Option<Decimal>,
    pub starting_price: Option<String>,
    pub starting_price_decimal: Option<Decimal>,
    pub finish_time: Option<String>,
    pub comment: Option<String>,
}

/// Canonical per-runner result record (`ra_race_results`), keyed by
/// (race_id, horse_id). Keeps the raw position string alongside the
/// canonical integer so re-derivation is always possible.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct RaceResult {
    pub race_id: String,
    pub horse_id: String,
    pub position_raw: Option<String>,
    pub position: Option<i32>,
    pub disqualified: bool,
    pub distance_beaten: Option<Decimal>,
    pub starting_price: Option<String>,
    pub starting_price_decimal: Option<Decimal>,
    pub prize_won: Option<Decimal>,
    pub finish_time: Option<String>,
    pub comment: Option<String>,
}

/// Post-race columns applied to an existing race row by the results fetcher.
#[derive(Debug, Clone, Default)]
pub struct RacePostFields {
    pub race_id: String,
    pub winning_time: Option<String>,
    pub tote_win: Option<String>,
    pub tote_place: Option<String>,
    pub comments: Option<String>,
}

/// Column-level partial runner update from a results document. Pre-race
/// fields that may be absent from the results response (draw, names) are
/// preserved rather than overwritten.
#[derive(Debug, Clone, Default)]
pub struct RunnerResultPatch {
    pub race_id: String,
    pub horse_id: String,
    pub horse_name: Option<String>,
    pub draw: Option<i32>,
    pub position: Option<i32>,
    pub distance_beaten: Option<Decimal>,
    pub prize_won: Option<Decimal>,
    pub starting_price: Option<String>,
    pub starting_price_decimal: Option<Decimal>,
    pub finish_time: Option<String>,
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Derived statistics rows
// ---------------------------------------------------------------------------

/// Per-person statistics row (jockey/trainer/owner statistics tables).
#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct PeopleStats {
    pub entity_id: String,
    pub total_rides: i64,
    pub wins: i64,
    pub places: i64,
    pub seconds: i64,
    pub thirds: i64,
    /// `round(wins * 100 / total, 2)`; NULL when total is zero.
    pub win_rate: Option<Decimal>,
    pub rides_14d: i64,
    pub wins_14d: i64,
    pub win_rate_14d: Option<Decimal>,
    pub rides_30d: i64,
    pub wins_30d: i64,
    pub win_rate_30d: Option<Decimal>,
    pub last_ride_date: Option<NaiveDate>,
    pub last_win_date: Option<NaiveDate>,
    pub days_since_last_ride: Option<i32>,
    pub days_since_last_win: Option<i32>,
    pub computed_at: DateTime<Utc>,
}

/// One class/distance breakdown entry kept on a pedigree statistics row.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GroupBreakdown {
    pub name: String,
    pub runs: i64,
    pub wins: i64,
    pub win_pct: Option<Decimal>,
}

/// Derived progeny-performance block written onto sire/dam/damsire rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PedigreeStats {
    pub ancestor_id: String,
    pub progeny_count: i64,
    pub progeny_runs: i64,
    pub progeny_wins: i64,
    pub progeny_places: i64,
    pub progeny_earnings: Decimal,
    pub best_class: Option<String>,
    pub best_class_win_rate: Option<Decimal>,
    pub best_distance: Option<String>,
    pub best_distance_win_rate: Option<Decimal>,
    /// Top-3 class breakdown, largest sample first.
    pub class_breakdown: Vec<GroupBreakdown>,
    /// Top-3 distance-band breakdown, largest sample first.
    pub distance_breakdown: Vec<GroupBreakdown>,
    /// `min(1, log10(1 + total_runs) / 3)`.
    pub data_quality_score: f64,
    pub computed_at: DateTime<Utc>,
}

/// Per-runner derived features (`ra_runner_statistics`), computed from the
/// horse's runs strictly before this runner's race date.
#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct RunnerStats {
    pub race_id: String,
    pub horse_id: String,
    pub race_date: NaiveDate,
    pub career_runs: i64,
    pub career_wins: i64,
    pub career_places: i64,
    pub win_rate: Option<Decimal>,
    /// Racing-form string over the most recent runs, newest first ("320P1").
    pub recent_form: Option<String>,
    pub days_since_last_run: Option<i32>,
    pub computed_at: DateTime<Utc>,
}

/// Jockey-trainer combination counters (`ra_entity_combinations`).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EntityCombination {
    pub jockey_id: String,
    pub trainer_id: String,
    pub runs: i64,
    pub wins: i64,
    pub places: i64,
    pub win_rate: Option<Decimal>,
    pub computed_at: DateTime<Utc>,
}

/// Specialist performance row keyed by (horse_id, distance band) or
/// (horse_id, course_id).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PerformanceBucket {
    pub horse_id: String,
    pub bucket: String,
    pub runs: i64,
    pub wins: i64,
    pub places: i64,
    pub win_rate: Option<Decimal>,
    pub computed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Aggregation read rows (inputs to the statistics calculators)
// ---------------------------------------------------------------------------

/// Career/window aggregate for one person, straight from SQL.
#[derive(Debug, Clone, FromRow)]
pub struct PeopleAggRow {
    pub entity_id: String,
    pub total_rides: i64,
    pub wins: i64,
    pub places: i64,
    pub seconds: i64,
    pub thirds: i64,
    pub rides_14d: i64,
    pub wins_14d: i64,
    pub rides_30d: i64,
    pub wins_30d: i64,
    pub last_ride_date: Option<NaiveDate>,
    pub last_win_date: Option<NaiveDate>,
}

/// Progeny totals for one ancestor.
#[derive(Debug, Clone, FromRow)]
pub struct AncestorTotalsRow {
    pub ancestor_id: String,
    pub progeny_count: i64,
    pub runs: i64,
    pub wins: i64,
    pub places: i64,
    pub earnings: Option<Decimal>,
}

/// Per-(ancestor, group) counters where group is a race class or a
/// distance band.
#[derive(Debug, Clone, FromRow)]
pub struct AncestorGroupRow {
    pub ancestor_id: String,
    pub group_name: String,
    pub runs: i64,
    pub wins: i64,
}

/// One historical run of a horse, used to derive runner statistics.
#[derive(Debug, Clone, FromRow)]
pub struct HorseRunRow {
    pub horse_id: String,
    pub race_date: NaiveDate,
    pub position: Option<i32>,
    pub disqualified: Option<bool>,
}

/// A runner identity plus race date, the unit of work for the runner
/// statistics calculator.
#[derive(Debug, Clone, FromRow)]
pub struct RunnerKeyRow {
    pub race_id: String,
    pub horse_id: String,
    pub race_date: NaiveDate,
}

/// Joint jockey-trainer aggregate from SQL.
#[derive(Debug, Clone, FromRow)]
pub struct ComboAggRow {
    pub jockey_id: String,
    pub trainer_id: String,
    pub runs: i64,
    pub wins: i64,
    pub places: i64,
}

/// Per-(horse, bucket) aggregate from SQL for distance/venue specialists.
#[derive(Debug, Clone, FromRow)]
pub struct BucketAggRow {
    pub horse_id: String,
    pub bucket: String,
    pub runs: i64,
    pub wins: i64,
    pub places: i64,
}
