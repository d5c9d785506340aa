//! Bulk fetchers for reference data: courses, bookmakers, regions, and the
//! three people tables. Each walks the endpoint (all pages where
//! paginated), writes through the repository, and returns a count summary.

use serde::Serialize;
use std::collections::HashMap;

use crate::db::models::{Bookmaker, Course, PeopleKind, Person, Region};
use crate::db::queries::Repository;
use crate::errors::AppError;
use crate::services::racing_api::RacingApi;

/// Count summary for one master-table pull.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MasterSummary {
    pub table: &'static str,
    pub fetched: usize,
    pub written: usize,
    pub failed_batches: usize,
}

/// Fetch all courses and derive the regions table from them.
pub async fn fetch_courses(
    api: &dyn RacingApi,
    repo: &Repository,
    regions: &[String],
) -> Result<Vec<MasterSummary>, AppError> {
    let docs = api.get_courses(regions).await?;

    let courses: Vec<Course> = docs
        .iter()
        .map(|d| Course {
            id: d.id.clone(),
            name: d.course.clone(),
            region_code: d.region_code.as_ref().map(|r| r.to_lowercase()),
            region: d.region.clone(),
            latitude: d.latitude,
            longitude: d.longitude,
        })
        .collect();

    // Regions are not served by a dedicated endpoint; the course list is
    // the authoritative source of (code, name) pairs.
    let mut region_map: HashMap<String, Region> = HashMap::new();
    for doc in &docs {
        if let (Some(code), Some(name)) = (&doc.region_code, &doc.region) {
            region_map
                .entry(code.to_lowercase())
                .or_insert_with(|| Region {
                    code: code.to_lowercase(),
                    name: name.clone(),
                });
        }
    }
    let region_rows: Vec<Region> = region_map.into_values().collect();

    let course_outcome = repo.upsert_courses(&courses).await;
    let region_outcome = repo.upsert_regions(&region_rows).await;

    tracing::info!(
        "MasterFetchers: {} courses, {} regions",
        course_outcome.rows_written,
        region_outcome.rows_written,
    );
    Ok(vec![
        MasterSummary {
            table: "courses",
            fetched: courses.len(),
            written: course_outcome.rows_written,
            failed_batches: course_outcome.failed_batches,
        },
        MasterSummary {
            table: "regions",
            fetched: region_rows.len(),
            written: region_outcome.rows_written,
            failed_batches: region_outcome.failed_batches,
        },
    ])
}

pub async fn fetch_bookmakers(
    api: &dyn RacingApi,
    repo: &Repository,
) -> Result<MasterSummary, AppError> {
    let docs = api.get_bookmakers().await?;
    let rows: Vec<Bookmaker> = docs
        .iter()
        .map(|d| Bookmaker {
            id: d.id.clone(),
            name: d.name.clone(),
            code: d.code.clone(),
            kind: d.kind.clone(),
            is_active: d.is_active,
        })
        .collect();

    let outcome = repo.upsert_bookmakers(&rows).await;
    tracing::info!("MasterFetchers: {} bookmakers", outcome.rows_written);
    Ok(MasterSummary {
        table: "bookmakers",
        fetched: rows.len(),
        written: outcome.rows_written,
        failed_batches: outcome.failed_batches,
    })
}

/// Fetch one people table in full (the client walks all pages).
pub async fn fetch_people(
    api: &dyn RacingApi,
    repo: &Repository,
    kind: PeopleKind,
    regions: &[String],
) -> Result<MasterSummary, AppError> {
    let docs = match kind {
        PeopleKind::Jockey => api.get_jockeys(regions).await?,
        PeopleKind::Trainer => api.get_trainers(regions).await?,
        PeopleKind::Owner => api.get_owners(regions).await?,
    };
    let rows: Vec<Person> = docs
        .iter()
        .map(|d| Person {
            id: d.id.clone(),
            name: d.name.clone(),
            location: d.location.clone(),
        })
        .collect();

    let outcome = repo.upsert_people(kind, &rows).await;
    tracing::info!(
        "MasterFetchers: {} rows into {}",
        outcome.rows_written,
        kind.table(),
    );
    Ok(MasterSummary {
        table: kind.table(),
        fetched: rows.len(),
        written: outcome.rows_written,
        failed_batches: outcome.failed_batches,
    })
}
