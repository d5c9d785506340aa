//! Progeny-performance calculator for sires, dams, and damsires.
//!
//! For each ancestor the calculator aggregates the racing record of its
//! offspring: totals, earnings, the top-3 class and distance-band
//! breakdowns, a "best" class/distance pick, and a data-quality score
//! reflecting sample size. Results are written back onto the ancestor rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::db::models::{
    AncestorGroupRow, AncestorKind, AncestorTotalsRow, GroupBreakdown, PedigreeStats,
};
use crate::db::queries::{Repository, STATS_PAGE_SIZE};
use crate::errors::AppError;
use crate::stats::people::StatsRunSummary;
use crate::stats::win_rate;

/// Minimum runs a class/distance group needs before it can be "best".
const MIN_BEST_GROUP_RUNS: i64 = 3;
/// Breakdown entries kept per dimension.
const BREAKDOWN_KEPT: usize = 3;

pub struct PedigreeCalculator<'a> {
    repo: &'a Repository,
}

impl<'a> PedigreeCalculator<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    pub async fn run(&self, kind: AncestorKind) -> Result<StatsRunSummary, AppError> {
        let mut summary = StatsRunSummary::default();
        let mut after: Option<String> = None;
        let computed_at = Utc::now();

        loop {
            let ids = self.repo.ancestor_ids_page(kind, after.as_deref()).await?;
            if ids.is_empty() {
                break;
            }

            let totals = self.repo.ancestor_totals(kind, &ids).await?;
            let class_groups = self.repo.ancestor_class_groups(kind, &ids).await?;
            let distance_groups = self.repo.ancestor_distance_groups(kind, &ids).await?;

            let rows = build_pedigree_stats(&totals, &class_groups, &distance_groups, computed_at);

            let outcome = self.repo.update_ancestor_stats(kind, &rows).await;
            summary.entities_processed += ids.len();
            summary.rows_written += outcome.rows_written;
            summary.failed_batches += outcome.failed_batches;

            if (ids.len() as i64) < STATS_PAGE_SIZE {
                break;
            }
            after = ids.last().cloned();
        }

        tracing::info!(
            "StatisticsCalculators: {} progeny stats done, {} entities, {} failed batches",
            kind.table(),
            summary.entities_processed,
            summary.failed_batches,
        );
        Ok(summary)
    }
}

/// Combine the three aggregate views into one stats row per ancestor.
pub fn build_pedigree_stats(
    totals: &[AncestorTotalsRow],
    class_groups: &[AncestorGroupRow],
    distance_groups: &[AncestorGroupRow],
    computed_at: DateTime<Utc>,
) -> Vec<PedigreeStats> {
    let mut classes: HashMap<&str, Vec<&AncestorGroupRow>> = HashMap::new();
    for g in class_groups {
        classes.entry(&g.ancestor_id).or_default().push(g);
    }
    let mut distances: HashMap<&str, Vec<&AncestorGroupRow>> = HashMap::new();
    for g in distance_groups {
        distances.entry(&g.ancestor_id).or_default().push(g);
    }

    totals
        .iter()
        .map(|t| {
            let class_breakdown = select_breakdown(
                classes
                    .get(t.ancestor_id.as_str())
                    .map_or(&[][..], |v| v.as_slice()),
            );
            let distance_breakdown = select_breakdown(
                distances
                    .get(t.ancestor_id.as_str())
                    .map_or(&[][..], |v| v.as_slice()),
            );
            let best_class = best_group(&class_breakdown);
            let best_distance = best_group(&distance_breakdown);

            PedigreeStats {
                ancestor_id: t.ancestor_id.clone(),
                progeny_count: t.progeny_count,
                progeny_runs: t.runs,
                progeny_wins: t.wins,
                progeny_places: t.places,
                progeny_earnings: t.earnings.unwrap_or(Decimal::ZERO),
                best_class: best_class.map(|b| b.name.clone()),
                best_class_win_rate: best_class.and_then(|b| b.win_pct),
                best_distance: best_distance.map(|b| b.name.clone()),
                best_distance_win_rate: best_distance.and_then(|b| b.win_pct),
                class_breakdown,
                distance_breakdown,
                data_quality_score: data_quality_score(t.runs),
                computed_at,
            }
        })
        .collect()
}

/// Keep the top three groups by sample size (runs desc, then name for a
/// stable order).
fn select_breakdown(groups: &[&AncestorGroupRow]) -> Vec<GroupBreakdown> {
    let mut entries: Vec<GroupBreakdown> = groups
        .iter()
        .map(|g| GroupBreakdown {
            name: g.group_name.clone(),
            runs: g.runs,
            wins: g.wins,
            win_pct: win_rate(g.wins, g.runs),
        })
        .collect();
    entries.sort_by(|a, b| b.runs.cmp(&a.runs).then_with(|| a.name.cmp(&b.name)));
    entries.truncate(BREAKDOWN_KEPT);
    entries
}

/// Best group by win rate among the kept breakdown entries with at least
/// [`MIN_BEST_GROUP_RUNS`] runs. Ties break on higher absolute win count,
/// then alphabetically on the group name.
fn best_group(breakdown: &[GroupBreakdown]) -> Option<&GroupBreakdown> {
    breakdown
        .iter()
        .filter(|b| b.runs >= MIN_BEST_GROUP_RUNS)
        .max_by(|a, b| {
            a.win_pct
                .cmp(&b.win_pct)
                .then_with(|| a.wins.cmp(&b.wins))
                .then_with(|| b.name.cmp(&a.name))
        })
}

/// Sample-size confidence in [0, 1]: `min(1, log10(1 + total_runs) / 3)`.
pub fn data_quality_score(total_runs: i64) -> f64 {
    let score = ((1 + total_runs.max(0)) as f64).log10() / 3.0;
    score.min(1.0)
}
