//! Declared run schedule for the `scheduled` mode.
//!
//! The schedule is a table of constants evaluated against local time. The
//! scheduled mode is expected to be invoked hourly (cron); a job is due
//! when the invocation falls inside its scheduled hour, so the 02:30
//! statistics slot runs during the 02:00 invocation.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};

/// Jobs the scheduler can decide to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledJob {
    /// RaceFetcher + ResultsFetcher over the last-3-days window.
    TransactionalSync,
    /// Horse refresh via today's racecards (part of RaceFetcher).
    HorseRefresh,
    /// The statistics calculators.
    Statistics,
    /// Jockeys/trainers/owners master fetchers.
    PeopleMasters,
    /// Courses/bookmakers/regions master fetchers.
    ReferenceMasters,
}

/// One row of the operator-visible schedule table.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleEntry {
    pub job: ScheduledJob,
    pub cadence: &'static str,
    pub targets: &'static str,
}

/// Hours (local) at which the transactional sync runs.
const TRANSACTIONAL_HOURS: &[u32] = &[6, 10, 14, 18, 22];
/// Hour (local) of the daily horse refresh and the weekly/monthly masters.
const MASTERS_HOUR: u32 = 13;
/// Hour (local) of the daily statistics recomputation (02:30 slot).
const STATISTICS_HOUR: u32 = 2;

/// The declared schedule, in evaluation order.
pub const SCHEDULE: &[ScheduleEntry] = &[
    ScheduleEntry {
        job: ScheduledJob::TransactionalSync,
        cadence: "every 4h (06,10,14,18,22)",
        targets: "races + results, last-3-days window",
    },
    ScheduleEntry {
        job: ScheduledJob::HorseRefresh,
        cadence: "daily 13:00",
        targets: "horses via racecards",
    },
    ScheduleEntry {
        job: ScheduledJob::Statistics,
        cadence: "daily 02:30",
        targets: "statistics calculators",
    },
    ScheduleEntry {
        job: ScheduledJob::PeopleMasters,
        cadence: "weekly Sunday 13:00",
        targets: "jockeys, trainers, owners",
    },
    ScheduleEntry {
        job: ScheduledJob::ReferenceMasters,
        cadence: "monthly 1st 13:00",
        targets: "courses, bookmakers, regions",
    },
];

/// Decide which jobs are due at the given local time.
pub fn due_jobs(now: NaiveDateTime) -> Vec<ScheduledJob> {
    let mut due = Vec::new();
    let hour = now.hour();

    if TRANSACTIONAL_HOURS.contains(&hour) {
        due.push(ScheduledJob::TransactionalSync);
    }
    if hour == MASTERS_HOUR {
        due.push(ScheduledJob::HorseRefresh);
    }
    if hour == STATISTICS_HOUR {
        due.push(ScheduledJob::Statistics);
    }
    if now.weekday() == Weekday::Sun && hour == MASTERS_HOUR {
        due.push(ScheduledJob::PeopleMasters);
    }
    if now.day() == 1 && hour == MASTERS_HOUR {
        due.push(ScheduledJob::ReferenceMasters);
    }

    due
}
