//! Synthetic job-log generation for seeding and demos.

use chrono::{Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::{JobLog, Progress, RunStatus};

const SOURCES: &[&str] = &["StepStone", "Adzuna", "Jobsora", "WhatJobs", "Jooble"];
const COUNTRIES: &[(&str, &str)] = &[
    ("US", "USD"),
    ("UK", "GBP"),
    ("DE", "EUR"),
    ("FR", "EUR"),
    ("AU", "AUD"),
];

/// Deterministic sample record, cycling through the value space by index.
pub fn sample_log(i: usize) -> JobLog {
    let (country, currency) = COUNTRIES[i % COUNTRIES.len()];
    let in_feed = 10_000 + (i as i64 % 7) * 1_500;
    let failed = (i as i64 % 13) * 40;
    let sent = in_feed - failed;

    JobLog {
        id: Uuid::new_v4(),
        country_code: country.into(),
        currency_code: currency.into(),
        progress: Progress {
            switch_index: i % 2 == 0,
            total_records_in_feed: in_feed + 200,
            total_jobs_in_feed: in_feed,
            total_jobs_fail_indexed: failed,
            total_jobs_sent_to_enrich: in_feed - (i as i64 % 5) * 25,
            total_jobs_dont_have_metadata: (i as i64 % 11) * 12,
            total_jobs_dont_have_metadata_v2: (i as i64 % 9) * 8,
            total_jobs_sent_to_index: sent,
        },
        status: match i % 10 {
            0 => RunStatus::Failed,
            1 => RunStatus::InProgress,
            _ => RunStatus::Completed,
        },
        timestamp: Utc::now() - Duration::hours(i as i64 * 6),
        transaction_source_name: SOURCES[i % SOURCES.len()].into(),
        no_coordinates_count: (i as i64 % 17) * 3,
        record_count: in_feed + 200,
        unique_ref_number_count: in_feed - (i as i64 % 3) * 10,
    }
}

/// Randomized batch spread over the last 30 days.
pub fn sample_batch(count: usize) -> Vec<JobLog> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let mut log = sample_log(i);
            log.timestamp = Utc::now() - Duration::minutes(rng.gen_range(0..43_200));
            log.progress.total_jobs_in_feed += rng.gen_range(0..500);
            log.progress.total_jobs_sent_to_index =
                log.progress.total_jobs_in_feed - log.progress.total_jobs_fail_indexed;
            log
        })
        .collect()
}
