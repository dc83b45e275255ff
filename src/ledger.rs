use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::courts::CourtDirectory;
use crate::error::JamError;
use crate::ratelimit::RateLimiter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub court_id: String,
    pub subject_id: String,
    pub display_name: String,
    pub timestamp_ms: i64,
}

/// Active check-ins keyed by court. For any `(court_id, subject_id)` pair at
/// most one record exists; the guard runs under the per-court entry lock so
/// concurrent check-ins cannot slip past it.
///
/// Lock order is always records, then limiter, then the court directory.
pub struct CheckInLedger {
    records: DashMap<String, Vec<CheckInRecord>>,
}

impl CheckInLedger {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Admits a check-in. Rejection order: validation, unknown court,
    /// duplicate state, rate limit. A duplicate attempt is decided before the
    /// limiter is consulted and does not spend an attempt.
    pub fn check_in(
        &self,
        courts: &CourtDirectory,
        limiter: &RateLimiter,
        court_id: &str,
        subject_id: &str,
        display_name: &str,
    ) -> Result<CheckInRecord, JamError> {
        validate_pair(court_id, subject_id)?;
        if display_name.trim().is_empty() {
            return Err(JamError::Validation(
                "display name must not be empty".to_string(),
            ));
        }
        if !courts.contains(court_id) {
            return Err(JamError::UnknownCourt(court_id.to_string()));
        }

        let mut entry = self.records.entry(court_id.to_string()).or_default();
        if entry.iter().any(|r| r.subject_id == subject_id) {
            return Err(JamError::Duplicate(format!(
                "{} is already checked in at court {}",
                subject_id, court_id
            )));
        }
        limiter.check(subject_id)?;
        courts.record_check_in(court_id)?;

        let record = CheckInRecord {
            court_id: court_id.to_string(),
            subject_id: subject_id.to_string(),
            display_name: display_name.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        entry.push(record.clone());
        Ok(record)
    }

    /// Removes the pair's record and drops the court's occupancy. Returns the
    /// new occupancy. Checking out while absent is a duplicate-state error,
    /// never a panic.
    pub fn check_out(
        &self,
        courts: &CourtDirectory,
        court_id: &str,
        subject_id: &str,
    ) -> Result<u32, JamError> {
        validate_pair(court_id, subject_id)?;

        let Some(mut entry) = self.records.get_mut(court_id) else {
            return Err(no_active(court_id, subject_id));
        };
        let before = entry.len();
        entry.retain(|r| r.subject_id != subject_id);
        if entry.len() == before {
            return Err(no_active(court_id, subject_id));
        }
        courts.record_check_out(court_id)
    }

    pub fn has_active_check_in(&self, court_id: &str, subject_id: &str) -> bool {
        self.records
            .get(court_id)
            .map(|v| v.iter().any(|r| r.subject_id == subject_id))
            .unwrap_or(false)
    }

    pub fn active_count(&self, court_id: &str) -> usize {
        self.records.get(court_id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.records.iter().map(|kv| kv.value().len()).sum()
    }

    /// End-of-day sweep. Each court's records are cleared and its occupancy
    /// zeroed under that court's entry lock, so a check-in landing mid-sweep
    /// cannot end up with a live record and a zeroed counter. Lifetime
    /// check-in totals keep counting.
    pub fn reset_daily(&self, courts: &CourtDirectory) {
        for court_id in courts.ids() {
            let mut entry = self.records.entry(court_id.clone()).or_default();
            entry.clear();
            courts.zero_player_count(&court_id);
        }
        self.records.retain(|_, log| !log.is_empty());
    }

    /// Administrative wipe: clears records and zeroes both occupancy and
    /// lifetime totals.
    pub fn reset_all(&self, courts: &CourtDirectory) {
        self.records.clear();
        courts.reset_counters_all();
    }

    pub fn export(&self) -> Vec<CheckInRecord> {
        let mut out: Vec<CheckInRecord> = self
            .records
            .iter()
            .flat_map(|kv| kv.value().clone())
            .collect();
        out.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.court_id.cmp(&b.court_id))
        });
        out
    }

    /// Replaces all records with the supplied set and re-derives every
    /// court's occupancy from it. Records violating the one-per-pair
    /// invariant or naming a court the directory does not know are dropped
    /// rather than trusted.
    pub fn restore(&self, courts: &CourtDirectory, records: Vec<CheckInRecord>) {
        self.records.clear();
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for record in records {
            if !courts.contains(&record.court_id) {
                continue;
            }
            let mut entry = self.records.entry(record.court_id.clone()).or_default();
            if entry.iter().any(|r| r.subject_id == record.subject_id) {
                continue;
            }
            *counts.entry(record.court_id.clone()).or_insert(0) += 1;
            entry.push(record);
        }
        courts.apply_player_counts(&counts);
    }
}

impl Default for CheckInLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_pair(court_id: &str, subject_id: &str) -> Result<(), JamError> {
    if court_id.trim().is_empty() {
        return Err(JamError::Validation("court id must not be empty".to_string()));
    }
    if subject_id.trim().is_empty() {
        return Err(JamError::Validation("subject id must not be empty".to_string()));
    }
    Ok(())
}

fn no_active(court_id: &str, subject_id: &str) -> JamError {
    JamError::Duplicate(format!(
        "{} has no active check-in at court {}",
        subject_id, court_id
    ))
}
