use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::courts::{Court, CourtDirectory};
use crate::error::JamError;
use crate::ledger::{CheckInLedger, CheckInRecord};
use crate::ratelimit::{ActionLimits, LimiterEntry};

const SNAPSHOT_VERSION: u32 = 1;

/// Everything worth surviving a restart: courts with their counters, the
/// rater sets, active check-ins and in-flight limiter windows. Chat history
/// is deliberately absent; it is ephemeral by contract.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub courts: Vec<Court>,
    pub raters: BTreeMap<String, Vec<String>>,
    pub checkins: Vec<CheckInRecord>,
    pub rate_limits: BTreeMap<String, HashMap<String, LimiterEntry>>,
}

impl Snapshot {
    pub fn capture(
        courts: &CourtDirectory,
        ledger: &CheckInLedger,
        limits: &ActionLimits,
    ) -> Self {
        let (courts_list, raters) = courts.export();
        Self {
            version: SNAPSHOT_VERSION,
            courts: courts_list,
            raters,
            checkins: ledger.export(),
            rate_limits: limits.export(),
        }
    }

    /// Pushes the snapshot into the live managers. Occupancy is re-derived
    /// from the restored ledger, never trusted from the file.
    pub fn apply(self, courts: &CourtDirectory, ledger: &CheckInLedger, limits: &ActionLimits) {
        courts.restore(self.courts, self.raters);
        ledger.restore(courts, self.checkins);
        limits.restore(self.rate_limits);
    }
}

/// JSON-on-disk persistence with an explicit reset-to-default policy: a
/// missing, unreadable or schema-incompatible file never stops startup, it
/// just means starting from the seed.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
        }
    }

    pub fn load(&self) -> Option<Snapshot> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot on disk, starting fresh");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot unreadable, starting fresh");
                return None;
            }
        };

        let snapshot: Snapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot corrupt, starting fresh");
                return None;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "Snapshot version mismatch, starting fresh"
            );
            return None;
        }

        Some(snapshot)
    }

    /// Writes via a temp file and rename so a crash mid-write cannot leave a
    /// torn snapshot behind.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), JamError> {
        let raw = serde_json::to_vec(snapshot)
            .map_err(|e| JamError::Storage(format!("encode snapshot: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &raw)
            .map_err(|e| JamError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| JamError::Storage(format!("rename {}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::ratelimit::ActionLimits;
    use uuid::Uuid;

    struct TempStore {
        store: SnapshotStore,
        path: PathBuf,
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn temp_store() -> TempStore {
        let path = std::env::temp_dir().join(format!("jam_snapshot_{}.json", Uuid::new_v4()));
        let store = SnapshotStore::new(&StorageConfig {
            path: path.to_string_lossy().into_owned(),
            flush_interval_secs: 30,
        });
        TempStore { store, path }
    }

    fn managers() -> (CourtDirectory, CheckInLedger, ActionLimits) {
        (
            CourtDirectory::from_seed().unwrap(),
            CheckInLedger::new(),
            ActionLimits::new(&LimitsConfig::default()),
        )
    }

    #[test]
    fn missing_file_means_fresh_start() {
        let tmp = temp_store();
        assert!(tmp.store.load().is_none());
    }

    #[test]
    fn corrupt_file_means_fresh_start() {
        let tmp = temp_store();
        fs::write(&tmp.path, b"{ not json ]").unwrap();
        assert!(tmp.store.load().is_none());
    }

    #[test]
    fn version_mismatch_means_fresh_start() {
        let tmp = temp_store();
        fs::write(
            &tmp.path,
            br#"{"version":99,"courts":[],"raters":{},"checkins":[],"rate_limits":{}}"#,
        )
        .unwrap();
        assert!(tmp.store.load().is_none());
    }

    #[test]
    fn save_into_missing_directory_is_a_storage_error() {
        let store = SnapshotStore::new(&StorageConfig {
            path: "/definitely/not/a/dir/state.json".to_string(),
            flush_interval_secs: 30,
        });
        let (courts, ledger, limits) = managers();
        let snapshot = Snapshot::capture(&courts, &ledger, &limits);
        assert!(matches!(store.save(&snapshot), Err(JamError::Storage(_))));
    }

    #[test]
    fn state_survives_a_round_trip() {
        let tmp = temp_store();
        let (courts, ledger, limits) = managers();

        ledger
            .check_in(&courts, &limits.checkin, "1", "alice", "Alice")
            .unwrap();
        ledger
            .check_in(&courts, &limits.checkin, "1", "bob", "Bob")
            .unwrap();
        courts.rate("2", "alice", 5).unwrap();

        tmp.store
            .save(&Snapshot::capture(&courts, &ledger, &limits))
            .unwrap();

        let (courts2, ledger2, limits2) = managers();
        tmp.store
            .load()
            .unwrap()
            .apply(&courts2, &ledger2, &limits2);

        let court = courts2.get("1").unwrap();
        assert_eq!(court.current_players, 2);
        assert_eq!(court.total_checkins, 2);
        assert!(ledger2.has_active_check_in("1", "alice"));
        // rater set came back with the courts
        assert!(matches!(
            courts2.rate("2", "alice", 3),
            Err(JamError::Duplicate(_))
        ));
        // limiter windows carried over: alice already spent attempts
        assert!(
            limits2.checkin.remaining_attempts("alice")
                < ActionLimits::new(&LimitsConfig::default())
                    .checkin
                    .remaining_attempts("alice")
        );
    }

    #[test]
    fn occupancy_is_rederived_not_trusted() {
        let tmp = temp_store();
        let (courts, ledger, limits) = managers();
        ledger
            .check_in(&courts, &limits.checkin, "1", "alice", "Alice")
            .unwrap();

        let mut snapshot = Snapshot::capture(&courts, &ledger, &limits);
        // tamper with the persisted counter; the ledger is the truth
        for court in &mut snapshot.courts {
            court.current_players = 40;
        }
        tmp.store.save(&snapshot).unwrap();

        let (courts2, ledger2, limits2) = managers();
        tmp.store
            .load()
            .unwrap()
            .apply(&courts2, &ledger2, &limits2);

        assert_eq!(courts2.get("1").unwrap().current_players, 1);
        assert_eq!(courts2.get("2").unwrap().current_players, 0);
    }
}
