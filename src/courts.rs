use std::collections::{BTreeMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::JamError;

const SEED: &str = include_str!("courts.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amenities {
    pub shade: bool,
    pub lighting: bool,
    pub fountain: bool,
    pub restrooms: bool,
}

/// A court as served to clients. `current_players` is derived from the
/// check-in ledger; `total_checkins` only ever grows outside of an
/// administrative reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Court {
    pub id: String,
    pub name: String,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub amenities: Amenities,
    pub open_hours: String,
    pub basket_count: u32,
    #[serde(default)]
    pub current_players: u32,
    #[serde(default)]
    pub total_checkins: u64,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub rating_count: u32,
}

#[derive(Debug, Clone)]
struct CourtState {
    court: Court,
    raters: HashSet<String>,
}

impl CourtState {
    fn new(court: Court) -> Self {
        Self {
            court,
            raters: HashSet::new(),
        }
    }
}

/// The single mutable root for court data. Check-in records reference courts
/// by id but never own them.
pub struct CourtDirectory {
    courts: RwLock<BTreeMap<String, CourtState>>,
}

impl CourtDirectory {
    pub fn from_seed() -> Result<Self, JamError> {
        Ok(Self {
            courts: RwLock::new(index(parse_seed()?)),
        })
    }

    /// Throws away all state and reloads the embedded seed.
    pub fn restore_defaults(&self) -> Result<(), JamError> {
        let fresh = index(parse_seed()?);
        *self.courts.write() = fresh;
        Ok(())
    }

    pub fn list(&self) -> Vec<Court> {
        self.courts.read().values().map(|s| s.court.clone()).collect()
    }

    pub fn get(&self, court_id: &str) -> Option<Court> {
        self.courts.read().get(court_id).map(|s| s.court.clone())
    }

    pub fn contains(&self, court_id: &str) -> bool {
        self.courts.read().contains_key(court_id)
    }

    pub fn count(&self) -> usize {
        self.courts.read().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.courts.read().keys().cloned().collect()
    }

    /// Bumps both occupancy counters for a successful check-in and returns
    /// the new `(current_players, total_checkins)`.
    pub fn record_check_in(&self, court_id: &str) -> Result<(u32, u64), JamError> {
        let mut courts = self.courts.write();
        let state = courts
            .get_mut(court_id)
            .ok_or_else(|| JamError::UnknownCourt(court_id.to_string()))?;
        state.court.current_players += 1;
        state.court.total_checkins += 1;
        Ok((state.court.current_players, state.court.total_checkins))
    }

    /// Drops occupancy by one, floored at zero, and returns the new count.
    pub fn record_check_out(&self, court_id: &str) -> Result<u32, JamError> {
        let mut courts = self.courts.write();
        let state = courts
            .get_mut(court_id)
            .ok_or_else(|| JamError::UnknownCourt(court_id.to_string()))?;
        state.court.current_players = state.court.current_players.saturating_sub(1);
        Ok(state.court.current_players)
    }

    pub fn has_rated(&self, court_id: &str, subject_id: &str) -> bool {
        self.courts
            .read()
            .get(court_id)
            .map(|s| s.raters.contains(subject_id))
            .unwrap_or(false)
    }

    /// Folds one star rating into the running average. Per-subject rating
    /// history is not retained; only the rater set guards repeats.
    pub fn rate(&self, court_id: &str, subject_id: &str, stars: u8) -> Result<(f64, u32), JamError> {
        if !(1..=5).contains(&stars) {
            return Err(JamError::Validation(
                "stars must be between 1 and 5".to_string(),
            ));
        }
        let mut courts = self.courts.write();
        let state = courts
            .get_mut(court_id)
            .ok_or_else(|| JamError::UnknownCourt(court_id.to_string()))?;
        if !state.raters.insert(subject_id.to_string()) {
            return Err(JamError::Duplicate(format!(
                "{} already rated court {}",
                subject_id, court_id
            )));
        }
        let count = state.court.rating_count;
        state.court.rating =
            (state.court.rating * count as f64 + stars as f64) / (count + 1) as f64;
        state.court.rating_count = count + 1;
        Ok((state.court.rating, state.court.rating_count))
    }

    /// Sets one court's occupancy to zero. Total check-in counters keep
    /// their values; an unknown court is a no-op.
    pub fn zero_player_count(&self, court_id: &str) {
        let mut courts = self.courts.write();
        if let Some(state) = courts.get_mut(court_id) {
            state.court.current_players = 0;
        }
    }

    /// Zeroes both occupancy and lifetime check-in counters on every court.
    pub fn reset_counters_all(&self) {
        let mut courts = self.courts.write();
        for state in courts.values_mut() {
            state.court.current_players = 0;
            state.court.total_checkins = 0;
        }
    }

    /// Overwrites every court's occupancy with the supplied per-court counts;
    /// courts absent from the map go to zero. Used when occupancy is
    /// re-derived from a restored ledger.
    pub fn apply_player_counts(&self, counts: &BTreeMap<String, u32>) {
        let mut courts = self.courts.write();
        for (id, state) in courts.iter_mut() {
            state.court.current_players = counts.get(id).copied().unwrap_or(0);
        }
    }

    pub fn export(&self) -> (Vec<Court>, BTreeMap<String, Vec<String>>) {
        let courts = self.courts.read();
        let list = courts.values().map(|s| s.court.clone()).collect();
        let raters = courts
            .iter()
            .filter(|(_, s)| !s.raters.is_empty())
            .map(|(id, s)| {
                let mut names: Vec<String> = s.raters.iter().cloned().collect();
                names.sort();
                (id.clone(), names)
            })
            .collect();
        (list, raters)
    }

    pub fn restore(&self, courts: Vec<Court>, raters: BTreeMap<String, Vec<String>>) {
        let mut map = index(courts);
        for (id, names) in raters {
            if let Some(state) = map.get_mut(&id) {
                state.raters = names.into_iter().collect();
            }
        }
        *self.courts.write() = map;
    }
}

fn parse_seed() -> Result<Vec<Court>, JamError> {
    serde_json::from_str(SEED).map_err(|e| JamError::Config(format!("court seed: {e}")))
}

fn index(courts: Vec<Court>) -> BTreeMap<String, CourtState> {
    courts
        .into_iter()
        .map(|c| (c.id.clone(), CourtState::new(c)))
        .collect()
}
