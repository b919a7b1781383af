use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DIMENSIONALITY: usize = 8;
const VIVALDI_ERROR_MAX: f64 = 1.5;
const VIVALDI_CE: f64 = 0.25;
const VIVALDI_CC: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub vec: [f64; DIMENSIONALITY],
    pub height: f64,
    pub error: f64,
    pub adjustment: f64,
}

impl Default for Coordinate {
    fn default() -> Self {
        Self {
            vec: [0.0; DIMENSIONALITY],
            height: 0.0,
            error: VIVALDI_ERROR_MAX,
            adjustment: 0.0,
        }
    }
}

impl Coordinate {
    pub fn is_valid(&self) -> bool {
        self.vec.iter().all(|c| c.is_finite())
            && self.height.is_finite()
            && self.error.is_finite()
            && self.adjustment.is_finite()
    }

    fn raw_distance_to(&self, other: &Coordinate) -> f64 {
        let sum_sq: f64 = self.vec.iter().zip(other.vec.iter()).map(|(a, b)| (a - b).powi(2)).sum();
        sum_sq.sqrt() + self.height + other.height
    }

    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        let dist = (self.raw_distance_to(other) + self.adjustment + other.adjustment).max(0.0);
        Duration::from_secs_f64(dist)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinateStats {
    pub resets: u64,
    /// Number of RTT samples currently held in each peer's median filter
    /// (at most `filter_window`); exposed so the RPC `stats` command can
    /// show how well-calibrated a distance estimate to a given peer is.
    pub samples_per_node: HashMap<String, usize>,
}

struct NodeFilter {
    samples: Vec<f64>,
}

/// Vivaldi network-coordinate client. Maintains a local coordinate and
/// updates it on every successful round trip; tracks a short median filter
/// per peer so a single spiky RTT can't perturb the fit.
pub struct CoordinateClient {
    local: Mutex<Coordinate>,
    filters: Mutex<HashMap<String, NodeFilter>>,
    peer_coords: Mutex<HashMap<String, Coordinate>>,
    resets: AtomicU64,
    filter_window: usize,
}

impl Default for CoordinateClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinateClient {
    pub fn new() -> Self {
        Self {
            local: Mutex::new(Coordinate::default()),
            filters: Mutex::new(HashMap::new()),
            peer_coords: Mutex::new(HashMap::new()),
            resets: AtomicU64::new(0),
            filter_window: 3,
        }
    }

    pub fn get_coordinate(&self) -> Coordinate {
        self.local.lock().clone()
    }

    pub fn set_coordinate(&self, coord: Coordinate) -> bool {
        if !coord.is_valid() {
            return false;
        }
        *self.local.lock() = coord;
        true
    }

    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        self.local.lock().distance_to(other)
    }

    pub fn peer_coordinate(&self, name: &str) -> Option<Coordinate> {
        self.peer_coords.lock().get(name).cloned()
    }

    pub fn forget_node(&self, name: &str) {
        self.filters.lock().remove(name);
        self.peer_coords.lock().remove(name);
    }

    pub fn stats(&self) -> CoordinateStats {
        let samples_per_node = self
            .filters
            .lock()
            .iter()
            .map(|(name, filter)| (name.clone(), filter.samples.len()))
            .collect();
        CoordinateStats {
            resets: self.resets.load(Ordering::SeqCst),
            samples_per_node,
        }
    }

    /// Folds one successful round-trip measurement into the local
    /// coordinate: median-filters the RTT, rejects samples outside a sane
    /// range, then applies the Vivaldi spring update. A corrupted result
    /// (NaN/Inf, which only a pathological remote coordinate can produce
    /// given the checks above) resets the local coordinate to the origin
    /// and counts against `stats().resets` rather than propagating.
    pub fn update(&self, peer: &str, remote: Coordinate, rtt: Duration) {
        let Some(rtt_secs) = self.filtered_rtt(peer, rtt.as_secs_f64()) else {
            return;
        };
        if !(0.0..=10.0).contains(&rtt_secs) || !remote.is_valid() {
            return;
        }
        self.peer_coords.lock().insert(peer.to_string(), remote.clone());

        let mut local = self.local.lock();
        let dist = local.raw_distance_to(&remote).max(0.0);
        let err = rtt_secs - dist;

        let total_err = (local.error + remote.error).max(1e-6);
        let weight = local.error / total_err;

        let new_error = (weight * VIVALDI_CE * err.abs() + (1.0 - weight * VIVALDI_CE) * local.error).min(VIVALDI_ERROR_MAX);
        let delta = VIVALDI_CC * weight;

        let direction = unit_vector_between(&local, &remote);
        for i in 0..DIMENSIONALITY {
            local.vec[i] += direction[i] * delta * err;
        }
        local.height = (local.height + delta * err).max(1e-6);
        local.error = new_error;

        if !local.is_valid() {
            *local = Coordinate::default();
            drop(local);
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn filtered_rtt(&self, peer: &str, sample: f64) -> Option<f64> {
        let mut filters = self.filters.lock();
        let entry = filters.entry(peer.to_string()).or_insert_with(|| NodeFilter { samples: Vec::new() });
        entry.samples.push(sample);
        if entry.samples.len() > self.filter_window {
            entry.samples.remove(0);
        }
        let mut sorted = entry.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        sorted.get(sorted.len() / 2).copied()
    }
}

fn unit_vector_between(from: &Coordinate, to: &Coordinate) -> [f64; DIMENSIONALITY] {
    let mut diff = [0.0; DIMENSIONALITY];
    for i in 0..DIMENSIONALITY {
        diff[i] = from.vec[i] - to.vec[i];
    }
    let mut mag: f64 = diff.iter().map(|x| x * x).sum::<f64>().sqrt();
    if mag < 1e-6 {
        let mut rng = rand::thread_rng();
        for d in diff.iter_mut() {
            *d = rng.gen_range(-1.0..1.0);
        }
        mag = diff.iter().map(|x| x * x).sum::<f64>().sqrt().max(1e-6);
    }
    for d in diff.iter_mut() {
        *d /= mag;
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_coordinate_is_valid_and_at_origin() {
        let c = Coordinate::default();
        assert!(c.is_valid());
        assert_eq!(c.vec, [0.0; DIMENSIONALITY]);
    }

    #[test]
    fn update_pulls_coordinates_toward_observed_rtt() {
        let client = CoordinateClient::new();
        let mut remote = Coordinate::default();
        remote.vec[0] = 1.0;
        for _ in 0..50 {
            client.update("peer", remote.clone(), Duration::from_millis(100));
        }
        assert!(client.get_coordinate().is_valid());
        // after many consistent samples the estimate should have moved off the origin.
        assert_ne!(client.get_coordinate().vec, [0.0; DIMENSIONALITY]);
    }

    #[test]
    fn set_coordinate_rejects_invalid_input() {
        let client = CoordinateClient::new();
        let mut bad = Coordinate::default();
        bad.height = f64::NAN;
        assert!(!client.set_coordinate(bad));
        assert!(client.get_coordinate().is_valid());
    }

    #[test]
    fn forget_node_drops_cached_state() {
        let client = CoordinateClient::new();
        client.update("peer", Coordinate::default(), Duration::from_millis(50));
        assert!(client.peer_coordinate("peer").is_some());
        client.forget_node("peer");
        assert!(client.peer_coordinate("peer").is_none());
    }
}
