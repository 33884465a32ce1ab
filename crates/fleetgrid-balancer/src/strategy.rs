//! Selection strategies.
//!
//! Each strategy is a [`Selector`] that picks an index into a candidate
//! slice. Selectors never touch the registry, so they can be exercised
//! on plain vectors.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fleetgrid_state::{LoadBalancingStrategy, ServerInstance, StrategyName, first_min_index};

/// Picks one candidate for a unit of work.
pub trait Selector: Send + Sync {
    /// Index of the chosen candidate, or `None` if `candidates` is empty.
    fn select(&self, candidates: &[ServerInstance], client_key: Option<&str>) -> Option<usize>;

    fn name(&self) -> StrategyName;
}

/// Build a fresh selector. Any cursor state starts from zero.
pub fn build_selector(strategy: &LoadBalancingStrategy) -> Box<dyn Selector> {
    match strategy.name {
        StrategyName::RoundRobin => Box::new(RoundRobin::new()),
        StrategyName::WeightedRoundRobin => Box::new(match strategy.seed() {
            Some(seed) => WeightedRandom::seeded(seed),
            None => WeightedRandom::new(),
        }),
        StrategyName::LeastConnections => Box::new(LeastConnections),
        StrategyName::LeastResponseTime => Box::new(LeastResponseTime),
        StrategyName::IpHash => Box::new(IpHash::new()),
    }
}

/// Monotonic cursor modulo the current candidate count.
///
/// The cursor is never rewound when the candidate set changes, so the
/// visit-each-once cycle only holds while membership is stable.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RoundRobin {
    fn select(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }

    fn name(&self) -> StrategyName {
        StrategyName::RoundRobin
    }
}

/// Weight-proportional random choice.
///
/// Draws `r` in `[0, Σweight)` and walks the candidates subtracting each
/// weight; the first candidate that takes `r` to zero or below wins.
#[derive(Debug)]
pub struct WeightedRandom {
    rng: Mutex<StdRng>,
}

impl WeightedRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible draws.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for WeightedRandom {
    fn select(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        // Negative weights would make the walk meaningless.
        let weight = |c: &ServerInstance| c.weight.max(0.0);
        let total: f64 = candidates.iter().map(weight).sum();
        if total <= 0.0 || !total.is_finite() {
            return Some(0);
        }

        let mut remaining = self.rng.lock().expect("weighted rng lock").gen_range(0.0..total);
        for (idx, candidate) in candidates.iter().enumerate() {
            remaining -= weight(candidate);
            if remaining <= 0.0 {
                return Some(idx);
            }
        }
        // Rounding left a sliver above zero.
        Some(0)
    }

    fn name(&self) -> StrategyName {
        StrategyName::WeightedRoundRobin
    }
}

/// Fewest open connections; ties go to the earliest candidate.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl Selector for LeastConnections {
    fn select(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> Option<usize> {
        first_min_index(candidates, |c| c.current_connections as f64)
    }

    fn name(&self) -> StrategyName {
        StrategyName::LeastConnections
    }
}

/// Lowest last-probed response time; ties go to the earliest candidate.
#[derive(Debug, Default)]
pub struct LeastResponseTime;

impl Selector for LeastResponseTime {
    fn select(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> Option<usize> {
        first_min_index(candidates, |c| c.response_time)
    }

    fn name(&self) -> StrategyName {
        StrategyName::LeastResponseTime
    }
}

/// Modulo hashing of the client key. Without a key, or with an empty
/// one, it behaves as round-robin.
///
/// This is not consistent hashing: any change in candidate count remaps
/// most keys.
#[derive(Debug, Default)]
pub struct IpHash {
    fallback: RoundRobin,
}

impl IpHash {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for IpHash {
    fn select(&self, candidates: &[ServerInstance], client_key: Option<&str>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match client_key {
            Some(key) if !key.is_empty() => Some(ip_hash(key) as usize % candidates.len()),
            _ => self.fallback.select(candidates, None),
        }
    }

    fn name(&self) -> StrategyName {
        StrategyName::IpHash
    }
}

/// `h = h * 31 + unit` over the key's UTF-16 code units in wrapping
/// 32-bit signed arithmetic, then the absolute value.
pub fn ip_hash(key: &str) -> u32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
        .unsigned_abs()
}
