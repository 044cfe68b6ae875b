//! Duplicate-packet suppression with a rotating Bloom filter
//!
//! Every packet id the engine has processed or sent is added here so that
//! retransmissions and looped-back copies are dropped. The filter never grows:
//! once it holds `capacity` ids, or `rotation_interval` has passed since the
//! last clear, it is wiped. Very old duplicates can therefore resurface as
//! "unseen" after a rotation; that is accepted.
//!
//! Bit positions come from double hashing: two independent 32-bit words
//! `h1`, `h2` are taken from one BLAKE3 digest of the id and bit `i` is
//! `(h1 + i * h2) mod size`.

use std::time::Duration;
use tokio::time::Instant;

/// Default number of ids held before a forced rotation
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Design false-positive rate at full capacity
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Default time between rotations (5 minutes)
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(300);

/// Probabilistic set of seen packet ids
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    size: u64,
    hash_count: u32,
    capacity: usize,
    count: usize,
    rotation_interval: Duration,
    last_rotation: Instant,
    rotations: u64,
}

impl BloomFilter {
    /// Filter with the protocol defaults: 10 000 ids, 1 % FP, 5 minute rotation
    pub fn new() -> Self {
        Self::with_params(
            DEFAULT_CAPACITY,
            DEFAULT_FALSE_POSITIVE_RATE,
            DEFAULT_ROTATION_INTERVAL,
        )
    }

    /// Filter sized for `capacity` ids at `fp_rate`, rotating every `rotation_interval`
    pub fn with_params(capacity: usize, fp_rate: f64, rotation_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        let fp_rate = fp_rate.clamp(1e-9, 0.5);
        let size = optimal_bits(capacity, fp_rate);
        let hash_count = optimal_hashes(size, capacity);

        Self {
            bits: vec![0u64; size.div_ceil(64) as usize],
            size,
            hash_count,
            capacity,
            count: 0,
            rotation_interval,
            last_rotation: Instant::now(),
            rotations: 0,
        }
    }

    /// Number of bits in the filter
    pub fn size_bits(&self) -> u64 {
        self.size
    }

    /// Number of hash positions per id
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Ids added since the last rotation
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Completed rotations since creation
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// True if `id` may have been added (false positives possible, no false negatives)
    pub fn might_contain(&self, id: impl AsRef<[u8]>) -> bool {
        let (h1, h2) = hash_pair(id.as_ref());
        (0..self.hash_count).all(|i| self.bit(self.position(h1, h2, i)))
    }

    /// Record an id, rotating first if the filter is due
    pub fn add(&mut self, id: impl AsRef<[u8]>) {
        self.rotate_if_due();
        self.insert(id.as_ref());
    }

    /// Returns true iff `id` was (probably) already present; records it either way
    pub fn check_and_add(&mut self, id: impl AsRef<[u8]>) -> bool {
        self.rotate_if_due();
        let id = id.as_ref();
        if self.might_contain(id) {
            return true;
        }
        self.insert(id);
        false
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
        self.count = 0;
        self.last_rotation = Instant::now();
    }

    /// Fraction of bits currently set
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.bits.iter().map(|w| w.count_ones() as u64).sum();
        set as f64 / self.size as f64
    }

    fn rotate_if_due(&mut self) {
        let expired = Instant::now().duration_since(self.last_rotation) >= self.rotation_interval;
        if self.count >= self.capacity || expired {
            tracing::debug!(
                "Rotating dedup filter ({} ids, interval expired: {})",
                self.count,
                expired
            );
            self.clear();
            self.rotations += 1;
        }
    }

    fn insert(&mut self, id: &[u8]) {
        let (h1, h2) = hash_pair(id);
        for i in 0..self.hash_count {
            let pos = self.position(h1, h2, i);
            self.bits[(pos / 64) as usize] |= 1u64 << (pos % 64);
        }
        self.count += 1;
    }

    fn position(&self, h1: u32, h2: u32, i: u32) -> u64 {
        (h1 as u64 + i as u64 * h2 as u64) % self.size
    }

    fn bit(&self, pos: u64) -> bool {
        self.bits[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Two independent 32-bit hashes of `data`. `h2` is forced odd so successive
/// positions never collapse onto `h1`.
fn hash_pair(data: &[u8]) -> (u32, u32) {
    let digest = blake3::hash(data);
    let bytes = digest.as_bytes();
    let h1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let h2 = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) | 1;
    (h1, h2)
}

/// m = -n ln p / (ln 2)^2
fn optimal_bits(capacity: usize, fp_rate: f64) -> u64 {
    let ln2 = std::f64::consts::LN_2;
    let bits = -(capacity as f64) * fp_rate.ln() / (ln2 * ln2);
    (bits.ceil() as u64).max(64)
}

/// k = (m / n) ln 2
fn optimal_hashes(size: u64, capacity: usize) -> u32 {
    let k = (size as f64 / capacity as f64) * std::f64::consts::LN_2;
    (k.round() as u32).clamp(1, 16)
}
