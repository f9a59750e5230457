//! Chunk ordering
//!
//! The leading prefetch window is fetched strictly in order so playback can
//! start early; everything after it is visited in a shuffled order. All
//! randomness comes from an injected RNG so orderings are reproducible.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// RNG for a session, deterministic when seeded
pub fn session_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Size of the in-order window for a content item
pub fn prefetch_len(total: u32, window: u32) -> u32 {
    window.min(total)
}

/// First-pass visiting order: `0..P` in order, then the rest shuffled
pub fn first_pass_order<R: Rng + ?Sized>(total: u32, window: u32, rng: &mut R) -> Vec<u32> {
    let head = prefetch_len(total, window);
    let mut order: Vec<u32> = (0..head).collect();
    let mut tail: Vec<u32> = (head..total).collect();
    tail.shuffle(rng);
    order.extend(tail);
    order
}

/// Visiting order for a repair pass over missing indices
pub fn repair_order<R: Rng + ?Sized>(missing: impl IntoIterator<Item = u32>, rng: &mut R) -> Vec<u32> {
    let mut order: Vec<u32> = missing.into_iter().collect();
    order.shuffle(rng);
    order
}

/// Optional fault injection: skips chunks outside the prefetch window in the
/// first pass with a fixed probability, leaving them to the repair rounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultInjection {
    loss_rate: f64,
}

impl Default for FaultInjection {
    fn default() -> Self {
        Self::disabled()
    }
}

impl FaultInjection {
    /// No simulated loss
    pub fn disabled() -> Self {
        Self { loss_rate: 0.0 }
    }

    /// Simulated loss with the given probability, clamped to `[0, 1]`
    pub fn with_loss_rate(loss_rate: f64) -> Self {
        let loss_rate = if loss_rate.is_finite() { loss_rate.clamp(0.0, 1.0) } else { 0.0 };
        Self { loss_rate }
    }

    /// Configured loss probability
    pub fn loss_rate(&self) -> f64 {
        self.loss_rate
    }

    /// Whether to skip `index` in the first pass. Chunks inside the prefetch
    /// window are never skipped.
    pub fn should_skip<R: Rng + ?Sized>(&self, index: u32, prefetch: u32, rng: &mut R) -> bool {
        if index < prefetch || self.loss_rate <= 0.0 {
            return false;
        }
        rng.gen_bool(self.loss_rate)
    }
}
