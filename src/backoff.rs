//! Delay policy between polling cycles.
//!
//! Exponential growth with full jitter while cycles come back empty or
//! failed; a fixed floor once a cycle does productive work.
//!
//! Why: idle listeners should get out of the queue's way, and several
//! listeners on one queue must not wake in lockstep.
use rand::{Rng as _, SeedableRng as _};

/// Shortest wait between cycles; also the delay after a productive cycle.
const MIN_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug)]
/// Randomized exponential backoff driven by cycle outcomes.
///
/// Owned by a single poll loop; the failure streak is its only state and
/// resets on any productive cycle.
pub struct Backoff {
    max_delay: std::time::Duration,
    streak: u32,
    rng: rand::rngs::StdRng,
}

impl Backoff {
    /// Policy whose delay never exceeds `max_delay`.
    pub fn new(max_delay: std::time::Duration) -> Self {
        Self {
            max_delay,
            streak: 0,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    fn seeded(max_delay: std::time::Duration, seed: u64) -> Self {
        Self {
            max_delay,
            streak: 0,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    /// Next wait before polling again.
    ///
    /// A non-productive cycle grows the envelope to
    /// `min(100ms * 2^streak, max_delay)`; the returned delay is drawn
    /// uniformly from `[0, envelope]` and floored at the 100 ms minimum.
    pub fn next_delay(&mut self, productive: bool) -> std::time::Duration {
        if productive {
            self.streak = 0;
            return MIN_DELAY;
        }

        self.streak = self.streak.saturating_add(1);
        let envelope = envelope_delay(self.streak, self.max_delay);
        let jittered = self.rng.gen_range(0..=envelope.as_millis() as u64);
        std::time::Duration::from_millis(jittered).max(MIN_DELAY)
    }
}

/// Unjittered delay for a failure streak, saturating on overflow.
fn envelope_delay(streak: u32, max_delay: std::time::Duration) -> std::time::Duration {
    let millis = 1u64
        .checked_shl(streak)
        .map(|factor| (MIN_DELAY.as_millis() as u64).saturating_mul(factor))
        .unwrap_or(u64::MAX);
    std::time::Duration::from_millis(millis).min(max_delay)
}
