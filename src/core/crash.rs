//! Crash Point and Multiplier Model
//!
//! Two pure functions define a round's economics:
//!
//! - the crash draw, `crash = (1 - edge) / (1 - u)` for `u` uniform in [0, 1),
//!   floored to cents and clamped to `[1.00, max_multiplier]`;
//! - the growth curve, `multiplier(t) = e^(rate * t)` for `t` seconds of flight.
//!
//! For any cash-out target `x >= 1.0`, `P(crash >= x) = (1 - edge) / x`, so a
//! player who always exits at `x` has an expected return of `1 - edge`.

use std::time::Duration;

use crate::core::rng::DeterministicRng;

/// Lowest possible crash multiplier.
pub const MIN_MULTIPLIER: f64 = 1.0;

/// Parameters of the crash distribution and growth curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashModel {
    /// Long-run house edge in [0, 1).
    pub house_edge: f64,
    /// Exponential growth rate per second of flight.
    pub growth_rate: f64,
    /// Hard cap on the crash multiplier.
    pub max_multiplier: f64,
}

impl Default for CrashModel {
    fn default() -> Self {
        Self {
            house_edge: 0.01,
            growth_rate: 0.06,
            max_multiplier: 1000.0,
        }
    }
}

impl CrashModel {
    /// Draw a crash multiplier.
    pub fn draw_crash(&self, rng: &mut DeterministicRng) -> f64 {
        self.crash_from_unit(rng.next_unit())
    }

    /// Map a uniform sample in [0, 1) to a crash multiplier.
    pub fn crash_from_unit(&self, u: f64) -> f64 {
        let u = u.clamp(0.0, 1.0 - f64::EPSILON);
        let raw = (1.0 - self.house_edge) / (1.0 - u);
        floor_cents(raw).clamp(MIN_MULTIPLIER, self.max_multiplier.max(MIN_MULTIPLIER))
    }

    /// Multiplier after `elapsed` flight time.
    #[inline]
    pub fn multiplier_at(&self, elapsed: Duration) -> f64 {
        (self.growth_rate * elapsed.as_secs_f64()).exp()
    }

    /// Flight time at which the curve reaches `multiplier`.
    pub fn time_to_reach(&self, multiplier: f64) -> Duration {
        if multiplier <= MIN_MULTIPLIER || self.growth_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(multiplier.ln() / self.growth_rate)
    }
}

/// Round down to two decimal places.
#[inline]
pub fn floor_cents(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}
