//! ## credence-core::decay
//! **Exponential expiration without per-balance timers**
//!
//! A [`DecayModel`] maintains a global logarithmic offset that grows linearly
//! with time. An [`ExpiredValue`] stores `base` and an integer exponent `exp`;
//! its present value is `base * 2^(exp - offset)`. Instead of shrinking every
//! stored value as time passes, additions are inflated by the current offset
//! and the deflation happens on readout, so any number of balances decay
//! against the same curve for free.
//!
//! A zero rate leaves the offset constant, which turns the whole model into
//! the identity. Deterministic tests rely on that.

use std::f64::consts::LN_2;
use std::ops::{Add, Sub};

use parking_lot::RwLock;

use crate::clock::AbsTime;

/// Fixed point multiplier (24 fractional bits).
const FIXED_FACTOR: u64 = 0x100_0000;
const LOG_TO_FIXED: f64 = FIXED_FACTOR as f64 / LN_2;
const FIXED_TO_LOG: f64 = LN_2 / FIXED_FACTOR as f64;

/// 64-bit fixed point base-2 logarithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed64(pub i64);

impl Fixed64 {
    pub fn from_u64(value: u64) -> Self {
        Fixed64(value.wrapping_mul(FIXED_FACTOR) as i64)
    }

    pub fn from_f64(value: f64) -> Self {
        Fixed64((value * FIXED_FACTOR as f64) as i64)
    }

    /// Integer part.
    pub fn to_u64(self) -> u64 {
        (self.0 as u64) / FIXED_FACTOR
    }

    /// Fractional part, same sign as the value.
    pub fn fraction(self) -> Fixed64 {
        Fixed64(self.0 % FIXED_FACTOR as i64)
    }

    /// `2^self` as a float.
    pub fn pow2(self) -> f64 {
        (self.0 as f64 * FIXED_TO_LOG).exp()
    }
}

impl Add for Fixed64 {
    type Output = Fixed64;

    fn add(self, rhs: Fixed64) -> Fixed64 {
        Fixed64(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Fixed64 {
    type Output = Fixed64;

    fn sub(self, rhs: Fixed64) -> Fixed64 {
        Fixed64(self.0.wrapping_sub(rhs.0))
    }
}

/// `value >> shift` with shifts of 64 or more yielding zero.
#[inline]
fn shr(value: u64, shift: u64) -> u64 {
    u32::try_from(shift)
        .ok()
        .and_then(|s| value.checked_shr(s))
        .unwrap_or(0)
}

/// A scalar that expires exponentially against a [`DecayModel`] offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpiredValue {
    pub base: u64,
    pub exp: u64,
}

impl ExpiredValue {
    /// Present value under the given offset.
    pub fn value(&self, log_offset: Fixed64) -> u64 {
        let offset = Fixed64::from_u64(self.exp) - log_offset;
        (self.base as f64 * offset.pow2()) as u64
    }

    /// Adds a signed amount at the given offset and returns the amount that
    /// was actually applied. Subtractions never go below zero: when the stored
    /// value is too small the value becomes zero and the (smaller, negative)
    /// applied amount is returned.
    pub fn add(&mut self, amount: i64, log_offset: Fixed64) -> i64 {
        let integer = log_offset.to_u64();
        let factor = log_offset.fraction().pow2();
        let mut base = factor * amount as f64;
        if integer < self.exp {
            base /= 2f64.powf((self.exp - integer) as f64);
        }
        if integer > self.exp {
            self.base = shr(self.base, integer - self.exp);
            self.exp = integer;
        }
        if base >= 0.0 {
            self.base = self.base.saturating_add(base as u64);
            return amount;
        }
        let decrease = (-base) as u64;
        if decrease <= self.base {
            self.base -= decrease;
            return amount;
        }
        let net = (-(self.base as f64) / factor) as i64;
        self.base = 0;
        net
    }

    /// Adds another expired value.
    pub fn add_exp(&mut self, mut other: ExpiredValue) {
        self.align(&mut other);
        self.base = self.base.saturating_add(other.base);
    }

    /// Subtracts another expired value, clamping at zero.
    pub fn sub_exp(&mut self, mut other: ExpiredValue) {
        self.align(&mut other);
        self.base = self.base.saturating_sub(other.base);
    }

    pub fn is_zero(&self) -> bool {
        self.base == 0
    }

    fn align(&mut self, other: &mut ExpiredValue) {
        if self.exp > other.exp {
            other.base = shr(other.base, self.exp - other.exp);
        }
        if self.exp < other.exp {
            self.base = shr(self.base, other.exp - self.exp);
            self.exp = other.exp;
        }
    }
}

#[derive(Debug, Default)]
struct DecayState {
    log_offset: Fixed64,
    rate: f64,
    last_update: AbsTime,
}

/// Global logarithmic offset that advances at a configurable rate.
///
/// The rate is the inverse of the expiration time constant in nanoseconds; a
/// value left alone for one time constant shrinks by a factor of `e`.
#[derive(Debug, Default)]
pub struct DecayModel {
    state: RwLock<DecayState>,
}

impl DecayModel {
    /// A model that never decays.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate corresponding to a time constant in seconds; zero means no decay.
    pub fn rate_for_time_constant(seconds: u64) -> f64 {
        if seconds == 0 {
            0.0
        } else {
            1.0 / (seconds as f64 * 1e9)
        }
    }

    pub fn set_rate(&self, now: AbsTime, rate: f64) {
        let mut state = self.state.write();
        if now > state.last_update {
            let dt = (now - state.last_update).as_nanos() as f64;
            state.log_offset = state.log_offset + Fixed64((LOG_TO_FIXED * dt * state.rate) as i64);
        }
        state.last_update = now;
        state.rate = rate;
    }

    pub fn set_log_offset(&self, now: AbsTime, log_offset: Fixed64) {
        let mut state = self.state.write();
        state.last_update = now;
        state.log_offset = log_offset;
    }

    pub fn log_offset(&self, now: AbsTime) -> Fixed64 {
        let state = self.state.read();
        if now <= state.last_update {
            return state.log_offset;
        }
        let dt = (now - state.last_update).as_nanos() as f64;
        state.log_offset + Fixed64((LOG_TO_FIXED * dt * state.rate) as i64)
    }

    pub fn rate(&self) -> f64 {
        self.state.read().rate
    }
}
