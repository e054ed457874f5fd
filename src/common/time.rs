// SPDX-License-Identifier: GPL-2.0-or-later

use serde::{Deserialize, Serialize};
use std::{
    ops::Deref,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

pub const MICROSECOND: i64 = 1;
pub const MILLISECOND: i64 = MICROSECOND * 1000;
pub const SECOND: i64 = MILLISECOND * 1000;

// Microseconds since the Unix epoch.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnixMicro(i64);

impl UnixMicro {
    pub fn now() -> Self {
        Self(
            i64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("time went backwards")
                    .as_micros(),
            )
            .expect("timestamp to fit i64"),
        )
    }

    #[must_use]
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        Some(Self(self.0.checked_add(*duration)?))
    }

    // Reports whether the instant `self` is after `other`.
    #[must_use]
    pub fn after(&self, other: Self) -> bool {
        self.0 > other.0
    }

    // Returns the duration self - u.
    #[must_use]
    pub fn sub(&self, u: Self) -> Option<Duration> {
        self.0.checked_sub(u.0).map(Duration)
    }
}

impl From<i64> for UnixMicro {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for UnixMicro {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Signed span of time in microseconds.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration(i64);

impl Duration {
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(MILLISECOND))
    }

    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(SECOND))
    }

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1_000_000.0) as i64)
    }

    #[must_use]
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0 / MILLISECOND
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn saturating_add(&self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    #[must_use]
    pub fn saturating_sub(&self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::as_conversions
    )]
    #[must_use]
    pub fn mul_f64(&self, v: f64) -> Self {
        Self((self.0 as f64 * v) as i64)
    }
}

impl From<i64> for Duration {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for Duration {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Deserializes a `Duration` from fractional seconds, the unit used by the
// vhost configuration files.
pub fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Ok(Duration::from_secs_f64(secs))
}

pub type ArcClock = Arc<dyn Clock + Send + Sync>;

// Wall clock. The muxer reads it through a trait so floor-mode segment
// numbering can be driven by tests.
pub trait Clock {
    fn now(&self) -> UnixMicro;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixMicro {
        UnixMicro::now()
    }
}
