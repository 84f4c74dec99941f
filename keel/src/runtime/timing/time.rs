//! Minimal time units and strongly-typed durations/timestamps.
use core::fmt;
use core::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marker trait for a time unit.
pub trait TimeUnit {
    /// Human-readable suffix for logs.
    const NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Millis {}
impl TimeUnit for Millis {
    const NAME: &'static str = "ms";
}

/// Strongly-typed duration in a given unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(u64, PhantomData<U>);

/// Strongly-typed timestamp in a given unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp<U: TimeUnit>(u64, PhantomData<U>);

impl<U: TimeUnit> Duration<U> {
    /// Zero-length duration.
    pub const ZERO: Self = Self::new(0);

    /// Create a new duration.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    /// Return the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Duration<Millis> {
    /// Convenience constructor for milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(value: u64) -> Self {
        Self::new(value)
    }
}

impl<U: TimeUnit> Default for Duration<U> {
    fn default() -> Self {
        Self::ZERO
    }
}

impl<U: TimeUnit> fmt::Display for Duration<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}

// Serialized as a bare integer in the unit of the type.
impl<U: TimeUnit> Serialize for Duration<U> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de, U: TimeUnit> Deserialize<'de> for Duration<U> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self::new)
    }
}

impl<U: TimeUnit> Timestamp<U> {
    /// Create a new timestamp.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    /// Return the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    ///
    /// Wall clocks can step backwards; callers comparing against a stored
    /// timestamp get zero instead of a wrapped value.
    #[inline]
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration<U> {
        Duration::new(self.0.saturating_sub(earlier.0))
    }
}

impl<U: TimeUnit> fmt::Display for Timestamp<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}", self.0, U::NAME)
    }
}

impl<U: TimeUnit> core::ops::Sub for Timestamp<U> {
    type Output = Duration<U>;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}
