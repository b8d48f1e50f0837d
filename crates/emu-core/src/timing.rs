//! Virtual time and clock-rate conversions.
//!
//! Machine time is counted in picoseconds from power-on. Devices keep their own progress in
//! whole clock cycles and convert through [`Clock`] so that repeated conversions never drift.

/// Picoseconds per second.
pub const PICOS_PER_SECOND: u64 = 1_000_000_000_000;

/// A point in (or span of) virtual machine time, in picoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Time(u64);

impl Time {
    /// Time zero.
    pub const ZERO: Self = Self(0);
    /// Sentinel used for disabled timers; compares greater than every real time.
    pub const NEVER: Self = Self(u64::MAX);

    /// Builds a time from raw picoseconds.
    #[must_use]
    pub const fn from_picos(picos: u64) -> Self {
        Self(picos)
    }

    /// Builds a time from nanoseconds, saturating to [`Time::NEVER`].
    #[must_use]
    pub const fn from_nsec(nsec: u64) -> Self {
        Self(nsec.saturating_mul(1_000))
    }

    /// Builds a time from microseconds, saturating to [`Time::NEVER`].
    #[must_use]
    pub const fn from_usec(usec: u64) -> Self {
        Self(usec.saturating_mul(1_000_000))
    }

    /// Builds the duration of `ticks` cycles of a `hz` clock, rounded down to the picosecond.
    ///
    /// A zero-rate clock never ticks, so any non-zero tick count maps to [`Time::NEVER`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_ticks(ticks: u64, hz: u32) -> Self {
        if hz == 0 {
            return if ticks == 0 { Self::ZERO } else { Self::NEVER };
        }
        let picos = (ticks as u128 * PICOS_PER_SECOND as u128) / hz as u128;
        if picos >= u64::MAX as u128 {
            Self::NEVER
        } else {
            Self(picos as u64)
        }
    }

    /// Returns how many whole `hz` cycles fit in this time.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_ticks(self, hz: u32) -> u64 {
        ((self.0 as u128 * hz as u128) / PICOS_PER_SECOND as u128) as u64
    }

    /// Raw picosecond count.
    #[must_use]
    pub const fn as_picos(self) -> u64 {
        self.0
    }

    /// Returns `true` for the [`Time::NEVER`] sentinel.
    #[must_use]
    pub const fn is_never(self) -> bool {
        self.0 == u64::MAX
    }

    /// Adds two times; anything involving [`Time::NEVER`] stays never.
    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Subtracts `rhs`, clamping at zero. `NEVER - x` stays never.
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        if self.is_never() {
            return Self::NEVER;
        }
        Self(self.0.saturating_sub(rhs.0))
    }
}

/// A device clock rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Clock {
    hz: u32,
}

impl Clock {
    /// Creates a clock running at `hz`.
    #[must_use]
    pub const fn new(hz: u32) -> Self {
        Self { hz }
    }

    /// Clock rate in hertz.
    #[must_use]
    pub const fn hz(self) -> u32 {
        self.hz
    }

    /// Duration of one cycle.
    #[must_use]
    pub const fn period(self) -> Time {
        Time::from_ticks(1, self.hz)
    }

    /// Machine time reached after `cycles` cycles from power-on.
    #[must_use]
    pub const fn cycles_to_time(self, cycles: u64) -> Time {
        Time::from_ticks(cycles, self.hz)
    }

    /// Whole cycles elapsed at machine time `time`.
    #[must_use]
    pub const fn time_to_cycles(self, time: Time) -> u64 {
        if time.is_never() {
            return u64::MAX;
        }
        time.as_ticks(self.hz)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, Time};

    #[test]
    fn tick_conversions_are_exact_for_integral_periods() {
        let clock = Clock::new(1_000_000);
        assert_eq!(clock.period(), Time::from_usec(1));
        assert_eq!(clock.cycles_to_time(500), Time::from_usec(500));
        assert_eq!(clock.time_to_cycles(Time::from_usec(500)), 500);
    }

    #[test]
    fn cycle_round_trip_never_runs_ahead_for_fractional_periods() {
        let clock = Clock::new(3_579_545);
        for cycles in [0u64, 1, 2, 3, 7, 1_000, 3_579_545, 123_456_789] {
            let time = clock.cycles_to_time(cycles);
            assert!(clock.time_to_cycles(time) <= cycles);
            assert!(clock.time_to_cycles(time) + 1 >= cycles);
        }
    }

    #[test]
    fn never_saturates() {
        assert!(Time::NEVER.saturating_add(Time::from_usec(1)).is_never());
        assert!(Time::NEVER.saturating_sub(Time::from_usec(1)).is_never());
        assert_eq!(Time::ZERO.saturating_sub(Time::from_usec(1)), Time::ZERO);
        assert_eq!(Clock::new(1).time_to_cycles(Time::NEVER), u64::MAX);
    }

    #[test]
    fn zero_rate_clock_never_advances() {
        assert_eq!(Time::from_ticks(0, 0), Time::ZERO);
        assert!(Time::from_ticks(5, 0).is_never());
    }
}
