/*
    StEmu

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    clock.rs

    Master cycle counter shared by the CPU core and every peripheral.
*/

use std::{
    fmt,
    ops::{Add, Sub},
};

/// Reference CPU clock. Peripheral timing constants are expressed in cycles at this rate
/// and scaled when the machine is configured to run at a different frequency.
pub const CPU_HZ_REFERENCE: u32 = 8_000_000;
pub const COLD_BOOT_TIME: i64 = 0;

/// A point in emulated time, in CPU cycles since cold boot.
///
/// ClockValue deliberately does not implement PartialOrd. Two values are ordered by
/// subtracting them, which keeps ordering correct if the counter ever wraps.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClockValue(i64);

impl ClockValue {
    pub const fn new(cycles: i64) -> Self {
        Self(cycles)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Signed distance from `earlier` to `self`.
    #[inline]
    pub fn diff(self, earlier: ClockValue) -> i64 {
        self.0.wrapping_sub(earlier.0)
    }

    #[inline]
    pub fn offset(self, cycles: i64) -> ClockValue {
        ClockValue(self.0.wrapping_add(cycles))
    }

    /// True if `self` is at or before `other`.
    #[inline]
    pub fn is_at_or_before(self, other: ClockValue) -> bool {
        other.diff(self) >= 0
    }
}

impl Add<i64> for ClockValue {
    type Output = ClockValue;
    fn add(self, rhs: i64) -> ClockValue {
        self.offset(rhs)
    }
}

impl Sub for ClockValue {
    type Output = i64;
    fn sub(self, rhs: ClockValue) -> i64 {
        self.diff(rhs)
    }
}

impl fmt::Display for ClockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Clock {
    now:    ClockValue,
    cpu_hz: u32,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            now:    ClockValue(COLD_BOOT_TIME),
            cpu_hz: CPU_HZ_REFERENCE,
        }
    }
}

impl Clock {
    pub fn new(cpu_hz: u32) -> Self {
        Self {
            cpu_hz: cpu_hz.max(1),
            ..Default::default()
        }
    }

    #[inline]
    pub fn now(&self) -> ClockValue {
        self.now
    }

    pub fn cpu_hz(&self) -> u32 {
        self.cpu_hz
    }

    pub fn cycles_per_second(&self) -> i64 {
        self.cpu_hz as i64
    }

    pub fn cold_reset(&mut self) {
        self.now = ClockValue(COLD_BOOT_TIME);
    }

    #[inline]
    pub fn advance(&mut self, cycles: u32) -> ClockValue {
        self.now = self.now.offset(cycles as i64);
        self.now
    }

    /// Move the clock to `now`. Time never runs backwards within a run, so an earlier
    /// value is ignored.
    pub fn set(&mut self, now: ClockValue) {
        let delta = now.diff(self.now);
        if delta < 0 {
            log::warn!("Clock::set(): ignoring backwards step of {} cycles", -delta);
            return;
        }
        self.now = now;
    }

    pub fn cycles_to_micros(&self, cycles: i64) -> i64 {
        ((cycles as i128 * 1_000_000) / self.cpu_hz as i128) as i64
    }

    pub fn micros_to_cycles(&self, micros: i64) -> i64 {
        ((micros as i128 * self.cpu_hz as i128) / 1_000_000) as i64
    }

    /// Convert a cycle count measured at the 8MHz reference clock to this clock.
    pub fn scale_reference(&self, cycles: i64) -> i64 {
        scale_reference(cycles, self.cpu_hz)
    }
}

pub fn scale_reference(cycles: i64, cpu_hz: u32) -> i64 {
    if cpu_hz == CPU_HZ_REFERENCE {
        return cycles;
    }
    ((cycles as i128 * cpu_hz as i128) / CPU_HZ_REFERENCE as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_across_wrap() {
        let before = ClockValue::new(i64::MAX - 5);
        let after = before + 10;

        assert!(after.raw() < before.raw());
        assert_eq!(after.diff(before), 10);
        assert_eq!(before - after, -10);
        assert!(before.is_at_or_before(after));
        assert!(!after.is_at_or_before(before));
    }

    #[test]
    fn test_set_ignores_backwards() {
        let mut clock = Clock::new(CPU_HZ_REFERENCE);
        clock.advance(1000);
        clock.set(ClockValue::new(500));
        assert_eq!(clock.now().raw(), 1000);
        clock.set(ClockValue::new(1500));
        assert_eq!(clock.now().raw(), 1500);
        clock.cold_reset();
        assert_eq!(clock.now().raw(), COLD_BOOT_TIME);
    }

    #[test]
    fn test_conversions() {
        let clock = Clock::new(CPU_HZ_REFERENCE);
        assert_eq!(clock.micros_to_cycles(1), 8);
        assert_eq!(clock.cycles_to_micros(8_000), 1_000);

        let fast = Clock::new(16_000_000);
        assert_eq!(fast.scale_reference(4000), 8000);
        assert_eq!(clock.scale_reference(4000), 4000);
    }
}
