//! Cycle counter timing.
//!
//! The tile cycle counter read by `cycle_count()` is 32 bits wide and wraps.
//! Differences are taken modulo 2^32, so an interval is only measured
//! correctly when it is shorter than one wraparound period
//! ([`wraparound_period`]); longer intervals silently report the wrapped
//! value. No correction is attempted.

use std::time::Duration;

use crate::graph::Device;

/// Cycles elapsed between two counter reads.
pub fn elapsed_cycles(start: u32, end: u32) -> u32 {
    end.wrapping_sub(start)
}

/// Wall time of `cycles` tile cycles at `clock_hz`.
pub fn cycles_to_duration(cycles: u64, clock_hz: u64) -> Duration {
    if clock_hz == 0 {
        return Duration::ZERO;
    }
    let secs = cycles / clock_hz;
    let rem = cycles % clock_hz;
    let nanos = (rem as u128 * 1_000_000_000 / clock_hz as u128) as u32;
    Duration::new(secs, nanos)
}

/// Longest interval the counter can measure on `device`.
pub fn wraparound_period(device: &dyn Device) -> Duration {
    cycles_to_duration(1u64 << 32, device.tile_clock_frequency())
}

/// One `@cycles` measurement found in printed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleMeasurement {
    pub label: String,
    pub cycles: u32,
}

impl CycleMeasurement {
    pub fn duration(&self, device: &dyn Device) -> Duration {
        cycles_to_duration(self.cycles as u64, device.tile_clock_frequency())
    }
}

/// Collect the `<label>: <n> cycles` lines that `@cycles` blocks print.
pub fn parse_cycle_reports(output: &str) -> Vec<CycleMeasurement> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim_end().strip_suffix(" cycles")?;
            let (label, count) = rest.rsplit_once(": ")?;
            Some(CycleMeasurement {
                label: label.to_string(),
                cycles: count.trim().parse().ok()?,
            })
        })
        .collect()
}
