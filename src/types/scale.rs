//! Unit scaling between engineering values and wire integers.

use std::time::Duration;

/// Board clock in MHz; delays travel as clock cycles for sub-microsecond
/// resolution.
pub const CLOCK_SPEED_MHZ: f64 = 600.0;

/// Full-scale voltage of the confocal line threshold.
pub const THRESHOLD_FULL_SCALE_VOLTS: f64 = 3.3;

const U16_FULL_SCALE: f64 = 65535.0;

/// Converts a percentage (0-100) to the 16-bit wire value.
#[must_use]
pub fn percent_to_u16(percent: f64) -> u16 {
    (percent / 100.0 * U16_FULL_SCALE)
        .round()
        .clamp(0.0, U16_FULL_SCALE) as u16
}

/// Converts a 16-bit wire value to a percentage.
#[must_use]
pub fn u16_to_percent(raw: u16) -> f64 {
    f64::from(raw) / U16_FULL_SCALE * 100.0
}

/// Converts a duration to whole microseconds, saturating at `u32::MAX`.
#[must_use]
pub fn duration_to_micros(duration: Duration) -> u32 {
    let micros = (duration.as_secs_f64() * 1e6).round();
    micros.clamp(0.0, f64::from(u32::MAX)) as u32
}

/// Converts wire microseconds to a duration.
#[must_use]
pub fn micros_to_duration(micros: u32) -> Duration {
    Duration::from_micros(u64::from(micros))
}

/// Converts microseconds to board clock cycles.
#[must_use]
pub fn micros_to_cycles(micros: f64) -> u32 {
    (micros * CLOCK_SPEED_MHZ)
        .round()
        .clamp(0.0, f64::from(u32::MAX)) as u32
}

/// Converts board clock cycles to microseconds.
#[must_use]
pub fn cycles_to_micros(cycles: u32) -> f64 {
    f64::from(cycles) / CLOCK_SPEED_MHZ
}

/// Converts a threshold voltage to the 16-bit wire value.
#[must_use]
pub fn volts_to_u16(volts: f64) -> u16 {
    (volts / THRESHOLD_FULL_SCALE_VOLTS * U16_FULL_SCALE)
        .round()
        .clamp(0.0, U16_FULL_SCALE) as u16
}

/// Converts a 16-bit wire value to a threshold voltage.
#[must_use]
pub fn u16_to_volts(raw: u16) -> f64 {
    f64::from(raw) / U16_FULL_SCALE * THRESHOLD_FULL_SCALE_VOLTS
}
