//! Motion unit conversions for the lab stages.
//!
//! Linear stages move 0.01 mm per pulse at the 1/100 pulse scale; rotary
//! stages step 0.72° per pulse; the motors take 500 pulses per revolution.

pub const PULSES_PER_MM: f64 = 100.0;
pub const DEGREES_PER_PULSE: f64 = 0.72;
pub const PULSES_PER_REV: f64 = 500.0;

/// Rounded to the nearest whole pulse.
pub fn mm_to_pulse(mm: f64) -> i64 {
    (mm * PULSES_PER_MM).round() as i64
}

pub fn pulse_to_mm(pulses: i64) -> f64 {
    pulses as f64 / PULSES_PER_MM
}

/// Rounded to the nearest whole pulse.
pub fn degree_to_pulse(degrees: f64) -> i64 {
    (degrees / DEGREES_PER_PULSE).round() as i64
}

pub fn pulse_to_degree(pulses: i64) -> f64 {
    pulses as f64 * DEGREES_PER_PULSE
}

pub fn rpm_to_pps(rpm: f64) -> f64 {
    rpm * PULSES_PER_REV / 60.0
}

pub fn pps_to_rpm(pps: f64) -> f64 {
    pps * 60.0 / PULSES_PER_REV
}
