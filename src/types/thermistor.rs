//! On-board thermistor conversion.
//!
//! Temperature thresholds travel as raw 16-bit ADC codes of a thermistor in
//! series with a fixed resistor. The conversion uses the beta form of the
//! Steinhart-Hart equation:
//!
//! ```text
//! R   = R_series / (65535 / adc - 1)
//! 1/T = 1/T0 + ln(R / R0) / B
//! ```

/// Thermistor resistance at the nominal temperature, in ohms.
pub const THERMISTOR_NOMINAL_OHMS: f64 = 4700.0;

/// Beta coefficient of the thermistor.
pub const B_COEFFICIENT: f64 = 3500.0;

/// Series resistor on the board, in ohms.
pub const SERIES_RESISTOR_OHMS: f64 = 3600.0;

/// Nominal temperature, in degrees Celsius.
pub const NOMINAL_CELSIUS: f64 = 25.0;

/// Codes above this mean the thermistor is not connected.
pub const DISCONNECTED_THRESHOLD: u16 = 65500;

/// Temperature reported for a disconnected thermistor.
pub const DISCONNECTED_CELSIUS: f64 = -1000.0;

const KELVIN_OFFSET: f64 = 273.15;
const ADC_FULL_SCALE: f64 = 65535.0;

/// Converts a raw ADC code to degrees Celsius.
///
/// Returns [`DISCONNECTED_CELSIUS`] for codes that cannot come from a
/// connected thermistor.
#[must_use]
pub fn adc_to_celsius(adc: u16) -> f64 {
    if adc > DISCONNECTED_THRESHOLD || adc == 0 {
        return DISCONNECTED_CELSIUS;
    }

    let resistance = SERIES_RESISTOR_OHMS / (ADC_FULL_SCALE / f64::from(adc) - 1.0);
    let inverse_kelvin = (resistance / THERMISTOR_NOMINAL_OHMS).ln() / B_COEFFICIENT
        + 1.0 / (NOMINAL_CELSIUS + KELVIN_OFFSET);
    1.0 / inverse_kelvin - KELVIN_OFFSET
}

/// Converts degrees Celsius to the raw ADC code the board compares against.
#[must_use]
pub fn celsius_to_adc(celsius: f64) -> u16 {
    let exponent =
        (1.0 / (celsius + KELVIN_OFFSET) - 1.0 / (NOMINAL_CELSIUS + KELVIN_OFFSET)) * B_COEFFICIENT;
    let resistance = exponent.exp() * THERMISTOR_NOMINAL_OHMS;
    let adc = ADC_FULL_SCALE / (SERIES_RESISTOR_OHMS / resistance + 1.0);
    adc.round().clamp(0.0, ADC_FULL_SCALE) as u16
}
