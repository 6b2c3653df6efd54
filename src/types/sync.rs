//! Sync configuration record.
//!
//! The sync record selects how the driver reacts to external triggers
//! (digital input edges, analog selectors, or a confocal scanner) and what
//! it outputs in each state.
//!
//! Format (little-endian, packed, `B` = number of boards). Paired fields are
//! interleaved: every low/standby value is followed by its high/scanning
//! counterpart.
//! ```text
//! [mode:1] [input channel:1]
//! [mode:1×2] [channel:1×2] [pwm:2×2] [current:2×2] [duration µs:4×2]
//! B × [analog selector:1]
//! [shutter:1] [channel:1] [line:1] [digital:1] [polarity:1]
//! [threshold:2] [delay mode:1] [period cycles:4] [delay cycles:4×3]
//! [mode:1×2] [channel:1×2] [pwm:2×2] [current:2×2] [duration µs:4×2]
//! [checksum:1]
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::record::{self, BoardLayout, RecordKind};
use crate::types::scale;

/// Bytes in one interleaved pair of output settings.
const OUTPUT_PAIR_LEN: usize = 2 * (1 + 1 + 2 + 2 + 4);

/// Bytes in the confocal block.
const CONFOCAL_LEN: usize = 5 + 2 + 1 + 4 + 3 * 4 + OUTPUT_PAIR_LEN;

/// What the driver outputs in one trigger state.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    /// Output mode index.
    pub mode: u8,
    /// LED channel, numbered board-major across all boards.
    pub channel: u8,
    /// PWM duty cycle in percent.
    pub pwm: f64,
    /// Current in percent of the channel limit.
    pub current: f64,
    /// How long the output is held.
    pub duration: Duration,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            mode: 0,
            channel: 0,
            pwm: 0.0,
            current: 0.0,
            duration: Duration::ZERO,
        }
    }
}

/// Digital input trigger settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DigitalSync {
    /// Input connector that carries the trigger.
    pub input_channel: u8,
    /// Output while the input is low.
    pub low: OutputSettings,
    /// Output while the input is high.
    pub high: OutputSettings,
}

/// Confocal scanner trigger settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfocalSync {
    /// Shutter input selector.
    pub shutter: u8,
    /// Scanner input channel.
    pub channel: u8,
    /// Line sync source selector.
    pub line: u8,
    /// Digital or analog line detection.
    pub digital: u8,
    /// Active line polarity.
    pub polarity: u8,
    /// Analog line detection threshold in volts.
    pub threshold: f64,
    /// Delay mode selector.
    pub delay_mode: u8,
    /// Scan line period in µs.
    pub period: f64,
    /// Delays within the line in µs.
    pub delays: [f64; 3],
    /// Output while the scanner is idle.
    pub standby: OutputSettings,
    /// Output while the scanner is scanning.
    pub scanning: OutputSettings,
}

/// Trigger configuration of the driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncConfiguration {
    /// Active trigger mode index.
    pub mode: u8,
    /// Digital trigger settings.
    pub digital: DigitalSync,
    /// Analog selector per board.
    pub analog: Vec<u8>,
    /// Confocal trigger settings.
    pub confocal: ConfocalSync,
}

fn put_output_pair(buf: &mut BytesMut, first: &OutputSettings, second: &OutputSettings) {
    buf.put_u8(first.mode);
    buf.put_u8(second.mode);
    buf.put_u8(first.channel);
    buf.put_u8(second.channel);
    buf.put_u16_le(scale::percent_to_u16(first.pwm));
    buf.put_u16_le(scale::percent_to_u16(second.pwm));
    buf.put_u16_le(scale::percent_to_u16(first.current));
    buf.put_u16_le(scale::percent_to_u16(second.current));
    buf.put_u32_le(scale::duration_to_micros(first.duration));
    buf.put_u32_le(scale::duration_to_micros(second.duration));
}

fn get_output_pair(cursor: &mut &[u8]) -> (OutputSettings, OutputSettings) {
    let mut first = OutputSettings {
        mode: cursor.get_u8(),
        ..OutputSettings::default()
    };
    let mut second = OutputSettings {
        mode: cursor.get_u8(),
        ..OutputSettings::default()
    };
    first.channel = cursor.get_u8();
    second.channel = cursor.get_u8();
    first.pwm = scale::u16_to_percent(cursor.get_u16_le());
    second.pwm = scale::u16_to_percent(cursor.get_u16_le());
    first.current = scale::u16_to_percent(cursor.get_u16_le());
    second.current = scale::u16_to_percent(cursor.get_u16_le());
    first.duration = scale::micros_to_duration(cursor.get_u32_le());
    second.duration = scale::micros_to_duration(cursor.get_u32_le());
    (first, second)
}

impl SyncConfiguration {
    /// Creates a default sync configuration for `layout`.
    #[must_use]
    pub fn new(layout: &BoardLayout) -> Self {
        Self {
            analog: vec![0; layout.boards],
            ..Self::default()
        }
    }

    /// Length of the encoded record, checksum included.
    #[must_use]
    pub const fn record_len(layout: &BoardLayout) -> usize {
        2 + OUTPUT_PAIR_LEN + layout.boards + CONFOCAL_LEN + 1
    }

    /// Encodes the record, checksummed for sending under `prefix`.
    pub fn encode(&self, layout: &BoardLayout, prefix: u8) -> Result<Bytes> {
        if self.analog.len() != layout.boards {
            return Err(Error::InvalidRecord {
                record: RecordKind::Sync,
                reason: format!(
                    "{} analog selectors for {} boards",
                    self.analog.len(),
                    layout.boards
                ),
            });
        }

        let mut buf = BytesMut::with_capacity(Self::record_len(layout));

        buf.put_u8(self.mode);
        buf.put_u8(self.digital.input_channel);
        put_output_pair(&mut buf, &self.digital.low, &self.digital.high);

        buf.put_slice(&self.analog);

        let confocal = &self.confocal;
        buf.put_u8(confocal.shutter);
        buf.put_u8(confocal.channel);
        buf.put_u8(confocal.line);
        buf.put_u8(confocal.digital);
        buf.put_u8(confocal.polarity);
        buf.put_u16_le(scale::volts_to_u16(confocal.threshold));
        buf.put_u8(confocal.delay_mode);
        buf.put_u32_le(scale::micros_to_cycles(confocal.period));
        for delay in confocal.delays {
            buf.put_u32_le(scale::micros_to_cycles(delay));
        }
        put_output_pair(&mut buf, &confocal.standby, &confocal.scanning);

        record::seal(&mut buf, prefix);
        Ok(buf.freeze())
    }

    /// Decodes a record received under `prefix` (prefix byte excluded).
    pub fn decode(layout: &BoardLayout, prefix: u8, data: &[u8]) -> Result<Self> {
        record::verify(data, prefix, RecordKind::Sync)?;
        record::expect_remaining(data, Self::record_len(layout), RecordKind::Sync)?;

        let mut cursor = data;

        let mode = cursor.get_u8();
        let input_channel = cursor.get_u8();
        let (low, high) = get_output_pair(&mut cursor);

        let analog = cursor[..layout.boards].to_vec();
        cursor.advance(layout.boards);

        let shutter = cursor.get_u8();
        let channel = cursor.get_u8();
        let line = cursor.get_u8();
        let digital = cursor.get_u8();
        let polarity = cursor.get_u8();
        let threshold = scale::u16_to_volts(cursor.get_u16_le());
        let delay_mode = cursor.get_u8();
        let period = scale::cycles_to_micros(cursor.get_u32_le());
        let delays = [
            scale::cycles_to_micros(cursor.get_u32_le()),
            scale::cycles_to_micros(cursor.get_u32_le()),
            scale::cycles_to_micros(cursor.get_u32_le()),
        ];
        let (standby, scanning) = get_output_pair(&mut cursor);

        Ok(Self {
            mode,
            digital: DigitalSync {
                input_channel,
                low,
                high,
            },
            analog,
            confocal: ConfocalSync {
                shutter,
                channel,
                line,
                digital,
                polarity,
                threshold,
                delay_mode,
                period,
                delays,
                standby,
                scanning,
            },
        })
    }
}
