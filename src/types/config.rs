//! Driver configuration record.
//!
//! Format (little-endian, packed, `N` = boards × channels per board):
//! ```text
//! [name:L] [NUL]
//! N × ([channel id:L] [NUL])
//! N × [active:1]
//! N × [current limit:2]
//! [reserved:1]
//! [temp warn:2] [temp fault:2] [fan min:2] [fan max:2]
//! [status volume:1] [alarm volume:1] [indicator:1] [alarm pattern:1]
//! [checksum:1]
//! ```
//! Strings are padded with spaces to `L` characters. Temperatures travel as
//! raw thermistor ADC codes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::record::{self, BoardLayout, RecordKind};
use crate::types::{scale, thermistor};

/// Fixed bytes after the per-channel block, checksum included.
const TRAILER_LEN: usize = 1 + 4 * 2 + 4 + 1;

/// Light pattern shown by the pushbutton LEDs on an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AlarmPattern {
    /// No indication.
    #[default]
    Disabled = 0,
    /// Both LEDs flash together.
    Flash = 1,
    /// LEDs alternate.
    Chase = 2,
    /// LEDs stay lit.
    Solid = 3,
}

impl AlarmPattern {
    /// Parses a pattern from its wire index.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Disabled),
            1 => Some(Self::Flash),
            2 => Some(Self::Chase),
            3 => Some(Self::Solid),
            _ => None,
        }
    }
}

/// Settings of one LED channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Channel identifier shown to users.
    pub id: String,
    /// Whether the channel may be driven.
    pub active: bool,
    /// Current limit in percent of full scale.
    pub current_limit: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            active: true,
            current_limit: 100.0,
        }
    }
}

/// Persistent driver configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfiguration {
    /// Driver name.
    pub name: String,
    /// Channel settings, board-major.
    pub channels: Vec<ChannelConfig>,
    /// Reserved flag (simultaneous channel mode on newer firmware).
    pub simultaneous: bool,
    /// Temperature warning threshold in °C.
    pub temperature_warn: f64,
    /// Temperature fault threshold in °C.
    pub temperature_fault: f64,
    /// Temperature at which the fan starts, in °C.
    pub fan_min: f64,
    /// Temperature at which the fan runs at full speed, in °C.
    pub fan_max: f64,
    /// Volume of status tones.
    pub status_volume: u8,
    /// Volume of alarm tones.
    pub alarm_volume: u8,
    /// Whether the pushbutton LEDs indicate channel state.
    pub indicator: bool,
    /// Pushbutton pattern on alarm.
    pub alarm_pattern: AlarmPattern,
}

impl DriverConfiguration {
    /// Creates a configuration with default settings for `layout`.
    #[must_use]
    pub fn new(layout: &BoardLayout) -> Self {
        let channels = (0..layout.channel_count())
            .map(|i| ChannelConfig {
                id: format!(
                    "LED{}{}",
                    i / layout.channels_per_board + 1,
                    i % layout.channels_per_board + 1
                ),
                ..ChannelConfig::default()
            })
            .collect();

        Self {
            name: String::new(),
            channels,
            simultaneous: false,
            temperature_warn: 60.0,
            temperature_fault: 80.0,
            fan_min: 30.0,
            fan_max: 50.0,
            status_volume: 0,
            alarm_volume: 0,
            indicator: false,
            alarm_pattern: AlarmPattern::Disabled,
        }
    }

    /// Returns one channel by board and channel index (both zero-based).
    #[must_use]
    pub fn channel(
        &self,
        layout: &BoardLayout,
        board: usize,
        channel: usize,
    ) -> Option<&ChannelConfig> {
        if channel >= layout.channels_per_board {
            return None;
        }
        self.channels.get(board * layout.channels_per_board + channel)
    }

    /// Encodes the record, checksummed for sending under `prefix`.
    ///
    /// The prefix byte itself is not included.
    pub fn encode(&self, layout: &BoardLayout, prefix: u8) -> Result<Bytes> {
        let count = layout.channel_count();
        if self.channels.len() != count {
            return Err(Error::InvalidRecord {
                record: RecordKind::Configuration,
                reason: format!("{} channels for a {count}-channel driver", self.channels.len()),
            });
        }

        let mut buf = BytesMut::with_capacity((layout.name_len + 1) * (count + 1) + count * 3 + TRAILER_LEN);

        record::put_padded_str(&mut buf, &self.name, layout.name_len);
        for channel in &self.channels {
            record::put_padded_str(&mut buf, &channel.id, layout.name_len);
        }
        for channel in &self.channels {
            buf.put_u8(u8::from(channel.active));
        }
        for channel in &self.channels {
            buf.put_u16_le(scale::percent_to_u16(channel.current_limit));
        }

        buf.put_u8(u8::from(self.simultaneous));
        buf.put_u16_le(thermistor::celsius_to_adc(self.temperature_warn));
        buf.put_u16_le(thermistor::celsius_to_adc(self.temperature_fault));
        buf.put_u16_le(thermistor::celsius_to_adc(self.fan_min));
        buf.put_u16_le(thermistor::celsius_to_adc(self.fan_max));
        buf.put_u8(self.status_volume);
        buf.put_u8(self.alarm_volume);
        buf.put_u8(u8::from(self.indicator));
        buf.put_u8(self.alarm_pattern as u8);

        record::seal(&mut buf, prefix);
        Ok(buf.freeze())
    }

    /// Decodes a record received under `prefix` (prefix byte excluded).
    pub fn decode(layout: &BoardLayout, prefix: u8, data: &[u8]) -> Result<Self> {
        const KIND: RecordKind = RecordKind::Configuration;

        record::verify(data, prefix, KIND)?;

        let count = layout.channel_count();
        let mut cursor = data;

        let name = record::get_padded_str(&mut cursor, KIND)?;
        let ids = (0..count)
            .map(|_| record::get_padded_str(&mut cursor, KIND))
            .collect::<Result<Vec<_>>>()?;

        record::expect_remaining(cursor, count * 3 + TRAILER_LEN, KIND)?;

        let active: Vec<bool> = (0..count).map(|_| cursor.get_u8() != 0).collect();
        let limits: Vec<f64> = (0..count)
            .map(|_| scale::u16_to_percent(cursor.get_u16_le()))
            .collect();

        let channels = ids
            .into_iter()
            .zip(active)
            .zip(limits)
            .map(|((id, active), current_limit)| ChannelConfig {
                id,
                active,
                current_limit,
            })
            .collect();

        let simultaneous = cursor.get_u8() != 0;
        let temperature_warn = thermistor::adc_to_celsius(cursor.get_u16_le());
        let temperature_fault = thermistor::adc_to_celsius(cursor.get_u16_le());
        let fan_min = thermistor::adc_to_celsius(cursor.get_u16_le());
        let fan_max = thermistor::adc_to_celsius(cursor.get_u16_le());
        let status_volume = cursor.get_u8();
        let alarm_volume = cursor.get_u8();
        let indicator = cursor.get_u8() != 0;
        let pattern_byte = cursor.get_u8();
        let alarm_pattern =
            AlarmPattern::from_byte(pattern_byte).ok_or_else(|| Error::InvalidRecord {
                record: KIND,
                reason: format!("unknown alarm pattern {pattern_byte}"),
            })?;

        Ok(Self {
            name,
            channels,
            simultaneous,
            temperature_warn,
            temperature_fault,
            fan_min,
            fan_max,
            status_volume,
            alarm_volume,
            indicator,
            alarm_pattern,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Prefix, checksum};

    fn sample(layout: &BoardLayout) -> DriverConfiguration {
        let mut config = DriverConfiguration::new(layout);
        config.name = "Bench rig".into();
        for channel in &mut config.channels {
            channel.current_limit = 50.0;
        }
        config.channels[1].active = false;
        config.status_volume = 40;
        config.alarm_volume = 90;
        config.indicator = true;
        config.alarm_pattern = AlarmPattern::Chase;
        config
    }

    #[test]
    fn test_round_trip_with_inactive_channel() {
        let layout = BoardLayout::default();
        let config = sample(&layout);
        let upload = u8::from(Prefix::UploadConfig);

        let bytes = config.encode(&layout, upload).unwrap();
        assert_eq!(bytes.len(), 17 * 13 + 12 * 3 + 14);
        assert!(checksum::validate(&bytes, upload));

        // Current limits start right after the name, ids and active flags.
        let limits = 17 * 13 + 12;
        assert_eq!(&bytes[limits..limits + 2], &32768u16.to_le_bytes());

        let decoded = DriverConfiguration::decode(&layout, upload, &bytes).unwrap();
        assert_eq!(decoded.name, "Bench rig");
        assert_eq!(decoded.channels.len(), 12);
        assert_eq!(decoded.channels[0].id, "LED11");
        assert_eq!(decoded.channels[11].id, "LED34");
        assert!(!decoded.channels[1].active);
        for channel in &decoded.channels {
            assert!((channel.current_limit - 50.0).abs() <= 100.0 / 65535.0);
        }
        assert!((decoded.temperature_warn - 60.0).abs() < 0.05);
        assert!((decoded.fan_max - 50.0).abs() < 0.05);
        assert_eq!(decoded.status_volume, 40);
        assert_eq!(decoded.alarm_volume, 90);
        assert!(decoded.indicator);
        assert_eq!(decoded.alarm_pattern, AlarmPattern::Chase);
    }

    #[test]
    fn test_three_by_four_all_active_at_half_current() {
        let layout = BoardLayout::default();
        let mut config = DriverConfiguration::new(&layout);
        for channel in &mut config.channels {
            channel.active = true;
            channel.current_limit = 50.0;
        }
        let upload = u8::from(Prefix::UploadConfig);

        let bytes = config.encode(&layout, upload).unwrap();
        assert!(checksum::validate(&bytes, upload));

        let decoded = DriverConfiguration::decode(&layout, upload, &bytes).unwrap();
        assert_eq!(decoded.channels.len(), 12);
        assert!(decoded.channels.iter().all(|c| c.active));
        for channel in &decoded.channels {
            assert!((channel.current_limit - 50.0).abs() <= 100.0 / 65535.0);
        }
    }

    #[test]
    fn test_checksum_mismatch_is_reported() {
        let layout = BoardLayout::default();
        let mut bytes = BytesMut::from(&sample(&layout).encode(&layout, 2).unwrap()[..]);
        bytes[0] ^= 0x01;

        let err = DriverConfiguration::decode(&layout, 2, &bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                record: RecordKind::Configuration,
                ..
            }
        ));
    }

    #[test]
    fn test_wrong_prefix_fails_checksum() {
        let layout = BoardLayout::default();
        let bytes = sample(&layout).encode(&layout, 3).unwrap();
        assert!(DriverConfiguration::decode(&layout, 2, &bytes).is_err());
    }

    #[test]
    fn test_layout_mismatch() {
        let layout = BoardLayout::default();
        let small = BoardLayout::new(1, 4);
        let bytes = sample(&layout).encode(&layout, 2).unwrap();

        let err = DriverConfiguration::decode(&small, 2, &bytes).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { .. }));

        let err = sample(&small).encode(&layout, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { .. }));
    }

    #[test]
    fn test_long_names_are_truncated() {
        let layout = BoardLayout::new(1, 1);
        let mut config = DriverConfiguration::new(&layout);
        config.name = "An unusually long driver name".into();

        let bytes = config.encode(&layout, 2).unwrap();
        let decoded = DriverConfiguration::decode(&layout, 2, &bytes).unwrap();
        assert_eq!(decoded.name, "An unusually lon");
    }

    #[test]
    fn test_channel_lookup() {
        let layout = BoardLayout::default();
        let config = DriverConfiguration::new(&layout);
        assert_eq!(config.channel(&layout, 2, 1).unwrap().id, "LED32");
        assert!(config.channel(&layout, 0, 4).is_none());
        assert!(config.channel(&layout, 3, 0).is_none());
    }
}
