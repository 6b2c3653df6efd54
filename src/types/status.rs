//! Controller status telemetry.
//!
//! The board streams short samples describing the hand controller: two
//! pushbuttons, two toggle switches, their indicator LEDs, the built-in LED
//! and two rotary encoders.
//!
//! Format:
//! ```text
//! [bits:1] [left encoder delta:2 LE, signed] [right encoder delta:2 LE, signed]
//!
//! bit 0: left button    bit 1: right button
//! bit 2: left switch    bit 3: right switch
//! bit 4: left LED       bit 5: right LED
//! bit 6: built-in LED
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::RecordKind;

/// Length of one telemetry sample.
pub const SAMPLE_LEN: usize = 5;

const BUTTON_LEFT: u8 = 1 << 0;
const BUTTON_RIGHT: u8 = 1 << 1;
const SWITCH_LEFT: u8 = 1 << 2;
const SWITCH_RIGHT: u8 = 1 << 3;
const LED_LEFT: u8 = 1 << 4;
const LED_RIGHT: u8 = 1 << 5;
const LED_BUILTIN: u8 = 1 << 6;

/// Controller side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Left-hand control.
    Left,
    /// Right-hand control.
    Right,
}

/// One telemetry sample as sent by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSample {
    /// Discrete input and indicator bits.
    pub bits: u8,
    /// Left encoder movement since the previous sample.
    pub encoder_left: i16,
    /// Right encoder movement since the previous sample.
    pub encoder_right: i16,
}

impl StatusSample {
    /// Parses a sample from a telemetry frame body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != SAMPLE_LEN {
            return Err(Error::InvalidRecord {
                record: RecordKind::Telemetry,
                reason: format!("expected {SAMPLE_LEN} bytes, found {}", data.len()),
            });
        }

        let mut cursor = data;
        Ok(Self {
            bits: cursor.get_u8(),
            encoder_left: cursor.get_i16_le(),
            encoder_right: cursor.get_i16_le(),
        })
    }

    /// Serializes the sample.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SAMPLE_LEN);
        buf.put_u8(self.bits);
        buf.put_i16_le(self.encoder_left);
        buf.put_i16_le(self.encoder_right);
        buf.freeze()
    }

    /// Returns true if the button on `side` is pressed.
    #[must_use]
    pub const fn button(&self, side: Side) -> bool {
        self.bit(match side {
            Side::Left => BUTTON_LEFT,
            Side::Right => BUTTON_RIGHT,
        })
    }

    /// Returns true if the switch on `side` is on.
    #[must_use]
    pub const fn switch(&self, side: Side) -> bool {
        self.bit(match side {
            Side::Left => SWITCH_LEFT,
            Side::Right => SWITCH_RIGHT,
        })
    }

    /// Returns true if the indicator LED on `side` is lit.
    #[must_use]
    pub const fn led(&self, side: Side) -> bool {
        self.bit(match side {
            Side::Left => LED_LEFT,
            Side::Right => LED_RIGHT,
        })
    }

    /// Returns true if the built-in LED is lit.
    #[must_use]
    pub const fn builtin_led(&self) -> bool {
        self.bit(LED_BUILTIN)
    }

    const fn bit(&self, mask: u8) -> bool {
        self.bits & mask != 0
    }
}

/// State of one side of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SideStatus {
    /// Pushbutton pressed.
    pub button: bool,
    /// Toggle switch on.
    pub switch: bool,
    /// Indicator LED lit.
    pub led: bool,
    /// Accumulated encoder position.
    pub encoder: i16,
}

/// Latest known controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerStatus {
    /// Left-hand controls.
    pub left: SideStatus,
    /// Right-hand controls.
    pub right: SideStatus,
    /// Built-in LED lit.
    pub builtin_led: bool,
}

impl ControllerStatus {
    /// Returns the state of one side.
    #[must_use]
    pub const fn side(&self, side: Side) -> &SideStatus {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Folds a sample into the state.
    ///
    /// Returns true on a logical change: a button or switch flipped, or an
    /// encoder position moved. Indicator LEDs are mirrored silently.
    pub fn apply(&mut self, sample: &StatusSample) -> bool {
        let mut changed = false;

        for (state, side, delta) in [
            (&mut self.left, Side::Left, sample.encoder_left),
            (&mut self.right, Side::Right, sample.encoder_right),
        ] {
            let button = sample.button(side);
            let switch = sample.switch(side);
            let encoder = state.encoder.saturating_add(delta);

            changed |= state.button != button || state.switch != switch || state.encoder != encoder;

            state.button = button;
            state.switch = switch;
            state.led = sample.led(side);
            state.encoder = encoder;
        }

        self.builtin_led = sample.builtin_led();
        changed
    }

    /// Sets both encoder positions back to zero.
    pub fn reset_encoders(&mut self) {
        self.left.encoder = 0;
        self.right.encoder = 0;
    }
}
