//! Data types exchanged with the LED driver.
//!
//! This module contains the binary records and their codecs:
//! - Driver configuration
//! - Sync configuration
//! - Controller status telemetry
//! - Unit scaling and thermistor conversion

pub mod config;
pub mod record;
pub mod scale;
pub mod status;
pub mod sync;
pub mod thermistor;

pub use config::{AlarmPattern, ChannelConfig, DriverConfiguration};
pub use record::{BoardLayout, RecordKind};
pub use status::{ControllerStatus, Side, SideStatus, StatusSample};
pub use sync::{ConfocalSync, DigitalSync, OutputSettings, SyncConfiguration};
