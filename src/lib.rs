//! # leddriver
//!
//! A Rust host-side library for USB LED driver boards.
//!
//! This library provides async communication with LED drivers over USB/Serial.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - COBS framing with prefix-based routing of replies
//! - Checksummed configuration and sync records
//! - Raw stream transfers with deadlines
//! - Rate-limited controller status on a `watch` channel
//!
//! ## Quick Start
//!
//! ```no_run
//! use leddriver::LedDriver;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), leddriver::Error> {
//!     // Connect to an LED driver
//!     let mut driver = LedDriver::serial("/dev/ttyACM0");
//!     let id = driver.connect().await?;
//!     println!("Connected to: {id}");
//!
//!     // Read the driver configuration
//!     let config = driver.download_configuration().await?;
//!     println!("Driver name: {}", config.name);
//!
//!     // Follow the controller
//!     let mut status = driver.status();
//!     status.changed().await.ok();
//!     println!("Left encoder: {}", status.borrow().left.encoder);
//!
//!     driver.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Framing, prefixes, checksum, receive assembly and routing
//! - [`types`] - Records and their scaling (configuration, sync, status)
//! - [`transport`] - Transport implementations (currently USB/Serial)
//! - [`event`] - Event broadcast and the status emitter
//! - [`commands`] - Request/reply operations and the heartbeat timer
//! - [`client`] - High-level [`LedDriver`] session

pub mod client;
pub mod commands;
pub mod error;
pub mod event;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{LedDriver, SessionConfig, SessionState};
pub use commands::{AudioTest, CommandHandler, HEARTBEAT_INTERVAL};
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, EventFilter, Subscription};
pub use protocol::Prefix;
pub use transport::{
    DisconnectReason, DriverPort, PortFilter, SerialConfig, SerialTransport, Transport,
    TransportEvent, discover_ports,
};
pub use types::{
    AlarmPattern, BoardLayout, ChannelConfig, ControllerStatus, DriverConfiguration,
    OutputSettings, Side, SideStatus, StatusSample, SyncConfiguration,
};
