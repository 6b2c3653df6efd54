//! Serial/USB transport implementation.
//!
//! This module provides serial port communication for LED drivers
//! connected via USB, and discovery of candidate ports.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use crate::error::{Error, Result};
use crate::transport::{
    DisconnectReason, INBOUND_CAPACITY, Transport, TransportEvent, classify_io_error,
};

/// Default baud rate for LED drivers.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default connection delay.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(300);

/// How long stale bytes are drained after opening.
pub const DRAIN_DURATION: Duration = Duration::from_millis(500);

/// How long a write may wait for the port to drain.
pub const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// USB vendor id of the driver's microcontroller.
pub const VENDOR_ID: u16 = 0x239A;

/// USB product id of the driver's microcontroller.
pub const PRODUCT_ID: u16 = 0x800E;

/// Pattern of custom driver serial numbers.
pub const SERIAL_PATTERN: &str = "MHZ_LED[A-Z0-9_-]{2}";

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyACM0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Delay after opening before stale bytes are drained.
    pub connection_delay: Duration,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }
}

/// Serial transport for LED drivers.
///
/// The stream is split: a background task owns the read half and feeds the
/// inbound channel, writes go straight to the write half.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    read_task: Option<JoinHandle<()>>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            read_task: None,
            events: None,
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Forwards inbound bytes until the port fails or the receiver is dropped.
    async fn run_read_loop(mut reader: ReadHalf<SerialStream>, events: mpsc::Sender<TransportEvent>) {
        let mut buf = [0u8; 1024];

        let reason = loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("serial port closed");
                    break DisconnectReason::ResourceUnavailable;
                }
                Ok(n) => {
                    tracing::trace!("received {} bytes: {}", n, hex::encode(&buf[..n]));
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if events.send(TransportEvent::Data(data)).await.is_err() {
                        tracing::debug!("inbound receiver dropped");
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("serial read error: {}", e);
                    break classify_io_error(&e);
                }
            }
        };

        let _ = events.send(TransportEvent::Closed(reason)).await;
    }

    /// Tears the link down after a write failure and reports it inbound.
    fn fail(&mut self, err: &io::Error) -> Error {
        let reason = classify_io_error(err);
        tracing::warn!("serial write failed ({}): {}", reason, err);

        self.writer = None;
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(events) = self.events.take() {
            let _ = events.try_send(TransportEvent::Closed(reason));
        }
        Error::Disconnected(reason)
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        self.writer = None;
        self.events = None;
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>>> {
        Box::pin(async move {
            if self.writer.is_some() {
                self.shutdown();
            }

            tracing::info!("opening serial port: {}", self.config.port);

            let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .open_native_async()
                .map_err(Error::Serial)?;

            // The board only talks back once both lines are asserted.
            if let Err(e) = tokio_serial::SerialPort::write_data_terminal_ready(&mut stream, true)
            {
                tracing::warn!("failed to set DTR: {}", e);
            }
            if let Err(e) = tokio_serial::SerialPort::write_request_to_send(&mut stream, true) {
                tracing::warn!("failed to set RTS: {}", e);
            }

            tokio::time::sleep(self.config.connection_delay).await;

            let mut buf = [0u8; 1024];
            let mut total_drained = 0usize;

            let drain_deadline = tokio::time::Instant::now() + DRAIN_DURATION;
            while tokio::time::Instant::now() < drain_deadline {
                match tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await {
                    Ok(Ok(n)) if n > 0 => {
                        total_drained += n;
                    }
                    _ => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }

            if total_drained > 0 {
                tracing::debug!("drained {} stale bytes from buffer", total_drained);
            }

            let (reader, writer) = tokio::io::split(stream);
            let (events_tx, events_rx) = mpsc::channel(INBOUND_CAPACITY);

            self.read_task = Some(tokio::spawn(Self::run_read_loop(
                reader,
                events_tx.clone(),
            )));
            self.writer = Some(writer);
            self.events = Some(events_tx);

            tracing::info!("serial port open: {}", self.config.port);
            Ok(events_rx)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.writer.is_some() || self.read_task.is_some() {
                tracing::info!("closing serial port: {}", self.config.port);
                self.shutdown();
            }
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;

            let mut written = 0;
            while written < data.len() {
                match writer.write(&data[written..]).await {
                    Ok(0) => break,
                    Ok(n) => written += n,
                    Err(e) => return Err(self.fail(&e)),
                }
            }

            if written < data.len() {
                return Err(Error::WriteIncomplete {
                    written,
                    expected: data.len(),
                });
            }

            match tokio::time::timeout(WRITE_DRAIN_TIMEOUT, writer.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                    tracing::debug!("ignoring write drain timeout: {}", e);
                }
                Err(_) => {
                    tracing::debug!("write drain did not finish in {:?}", WRITE_DRAIN_TIMEOUT);
                }
                Ok(Err(e)) => return Err(self.fail(&e)),
            }

            Ok(written)
        })
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
            && self
                .read_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    fn name(&self) -> &str {
        &self.config.port
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// A USB serial port that may host an LED driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPort {
    /// Port path.
    pub path: String,
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// USB serial number, if reported.
    pub serial_number: Option<String>,
}

/// Criteria for picking driver ports out of the system's serial ports.
#[derive(Debug, Clone)]
pub struct PortFilter {
    /// Required USB vendor id.
    pub vendor_id: u16,
    /// Required USB product id.
    pub product_id: u16,
    /// Regular expression found in custom serial numbers.
    pub serial_pattern: String,
}

impl Default for PortFilter {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            serial_pattern: SERIAL_PATTERN.to_string(),
        }
    }
}

impl PortFilter {
    /// Sets the USB ids.
    #[must_use]
    pub const fn usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    /// Sets the custom serial number pattern.
    #[must_use]
    pub fn serial_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.serial_pattern = pattern.into();
        self
    }

    /// Compiles the custom serial number pattern.
    pub fn serial_regex(&self) -> Result<Regex> {
        Ok(Regex::new(&self.serial_pattern)?)
    }

    /// Keeps the ports with matching USB ids.
    ///
    /// If any of them carries a custom serial number, only those are kept.
    pub fn select(&self, ports: Vec<DriverPort>) -> Result<Vec<DriverPort>> {
        let pattern = self.serial_regex()?;
        let matching: Vec<DriverPort> = ports
            .into_iter()
            .filter(|p| p.vendor_id == self.vendor_id && p.product_id == self.product_id)
            .collect();

        let custom: Vec<DriverPort> = matching
            .iter()
            .filter(|p| {
                p.serial_number
                    .as_deref()
                    .is_some_and(|s| custom_serial(&pattern, s).is_some())
            })
            .cloned()
            .collect();

        Ok(if custom.is_empty() { matching } else { custom })
    }
}

/// Finds a custom serial number inside `serial`.
#[must_use]
pub fn custom_serial<'a>(pattern: &Regex, serial: &'a str) -> Option<&'a str> {
    pattern.find(serial).map(|m| m.as_str())
}

/// Lists serial ports that may host an LED driver.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn discover_ports(filter: &PortFilter) -> Result<Vec<DriverPort>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;

    let usb_ports = ports
        .into_iter()
        .filter_map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => Some(DriverPort {
                path: p.port_name,
                vendor_id: usb.vid,
                product_id: usb.pid,
                serial_number: usb.serial_number,
            }),
            _ => None,
        })
        .collect();

    let selected = filter.select(usb_ports)?;
    tracing::debug!("found {} candidate driver ports", selected.len());
    Ok(selected)
}
