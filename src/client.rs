//! Main [`LedDriver`] client implementation.
//!
//! This module provides the high-level [`LedDriver`] client that combines
//! transport, frame processing, heartbeat and commands into a session.
//!
//! All inbound traffic is handled by one processing task per connection.
//! It owns the receive assembler, the router and the status emitter, so a
//! frame is always fully dispatched before the next bytes are parsed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::commands::{
    CommandHandler, Control, ControlSender, HEARTBEAT_INTERVAL, HeartbeatTimer,
    REPLY_TIMEOUT_BASE,
};
use crate::error::{Error, Result};
use crate::event::{
    Event, EventDispatcher, EventFilter, STATUS_EMIT_INTERVAL, StatusEmitter, Subscription,
};
use crate::protocol::{Assembled, CommandRouter, PendingReply, Prefix, ReceiveAssembler};
use crate::transport::{
    DisconnectReason, PortFilter, SerialConfig, SerialTransport, Transport, TransportEvent,
    discover_ports,
};
use crate::types::{BoardLayout, ControllerStatus, DriverConfiguration, SyncConfiguration};

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

const CONTROL_CAPACITY: usize = 16;

/// Current wall-clock time as seconds, counted in local time.
///
/// The board has no notion of time zones, so it is given the local time as
/// if it were UTC.
fn local_timestamp() -> u32 {
    let local = chrono::Local::now().naive_local().and_utc().timestamp();
    u32::try_from(local).unwrap_or(0)
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No link.
    Disconnected,
    /// Link open, identity not yet confirmed.
    Handshaking,
    /// Handshake done; heartbeats are running.
    Connected,
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Base time to wait for a reply.
    pub reply_timeout: Duration,
    /// Shape of the driver hardware.
    pub layout: BoardLayout,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reply_timeout: REPLY_TIMEOUT_BASE,
            layout: BoardLayout::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the base reply timeout.
    #[must_use]
    pub const fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Sets the board layout.
    #[must_use]
    pub const fn layout(mut self, layout: BoardLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Sets the event channel capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Client for communicating with an LED driver.
pub struct LedDriver<T> {
    transport: Arc<Mutex<T>>,
    dispatcher: EventDispatcher,
    commands: CommandHandler<T>,
    config: SessionConfig,

    // Shared with the processing task
    state: Arc<watch::Sender<SessionState>>,
    status: Arc<watch::Sender<ControllerStatus>>,
    pending: PendingReply,
    heartbeat: HeartbeatTimer,
    control: ControlSender,
    dropped: Arc<AtomicU64>,

    driver_id: Option<String>,
    process_task: Option<JoinHandle<()>>,
}

impl LedDriver<SerialTransport> {
    /// Creates a new client for a serial port.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g., "/dev/ttyACM0")
    ///
    /// # Returns
    ///
    /// A new client (not yet connected).
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_serial_config(SerialConfig::new(port))
    }

    /// Creates a new client with custom serial configuration.
    #[must_use]
    pub fn with_serial_config(config: SerialConfig) -> Self {
        Self::new(SerialTransport::new(config), SessionConfig::default())
    }

    /// Connects to the first LED driver found on the USB ports matching
    /// `filter`.
    pub async fn discover(filter: &PortFilter) -> Result<Self> {
        let ports = discover_ports(filter)?;
        tracing::debug!("{} candidate ports", ports.len());

        let candidates = ports
            .into_iter()
            .map(|port| SerialTransport::new(SerialConfig::new(port.path)));
        Self::connect_first(candidates, SessionConfig::default()).await
    }
}

impl<T: Transport + 'static> LedDriver<T> {
    /// Creates a new client with the given transport.
    #[must_use]
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let dispatcher = EventDispatcher::new(config.event_capacity);
        let transport = Arc::new(Mutex::new(transport));
        let pending: PendingReply = Arc::new(Mutex::new(None));
        let heartbeat = HeartbeatTimer::new();
        let control: ControlSender = Arc::new(Mutex::new(None));

        let mut commands = CommandHandler::new(
            Arc::clone(&transport),
            Arc::clone(&pending),
            heartbeat.clone(),
            config.layout,
            dispatcher.clone(),
            Arc::clone(&control),
        );
        commands.set_timeout(config.reply_timeout);

        let (state, _) = watch::channel(SessionState::Disconnected);
        let (status, _) = watch::channel(ControllerStatus::default());

        Self {
            transport,
            dispatcher,
            commands,
            config,
            state: Arc::new(state),
            status: Arc::new(status),
            pending,
            heartbeat,
            control,
            dropped: Arc::new(AtomicU64::new(0)),
            driver_id: None,
            process_task: None,
        }
    }

    /// Tries each candidate in turn and returns the first one that
    /// completes the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDriverFound`] if none of them does.
    pub async fn connect_first<I>(candidates: I, config: SessionConfig) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
    {
        for transport in candidates {
            let mut driver = Self::new(transport, config.clone());
            match driver.connect().await {
                Ok(id) => {
                    tracing::info!("found LED driver {:?}", id);
                    return Ok(driver);
                }
                Err(e) => tracing::debug!("skipping candidate: {}", e),
            }
        }
        Err(Error::NoDriverFound)
    }

    /// Connects to the driver and identifies it.
    ///
    /// This will:
    /// 1. Open the transport
    /// 2. Start the processing task
    /// 3. Exchange the handshake strings
    /// 4. Read the driver identity
    ///
    /// Returns the driver identity string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotADriver`] if the peer does not answer the
    /// handshake like an LED driver; the link is closed again.
    pub async fn connect(&mut self) -> Result<String> {
        if self.process_task.is_some() {
            self.teardown().await;
        }

        let (inbound, port) = {
            let mut transport = self.transport.lock().await;
            let inbound = transport.open().await?;
            (inbound, transport.name().to_string())
        };

        self.heartbeat.touch();
        self.state.send_replace(SessionState::Handshaking);
        self.start_processing(inbound).await;

        match self.commands.handshake().await {
            Ok(true) => {}
            Ok(false) | Err(Error::Timeout { .. } | Error::UnexpectedReply { .. }) => {
                tracing::warn!("{} did not answer the handshake", port);
                self.teardown().await;
                return Err(Error::NotADriver { port });
            }
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        }

        let driver_id = match self.commands.download_driver_id().await {
            Ok(id) => id,
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        };

        self.state.send_replace(SessionState::Connected);
        self.driver_id = Some(driver_id.clone());
        tracing::info!("connected to {:?} on {}", driver_id, port);
        self.dispatcher.dispatch(Event::Connected {
            port,
            driver_id: driver_id.clone(),
        });

        Ok(driver_id)
    }

    /// Spawns the processing task for a freshly opened link.
    async fn start_processing(&mut self, inbound: mpsc::Receiver<TransportEvent>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        *self.control.lock().await = Some(control_tx);

        let session = Session {
            inbound,
            control: control_rx,
            state_changes: self.state.subscribe(),
            assembler: ReceiveAssembler::new(Arc::clone(&self.dropped)),
            router: CommandRouter::new(
                self.config.layout,
                Arc::clone(&self.pending),
                self.dispatcher.clone(),
                Arc::clone(&self.dropped),
            ),
            emitter: StatusEmitter::new(Arc::clone(&self.status), STATUS_EMIT_INTERVAL),
            commands: self.commands.clone(),
            heartbeat: self.heartbeat.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            state: Arc::clone(&self.state),
            transport: Arc::clone(&self.transport),
            control_slot: Arc::clone(&self.control),
            dispatcher: self.dispatcher.clone(),
        };

        self.process_task = Some(tokio::spawn(session.run()));
    }

    /// Stops the processing task and closes the link without publishing.
    async fn teardown(&mut self) {
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
        self.control.lock().await.take();

        {
            let mut transport = self.transport.lock().await;
            if let Err(e) = transport.close().await {
                tracing::warn!("failed to close {}: {}", transport.name(), e);
            }
        }

        self.pending.lock().await.take();
        self.driver_id = None;
        self.state.send_replace(SessionState::Disconnected);
    }

    /// Disconnects from the driver.
    ///
    /// The board is told first, on a best-effort basis. The dropped-frame
    /// counter is kept.
    pub async fn disconnect(&mut self) -> Result<()> {
        let was_up = self.state() != SessionState::Disconnected;

        if self.state() == SessionState::Connected {
            if let Err(e) = self.commands.notify_disconnect().await {
                tracing::debug!("could not notify driver of disconnect: {}", e);
            }
        }

        self.teardown().await;

        if was_up {
            tracing::info!("disconnected");
            self.dispatcher.dispatch(Event::Disconnected {
                reason: DisconnectReason::Closed,
            });
        }

        Ok(())
    }

    /// Returns the session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches the session state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns true once the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Identity string of the connected driver.
    ///
    /// `None` once the session is down, including after a link loss.
    #[must_use]
    pub fn driver_id(&self) -> Option<&str> {
        self.driver_id.as_deref().filter(|_| self.is_connected())
    }

    /// Frames dropped since this client was created.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the command handler for direct command access.
    #[must_use]
    pub const fn commands(&self) -> &CommandHandler<T> {
        &self.commands
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe(None)
    }

    /// Subscribes to events matching `filter`.
    #[must_use]
    pub fn subscribe_filtered(&self, filter: EventFilter) -> Subscription {
        self.dispatcher.subscribe(Some(filter))
    }

    /// Watches the rate-limited controller status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }

    // ==================== High-Level Methods ====================

    /// Sets the board clock to the local wall-clock time.
    pub async fn sync_time(&self) -> Result<()> {
        self.commands.upload_time(local_timestamp()).await
    }

    /// Reads the driver configuration.
    pub async fn download_configuration(&self) -> Result<DriverConfiguration> {
        self.commands.download_configuration().await
    }

    /// Writes the driver configuration.
    pub async fn upload_configuration(&self, config: &DriverConfiguration) -> Result<()> {
        self.commands.upload_configuration(config).await
    }

    /// Reads the sync configuration.
    pub async fn download_sync(&self) -> Result<SyncConfiguration> {
        self.commands.download_sync().await
    }

    /// Writes the sync configuration.
    pub async fn upload_sync(&self, sync: &SyncConfiguration) -> Result<()> {
        self.commands.upload_sync(sync).await
    }

    /// Downloads a stream of `len` bytes.
    pub async fn download_stream(&self, len: u32) -> Result<Bytes> {
        self.commands.download_stream(len).await
    }

    /// Uploads `data` as a raw stream.
    pub async fn upload_stream(&self, data: Bytes) -> Result<()> {
        self.commands.upload_stream(data).await
    }

    /// Zeroes both encoder totals in the controller status.
    pub async fn reset_encoders(&self) -> Result<()> {
        self.commands.reset_encoders().await
    }
}

impl<T> Drop for LedDriver<T> {
    fn drop(&mut self) {
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
    }
}

/// State owned by the processing task.
struct Session<T> {
    inbound: mpsc::Receiver<TransportEvent>,
    control: mpsc::Receiver<Control>,
    state_changes: watch::Receiver<SessionState>,
    assembler: ReceiveAssembler,
    router: CommandRouter,
    emitter: StatusEmitter,
    commands: CommandHandler<T>,
    heartbeat: HeartbeatTimer,
    heartbeat_interval: Duration,
    state: Arc<watch::Sender<SessionState>>,
    transport: Arc<Mutex<T>>,
    control_slot: ControlSender,
    dispatcher: EventDispatcher,
}

impl<T: Transport + 'static> Session<T> {
    async fn run(mut self) {
        let reason = loop {
            let stream_deadline = self.assembler.deadline();
            let status_deadline = self.emitter.deadline();
            let connected = *self.state_changes.borrow_and_update() == SessionState::Connected;
            let heartbeat_deadline =
                connected.then(|| self.heartbeat.deadline(self.heartbeat_interval));

            tokio::select! {
                biased;

                Some(message) = self.control.recv() => self.handle_control(message),

                event = self.inbound.recv() => match event {
                    Some(TransportEvent::Data(data)) => {
                        if let Some(reason) = self.handle_data(&data).await {
                            break reason;
                        }
                    }
                    Some(TransportEvent::Closed(reason)) => break reason,
                    None => break DisconnectReason::ResourceUnavailable,
                },

                () = sleep_until_opt(stream_deadline) => {
                    if let Some(Assembled::TimedOut { received, expected }) =
                        self.assembler.expire(Instant::now())
                    {
                        tracing::warn!(
                            "stream timed out with {} of {} bytes received",
                            received,
                            expected
                        );
                        self.router
                            .fail_pending(
                                Prefix::DownloadStream,
                                Event::StreamTimedOut { received, expected },
                            )
                            .await;
                    }
                }

                () = sleep_until_opt(status_deadline) => {
                    self.emitter.fire(Instant::now());
                }

                () = sleep_until_opt(heartbeat_deadline) => {
                    if self.heartbeat.due(self.heartbeat_interval) {
                        if let Err(e) = self.commands.send_heartbeat().await {
                            tracing::warn!("heartbeat failed: {}", e);
                        }
                    }
                }

                Ok(()) = self.state_changes.changed() => {}
            }
        };

        self.shutdown(reason).await;
    }

    fn handle_control(&mut self, message: Control) {
        match message {
            Control::BeginStream {
                expected_len,
                deadline,
                ack,
            } => {
                self.assembler.begin_stream(expected_len, deadline);
                let _ = ack.send(());
            }
            Control::ResetEncoders => {
                self.emitter.reset_encoders(Instant::now());
            }
        }
    }

    /// Processes inbound bytes. Returns a reason if the link must close.
    async fn handle_data(&mut self, data: &[u8]) -> Option<DisconnectReason> {
        for item in self.assembler.push(data) {
            match item {
                Assembled::Frame(frame) | Assembled::Stream(frame) => {
                    self.heartbeat.touch();
                    match self.router.route(&frame).await {
                        Some(Event::Telemetry(sample)) => {
                            self.emitter.apply(&sample, Instant::now());
                        }
                        Some(Event::DisconnectRequested) => {
                            return Some(DisconnectReason::PeerRequested);
                        }
                        _ => {}
                    }
                }
                Assembled::Interrupted { received, expected } => {
                    tracing::warn!(
                        "stream interrupted by a driver message after {} of {} bytes",
                        received,
                        expected
                    );
                    self.router
                        .fail_pending(Prefix::DownloadStream, Event::StreamInterrupted)
                        .await;
                }
                Assembled::TimedOut { received, expected } => {
                    self.router
                        .fail_pending(
                            Prefix::DownloadStream,
                            Event::StreamTimedOut { received, expected },
                        )
                        .await;
                }
                Assembled::Dropped(_) => {}
            }
        }
        None
    }

    /// Cleans up after the link went down on its own.
    async fn shutdown(mut self, reason: DisconnectReason) {
        tracing::info!("link closed: {}", reason);

        self.control_slot.lock().await.take();
        self.assembler.reset();
        {
            let mut transport = self.transport.lock().await;
            if let Err(e) = transport.close().await {
                tracing::warn!("failed to close {}: {}", transport.name(), e);
            }
        }
        self.router.clear_pending().await;
        self.state.send_replace(SessionState::Disconnected);

        self.dispatcher.dispatch(Event::Disconnected { reason });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{MAGIC_RECEIVE, MAGIC_SEND};
    use crate::protocol::encode_frame;
    use crate::transport::mock::{MockHandle, MockTransport, Reply, Script};
    use crate::types::RecordKind;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn reply(prefix: Prefix, body: &[u8]) -> Reply {
        let mut payload = vec![u8::from(prefix)];
        payload.extend_from_slice(body);
        Reply::Frame(payload)
    }

    /// A well-behaved board; `extra` answers anything beyond the handshake.
    fn board(extra: fn(Prefix, &[u8]) -> Vec<Reply>) -> Script {
        Box::new(move |prefix: Prefix, body: &[u8]| match prefix {
            Prefix::Handshake if body == MAGIC_SEND.as_bytes() => {
                vec![reply(Prefix::Handshake, MAGIC_RECEIVE.as_bytes())]
            }
            Prefix::DownloadId => vec![reply(Prefix::DownloadId, b"Bench driver    \0")],
            _ => extra(prefix, body),
        })
    }

    fn quiet(_: Prefix, _: &[u8]) -> Vec<Reply> {
        Vec::new()
    }

    async fn connected(script: Script) -> (LedDriver<MockTransport>, MockHandle) {
        init_tracing();
        let (transport, handle) = MockTransport::new("mock0", script);
        let mut driver = LedDriver::new(transport, SessionConfig::default());
        driver.connect().await.unwrap();
        (driver, handle)
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        init_tracing();
        let (transport, handle) = MockTransport::new("mock0", board(quiet));
        let mut driver = LedDriver::new(transport, SessionConfig::default());
        let mut link = driver.subscribe_filtered(EventFilter::link());

        let id = driver.connect().await.unwrap();
        assert_eq!(id, "Bench driver");
        assert_eq!(driver.driver_id(), Some("Bench driver"));
        assert!(driver.is_connected());

        let sent = handle.sent_frames();
        assert_eq!(sent[0][0], u8::from(Prefix::Handshake));
        assert_eq!(&sent[0][1..], MAGIC_SEND.as_bytes());
        assert_eq!(sent[1].as_ref(), &[u8::from(Prefix::DownloadId)]);

        assert_eq!(
            link.recv().await,
            Some(Event::Connected {
                port: "mock0".into(),
                driver_id: "Bench driver".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_wrong_answer_is_not_a_driver() {
        let script: Script = Box::new(|prefix: Prefix, _: &[u8]| match prefix {
            Prefix::Handshake => vec![reply(Prefix::Handshake, b"hello")],
            _ => Vec::new(),
        });
        let (transport, handle) = MockTransport::new("mock1", script);
        let mut driver = LedDriver::new(transport, SessionConfig::default());

        let err = driver.connect().await.unwrap_err();
        assert!(matches!(err, Error::NotADriver { ref port } if port == "mock1"));
        assert_eq!(driver.state(), SessionState::Disconnected);
        assert!(!handle.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_port_is_not_a_driver() {
        let (transport, _handle) = MockTransport::silent("mock2");
        let mut driver = LedDriver::new(transport, SessionConfig::default());
        assert!(matches!(
            driver.connect().await,
            Err(Error::NotADriver { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_first_skips_silent_ports() {
        let (silent, _) = MockTransport::silent("silent");
        let (good, _) = MockTransport::new("good", board(quiet));

        let driver = LedDriver::connect_first([silent, good], SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(driver.driver_id(), Some("Bench driver"));

        let (a, _) = MockTransport::silent("a");
        let (b, _) = MockTransport::silent("b");
        assert!(matches!(
            LedDriver::connect_first([a, b], SessionConfig::default()).await,
            Err(Error::NoDriverFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_three_idle_seconds() {
        let (_driver, handle) = connected(board(quiet)).await;
        handle.clear();

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(handle.written().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.written(), vec![Bytes::from_static(&[0x01, 0x01, 0x00])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_postpones_heartbeat() {
        let (_driver, handle) = connected(board(quiet)).await;
        handle.clear();

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.inject(&encode_frame(&[12, 0, 0, 0, 0, 0]));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(handle.written().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(handle.written().len(), 1);
    }

    #[tokio::test]
    async fn test_checksum_failure_keeps_session() {
        fn corrupt_config(prefix: Prefix, _: &[u8]) -> Vec<Reply> {
            if prefix != Prefix::DownloadConfig {
                return Vec::new();
            }
            let layout = BoardLayout::default();
            let mut body = DriverConfiguration::new(&layout)
                .encode(&layout, 2)
                .unwrap()
                .to_vec();
            body[0] ^= 0x01;
            vec![reply(Prefix::DownloadConfig, &body)]
        }

        let (driver, _handle) = connected(board(corrupt_config)).await;

        let err = driver.download_configuration().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                record: RecordKind::Configuration,
                ..
            }
        ));
        assert!(driver.is_connected());
        assert_eq!(
            driver.commands().download_driver_id().await.unwrap(),
            "Bench driver"
        );
    }

    #[tokio::test]
    async fn test_configuration_round_trip() {
        fn echo_config(prefix: Prefix, _: &[u8]) -> Vec<Reply> {
            match prefix {
                Prefix::UploadConfig => vec![reply(Prefix::UploadConfig, &[])],
                Prefix::DownloadConfig => {
                    let layout = BoardLayout::default();
                    let mut config = DriverConfiguration::new(&layout);
                    config.name = "Scope 2".into();
                    let record = config.encode(&layout, 2).unwrap();
                    vec![reply(Prefix::DownloadConfig, &record)]
                }
                _ => Vec::new(),
            }
        }

        let (driver, handle) = connected(board(echo_config)).await;
        let config = driver.download_configuration().await.unwrap();
        assert_eq!(config.name, "Scope 2");

        handle.clear();
        driver.upload_configuration(&config).await.unwrap();
        let sent = handle.sent_frames();
        assert_eq!(sent[0][0], u8::from(Prefix::UploadConfig));
        assert!(crate::protocol::checksum::validate(&sent[0][1..], 3));
    }

    #[tokio::test]
    async fn test_dropped_frames_are_counted() {
        let (driver, handle) = connected(board(quiet)).await;
        let mut messages = driver.subscribe_filtered(EventFilter::prefixes(vec![Prefix::Message]));

        let mut wire = vec![0x05, 0x01, 0x00];
        wire.extend_from_slice(&encode_frame(b"\0hello"));
        handle.inject(&wire);
        handle.inject(&encode_frame(&[0x42, 1]));

        assert_eq!(
            messages.recv().await,
            Some(Event::DriverMessage("hello".into()))
        );
        handle.inject(&encode_frame(&[0]));
        assert_eq!(messages.recv().await, Some(Event::Heartbeat));
        assert_eq!(driver.dropped_frames(), 2);
        assert!(driver.is_connected());
    }

    #[tokio::test]
    async fn test_download_stream() {
        fn stream(prefix: Prefix, body: &[u8]) -> Vec<Reply> {
            if prefix != Prefix::DownloadStream {
                return Vec::new();
            }
            assert_eq!(body, &6u32.to_le_bytes());
            vec![
                Reply::Raw(vec![11, 0, 1, 2]),
                Reply::Raw(vec![0, 3, 4]),
            ]
        }

        let (driver, _handle) = connected(board(stream)).await;
        let data = driver.download_stream(6).await.unwrap();
        assert_eq!(data.as_ref(), &[0, 1, 2, 0, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_stream_times_out() {
        fn partial(prefix: Prefix, _: &[u8]) -> Vec<Reply> {
            if prefix == Prefix::DownloadStream {
                vec![Reply::Raw(vec![11, 9, 9])]
            } else {
                Vec::new()
            }
        }

        let (driver, handle) = connected(board(partial)).await;
        let err = driver.download_stream(100).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StreamTimeout {
                received: 3,
                expected: 101
            }
        ));

        // The assembler is back in framed mode.
        let mut ids = driver.subscribe_filtered(EventFilter::prefixes(vec![Prefix::DownloadId]));
        handle.inject(&encode_frame(b"\x08again"));
        assert_eq!(ids.recv().await, Some(Event::DriverId("again".into())));
    }

    #[tokio::test]
    async fn test_download_stream_interrupted() {
        fn busy(prefix: Prefix, _: &[u8]) -> Vec<Reply> {
            if prefix == Prefix::DownloadStream {
                vec![reply(Prefix::Message, b"busy")]
            } else {
                Vec::new()
            }
        }

        let (driver, _handle) = connected(board(busy)).await;
        let mut messages = driver.subscribe_filtered(EventFilter::prefixes(vec![Prefix::Message]));

        assert!(matches!(
            driver.download_stream(64).await,
            Err(Error::StreamInterrupted)
        ));
        assert_eq!(
            messages.recv().await,
            Some(Event::DriverMessage("busy".into()))
        );
    }

    #[tokio::test]
    async fn test_rejected_download_stream_keeps_framed_mode() {
        let (driver, handle) = connected(board(quiet)).await;
        let mut status = driver.status();

        let commands = driver.commands().clone();
        let waiting = tokio::spawn(async move { commands.measure_period().await });
        while !driver.pending.lock().await.as_ref().is_some_and(|e| e.is_awaited()) {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            driver.download_stream(16).await,
            Err(Error::ReplyPending(Prefix::MeasurePeriod))
        ));

        handle.inject(&encode_frame(&[12, 0b0000_0001, 5, 0, 0, 0]));
        tokio::time::timeout(Duration::from_millis(200), status.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.borrow().left.encoder, 5);

        handle.inject(&encode_frame(&[15, 0x2A]));
        assert_eq!(waiting.await.unwrap().unwrap().as_ref(), &[0x2A]);
    }

    #[tokio::test]
    async fn test_upload_stream_writes_raw_bytes() {
        fn ack(prefix: Prefix, _: &[u8]) -> Vec<Reply> {
            if prefix == Prefix::UploadStream {
                vec![reply(Prefix::UploadStream, &[])]
            } else {
                Vec::new()
            }
        }

        let (driver, handle) = connected(board(ack)).await;
        handle.clear();
        driver
            .upload_stream(Bytes::from_static(&[0, 0, 7, 0]))
            .await
            .unwrap();

        let written = handle.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].as_ref(), &[0, 0, 7, 0]);
    }

    #[tokio::test]
    async fn test_telemetry_reaches_status() {
        let (driver, handle) = connected(board(quiet)).await;
        let mut status = driver.status();

        // Button left, encoder left +5.
        handle.inject(&encode_frame(&[12, 0b0000_0001, 5, 0, 0, 0]));
        status.changed().await.unwrap();
        let current = *status.borrow_and_update();
        assert!(current.left.button);
        assert_eq!(current.left.encoder, 5);

        driver.reset_encoders().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), status.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.borrow().left.encoder, 0);
    }

    #[tokio::test]
    async fn test_board_requested_disconnect() {
        let (driver, handle) = connected(board(quiet)).await;
        let mut link = driver.subscribe_filtered(EventFilter::link());

        handle.inject(&encode_frame(&[14]));
        assert_eq!(
            link.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::PeerRequested
            })
        );
        assert_eq!(driver.state(), SessionState::Disconnected);
        assert_eq!(driver.driver_id(), None);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_link_loss() {
        let (driver, handle) = connected(board(quiet)).await;
        let mut link = driver.subscribe_filtered(EventFilter::link());

        handle.drop_link(DisconnectReason::DeviceNotFound);
        assert_eq!(
            link.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::DeviceNotFound
            })
        );
        assert_eq!(driver.driver_id(), None);
        assert!(matches!(
            driver.commands().send_heartbeat().await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_board() {
        let (mut driver, handle) = connected(board(quiet)).await;
        let mut messages = driver.subscribe_filtered(EventFilter::prefixes(vec![Prefix::Message]));
        let mut link = driver.subscribe_filtered(EventFilter::link());

        let mut wire = vec![0x05, 0x01, 0x00];
        wire.extend_from_slice(&encode_frame(&[0]));
        handle.inject(&wire);
        assert_eq!(messages.recv().await, Some(Event::Heartbeat));

        driver.disconnect().await.unwrap();
        assert_eq!(driver.state(), SessionState::Disconnected);
        assert_eq!(driver.driver_id(), None);
        assert_eq!(driver.dropped_frames(), 1);
        assert!(!handle.is_open());
        assert_eq!(
            link.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::Closed
            })
        );

        let sent = handle.sent_frames();
        assert_eq!(sent.last().map(|f| f.as_ref()), Some(&[14u8][..]));

        // Disconnecting twice is harmless.
        driver.disconnect().await.unwrap();
    }
}
