//! Command handlers for LED driver operations.
//!
//! Every operation is one frame out, optionally followed by one awaited
//! reply. A reply is matched by prefix through the shared [`PendingReply`];
//! only one reply can be awaited at a time.

pub mod heartbeat;

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher};
use crate::protocol::{Expectation, PendingReply, Prefix, encode_frame, stream_timeout};
use crate::transport::Transport;
use crate::types::{BoardLayout, DriverConfiguration, SyncConfiguration};

pub use heartbeat::{HEARTBEAT_INTERVAL, HeartbeatTimer};

/// Base time to wait for a reply.
pub const REPLY_TIMEOUT_BASE: Duration = Duration::from_millis(500);

/// Challenge sent to identify an LED driver.
pub const MAGIC_SEND: &str = "p6hGvGAKtyRehDZMM0VO";

/// Answer an LED driver gives to [`MAGIC_SEND`].
pub const MAGIC_RECEIVE: &str = "1UltmSfFUudnRfC1Y923";

/// Time to wait for the reply to a request with a body of `len` bytes.
#[must_use]
pub fn reply_timeout(base: Duration, len: usize) -> Duration {
    base + Duration::from_millis((len / 10) as u64)
}

fn stream_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::StreamTooLong { len })
}

fn timeout_error(timeout: Duration) -> Error {
    Error::Timeout {
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Audio test selector for [`CommandHandler::test_volume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AudioTest {
    /// Status tone at the status volume.
    Status = 0,
    /// Alarm tone at the alarm volume.
    Alarm = 1,
    /// The configured alarm pattern.
    Pattern = 2,
}

/// Requests for the processing task.
#[derive(Debug)]
pub(crate) enum Control {
    /// Switch the assembler to stream mode, then acknowledge.
    BeginStream {
        expected_len: usize,
        deadline: Instant,
        ack: oneshot::Sender<()>,
    },
    /// Zero both encoder totals.
    ResetEncoders,
}

/// Shared handle to the control channel of the running session.
pub(crate) type ControlSender = Arc<Mutex<Option<mpsc::Sender<Control>>>>;

/// Command handler for LED driver operations.
pub struct CommandHandler<T> {
    transport: Arc<Mutex<T>>,
    pending: PendingReply,
    heartbeat: HeartbeatTimer,
    layout: BoardLayout,
    dispatcher: EventDispatcher,
    control: ControlSender,
    reply_timeout: Duration,
}

impl<T> Clone for CommandHandler<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            pending: Arc::clone(&self.pending),
            heartbeat: self.heartbeat.clone(),
            layout: self.layout,
            dispatcher: self.dispatcher.clone(),
            control: Arc::clone(&self.control),
            reply_timeout: self.reply_timeout,
        }
    }
}

impl<T: Transport> CommandHandler<T> {
    /// Creates a new command handler.
    #[must_use]
    pub(crate) fn new(
        transport: Arc<Mutex<T>>,
        pending: PendingReply,
        heartbeat: HeartbeatTimer,
        layout: BoardLayout,
        dispatcher: EventDispatcher,
        control: ControlSender,
    ) -> Self {
        Self {
            transport,
            pending,
            heartbeat,
            layout,
            dispatcher,
            control,
            reply_timeout: REPLY_TIMEOUT_BASE,
        }
    }

    /// Sets the base reply timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.reply_timeout = timeout;
    }

    /// Board layout used for the records.
    #[must_use]
    pub const fn layout(&self) -> &BoardLayout {
        &self.layout
    }

    /// Returns the event dispatcher replies are published on.
    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    async fn write_raw(&self, data: Bytes) -> Result<()> {
        let expected = data.len();
        let written = {
            let mut transport = self.transport.lock().await;
            if !transport.is_open() {
                return Err(Error::NotConnected);
            }
            transport.write(data).await?
        };
        self.heartbeat.touch();

        if written != expected {
            return Err(Error::WriteIncomplete { written, expected });
        }
        Ok(())
    }

    async fn write_frame(&self, prefix: Prefix, body: &[u8]) -> Result<()> {
        let mut payload = BytesMut::with_capacity(body.len() + 1);
        payload.put_u8(prefix.into());
        payload.put_slice(body);

        tracing::trace!("sending {:?}: {}", prefix, hex::encode(&payload));
        self.write_raw(encode_frame(&payload)).await
    }

    /// Sends a frame without expecting a reply.
    ///
    /// An outstanding reply expectation is left alone.
    pub async fn send_without_reply(&self, prefix: Prefix, body: &[u8]) -> Result<()> {
        self.write_frame(prefix, body).await
    }

    /// Sends a frame and waits for the frame answering it.
    ///
    /// Waits `timeout`, or the base reply timeout scaled by the body length.
    /// Returns `None` if no reply arrived in time; a late reply is still
    /// routed and published normally.
    pub async fn send_with_reply(
        &self,
        prefix: Prefix,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<Event>> {
        let reply = self.expect(prefix).await?;
        if let Err(e) = self.write_frame(prefix, body).await {
            self.abandon(prefix).await;
            return Err(e);
        }

        let timeout = timeout.unwrap_or_else(|| reply_timeout(self.reply_timeout, body.len()));
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(event)) => Ok(Some(event)),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                tracing::debug!("no reply to {:?} within {:?}", prefix, timeout);
                Ok(None)
            }
        }
    }

    /// Registers `prefix` as the awaited reply.
    ///
    /// Fails with [`Error::ReplyPending`] while another caller still waits;
    /// an expectation nobody waits on is superseded.
    async fn expect(&self, prefix: Prefix) -> Result<oneshot::Receiver<Event>> {
        let mut pending = self.pending.lock().await;
        if let Some(current) = pending.as_ref().filter(|e| e.is_awaited()) {
            return Err(Error::ReplyPending(current.prefix));
        }

        let (expectation, reply) = Expectation::new(prefix);
        if let Some(stale) = pending.replace(expectation) {
            tracing::debug!("superseding stale expectation for {:?}", stale.prefix);
        }
        Ok(reply)
    }

    async fn request(&self, prefix: Prefix, body: &[u8], timeout: Option<Duration>) -> Result<Event> {
        let timeout = timeout.unwrap_or_else(|| reply_timeout(self.reply_timeout, body.len()));
        self.send_with_reply(prefix, body, Some(timeout))
            .await?
            .ok_or_else(|| timeout_error(timeout))
    }

    async fn abandon(&self, prefix: Prefix) {
        let mut pending = self.pending.lock().await;
        if pending.as_ref().is_some_and(|e| e.prefix == prefix) {
            pending.take();
        }
    }

    async fn control(&self, message: Control) -> Result<()> {
        let sender = self.control.lock().await.clone().ok_or(Error::NotConnected)?;
        sender.send(message).await.map_err(|_| Error::ChannelClosed)
    }

    // ==================== Session Commands ====================

    /// Sends the identification challenge.
    ///
    /// Returns true if the peer answered like an LED driver.
    pub async fn handshake(&self) -> Result<bool> {
        match self.request(Prefix::Handshake, MAGIC_SEND.as_bytes(), None).await? {
            Event::Handshake(answer) => {
                tracing::debug!("handshake answer: {:?}", answer);
                Ok(answer == MAGIC_RECEIVE)
            }
            other => Err(failure(Prefix::Handshake, other)),
        }
    }

    /// Reads the driver identity string.
    pub async fn download_driver_id(&self) -> Result<String> {
        match self.request(Prefix::DownloadId, &[], None).await? {
            Event::DriverId(id) => Ok(id),
            other => Err(failure(Prefix::DownloadId, other)),
        }
    }

    /// Sends an empty generic message to keep the link alive.
    pub async fn send_heartbeat(&self) -> Result<()> {
        tracing::debug!("sending heartbeat");
        self.send_without_reply(Prefix::Message, &[]).await
    }

    /// Tells the board the host is going away.
    pub async fn notify_disconnect(&self) -> Result<()> {
        self.send_without_reply(Prefix::Disconnect, &[]).await
    }

    /// Sets the board clock to `timestamp` seconds.
    pub async fn upload_time(&self, timestamp: u32) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(timestamp);
        self.send_without_reply(Prefix::UploadTime, &buf).await
    }

    // ==================== Record Commands ====================

    /// Reads the driver configuration record.
    pub async fn download_configuration(&self) -> Result<DriverConfiguration> {
        match self.request(Prefix::DownloadConfig, &[], None).await? {
            Event::Configuration(config) => Ok(*config),
            other => Err(failure(Prefix::DownloadConfig, other)),
        }
    }

    /// Writes the driver configuration record and waits for the ack.
    pub async fn upload_configuration(&self, config: &DriverConfiguration) -> Result<()> {
        let body = config.encode(&self.layout, Prefix::UploadConfig.into())?;
        match self.request(Prefix::UploadConfig, &body, None).await? {
            Event::Reply { .. } => Ok(()),
            other => Err(failure(Prefix::UploadConfig, other)),
        }
    }

    /// Reads the sync configuration record.
    pub async fn download_sync(&self) -> Result<SyncConfiguration> {
        match self.request(Prefix::DownloadSync, &[], None).await? {
            Event::Sync(sync) => Ok(*sync),
            other => Err(failure(Prefix::DownloadSync, other)),
        }
    }

    /// Writes the sync configuration record and waits for the ack.
    pub async fn upload_sync(&self, sync: &SyncConfiguration) -> Result<()> {
        let body = sync.encode(&self.layout, Prefix::UploadSync.into())?;
        match self.request(Prefix::UploadSync, &body, None).await? {
            Event::Reply { .. } => Ok(()),
            other => Err(failure(Prefix::UploadSync, other)),
        }
    }

    // ==================== Stream Commands ====================

    /// Downloads `len` bytes sent by the board as one unframed stream.
    ///
    /// The stream starts with the prefix byte, which is not part of the
    /// returned data.
    pub async fn download_stream(&self, len: u32) -> Result<Bytes> {
        let expected_len = len as usize + 1;
        let window = stream_timeout(expected_len);
        let timeout = window + self.reply_timeout;

        // The assembler is only switched once the reply slot is ours.
        let reply = self.expect(Prefix::DownloadStream).await?;
        if let Err(e) = self.begin_stream(expected_len, Instant::now() + window).await {
            self.abandon(Prefix::DownloadStream).await;
            return Err(e);
        }

        let mut body = BytesMut::with_capacity(4);
        body.put_u32_le(len);
        if let Err(e) = self.write_frame(Prefix::DownloadStream, &body).await {
            self.abandon(Prefix::DownloadStream).await;
            return Err(e);
        }

        let event = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => return Err(Error::NotConnected),
            Err(_) => return Err(timeout_error(timeout)),
        };
        match event {
            Event::StreamReceived(mut stream) => {
                tracing::debug!("downloaded {} byte stream", stream.len());
                Ok(stream.split_off(1))
            }
            other => Err(failure(Prefix::DownloadStream, other)),
        }
    }

    async fn begin_stream(&self, expected_len: usize, deadline: Instant) -> Result<()> {
        let (ack, acked) = oneshot::channel();
        self.control(Control::BeginStream {
            expected_len,
            deadline,
            ack,
        })
        .await?;
        acked.await.map_err(|_| Error::ChannelClosed)
    }

    /// Announces an upload stream, waits for the ack, then writes `data`
    /// raw.
    pub async fn upload_stream(&self, data: Bytes) -> Result<()> {
        let len = stream_len(data.len())?;

        let mut body = BytesMut::with_capacity(4);
        body.put_u32_le(len);
        match self.request(Prefix::UploadStream, &body, None).await? {
            Event::Reply { .. } => {}
            other => return Err(failure(Prefix::UploadStream, other)),
        }

        tracing::debug!("uploading {} byte stream", data.len());
        self.write_raw(data).await
    }

    // ==================== Controller Commands ====================

    /// Sets the indicator outputs on the controller.
    pub async fn set_output(&self, left: bool, right: bool, builtin: bool) -> Result<()> {
        let body = [u8::from(left), u8::from(right), u8::from(builtin)];
        self.send_without_reply(Prefix::SetOutput, &body).await
    }

    /// Plays an audio test tone.
    pub async fn test_volume(&self, test: AudioTest) -> Result<()> {
        self.send_without_reply(Prefix::TestVolume, &[test as u8])
            .await
    }

    /// Drives the test current on `channel`.
    pub async fn test_current(&self, channel: u8) -> Result<()> {
        self.send_without_reply(Prefix::TestCurrent, &[channel])
            .await
    }

    /// Measures the confocal scan period and returns the raw reply body.
    pub async fn measure_period(&self) -> Result<Bytes> {
        match self.request(Prefix::MeasurePeriod, &[], None).await? {
            Event::Reply { data, .. } => Ok(data),
            other => Err(failure(Prefix::MeasurePeriod, other)),
        }
    }

    /// Sends a calibration command and returns the raw reply body.
    pub async fn calibrate(&self, body: &[u8]) -> Result<Bytes> {
        match self.request(Prefix::Calibration, body, None).await? {
            Event::Reply { data, .. } => Ok(data),
            other => Err(failure(Prefix::Calibration, other)),
        }
    }

    /// Zeroes both encoder totals in the published controller status.
    pub async fn reset_encoders(&self) -> Result<()> {
        self.control(Control::ResetEncoders).await
    }
}

/// Turns a reply that is not the expected result into an error.
fn failure(expected: Prefix, event: Event) -> Error {
    match event {
        Event::ChecksumMismatch { record, sum } => Error::ChecksumMismatch { record, sum },
        Event::MalformedRecord { record, reason } => Error::InvalidRecord { record, reason },
        Event::StreamTimedOut {
            received,
            expected: total,
        } => Error::StreamTimeout {
            received,
            expected: total,
        },
        Event::StreamInterrupted => Error::StreamInterrupted,
        other => Error::UnexpectedReply {
            expected,
            message: format!("{other:?}"),
        },
    }
}
