//! In-memory transport with a scripted board, for tests.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{FRAME_DELIMITER, Prefix, decode_frame, encode_frame};
use crate::transport::{DisconnectReason, INBOUND_CAPACITY, Transport, TransportEvent};

/// What the scripted board sends back.
#[derive(Debug, Clone)]
pub enum Reply {
    /// A payload (prefix byte first), framed before delivery.
    Frame(Vec<u8>),
    /// Bytes delivered exactly as given.
    Raw(Vec<u8>),
}

/// Board behaviour: answers one decoded request.
pub type Script = Box<dyn Fn(Prefix, &[u8]) -> Vec<Reply> + Send + Sync>;

type Inbound = Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>;

/// Transport whose peer is a closure.
pub struct MockTransport {
    name: String,
    inbound: Inbound,
    written: Arc<Mutex<Vec<Bytes>>>,
    script: Script,
}

/// Test-side view of a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    inbound: Inbound,
    written: Arc<Mutex<Vec<Bytes>>>,
}

impl MockTransport {
    pub fn new(name: &str, script: Script) -> (Self, MockHandle) {
        let inbound: Inbound = Arc::new(Mutex::new(None));
        let written = Arc::new(Mutex::new(Vec::new()));
        let handle = MockHandle {
            inbound: Arc::clone(&inbound),
            written: Arc::clone(&written),
        };
        (
            Self {
                name: name.to_string(),
                inbound,
                written,
                script,
            },
            handle,
        )
    }

    /// A board that never answers.
    pub fn silent(name: &str) -> (Self, MockHandle) {
        Self::new(name, Box::new(|_: Prefix, _: &[u8]| Vec::new()))
    }
}

impl MockHandle {
    /// Delivers raw bytes as if the board sent them.
    pub fn inject(&self, data: &[u8]) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            tx.try_send(TransportEvent::Data(Bytes::copy_from_slice(data)))
                .unwrap();
        }
    }

    /// Reports a link loss.
    pub fn drop_link(&self, reason: DisconnectReason) {
        if let Some(tx) = self.inbound.lock().unwrap().take() {
            tx.try_send(TransportEvent::Closed(reason)).unwrap();
        }
    }

    /// Everything written so far, one entry per write.
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().unwrap().clone()
    }

    /// Decoded payloads of the framed writes so far.
    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.written()
            .iter()
            .filter_map(|w| w.strip_suffix(&[FRAME_DELIMITER]))
            .filter_map(|f| decode_frame(f).ok())
            .collect()
    }

    pub fn clear(&self) {
        self.written.lock().unwrap().clear();
    }

    pub fn is_open(&self) -> bool {
        self.inbound.lock().unwrap().is_some()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            *self.inbound.lock().unwrap() = Some(tx);
            Ok(rx)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inbound.lock().unwrap().take();
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let inbound = self.inbound.lock().unwrap().clone().ok_or(Error::NotConnected)?;
            self.written.lock().unwrap().push(data.clone());

            let request = data
                .strip_suffix(&[FRAME_DELIMITER])
                .and_then(|f| decode_frame(f).ok());
            if let Some(payload) = request {
                if let Some((prefix, body)) = payload
                    .split_first()
                    .and_then(|(&b, body)| Some((Prefix::from_byte(b)?, body)))
                {
                    for reply in (self.script)(prefix, body) {
                        let bytes = match reply {
                            Reply::Frame(frame) => encode_frame(&frame),
                            Reply::Raw(raw) => Bytes::from(raw),
                        };
                        let _ = inbound.try_send(TransportEvent::Data(bytes));
                    }
                }
            }

            Ok(data.len())
        })
    }

    fn is_open(&self) -> bool {
        self.inbound.lock().unwrap().is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
