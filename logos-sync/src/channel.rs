//! Channel capability and its WebSocket implementation.
//!
//! Outbound calls are non-blocking: they enqueue a frame and return. Every
//! inbound message, including the answer to `request_steps`, comes back
//! as a [`ChannelEvent`] on the provider's event stream, so responses may
//! interleave with regular traffic in any order.
//!
//! ```text
//! SyncProvider ──connect/send_steps/send_telepointer/request_steps──► WsChannel
//!                                                                        │ bounded mpsc
//!                                                                        ▼
//!                                                              writer task ──► WebSocket
//!                                                                                  │
//! SyncProvider ◄──── mpsc<ChannelEvent> ◄──── reader task (Frame::decode) ◄───────┘
//! ```

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;
use crate::protocol::{CatchupResponse, Frame, SendableSteps, StepBatch, Telepointer};

/// Inbound traffic delivered to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Handshake completed; the server's view of the document.
    Connected { doc: Vec<u8>, version: u64 },
    Data(StepBatch),
    Telepointer(Telepointer),
    /// Answer to `request_steps`.
    CatchupResponse(Result<CatchupResponse, SyncError>),
    Disconnected,
}

/// Duplex channel to the collaboration server.
pub trait Channel {
    /// Start the handshake with the local version and encoded document.
    fn connect(&mut self, version: u64, doc: Vec<u8>) -> Result<(), SyncError>;

    fn send_steps(&mut self, steps: SendableSteps) -> Result<(), SyncError>;

    fn send_telepointer(&mut self, telepointer: Telepointer) -> Result<(), SyncError>;

    /// Ask for everything after `since`. The answer arrives as
    /// `ChannelEvent::CatchupResponse`.
    fn request_steps(&mut self, since: u64) -> Result<(), SyncError>;
}

/// Map a server frame to the event it represents. Client-bound frames only.
pub fn frame_to_event(frame: Frame) -> Option<ChannelEvent> {
    match frame {
        Frame::Connected { doc, version } => Some(ChannelEvent::Connected { doc, version }),
        Frame::Data(batch) => Some(ChannelEvent::Data(batch)),
        Frame::Telepointer(telepointer) => Some(ChannelEvent::Telepointer(telepointer)),
        Frame::CatchupSteps { version, steps } => Some(ChannelEvent::CatchupResponse(Ok(
            CatchupResponse::Steps { version, steps },
        ))),
        Frame::CatchupSnapshot { doc, version } => Some(ChannelEvent::CatchupResponse(Ok(
            CatchupResponse::Snapshot { doc, version },
        ))),
        Frame::CatchupFailed { reason } => {
            Some(ChannelEvent::CatchupResponse(Err(SyncError::Catchup(reason))))
        }
        Frame::Connect { .. } | Frame::SendSteps(_) | Frame::GetSteps { .. } => None,
    }
}

/// Channel over a WebSocket carrying bincode [`Frame`]s.
pub struct WsChannel {
    session_id: String,
    outgoing: mpsc::Sender<Vec<u8>>,
}

impl WsChannel {
    /// Connect to `url` and spawn the reader and writer tasks.
    ///
    /// Decoded server frames are forwarded to `events`; a closed socket
    /// produces `ChannelEvent::Disconnected`.
    pub async fn open(
        url: &str,
        session_id: impl Into<String>,
        capacity: usize,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Self, SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity);

        // Writer task: forward outgoing frames to the socket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server frames into channel events
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match Frame::decode(&bytes) {
                            Ok(frame) => {
                                let Some(event) = frame_to_event(frame) else {
                                    log::debug!("Ignoring client-bound frame from server");
                                    continue;
                                };
                                if events.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = events.send(ChannelEvent::Disconnected).await;
        });

        log::info!("Channel open to {url}");
        Ok(Self {
            session_id: session_id.into(),
            outgoing: out_tx,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn push(&self, frame: Frame) -> Result<(), SyncError> {
        let encoded = frame.encode()?;
        self.outgoing.try_send(encoded).map_err(|e| match e {
            TrySendError::Full(_) => SyncError::Backpressure,
            TrySendError::Closed(_) => SyncError::ConnectionClosed,
        })
    }
}

impl Channel for WsChannel {
    fn connect(&mut self, version: u64, doc: Vec<u8>) -> Result<(), SyncError> {
        self.push(Frame::Connect {
            session_id: self.session_id.clone(),
            version,
            doc,
        })
    }

    fn send_steps(&mut self, steps: SendableSteps) -> Result<(), SyncError> {
        self.push(Frame::SendSteps(steps))
    }

    fn send_telepointer(&mut self, telepointer: Telepointer) -> Result<(), SyncError> {
        self.push(Frame::Telepointer(telepointer))
    }

    fn request_steps(&mut self, since: u64) -> Result<(), SyncError> {
        self.push(Frame::GetSteps { since })
    }
}

/// Channel that records outbound frames instead of sending them.
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    sent: Arc<Mutex<Vec<Frame>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames sent so far.
    pub fn sent(&self) -> Vec<Frame> {
        self.lock_sent().clone()
    }

    /// Frames sent so far, clearing the record.
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.lock_sent())
    }

    /// Versions passed to `request_steps`, in order.
    pub fn catchup_requests(&self) -> Vec<u64> {
        self.lock_sent()
            .iter()
            .filter_map(|f| match f {
                Frame::GetSteps { since } => Some(*since),
                _ => None,
            })
            .collect()
    }

    /// Make every outbound call fail with `ConnectionClosed`.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|p| p.into_inner()) = failing;
    }

    fn lock_sent(&self) -> std::sync::MutexGuard<'_, Vec<Frame>> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, frame: Frame) -> Result<(), SyncError> {
        if *self.failing.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(SyncError::ConnectionClosed);
        }
        self.lock_sent().push(frame);
        Ok(())
    }
}

impl Channel for MemoryChannel {
    fn connect(&mut self, version: u64, doc: Vec<u8>) -> Result<(), SyncError> {
        self.record(Frame::Connect {
            session_id: String::new(),
            version,
            doc,
        })
    }

    fn send_steps(&mut self, steps: SendableSteps) -> Result<(), SyncError> {
        self.record(Frame::SendSteps(steps))
    }

    fn send_telepointer(&mut self, telepointer: Telepointer) -> Result<(), SyncError> {
        self.record(Frame::Telepointer(telepointer))
    }

    fn request_steps(&mut self, since: u64) -> Result<(), SyncError> {
        self.record(Frame::GetSteps { since })
    }
}
