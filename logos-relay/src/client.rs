//! WebSocket peer for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - The two-step state exchange with automatic yrs integration
//! - Awareness updates and a view of remote presence
//!
//! The client keeps its own `Doc`; edits made through it are sent as
//! `UPDATE` frames and remote frames are merged into it.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::awareness::AwarenessRegistry;
use crate::connection::ConnectionState;
use crate::error::RelayError;
use crate::protocol::{self, AwarenessChange, SyncMessage};

/// Events emitted by the relay client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// A `STEP2` answer was merged into the local document
    Synced,
    /// A broadcast update was merged into the local document
    RemoteUpdate(Vec<u8>),
    /// Remote presence changes that were accepted locally
    Awareness(Vec<AwarenessChange>),
    /// Connection lost
    Disconnected,
}

/// A relay peer editing one document.
pub struct RelayClient {
    url: String,
    awareness_id: u64,
    awareness_clock: u64,
    doc: Arc<Mutex<Doc>>,
    remote_awareness: Arc<Mutex<AwarenessRegistry>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    writer: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to `url` (`ws://host:port/<document>`), announcing presence
    /// under `awareness_id`.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// starts the state exchange by sending our `STEP1`.
    pub async fn connect(url: impl Into<String>, awareness_id: u64) -> Result<Self, RelayError> {
        let url = url.into();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let doc = Arc::new(Mutex::new(Doc::new()));
        let remote_awareness = Arc::new(Mutex::new(AwarenessRegistry::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ClientEvent::Connected);

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: merge incoming frames into the local state
        {
            let doc = doc.clone();
            let remote_awareness = remote_awareness.clone();
            let state = state.clone();
            // Weak, so dropping the client's sender still ends the writer.
            let out_tx = out_tx.downgrade();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let event = match protocol::Message::decode(&data) {
                                Ok(msg) => handle_incoming(msg, &doc, &remote_awareness, &out_tx).await,
                                Err(e) => {
                                    log::warn!("Client dropped undecodable frame: {e}");
                                    None
                                }
                            };
                            if let Some(evt) = event {
                                let _ = event_tx.send(evt);
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                // Connection lost
                *state.write().await = ConnectionState::Closed;
                let _ = event_tx.send(ClientEvent::Disconnected);
            });
        }

        let state_vector = doc.lock().await.transact().state_vector().encode_v1();
        out_tx
            .send(protocol::sync_step1(state_vector))
            .await
            .map_err(|_| RelayError::Transport(tungstenite::Error::ConnectionClosed))?;

        *state.write().await = ConnectionState::Established;
        log::debug!("Client connected to {url}");

        Ok(Self {
            url,
            awareness_id,
            awareness_clock: 0,
            doc,
            remote_awareness,
            state,
            outgoing_tx: Some(out_tx),
            event_rx: Some(event_rx),
            writer: Some(writer),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(RelayError::Transport(tungstenite::Error::AlreadyClosed))?;
        tx.send(frame)
            .await
            .map_err(|_| RelayError::Transport(tungstenite::Error::ConnectionClosed))
    }

    /// Send an already encoded frame as is.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        self.send(frame).await
    }

    /// Insert `chunk` into the text named `name` and send the resulting update.
    pub async fn insert_text(&self, name: &str, index: u32, chunk: &str) -> Result<(), RelayError> {
        let update = {
            let doc = self.doc.lock().await;
            let text = doc.get_or_insert_text(name);
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.send(protocol::sync_update(update)).await
    }

    /// Current content of the text named `name` in the local document.
    pub async fn text(&self, name: &str) -> String {
        let doc = self.doc.lock().await;
        let text = doc.get_or_insert_text(name);
        let txn = doc.transact();
        text.get_string(&txn)
    }

    /// Encoded state vector of the local document.
    pub async fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().await.transact().state_vector().encode_v1()
    }

    /// Publish our presence state.
    pub async fn set_awareness(&mut self, state: impl Into<Vec<u8>>) -> Result<(), RelayError> {
        self.awareness_clock += 1;
        let change = AwarenessChange::live(self.awareness_id, self.awareness_clock, state);
        self.send(protocol::awareness(vec![change])).await
    }

    /// Withdraw our presence.
    pub async fn clear_awareness(&mut self) -> Result<(), RelayError> {
        self.awareness_clock += 1;
        let change = AwarenessChange::tombstone(self.awareness_id, self.awareness_clock);
        self.send(protocol::awareness(vec![change])).await
    }

    /// Live presence of the other peers, sorted by client id.
    pub async fn remote_awareness(&self) -> Vec<AwarenessChange> {
        self.remote_awareness.lock().await.snapshot()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn awareness_id(&self) -> u64 {
        self.awareness_id
    }

    /// Flush pending frames and close the socket.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

/// Merge one decoded frame into the local state, answering `STEP1` on
/// `out_tx`. Returns the event to report, if any.
async fn handle_incoming(
    msg: protocol::Message,
    doc: &Mutex<Doc>,
    remote_awareness: &Mutex<AwarenessRegistry>,
    out_tx: &mpsc::WeakSender<Vec<u8>>,
) -> Option<ClientEvent> {
    match msg {
        protocol::Message::Sync(SyncMessage::Step1(state_vector)) => {
            let diff = {
                let doc = doc.lock().await;
                let remote = StateVector::decode_v1(&state_vector).ok()?;
                let txn = doc.transact();
                txn.encode_diff_v1(&remote)
            };
            if let Some(tx) = out_tx.upgrade() {
                let _ = tx.send(protocol::sync_step2(diff)).await;
            }
            None
        }
        protocol::Message::Sync(SyncMessage::Step2(update)) => {
            merge(doc, &update).await.then_some(ClientEvent::Synced)
        }
        protocol::Message::Sync(SyncMessage::Update(update)) => {
            merge(doc, &update).await.then_some(ClientEvent::RemoteUpdate(update))
        }
        protocol::Message::Awareness(changes) => {
            let applied = remote_awareness.lock().await.apply_remote(changes);
            (!applied.is_empty()).then_some(ClientEvent::Awareness(applied))
        }
    }
}

async fn merge(doc: &Mutex<Doc>, update: &[u8]) -> bool {
    let update = match Update::decode_v1(update) {
        Ok(update) => update,
        Err(e) => {
            log::warn!("Client dropped undecodable update: {e}");
            return false;
        }
    };
    let doc = doc.lock().await;
    let mut txn = doc.transact_mut();
    match txn.apply_update(update) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Client failed to merge update: {e}");
            false
        }
    }
}
