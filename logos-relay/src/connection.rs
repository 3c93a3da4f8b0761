//! Per-connection driver.
//!
//! ```text
//! CONNECTING ── handshake ok, name resolved, joined ──► ESTABLISHED
//!     │                                                     │
//!     └── empty target / handshake failure            close / transport error
//!                         │                                 │
//!                         └──────────────► CLOSED ◄─────────┘  (leave)
//! ```
//!
//! One task per connection. Inbound frames are decoded and dispatched to the
//! session in arrival order; frames other connections caused arrive through
//! the session's broadcast receiver and are written straight to the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::RelayError;
use crate::protocol;
use crate::registry::SessionRegistry;
use crate::server::AtomicRelayStats;
use crate::session::{ClientConnection, ConnectionId, DocumentSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Established => "ESTABLISHED",
            Self::Closed => "CLOSED",
        })
    }
}

/// Document name carried by a request path: the path minus one leading `/`.
///
/// Returns `None` when nothing is left.
pub fn document_name(path: &str) -> Option<String> {
    let name = path.strip_prefix('/').unwrap_or(path);
    (!name.is_empty()).then(|| name.to_string())
}

/// Bookkeeping for one accepted socket.
struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    state: ConnectionState,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        log::debug!("Connection {} ({}): {} -> {next}", self.id, self.addr, self.state);
        self.state = next;
    }
}

/// Drive one TCP connection through handshake, session join, the receive
/// loop and the final leave.
///
/// The connection is closed from the relay side once `closing` turns `true`.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicRelayStats>,
    mut closing: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let mut conn = Connection {
        id: registry.next_connection_id(),
        addr,
        state: ConnectionState::Connecting,
    };

    let mut target: Option<String> = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match document_name(req.uri().path()) {
            Some(name) => {
                target = Some(name);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some("missing document name".to_string()));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                Err(refusal)
            }
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(tungstenite::Error::Http(_)) => {
            conn.transition(ConnectionState::Closed);
            return Err(RelayError::InvalidTarget(format!("empty document path from {addr}")));
        }
        Err(e) => {
            conn.transition(ConnectionState::Closed);
            return Err(e.into());
        }
    };
    let name = target.ok_or_else(|| RelayError::InvalidTarget(format!("no request path from {addr}")))?;

    let (session, baseline, mut broadcast_rx) = registry
        .join(&name, ClientConnection::new(conn.id, Some(addr)))
        .await?;
    conn.transition(ConnectionState::Established);
    stats.connection_opened();

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let result = async {
        // Baseline goes out before anything is read.
        for frame in baseline.frames() {
            ws_sender.send(Message::Binary(frame.into())).await?;
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            AtomicRelayStats::add(&stats.frames_received, 1);
                            if let Some(reply) = dispatch(&session, conn.id, &data, &stats).await? {
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed from {addr}", conn.id);
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Text(_))) => {
                            log::debug!("Ignoring text frame from {addr}");
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Err(RelayError::from(e));
                        }

                        _ => {}
                    }
                }

                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if !frame.is_for(conn.id) {
                                continue;
                            }
                            ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                            AtomicRelayStats::add(&stats.frames_forwarded, 1);
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {} lagged by {n} frames, resending full state", conn.id);
                            session.broadcast_group().record_lag(n);
                            AtomicRelayStats::add(&stats.frames_lagged, n);
                            resync(&mut ws_sender, &session).await?;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                // A dropped sender means the server is gone too.
                _ = closing.changed() => {
                    log::info!("Closing connection {} to {addr}: relay shutting down", conn.id);
                    ws_sender.send(Message::Close(None)).await?;
                    break;
                }
            }
        }
        Ok::<(), RelayError>(())
    }
    .await;

    conn.transition(ConnectionState::Closed);
    registry.leave(&session, conn.id).await;
    stats.connection_closed();

    result
}

/// Decode and apply one inbound frame, returning the sender's reply.
///
/// Undecodable frames and rejected updates are dropped here; only errors
/// that end the connection propagate.
async fn dispatch(
    session: &DocumentSession,
    id: ConnectionId,
    data: &[u8],
    stats: &AtomicRelayStats,
) -> Result<Option<Vec<u8>>, RelayError> {
    let msg = match protocol::Message::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Dropping frame from connection {id} in '{}': {e}", session.name());
            AtomicRelayStats::add(&stats.frames_dropped, 1);
            return Ok(None);
        }
    };
    match &msg {
        protocol::Message::Sync(sync) => {
            log::debug!("Connection {id} -> '{}': {}", session.name(), sync.label());
        }
        protocol::Message::Awareness(changes) => {
            log::trace!("Connection {id} -> '{}': {} awareness changes", session.name(), changes.len());
        }
    }

    match session.dispatch(id, msg).await {
        Ok(reply) => Ok(reply),
        Err(RelayError::Merge(e)) => {
            log::warn!("Update from connection {id} rejected in '{}': {e}", session.name());
            AtomicRelayStats::add(&stats.merge_failures, 1);
            Ok(None)
        }
        Err(e) if !e.is_fatal() => {
            log::warn!("Dropping frame from connection {id} in '{}': {e}", session.name());
            AtomicRelayStats::add(&stats.frames_dropped, 1);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Frames that replace whatever a lagged receiver missed: the whole document
/// as `STEP2`, then every live awareness entry.
async fn lag_recovery(session: &DocumentSession) -> [Vec<u8>; 2] {
    let state = session.lock().await;
    [
        protocol::sync_step2(state.full_state()),
        protocol::awareness(state.awareness().snapshot()),
    ]
}

/// Heal a gap left by dropped broadcast frames.
async fn resync<S>(ws_sender: &mut S, session: &DocumentSession) -> Result<(), RelayError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for frame in lag_recovery(session).await {
        ws_sender.send(Message::Binary(frame.into())).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, Text, Transact, Update};

    #[test]
    fn test_document_name_trims_one_separator() {
        assert_eq!(document_name("/doc:42").as_deref(), Some("doc:42"));
        assert_eq!(document_name("doc:42").as_deref(), Some("doc:42"));
        assert_eq!(document_name("//nested").as_deref(), Some("/nested"));
        assert_eq!(document_name("/rooms/a/b").as_deref(), Some("rooms/a/b"));
    }

    #[test]
    fn test_document_name_empty() {
        assert_eq!(document_name("/"), None);
        assert_eq!(document_name(""), None);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ConnectionState::Established.to_string(), "ESTABLISHED");
        assert_eq!(ConnectionState::Closed.to_string(), "CLOSED");
    }

    fn edit(chunk: &str) -> Vec<u8> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, chunk);
        txn.encode_update_v1()
    }

    fn text_of(update: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        doc.transact_mut()
            .apply_update(Update::decode_v1(update).unwrap())
            .unwrap();
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn test_dispatch_drops_garbage() {
        let session = DocumentSession::new("doc", 8).unwrap();
        let stats = AtomicRelayStats::default();

        let reply = dispatch(&session, 1, &[0x07, 0x00], &stats).await.unwrap();
        assert!(reply.is_none());
        let reply = dispatch(&session, 1, &protocol::sync_update(vec![0xff, 0xff]), &stats)
            .await
            .unwrap();
        assert!(reply.is_none());

        let s = stats.snapshot();
        assert_eq!(s.frames_dropped, 1);
        assert_eq!(s.merge_failures, 1);
    }

    #[tokio::test]
    async fn test_dispatch_survives_hostile_sync_frames() {
        let session = DocumentSession::new("doc", 8).unwrap();
        let stats = AtomicRelayStats::default();
        let (_, mut rx) = session.join(ClientConnection::new(2, None)).await.unwrap();

        let update = protocol::sync_update(vec![
            230, 23, 199, 56, 44, 10, 164, 7, 63, 15, 69, 137, 126, 174, 159, 168, 29, 137, 176, 185, 100, 6,
            136, 119, 173, 196,
        ]);
        assert!(dispatch(&session, 1, &update, &stats).await.unwrap().is_none());
        // Claims four billion state vector entries.
        let step1 = protocol::sync_step1(vec![0xff, 0xff, 0xff, 0xff, 0x0f, 1, 2]);
        assert!(dispatch(&session, 1, &step1, &stats).await.unwrap().is_none());

        let s = stats.snapshot();
        assert_eq!(s.merge_failures, 1);
        assert_eq!(s.frames_dropped, 1);

        dispatch(&session, 1, &protocol::sync_update(edit("fine")), &stats)
            .await
            .unwrap();
        let frame = rx.recv().await.unwrap();
        match protocol::Message::decode(&frame.bytes).unwrap() {
            protocol::Message::Sync(protocol::SyncMessage::Update(update)) => assert_eq!(text_of(&update), "fine"),
            other => panic!("expected UPDATE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagged_receiver_recovers_document_and_presence() {
        let session = DocumentSession::new("doc", 1).unwrap();
        let (_, mut rx) = session.join(ClientConnection::new(2, None)).await.unwrap();

        session
            .handle_awareness(1, vec![protocol::AwarenessChange::live(1, 1, b"a".to_vec())])
            .await
            .unwrap();
        for word in ["one", "two", "three"] {
            session
                .handle_sync(1, protocol::SyncMessage::Update(edit(word)))
                .await
                .unwrap();
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));

        let [step2, presence] = lag_recovery(&session).await;
        match protocol::Message::decode(&step2).unwrap() {
            protocol::Message::Sync(protocol::SyncMessage::Step2(update)) => {
                assert_eq!(text_of(&update).len(), "onetwothree".len());
            }
            other => panic!("expected STEP2, got {other:?}"),
        }
        assert_eq!(
            protocol::Message::decode(&presence).unwrap(),
            protocol::Message::Awareness(vec![protocol::AwarenessChange::live(1, 1, b"a".to_vec())])
        );
    }

    #[tokio::test]
    async fn test_dispatch_answers_step1() {
        let session = DocumentSession::new("doc", 8).unwrap();
        let stats = AtomicRelayStats::default();
        let empty_sv = session.state_vector().await;

        let reply = dispatch(&session, 1, &protocol::sync_step1(empty_sv), &stats)
            .await
            .unwrap()
            .expect("step1 must be answered");
        assert!(matches!(
            protocol::Message::decode(&reply).unwrap(),
            protocol::Message::Sync(protocol::SyncMessage::Step2(_))
        ));
    }
}
