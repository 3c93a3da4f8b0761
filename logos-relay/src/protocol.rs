//! Binary protocol for relaying CRDT sync and awareness frames.
//!
//! Wire format (lib0 variable-width integers):
//! ```text
//! envelope  = varint(kind) ++ payload
//!   kind 0  = SYNC       payload = varint(subtype) ++ varbuf(bytes)
//!                        subtype 0 = STEP1 (state vector)
//!                                1 = STEP2 (update)
//!                                2 = UPDATE (update)
//!   kind 1  = AWARENESS  payload = varbuf( varint(n) ++ n × entry )
//!                        entry   = varint(client_id) ++ varint(clock)
//!                                  ++ varbuf(state | empty)
//! ```
//!
//! `varbuf` is a varint length followed by that many bytes. The layout is
//! byte-compatible with the y-protocols sync and awareness messages, so Yjs
//! clients can talk to the relay without an adapter.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::StateVector;

/// Top-level message family discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// CRDT state exchange (STEP1 / STEP2 / UPDATE)
    Sync = 0,
    /// Ephemeral presence batch
    Awareness = 1,
}

impl MessageKind {
    /// Map a wire tag to a message kind.
    pub fn from_tag(tag: u64) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    pub fn tag(self) -> u64 {
        self as u64
    }
}

const SYNC_STEP1: u64 = 0;
const SYNC_STEP2: u64 = 1;
const SYNC_UPDATE: u64 = 2;

/// Sync sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Requester announces its encoded state vector.
    Step1(Vec<u8>),
    /// Responder sends the update the requester is missing.
    Step2(Vec<u8>),
    /// Unsolicited incremental update to merge and rebroadcast.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn subtype(&self) -> u64 {
        match self {
            Self::Step1(_) => SYNC_STEP1,
            Self::Step2(_) => SYNC_STEP2,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    /// Raw payload (state vector or update bytes).
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Step1(bytes) | Self::Step2(bytes) | Self::Update(bytes) => bytes,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Step1(_) => "STEP1",
            Self::Step2(_) => "STEP2",
            Self::Update(_) => "UPDATE",
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.write_var(self.subtype());
        buf.write_buf(self.payload());
    }

    fn read_from(reader: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        let subtype: u64 = reader.read_var()?;
        let payload = reader.read_buf()?.to_vec();
        match subtype {
            SYNC_STEP1 => Ok(Self::Step1(payload)),
            SYNC_STEP2 => Ok(Self::Step2(payload)),
            SYNC_UPDATE => Ok(Self::Update(payload)),
            other => Err(ProtocolError::UnknownSyncType(other)),
        }
    }
}

/// One `(client_id, clock, state | null)` tuple of an awareness batch.
///
/// `state == None` is a tombstone: the client left or was timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<Vec<u8>>,
}

impl AwarenessChange {
    pub fn live(client_id: u64, clock: u64, state: impl Into<Vec<u8>>) -> Self {
        Self {
            client_id,
            clock,
            state: Some(state.into()),
        }
    }

    pub fn tombstone(client_id: u64, clock: u64) -> Self {
        Self {
            client_id,
            clock,
            state: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.state.is_none()
    }
}

// Yjs clients serialize a removed state as the JSON literal `null`.
const JSON_NULL: &[u8] = b"null";

fn encode_awareness_batch(changes: &[AwarenessChange]) -> Vec<u8> {
    let mut inner = Vec::new();
    inner.write_var(changes.len() as u64);
    for change in changes {
        inner.write_var(change.client_id);
        inner.write_var(change.clock);
        inner.write_buf(change.state.as_deref().unwrap_or_default());
    }
    inner
}

fn decode_awareness_batch(bytes: &[u8]) -> Result<Vec<AwarenessChange>, ProtocolError> {
    let mut reader = Cursor::new(bytes);
    let count: u64 = reader.read_var()?;
    // Every entry takes at least three bytes, so a lying count cannot force a
    // huge allocation.
    let mut changes = Vec::with_capacity((count as usize).min(bytes.len() / 3));
    for _ in 0..count {
        let client_id: u64 = reader.read_var()?;
        let clock: u64 = reader.read_var()?;
        let raw = reader.read_buf()?;
        let state = if raw.is_empty() || raw == JSON_NULL {
            None
        } else {
            Some(raw.to_vec())
        };
        changes.push(AwarenessChange {
            client_id,
            clock,
            state,
        });
    }
    Ok(changes)
}

/// Decode a `STEP1` state vector: `varint(n) ++ n × (varint(client) ++ varint(clock))`.
///
/// The count is checked against the bytes actually present before anything
/// is allocated.
pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, ProtocolError> {
    let mut reader = Cursor::new(bytes);
    let count: u64 = reader.read_var()?;
    let remaining = bytes.len().saturating_sub(reader.next);
    if count > (remaining / 2) as u64 {
        return Err(ProtocolError::Malformed(format!(
            "state vector claims {count} entries in {remaining} bytes"
        )));
    }
    let mut state_vector = StateVector::default();
    for _ in 0..count {
        let client: u64 = reader.read_var()?;
        let clock: u32 = reader.read_var()?;
        state_vector.set_max(client, clock);
    }
    Ok(state_vector)
}

/// A fully decoded relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(Vec<AwarenessChange>),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Sync(_) => MessageKind::Sync,
            Self::Awareness(_) => MessageKind::Awareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Self::Sync(msg) => msg.write_to(&mut payload),
            Self::Awareness(changes) => payload.write_buf(encode_awareness_batch(changes)),
        }
        encode_envelope(self.kind(), &payload)
    }

    /// Deserialize from the binary wire format.
    ///
    /// Bytes following a complete message are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (kind, mut reader) = decode_envelope(bytes)?;
        match kind {
            MessageKind::Sync => Ok(Self::Sync(SyncMessage::read_from(&mut reader)?)),
            MessageKind::Awareness => {
                let batch = reader.read_buf()?;
                Ok(Self::Awareness(decode_awareness_batch(batch)?))
            }
        }
    }
}

/// Convenience constructors used on the hot path.
pub fn sync_step1(state_vector: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Step1(state_vector)).encode()
}

pub fn sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Step2(update)).encode()
}

pub fn sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode()
}

pub fn awareness(changes: Vec<AwarenessChange>) -> Vec<u8> {
    Message::Awareness(changes).encode()
}

/// Prefix an already family-encoded payload with its kind tag.
pub fn encode_envelope(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.write_var(kind.tag());
    buf.write_all(payload);
    buf
}

/// Split a frame into its kind and a reader positioned at the payload.
pub fn decode_envelope(bytes: &[u8]) -> Result<(MessageKind, Cursor<'_>), ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let mut reader = Cursor::new(bytes);
    let tag: u64 = reader.read_var()?;
    Ok((MessageKind::from_tag(tag)?, reader))
}

/// Undecodable frame. The frame is dropped; the connection survives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message kind {0}")]
    UnknownKind(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_step1_layout() {
        let bytes = sync_step1(vec![1, 2, 3]);
        assert_eq!(bytes, vec![0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn test_sync_update_layout() {
        let bytes = sync_update(vec![9, 9]);
        assert_eq!(bytes, vec![0, 2, 2, 9, 9]);
    }

    #[test]
    fn test_sync_messages_decode() {
        for msg in [
            SyncMessage::Step1(vec![10, 20]),
            SyncMessage::Step2(vec![]),
            SyncMessage::Update(vec![42; 300]),
        ] {
            let decoded = Message::decode(&Message::Sync(msg.clone()).encode()).unwrap();
            assert_eq!(decoded, Message::Sync(msg));
        }
    }

    #[test]
    fn test_awareness_layout() {
        let bytes = awareness(vec![AwarenessChange::live(7, 1, b"{}".to_vec())]);
        // kind, batch length, count, client, clock, state length, state
        assert_eq!(bytes, vec![1, 6, 1, 7, 1, 2, b'{', b'}']);
    }

    #[test]
    fn test_awareness_batch_with_tombstone() {
        let changes = vec![
            AwarenessChange::live(300, 5, b"{\"name\":\"ada\"}".to_vec()),
            AwarenessChange::tombstone(301, 9),
        ];
        let decoded = Message::decode(&awareness(changes.clone())).unwrap();
        assert_eq!(decoded, Message::Awareness(changes));
    }

    #[test]
    fn test_awareness_json_null_is_tombstone() {
        let mut inner = Vec::new();
        inner.write_var(1u64);
        inner.write_var(4u64);
        inner.write_var(2u64);
        inner.write_buf(b"null");
        let mut payload = Vec::new();
        payload.write_buf(inner);
        let frame = encode_envelope(MessageKind::Awareness, &payload);

        match Message::decode(&frame).unwrap() {
            Message::Awareness(changes) => {
                assert_eq!(changes, vec![AwarenessChange::tombstone(4, 2)]);
            }
            other => panic!("expected awareness, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(
            Message::decode(&[5, 0, 0]),
            Err(ProtocolError::UnknownKind(5))
        );
    }

    #[test]
    fn test_unknown_sync_type_rejected() {
        assert_eq!(
            Message::decode(&[0, 3, 0]),
            Err(ProtocolError::UnknownSyncType(3))
        );
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let full = sync_update(vec![1, 2, 3, 4]);
        for cut in 1..full.len() {
            assert!(
                matches!(Message::decode(&full[..cut]), Err(ProtocolError::Malformed(_))),
                "prefix of {cut} bytes should not decode"
            );
        }

        let full = awareness(vec![AwarenessChange::live(1, 1, b"x".to_vec())]);
        assert!(Message::decode(&full[..full.len() - 1]).is_err());
    }

    #[test]
    fn test_lying_awareness_count() {
        let mut inner = Vec::new();
        inner.write_var(u32::MAX as u64);
        let mut payload = Vec::new();
        payload.write_buf(inner);
        let frame = encode_envelope(MessageKind::Awareness, &payload);
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = sync_step2(vec![7]);
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        assert_eq!(
            Message::decode(&bytes).unwrap(),
            Message::Sync(SyncMessage::Step2(vec![7]))
        );
    }

    #[test]
    fn test_decode_envelope_exposes_payload_reader() {
        let frame = encode_envelope(MessageKind::Sync, &[2, 1, 0xAB]);
        let (kind, mut reader) = decode_envelope(&frame).unwrap();
        assert_eq!(kind, MessageKind::Sync);
        let subtype: u64 = reader.read_var().unwrap();
        assert_eq!(subtype, 2);
        assert_eq!(reader.read_buf().unwrap(), &[0xAB]);
    }

    #[test]
    fn test_state_vector_decodes_yrs_encoding() {
        use yrs::updates::encoder::Encode;
        let sv: StateVector = [(7u64, 3u32), (1 << 40, 12)].into_iter().collect();
        assert_eq!(decode_state_vector(&sv.encode_v1()).unwrap(), sv);
        assert_eq!(decode_state_vector(&[0]).unwrap(), StateVector::default());
    }

    #[test]
    fn test_state_vector_lying_count_rejected() {
        // Claims 2^32 - 1 entries backed by two bytes.
        let err = decode_state_vector(&[0xff, 0xff, 0xff, 0xff, 0x0f, 1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(decode_state_vector(&[2, 1, 1]).is_err());
        assert!(decode_state_vector(&[]).is_err());
    }

    #[test]
    fn test_message_kind_values() {
        assert_eq!(MessageKind::Sync as u8, 0);
        assert_eq!(MessageKind::Awareness as u8, 1);
        assert_eq!(MessageKind::from_tag(1).unwrap(), MessageKind::Awareness);
    }
}
