//! Message channel: ordered, attributed chat log with local echo.

use uuid::Uuid;

use crate::peer::PeerHandle;

/// Max chat text size in bytes. Anything larger cannot be represented as a
/// single reliable datagram and is rejected before hand-off.
pub const MAX_TEXT_LEN: usize = 16 * 1024;

/// One chat message. Immutable once appended to the log.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub text: String,
    /// Who authored it: the local identity or the remote peer.
    pub origin: PeerHandle,
    pub is_local: bool,
    /// Position in the session log; restarts at 0 each session.
    pub seq: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("message text exceeds {} bytes", MAX_TEXT_LEN)]
    InvalidInput,
}

/// Encode chat text for the transport. Empty text is the caller's no-op
/// case and never reaches here.
pub fn encode_text(text: &str) -> Result<Vec<u8>, SendError> {
    if text.len() > MAX_TEXT_LEN {
        return Err(SendError::InvalidInput);
    }
    Ok(text.as_bytes().to_vec())
}

/// Decode a received payload. `None` means the bytes are not valid UTF-8;
/// the caller drops the event without touching the log.
pub fn decode_text(payload: &[u8]) -> Option<String> {
    match std::str::from_utf8(payload) {
        Ok(s) => Some(s.to_owned()),
        Err(_) => None,
    }
}

/// Append-only session log. Order is the local observation order of
/// send/receive events; no cross-device reconciliation. Cleared whenever
/// the connection returns to idle (no history beyond one session).
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local echo: record a sent message at hand-off time, before any
    /// transport acknowledgment.
    pub fn append_local(&mut self, text: String, local: &PeerHandle) -> Message {
        self.append(text, local.clone(), true)
    }

    pub fn append_remote(&mut self, text: String, from: &PeerHandle) -> Message {
        self.append(text, from.clone(), false)
    }

    fn append(&mut self, text: String, origin: PeerHandle, is_local: bool) -> Message {
        let msg = Message {
            id: Uuid::new_v4(),
            text,
            origin,
            is_local,
            seq: self.entries.len() as u64,
        };
        self.entries.push(msg.clone());
        msg
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
