//! Transport seam: inbound event stream and outbound action list.
//!
//! The core performs no I/O. The host feeds every transport callback in as
//! one `TransportEvent` variant and performs the `Action`s the core returns;
//! together the two enums are the whole transport interface the core
//! requires (advertise/browse toggles, invitations, reliable datagrams).

use std::collections::HashMap;

use crate::invitation::InvitationResponder;
use crate::peer::{PeerHandle, PeerId};

/// Link state for one peer as reported by the transport.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkState {
    /// Session setup in flight. Bookkeeping only; never a state transition.
    Connecting,
    Connected,
    NotConnected,
}

/// Transport primitive that failed, for failure notifications.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportOp {
    Advertise,
    Browse,
    Invite,
    Send,
}

/// Inbound events from the transport. May originate on any thread; the host
/// must serialize them (with commands) into the facade.
#[derive(Debug)]
pub enum TransportEvent {
    /// A nearby peer became visible while browsing. `metadata` is the
    /// transport's advertised key-value info; the core ignores it beyond
    /// logging.
    PeerFound {
        handle: PeerHandle,
        metadata: HashMap<String, String>,
    },
    /// A previously visible peer is gone. Loss detection lags actual
    /// departure, so stale events are expected and tolerated.
    PeerLost { id: PeerId },
    /// A peer asked to establish a session. The responder must be consumed
    /// exactly once; the core guards both the zero- and double-use paths.
    InvitationReceived {
        from: PeerHandle,
        responder: InvitationResponder,
    },
    /// Session link state changed for a peer, on either side of an invite.
    ConnectionStateChanged { peer: PeerHandle, state: LinkState },
    /// Reliable datagram arrived from a connected peer.
    DataReceived { payload: Vec<u8>, from: PeerId },
    /// Async outcome of a previously issued `Action::Invite`.
    InviteFailed { peer: PeerHandle, reason: String },
    /// The transport failed to deliver a previously handed-off payload.
    /// The local echo is never retracted.
    SendFailed { peer: PeerId, reason: String },
    /// The underlying transport could not be created or bound for an
    /// operation (advertise/browse socket failure and the like).
    TransportUnavailable { op: TransportOp, detail: String },
}

/// Actions for the host to perform against the real transport. Fire and
/// forget: outcomes come back later as `TransportEvent`s, never as a
/// blocking return.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Action {
    StartAdvertising,
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
    /// Invite a discovered peer. `timeout_secs` is always positive; the
    /// facade substitutes the default for non-positive caller values.
    Invite { peer: PeerHandle, timeout_secs: u64 },
    /// Hand a payload to the transport for reliable in-order delivery.
    SendReliable { to: PeerId, payload: Vec<u8> },
    /// Tear down the active session.
    Disconnect,
}
