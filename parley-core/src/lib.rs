//! Parley nearby-chat core.
//! Host-driven: no I/O; the host feeds commands and transport events and
//! performs the returned actions.

pub mod channel;
pub mod event;
pub mod facade;
pub mod invitation;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use channel::{Message, MessageLog, SendError, MAX_TEXT_LEN};
pub use event::{Action, LinkState, TransportEvent, TransportOp};
pub use facade::{
    ConnectionState, Connectivity, Notification, DEFAULT_INVITE_TIMEOUT_SECS,
};
pub use invitation::{InvitationResponder, PendingInvitation};
pub use peer::{PeerHandle, PeerId};
pub use protocol::{Frame, PROTOCOL_VERSION};
pub use registry::DiscoveryRegistry;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
