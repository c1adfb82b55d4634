//! LAN wire protocol: frame types exchanged by hosts that speak the
//! multicast-discovery/TCP-session transport.

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Current protocol version. Carried in beacons and invites; peers on a
/// different version are invisible to each other.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire frame types. Encoding is bincode; framing is length-prefix
/// (see the wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Discovery: advertise presence over multicast with the port the
    /// advertiser accepts sessions on.
    Beacon {
        protocol_version: u8,
        peer_id: PeerId,
        display_name: String,
        session_port: u16,
    },
    /// Unicast reply to a beacon, so a browsing-only peer still learns who
    /// is advertising nearby.
    BeaconReply {
        protocol_version: u8,
        peer_id: PeerId,
        display_name: String,
        session_port: u16,
    },
    /// Session request, sent as the first frame on a fresh TCP connection.
    Invite {
        protocol_version: u8,
        peer_id: PeerId,
        display_name: String,
    },
    /// Answer to an `Invite`. A declined connection is closed right after.
    InviteDecision { accepted: bool },
    /// Chat payload (UTF-8 text bytes) on an established session.
    Chat { payload: Vec<u8> },
    /// Graceful session teardown.
    Bye,
}
