//! LAN discovery: UDP multicast beacons gated by the advertise/browse
//! toggles, peer liveness timeout, and the address book the session layer
//! dials from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::wire::{decode_frame, encode_frame};
use parley_core::{Frame, PeerHandle, PeerId, TransportEvent, TransportOp, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const MULTICAST_GROUP: &str = "239.255.70.70";
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// Advertise/browse switches, flipped by core actions and read by the
/// discovery loops. Independent sub-toggles; no coupling between the two.
#[derive(Clone, Default)]
pub struct Toggles {
    advertising: Arc<AtomicBool>,
    browsing: Arc<AtomicBool>,
}

impl Toggles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_advertising(&self, on: bool) {
        self.advertising.store(on, Ordering::SeqCst);
    }

    pub fn set_browsing(&self, on: bool) {
        self.browsing.store(on, Ordering::SeqCst);
    }

    fn advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    fn browsing(&self) -> bool {
        self.browsing.load(Ordering::SeqCst)
    }
}

/// Session addresses learned from beacons, keyed by peer identity. The
/// session layer reads this when an invite action names a peer to dial.
pub type PeerAddrs = Arc<Mutex<HashMap<PeerId, SocketAddr>>>;

pub async fn run_discovery(
    local: PeerHandle,
    discovery_port: u16,
    session_port: u16,
    toggles: Toggles,
    peer_addrs: PeerAddrs,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<()> {
    let socket = match make_multicast_socket(discovery_port).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            // One socket backs both activities; report the loss of each.
            for op in [TransportOp::Advertise, TransportOp::Browse] {
                let _ = events_tx.send(TransportEvent::TransportUnavailable {
                    op,
                    detail: e.to_string(),
                });
            }
            return Err(e);
        }
    };
    let seen: Arc<Mutex<HashMap<PeerId, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

    let beacon_socket = socket.clone();
    let beacon_local = local.clone();
    let beacon_toggles = toggles.clone();
    let beacon_task = tokio::spawn(async move {
        beacon_loop(
            beacon_socket,
            beacon_local,
            discovery_port,
            session_port,
            beacon_toggles,
        )
        .await
    });
    let recv_seen = seen.clone();
    let recv_addrs = peer_addrs.clone();
    let recv_events = events_tx.clone();
    let recv_task = tokio::spawn(async move {
        recv_loop(
            socket,
            local,
            session_port,
            toggles,
            recv_seen,
            recv_addrs,
            recv_events,
        )
        .await
    });
    let timeout_task = tokio::spawn(async move { timeout_loop(seen, peer_addrs, events_tx).await });

    let _ = tokio::try_join!(beacon_task, recv_task, timeout_task);
    Ok(())
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let multicast: std::net::Ipv4Addr =
        MULTICAST_GROUP
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            })?;
    std_sock.join_multicast_v4(&multicast, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Broadcast presence while the advertise toggle is on.
async fn beacon_loop(
    socket: Arc<UdpSocket>,
    local: PeerHandle,
    discovery_port: u16,
    session_port: u16,
    toggles: Toggles,
) -> std::io::Result<()> {
    let beacon = Frame::Beacon {
        protocol_version: PROTOCOL_VERSION,
        peer_id: local.id,
        display_name: local.display_name.clone(),
        session_port,
    };
    let frame = encode_frame(&beacon)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest: SocketAddr = format!("{}:{}", MULTICAST_GROUP, discovery_port)
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    loop {
        if toggles.advertising() {
            let _ = socket.send_to(&frame, dest).await;
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    local: PeerHandle,
    session_port: u16,
    toggles: Toggles,
    seen: Arc<Mutex<HashMap<PeerId, Instant>>>,
    peer_addrs: PeerAddrs,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    let reply = encode_frame(&Frame::BeaconReply {
        protocol_version: PROTOCOL_VERSION,
        peer_id: local.id,
        display_name: local.display_name.clone(),
        session_port,
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok((frame, _)) = decode_frame(&buf[..n]) else {
            debug!(%from, "undecodable discovery datagram; ignoring");
            continue;
        };
        match frame {
            Frame::Beacon {
                protocol_version,
                peer_id,
                display_name,
                session_port: peer_port,
            } => {
                if protocol_version != PROTOCOL_VERSION || peer_id == local.id {
                    continue;
                }
                if toggles.advertising() {
                    // Unicast back so the beaconing peer sees us even if
                    // our own beacons go missing.
                    let _ = socket.send_to(&reply, from).await;
                }
                if toggles.browsing() {
                    let addr = SocketAddr::new(from.ip(), peer_port);
                    track_peer(peer_id, display_name, addr, &seen, &peer_addrs, &events_tx).await;
                }
            }
            Frame::BeaconReply {
                protocol_version,
                peer_id,
                display_name,
                session_port: peer_port,
            } => {
                if protocol_version != PROTOCOL_VERSION || peer_id == local.id {
                    continue;
                }
                if toggles.browsing() {
                    let addr = SocketAddr::new(from.ip(), peer_port);
                    track_peer(peer_id, display_name, addr, &seen, &peer_addrs, &events_tx).await;
                }
            }
            _ => {}
        }
    }
}

async fn track_peer(
    id: PeerId,
    display_name: String,
    addr: SocketAddr,
    seen: &Mutex<HashMap<PeerId, Instant>>,
    peer_addrs: &PeerAddrs,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
    let is_new = seen.lock().await.insert(id, Instant::now()).is_none();
    peer_addrs.lock().await.insert(id, addr);
    if is_new {
        let handle = PeerHandle::new(id, display_name);
        debug!(peer = %handle, %addr, "peer visible");
        let _ = events_tx.send(TransportEvent::PeerFound {
            handle,
            metadata: HashMap::new(),
        });
    }
}

/// Expire peers whose beacons stopped. Loss necessarily lags departure by
/// up to the timeout.
async fn timeout_loop(
    seen: Arc<Mutex<HashMap<PeerId, Instant>>>,
    peer_addrs: PeerAddrs,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let timed_out: Vec<PeerId> = {
            let mut s = seen.lock().await;
            let list: Vec<PeerId> = s
                .iter()
                .filter(|(_, t)| now.duration_since(**t) >= PEER_TIMEOUT)
                .map(|(id, _)| *id)
                .collect();
            for id in &list {
                s.remove(id);
            }
            list
        };
        for id in timed_out {
            peer_addrs.lock().await.remove(&id);
            debug!(peer = %id, "peer timed out");
            let _ = events_tx.send(TransportEvent::PeerLost { id });
        }
    }
}
