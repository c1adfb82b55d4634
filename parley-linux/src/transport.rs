//! TCP sessions: outbound invites, inbound invitation handling, and the
//! framed chat pump for the single active session.

use std::sync::Arc;
use std::time::Duration;

use parley_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use parley_core::{
    Frame, InvitationResponder, LinkState, PeerHandle, PeerId, TransportEvent, TransportOp,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::discovery::PeerAddrs;

/// How long an accepted connection may sit silent before its first frame.
const INVITE_FRAME_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands from the action layer into the session tasks.
#[derive(Debug)]
pub enum TransportCmd {
    Invite { peer: PeerHandle, timeout_secs: u64 },
    Send { to: PeerId, payload: Vec<u8> },
    Disconnect,
}

struct Session {
    peer_id: PeerId,
    frames_tx: mpsc::UnboundedSender<Frame>,
}

/// The single active session slot; one-to-one by construction.
type Active = Arc<Mutex<Option<Session>>>;

pub async fn run_transport(
    local: PeerHandle,
    session_port: u16,
    peer_addrs: PeerAddrs,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCmd>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<()> {
    let listener = match TcpListener::bind(("0.0.0.0", session_port)).await {
        Ok(l) => l,
        Err(e) => {
            let _ = events_tx.send(TransportEvent::TransportUnavailable {
                op: TransportOp::Advertise,
                detail: format!("session listener: {e}"),
            });
            return Err(e);
        }
    };
    let active: Active = Arc::new(Mutex::new(None));

    let accept_local = local.clone();
    let accept_active = active.clone();
    let accept_events = events_tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound session connection");
                    let local = accept_local.clone();
                    let active = accept_active.clone();
                    let events = accept_events.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_inbound(stream, local, active, events).await {
                            debug!(error = %e, "inbound connection ended");
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TransportCmd::Invite { peer, timeout_secs } => {
                let local = local.clone();
                let peer_addrs = peer_addrs.clone();
                let active = active.clone();
                let events = events_tx.clone();
                tokio::spawn(async move {
                    run_invite(local, peer, timeout_secs, peer_addrs, active, events).await;
                });
            }
            TransportCmd::Send { to, payload } => {
                let guard = active.lock().await;
                match guard.as_ref() {
                    Some(s) if s.peer_id == to => {
                        if s.frames_tx.send(Frame::Chat { payload }).is_err() {
                            let _ = events_tx.send(TransportEvent::SendFailed {
                                peer: to,
                                reason: "session closed".into(),
                            });
                        }
                    }
                    _ => {
                        let _ = events_tx.send(TransportEvent::SendFailed {
                            peer: to,
                            reason: "no active session".into(),
                        });
                    }
                }
            }
            TransportCmd::Disconnect => {
                if let Some(s) = active.lock().await.take() {
                    let _ = s.frames_tx.send(Frame::Bye);
                }
            }
        }
    }
    Ok(())
}

/// Dial a discovered peer and ask for a session. The decision (or the
/// timeout) comes back to the core as an event, never a return value.
async fn run_invite(
    local: PeerHandle,
    peer: PeerHandle,
    timeout_secs: u64,
    peer_addrs: PeerAddrs,
    active: Active,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let Some(addr) = peer_addrs.lock().await.get(&peer.id).copied() else {
        let _ = events_tx.send(TransportEvent::InviteFailed {
            peer,
            reason: "peer address unknown".into(),
        });
        return;
    };
    let _ = events_tx.send(TransportEvent::ConnectionStateChanged {
        peer: peer.clone(),
        state: LinkState::Connecting,
    });
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(
            &mut stream,
            &Frame::Invite {
                protocol_version: PROTOCOL_VERSION,
                peer_id: local.id,
                display_name: local.display_name.clone(),
            },
        )
        .await?;
        let mut buf = Vec::new();
        loop {
            if let Frame::InviteDecision { accepted } = read_frame(&mut stream, &mut buf).await? {
                return std::io::Result::Ok((stream, buf, accepted));
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(timeout_secs), attempt).await {
        Err(_) => {
            let _ = events_tx.send(TransportEvent::InviteFailed {
                peer,
                reason: "timed out".into(),
            });
        }
        Ok(Err(e)) => {
            let _ = events_tx.send(TransportEvent::InviteFailed {
                peer,
                reason: e.to_string(),
            });
        }
        Ok(Ok((_, _, false))) => {
            let _ = events_tx.send(TransportEvent::InviteFailed {
                peer,
                reason: "declined".into(),
            });
        }
        Ok(Ok((stream, buf, true))) => {
            run_session(stream, peer, buf, active, events_tx).await;
        }
    }
}

/// Inbound side: read the invite, surface it to the core with a one-shot
/// responder, answer over the wire, then run the session if accepted.
async fn handle_inbound(
    mut stream: TcpStream,
    local: PeerHandle,
    active: Active,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let first = tokio::time::timeout(INVITE_FRAME_TIMEOUT, read_frame(&mut stream, &mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no invite frame"))??;
    let Frame::Invite {
        protocol_version,
        peer_id,
        display_name,
    } = first
    else {
        return Ok(());
    };
    if protocol_version != PROTOCOL_VERSION || peer_id == local.id {
        return Ok(());
    }
    let peer = PeerHandle::new(peer_id, display_name);
    let (decide_tx, decide_rx) = oneshot::channel::<bool>();
    let responder = InvitationResponder::new(move |accept| {
        let _ = decide_tx.send(accept);
    });
    let _ = events_tx.send(TransportEvent::InvitationReceived {
        from: peer.clone(),
        responder,
    });
    // The core consumes the responder exactly once (declining at teardown
    // if nothing else does), so this always resolves.
    let accepted = decide_rx.await.unwrap_or(false);
    if let Err(e) = write_frame(&mut stream, &Frame::InviteDecision { accepted }).await {
        if accepted {
            // The inviter gave up (timeout or teardown) before the answer
            // landed; the accepted session never comes up.
            let _ = events_tx.send(TransportEvent::ConnectionStateChanged {
                peer,
                state: LinkState::NotConnected,
            });
        }
        return Err(e);
    }
    if !accepted {
        return Ok(());
    }
    run_session(stream, peer, buf, active, events_tx).await;
    Ok(())
}

/// Pump chat frames both ways until EOF or `Bye`, then report the drop.
async fn run_session(
    stream: TcpStream,
    peer: PeerHandle,
    mut inbuf: Vec<u8>,
    active: Active,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
    {
        let mut slot = active.lock().await;
        if slot.is_some() {
            // Simultaneous pairings race for the slot; the loser is torn
            // down and the cores only ever see one connected report.
            debug!(peer = %peer, "second session lost the race; closing");
            return;
        }
        *slot = Some(Session {
            peer_id: peer.id,
            frames_tx,
        });
    }
    info!(peer = %peer, "session open");
    let _ = events_tx.send(TransportEvent::ConnectionStateChanged {
        peer: peer.clone(),
        state: LinkState::Connected,
    });

    let (mut reader, mut writer) = stream.into_split();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let done = matches!(frame, Frame::Bye);
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
            if done {
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader, &mut inbuf).await {
            Ok(Frame::Chat { payload }) => {
                let _ = events_tx.send(TransportEvent::DataReceived {
                    payload,
                    from: peer.id,
                });
            }
            Ok(Frame::Bye) | Err(_) => break,
            Ok(_) => {}
        }
    }
    write_task.abort();
    {
        let mut slot = active.lock().await;
        if slot.as_ref().is_some_and(|s| s.peer_id == peer.id) {
            *slot = None;
        }
    }
    info!(peer = %peer, "session closed");
    let _ = events_tx.send(TransportEvent::ConnectionStateChanged {
        peer,
        state: LinkState::NotConnected,
    });
}

async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Frame> {
    loop {
        match decode_frame(buf) {
            Ok((frame, n)) => {
                buf.drain(..n);
                return Ok(frame);
            }
            Err(FrameDecodeError::NeedMore) => {
                let mut chunk = [0u8; 4096];
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let bytes = encode_frame(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}
