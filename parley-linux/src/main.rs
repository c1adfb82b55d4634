// Parley Linux: LAN chat daemon (multicast discovery, TCP sessions, stdin commands).

mod config;
mod discovery;
mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use parley_core::{Action, Connectivity, Notification, PeerHandle, PeerId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

use crate::transport::TransportCmd;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handles the action layer writes to: the discovery toggles plus the
/// session command channel.
#[derive(Clone)]
struct Net {
    toggles: discovery::Toggles,
    cmd_tx: mpsc::UnboundedSender<TransportCmd>,
}

/// Perform core actions against the real transport. Fire and forget; the
/// outcomes come back as events.
fn apply_actions(net: &Net, actions: Vec<Action>) {
    for action in actions {
        match action {
            Action::StartAdvertising => net.toggles.set_advertising(true),
            Action::StopAdvertising => net.toggles.set_advertising(false),
            Action::StartBrowsing => net.toggles.set_browsing(true),
            Action::StopBrowsing => net.toggles.set_browsing(false),
            Action::Invite { peer, timeout_secs } => {
                let _ = net.cmd_tx.send(TransportCmd::Invite { peer, timeout_secs });
            }
            Action::SendReliable { to, payload } => {
                let _ = net.cmd_tx.send(TransportCmd::Send { to, payload });
            }
            Action::Disconnect => {
                let _ = net.cmd_tx.send(TransportCmd::Disconnect);
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("parley-linux {}", VERSION);
            return Ok(());
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cfg = config::load();
    let local = PeerHandle::new(PeerId::random(), cfg.display_name.clone());
    tracing::info!(id = %local.id, name = %local.display_name, "parley-linux {}", VERSION);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, local))
}

async fn run(cfg: config::Config, local: PeerHandle) -> anyhow::Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let core = Arc::new(Mutex::new(Connectivity::with_notifier(
        local.clone(),
        move |n| {
            let _ = notify_tx.send(n);
        },
    )));
    let toggles = discovery::Toggles::new();
    let peer_addrs: discovery::PeerAddrs = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let net = Net {
        toggles: toggles.clone(),
        cmd_tx,
    };
    let discovery_port = cfg.discovery_port;
    let session_port = cfg.session_port;

    {
        let local = local.clone();
        let peer_addrs = peer_addrs.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let _ = discovery::run_discovery(
                local,
                discovery_port,
                session_port,
                toggles,
                peer_addrs,
                events_tx,
            )
            .await;
        });
    }
    {
        let local = local.clone();
        tokio::spawn(async move {
            let _ =
                transport::run_transport(local, session_port, peer_addrs, cmd_rx, events_tx).await;
        });
    }

    // Single-writer pump: every transport event goes through the core under
    // one lock, and the resulting actions go back out.
    {
        let core = core.clone();
        let net = net.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let actions = core.lock().await.handle_event(event);
                apply_actions(&net, actions);
            }
        });
    }

    // Chat surface: print state changes and messages as they land.
    tokio::spawn(async move {
        while let Some(n) = notify_rx.recv().await {
            print_notification(&n);
        }
    });

    println!("parley ready; /help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(line.trim(), &core, &net).await {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    // One teardown path no matter which exit got us here.
    let actions = core.lock().await.shutdown();
    apply_actions(&net, actions);
    Ok(())
}

fn print_notification(n: &Notification) {
    match n {
        Notification::PeersChanged => println!("* nearby peers changed (/peers to list)"),
        Notification::StateChanged(state) => println!("* state: {:?}", state),
        Notification::InvitationPending(from) => {
            println!("* {} wants to chat; /accept or /decline", from.display_name)
        }
        Notification::MessageAppended(msg) => {
            if msg.is_local {
                println!("<you> {}", msg.text);
            } else {
                println!("<{}> {}", msg.origin.display_name, msg.text);
            }
        }
        Notification::TransportFailure { op, detail } => {
            println!("* {:?} failed: {}", op, detail)
        }
    }
}

/// Returns false when the loop should exit.
async fn handle_command(line: &str, core: &Arc<Mutex<Connectivity>>, net: &Net) -> bool {
    if line.is_empty() {
        return true;
    }
    let (cmd, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    if !cmd.starts_with('/') {
        // Bare text is chat once a session is up.
        let mut c = core.lock().await;
        match c.send(line) {
            Ok(actions) => {
                drop(c);
                apply_actions(net, actions);
            }
            Err(e) => println!("* {}", e),
        }
        return true;
    }
    match cmd {
        "/help" => {
            println!("/start /stop /advertise on|off /browse on|off /peers");
            println!("/invite <n> /accept /decline /send <text> /disconnect /quit");
        }
        "/start" => {
            let actions = core.lock().await.enable_discovery();
            apply_actions(net, actions);
        }
        "/stop" => {
            let actions = core.lock().await.disable_discovery();
            apply_actions(net, actions);
        }
        "/advertise" | "/browse" => {
            let on = match rest {
                "on" => true,
                "off" => false,
                _ => {
                    println!("* usage: {} on|off", cmd);
                    return true;
                }
            };
            let mut c = core.lock().await;
            let actions = if cmd == "/advertise" {
                c.set_advertising(on)
            } else {
                c.set_browsing(on)
            };
            drop(c);
            apply_actions(net, actions);
        }
        "/peers" => {
            let c = core.lock().await;
            if c.peers().is_empty() {
                println!("* no peers visible");
            }
            for (i, p) in c.peers().iter().enumerate() {
                println!("  [{}] {}", i, p);
            }
        }
        "/invite" => {
            let Ok(idx) = rest.parse::<usize>() else {
                println!("* usage: /invite <n>");
                return true;
            };
            let mut c = core.lock().await;
            let Some(peer) = c.peers().get(idx).cloned() else {
                println!("* no peer [{}]", idx);
                return true;
            };
            let actions = c.invite(&peer);
            drop(c);
            apply_actions(net, actions);
        }
        "/accept" | "/decline" => {
            let actions = core.lock().await.respond_to_invitation(cmd == "/accept");
            apply_actions(net, actions);
        }
        "/send" => {
            let mut c = core.lock().await;
            match c.send(rest) {
                Ok(actions) => {
                    drop(c);
                    apply_actions(net, actions);
                }
                Err(e) => println!("* {}", e),
            }
        }
        "/disconnect" => {
            let actions = core.lock().await.disconnect();
            apply_actions(net, actions);
        }
        "/quit" => return false,
        _ => println!("* unknown command {}; /help for the list", cmd),
    }
    true
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
