//! Connectivity facade: single owner of discovery, session, and log state.
//!
//! Host-driven, like the rest of the core: commands and transport events
//! mutate the facade and return actions for the host to perform. All calls
//! must be serialized by the host (one event loop or a mutex with short
//! critical sections); no call blocks on I/O.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::channel::{self, Message, MessageLog, SendError};
use crate::event::{Action, LinkState, TransportEvent, TransportOp};
use crate::invitation::{InvitationResponder, PendingInvitation};
use crate::peer::{PeerHandle, PeerId};
use crate::registry::DiscoveryRegistry;

/// Default invitation timeout. Non-positive caller timeouts are replaced by
/// this, never treated as "no timeout".
pub const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 30;

/// Session negotiation state. Exactly one instance, owned by the facade.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    AwaitingInvitationResponse,
    Connected,
}

/// State-change notifications published to the collaborator. Delivery is
/// fire-and-forget through the registered listener; observers that need the
/// data read it back through the facade's getters.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PeersChanged,
    StateChanged(ConnectionState),
    InvitationPending(PeerHandle),
    MessageAppended(Message),
    TransportFailure { op: TransportOp, detail: String },
}

type Notifier = Box<dyn Fn(Notification) + Send>;

/// The facade. Owns the discovered-peer set, the connection state, the
/// pending-invitation slot, and the message log; nothing else mutates them.
pub struct Connectivity {
    local: PeerHandle,
    advertising: bool,
    browsing: bool,
    state: ConnectionState,
    registry: DiscoveryRegistry,
    pending: Option<PendingInvitation>,
    /// Invitation accepted, session not yet reported up by the transport.
    accepted_from: Option<PeerHandle>,
    active: Option<PeerHandle>,
    log: MessageLog,
    notifier: Option<Notifier>,
}

impl Connectivity {
    pub fn new(local: PeerHandle) -> Self {
        Self {
            local,
            advertising: false,
            browsing: false,
            state: ConnectionState::Idle,
            registry: DiscoveryRegistry::new(),
            pending: None,
            accepted_from: None,
            active: None,
            log: MessageLog::new(),
            notifier: None,
        }
    }

    pub fn with_notifier(
        local: PeerHandle,
        notifier: impl Fn(Notification) + Send + 'static,
    ) -> Self {
        let mut this = Self::new(local);
        this.notifier = Some(Box::new(notifier));
        this
    }

    /// Replace the state-change listener. The listener should hold only a
    /// lightweight handle (a channel sender); dropping the receiving side
    /// is how an observer unregisters.
    pub fn set_notifier(&mut self, notifier: impl Fn(Notification) + Send + 'static) {
        self.notifier = Some(Box::new(notifier));
    }

    pub fn clear_notifier(&mut self) {
        self.notifier = None;
    }

    // Observable state.

    pub fn local(&self) -> &PeerHandle {
        &self.local
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn peers(&self) -> &[PeerHandle] {
        self.registry.peers()
    }

    /// Originator of the invitation currently awaiting a decision, if any.
    pub fn pending_invitation(&self) -> Option<&PeerHandle> {
        self.pending.as_ref().map(|p| &p.from)
    }

    pub fn active_peer(&self) -> Option<&PeerHandle> {
        self.active.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    // Commands.

    /// Toggle advertising (being discoverable). Idempotent: an action is
    /// emitted only on an actual edge.
    pub fn set_advertising(&mut self, on: bool) -> Vec<Action> {
        if on && self.state == ConnectionState::Connected {
            warn!("advertising enable ignored while a session is active");
            return vec![];
        }
        if self.advertising == on {
            return vec![];
        }
        self.advertising = on;
        let actions = vec![if on {
            Action::StartAdvertising
        } else {
            Action::StopAdvertising
        }];
        self.sync_discovery_state();
        actions
    }

    /// Toggle browsing (scanning for others). Independent of advertising;
    /// no coupling invariant between the two.
    pub fn set_browsing(&mut self, on: bool) -> Vec<Action> {
        if on && self.state == ConnectionState::Connected {
            warn!("browsing enable ignored while a session is active");
            return vec![];
        }
        if self.browsing == on {
            return vec![];
        }
        self.browsing = on;
        let actions = vec![if on {
            Action::StartBrowsing
        } else {
            Action::StopBrowsing
        }];
        self.sync_discovery_state();
        actions
    }

    /// Start advertising and browsing together (discoverable and
    /// discovering).
    pub fn enable_discovery(&mut self) -> Vec<Action> {
        let mut actions = self.set_advertising(true);
        actions.extend(self.set_browsing(true));
        actions
    }

    /// Stop both discovery activities. Safe to call when nothing is
    /// running.
    pub fn disable_discovery(&mut self) -> Vec<Action> {
        let mut actions = self.set_advertising(false);
        actions.extend(self.set_browsing(false));
        actions
    }

    /// Invite a discovered peer with the default timeout.
    pub fn invite(&mut self, peer: &PeerHandle) -> Vec<Action> {
        self.invite_with_timeout(peer, DEFAULT_INVITE_TIMEOUT_SECS as i64)
    }

    /// Invite with a caller-supplied timeout. Zero and negative values fall
    /// back to the default. Valid only while discovering with the peer
    /// visible; anything else is a caller bug, logged and ignored.
    pub fn invite_with_timeout(&mut self, peer: &PeerHandle, timeout_secs: i64) -> Vec<Action> {
        if self.state != ConnectionState::Discovering {
            warn!(state = ?self.state, "invite outside discovery; ignoring");
            return vec![];
        }
        let Some(handle) = self.registry.peers().iter().find(|p| p.id == peer.id).cloned()
        else {
            warn!(peer = %peer, "invite for a peer not in the registry; ignoring");
            return vec![];
        };
        let timeout_secs = if timeout_secs <= 0 {
            DEFAULT_INVITE_TIMEOUT_SECS
        } else {
            timeout_secs as u64
        };
        info!(peer = %handle, timeout_secs, "inviting peer");
        vec![Action::Invite {
            peer: handle,
            timeout_secs,
        }]
    }

    /// Answer the pending inbound invitation. The underlying one-shot token
    /// is consumed here; a response with nothing pending is logged and
    /// ignored.
    pub fn respond_to_invitation(&mut self, accept: bool) -> Vec<Action> {
        let Some(mut pending) = self.pending.take() else {
            warn!("invitation response with nothing pending; ignoring");
            return vec![];
        };
        pending.responder.respond(accept);
        if accept {
            info!(from = %pending.from, "invitation accepted; waiting for the session");
            self.accepted_from = Some(pending.from);
            // Stay in AwaitingInvitationResponse until the transport
            // reports the session outcome.
        } else {
            info!(from = %pending.from, "invitation declined");
            self.resume_discovery_state();
        }
        vec![]
    }

    /// Send chat text to the connected peer. Empty text is a no-op; text
    /// too large for one datagram is `InvalidInput`. The local echo is
    /// appended synchronously at hand-off, before any transport outcome.
    pub fn send(&mut self, text: &str) -> Result<Vec<Action>, SendError> {
        let Some(active) = self.active.clone() else {
            warn!("send while not connected; ignoring");
            return Ok(vec![]);
        };
        if text.is_empty() {
            return Ok(vec![]);
        }
        let payload = channel::encode_text(text)?;
        let msg = self.log.append_local(text.to_owned(), &self.local);
        self.notify(Notification::MessageAppended(msg));
        Ok(vec![Action::SendReliable {
            to: active.id,
            payload,
        }])
    }

    /// Drop the active session and discard its log. Idempotent: a no-op
    /// when nothing is connected. Discovery is not resumed.
    pub fn disconnect(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connected {
            return vec![];
        }
        info!(peer = ?self.active.as_ref().map(|p| p.to_string()), "disconnecting");
        self.active = None;
        self.log.clear();
        self.set_state(ConnectionState::Idle);
        vec![Action::Disconnect]
    }

    /// Single teardown path, run once regardless of which exit triggered
    /// it: declines any pending invitation, drops the session, stops both
    /// discovery activities, discards all accumulated state. Idempotent.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(mut pending) = self.pending.take() {
            debug!(from = %pending.from, "declining pending invitation at teardown");
            pending.responder.respond(false);
        }
        self.accepted_from = None;
        if self.state == ConnectionState::Connected {
            self.active = None;
            actions.push(Action::Disconnect);
        }
        if self.advertising {
            self.advertising = false;
            actions.push(Action::StopAdvertising);
        }
        if self.browsing {
            self.browsing = false;
            actions.push(Action::StopBrowsing);
        }
        if !self.registry.is_empty() {
            self.registry.clear();
            self.notify(Notification::PeersChanged);
        }
        self.log.clear();
        self.set_state(ConnectionState::Idle);
        actions
    }

    // Transport events.

    /// Feed one transport event through the state machine.
    pub fn handle_event(&mut self, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::PeerFound { handle, metadata } => {
                self.on_peer_found(handle, metadata);
                vec![]
            }
            TransportEvent::PeerLost { id } => {
                self.on_peer_lost(id);
                vec![]
            }
            TransportEvent::InvitationReceived { from, responder } => {
                self.on_invitation(from, responder);
                vec![]
            }
            TransportEvent::ConnectionStateChanged { peer, state } => {
                self.on_link_state(peer, state)
            }
            TransportEvent::DataReceived { payload, from } => {
                self.on_data(payload, from);
                vec![]
            }
            TransportEvent::InviteFailed { peer, reason } => {
                warn!(peer = %peer, reason = %reason, "invite failed");
                self.notify(Notification::TransportFailure {
                    op: TransportOp::Invite,
                    detail: reason,
                });
                vec![]
            }
            TransportEvent::SendFailed { peer, reason } => {
                // The local echo stays; there is no message withdrawal.
                warn!(peer = %peer, reason = %reason, "send failed");
                self.notify(Notification::TransportFailure {
                    op: TransportOp::Send,
                    detail: reason,
                });
                vec![]
            }
            TransportEvent::TransportUnavailable { op, detail } => {
                warn!(?op, detail = %detail, "transport unavailable");
                self.notify(Notification::TransportFailure { op, detail });
                vec![]
            }
        }
    }

    fn on_peer_found(&mut self, handle: PeerHandle, metadata: HashMap<String, String>) {
        if handle.id == self.local.id {
            // The registry never contains the local identity.
            return;
        }
        if self.active.as_ref().is_some_and(|a| a.id == handle.id) {
            return;
        }
        if !self.browsing {
            debug!(peer = %handle, "peer found while not browsing; ignoring");
            return;
        }
        debug!(peer = %handle, ?metadata, "peer found");
        if self.registry.found(handle) {
            self.notify(Notification::PeersChanged);
        }
    }

    fn on_peer_lost(&mut self, id: PeerId) {
        // Loss detection lags departure; stale reports fall through the
        // registry as no-ops.
        if self.registry.lost(&id) {
            debug!(peer = %id, "peer lost");
            self.notify(Notification::PeersChanged);
        }
    }

    fn on_invitation(&mut self, from: PeerHandle, mut responder: InvitationResponder) {
        let busy = self.pending.is_some()
            || self.accepted_from.is_some()
            || self.state == ConnectionState::Connected;
        if busy {
            // One pending invitation at a time; a concurrent second one is
            // auto-declined and never replaces the first's token.
            info!(from = %from, "auto-declining invitation while pairing is in progress");
            responder.respond(false);
            return;
        }
        info!(from = %from, "invitation received");
        self.pending = Some(PendingInvitation {
            from: from.clone(),
            responder,
        });
        self.set_state(ConnectionState::AwaitingInvitationResponse);
        self.notify(Notification::InvitationPending(from));
    }

    fn on_link_state(&mut self, peer: PeerHandle, state: LinkState) -> Vec<Action> {
        match state {
            LinkState::Connecting => {
                debug!(peer = %peer, "session connecting");
                vec![]
            }
            LinkState::Connected => self.on_connected(peer),
            LinkState::NotConnected => {
                self.on_not_connected(peer);
                vec![]
            }
        }
    }

    fn on_connected(&mut self, peer: PeerHandle) -> Vec<Action> {
        if self.active.is_some() {
            warn!(peer = %peer, "connected report while a session is active; ignoring");
            return vec![];
        }
        info!(peer = %peer, "session established");
        // One-to-one: no further pairing while the session is active.
        let mut actions = Vec::new();
        if self.advertising {
            self.advertising = false;
            actions.push(Action::StopAdvertising);
        }
        if self.browsing {
            self.browsing = false;
            actions.push(Action::StopBrowsing);
        }
        if !self.registry.is_empty() {
            self.registry.clear();
            self.notify(Notification::PeersChanged);
        }
        self.log.clear();
        if let Some(mut pending) = self.pending.take() {
            // Mutual-invite tie-break resolved by the transport; the now
            // moot inbound request still gets its one decision.
            pending.responder.respond(false);
        }
        self.accepted_from = None;
        self.active = Some(peer);
        self.set_state(ConnectionState::Connected);
        actions
    }

    fn on_not_connected(&mut self, peer: PeerHandle) {
        if self.active.as_ref().is_some_and(|a| a.id == peer.id) {
            info!(peer = %peer, "session dropped");
            self.active = None;
            self.log.clear();
            // Discovery is not auto-resumed; the collaborator must
            // re-enable it.
            self.set_state(ConnectionState::Idle);
        } else if self.accepted_from.as_ref().is_some_and(|a| a.id == peer.id) {
            info!(peer = %peer, "accepted session failed to establish");
            self.accepted_from = None;
            self.resume_discovery_state();
        } else {
            debug!(peer = %peer, "stale not-connected report; ignoring");
        }
    }

    fn on_data(&mut self, payload: Vec<u8>, from: PeerId) {
        let Some(active) = self.active.clone() else {
            debug!(peer = %from, "data with no active session; dropping");
            return;
        };
        if active.id != from {
            debug!(peer = %from, "data from a non-session peer; dropping");
            return;
        }
        match channel::decode_text(&payload) {
            Some(text) => {
                let msg = self.log.append_remote(text, &active);
                self.notify(Notification::MessageAppended(msg));
            }
            None => warn!(peer = %from, len = payload.len(), "undecodable payload; dropping"),
        }
    }

    // Internal state plumbing.

    fn notify(&self, notification: Notification) {
        if let Some(notifier) = &self.notifier {
            notifier(notification);
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            self.state = next;
            self.notify(Notification::StateChanged(next));
        }
    }

    /// Recompute Idle/Discovering from the sub-toggles; leaves invitation
    /// and session states alone.
    fn sync_discovery_state(&mut self) {
        if !self.advertising && !self.browsing && !self.registry.is_empty() {
            // Both activities stopped: stop offering peers.
            self.registry.clear();
            self.notify(Notification::PeersChanged);
        }
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::AwaitingInvitationResponse
        ) {
            return;
        }
        self.resume_discovery_state();
    }

    fn resume_discovery_state(&mut self) {
        let target = if self.advertising || self.browsing {
            ConnectionState::Discovering
        } else {
            ConnectionState::Idle
        };
        self.set_state(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    fn handle(name: &str) -> PeerHandle {
        PeerHandle::new(PeerId::random(), name)
    }

    fn discovering(local: PeerHandle) -> Connectivity {
        let mut c = Connectivity::new(local);
        c.enable_discovery();
        c
    }

    fn found(c: &mut Connectivity, peer: &PeerHandle) {
        c.handle_event(TransportEvent::PeerFound {
            handle: peer.clone(),
            metadata: HashMap::new(),
        });
    }

    fn connect(c: &mut Connectivity, peer: &PeerHandle) {
        c.handle_event(TransportEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state: LinkState::Connected,
        });
    }

    /// Responder that records the decision it was consumed with.
    fn recording_responder() -> (InvitationResponder, Arc<Mutex<Option<bool>>>) {
        let decision = Arc::new(Mutex::new(None));
        let d = decision.clone();
        let responder = InvitationResponder::new(move |accept| {
            *d.lock().unwrap() = Some(accept);
        });
        (responder, decision)
    }

    #[test]
    fn enable_discovery_emits_both_starts_once() {
        let mut c = Connectivity::new(handle("me"));
        let actions = c.enable_discovery();
        assert_eq!(actions, vec![Action::StartAdvertising, Action::StartBrowsing]);
        assert_eq!(c.state(), ConnectionState::Discovering);
        // Idempotent per sub-toggle.
        assert!(c.enable_discovery().is_empty());
        assert!(c.set_advertising(true).is_empty());
    }

    #[test]
    fn disable_discovery_twice_is_idempotent() {
        let mut c = discovering(handle("me"));
        let actions = c.disable_discovery();
        assert_eq!(actions, vec![Action::StopAdvertising, Action::StopBrowsing]);
        assert_eq!(c.state(), ConnectionState::Idle);
        assert!(c.disable_discovery().is_empty());
        assert_eq!(c.state(), ConnectionState::Idle);
    }

    #[test]
    fn stopping_both_toggles_clears_registry() {
        let mut c = discovering(handle("me"));
        let b = handle("b");
        found(&mut c, &b);
        assert_eq!(c.peers().len(), 1);
        c.set_browsing(false);
        // Still advertising: peers stay offered.
        assert_eq!(c.peers().len(), 1);
        c.set_advertising(false);
        assert!(c.peers().is_empty());
    }

    #[test]
    fn registry_tracks_found_minus_lost() {
        let mut c = discovering(handle("me"));
        let b = handle("b");
        let x = handle("x");
        found(&mut c, &b);
        found(&mut c, &b);
        found(&mut c, &x);
        c.handle_event(TransportEvent::PeerLost { id: x.id });
        c.handle_event(TransportEvent::PeerLost { id: x.id });
        let ids: Vec<PeerId> = c.peers().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[test]
    fn local_identity_never_enters_registry() {
        let me = handle("me");
        let mut c = discovering(me.clone());
        found(&mut c, &me);
        assert!(c.peers().is_empty());
    }

    #[test]
    fn found_while_not_browsing_is_ignored() {
        let mut c = Connectivity::new(handle("me"));
        c.set_advertising(true);
        let b = handle("b");
        found(&mut c, &b);
        assert!(c.peers().is_empty());
    }

    #[test]
    fn invite_zero_timeout_uses_default() {
        let mut c = discovering(handle("me"));
        let b = handle("b");
        found(&mut c, &b);
        let actions = c.invite_with_timeout(&b, 0);
        assert_eq!(
            actions,
            vec![Action::Invite {
                peer: b.clone(),
                timeout_secs: DEFAULT_INVITE_TIMEOUT_SECS
            }]
        );
        let actions = c.invite_with_timeout(&b, -5);
        assert_eq!(
            actions,
            vec![Action::Invite {
                peer: b,
                timeout_secs: DEFAULT_INVITE_TIMEOUT_SECS
            }]
        );
    }

    #[test]
    fn invite_outside_discovery_or_unknown_peer_is_ignored() {
        let me = handle("me");
        let b = handle("b");
        let mut c = Connectivity::new(me);
        assert!(c.invite(&b).is_empty()); // idle
        c.enable_discovery();
        assert!(c.invite(&b).is_empty()); // not in registry
    }

    #[test]
    fn connection_clears_registry_and_log_and_stops_discovery() {
        let mut c = discovering(handle("me"));
        let b = handle("b");
        found(&mut c, &b);
        let actions = c.handle_event(TransportEvent::ConnectionStateChanged {
            peer: b.clone(),
            state: LinkState::Connected,
        });
        assert_eq!(actions, vec![Action::StopAdvertising, Action::StopBrowsing]);
        assert_eq!(c.state(), ConnectionState::Connected);
        assert!(c.peers().is_empty());
        assert!(c.messages().is_empty());
        assert_eq!(c.active_peer().unwrap().id, b.id);
    }

    #[test]
    fn connecting_is_transient() {
        let mut c = discovering(handle("me"));
        let b = handle("b");
        found(&mut c, &b);
        let actions = c.handle_event(TransportEvent::ConnectionStateChanged {
            peer: b.clone(),
            state: LinkState::Connecting,
        });
        assert!(actions.is_empty());
        assert_eq!(c.state(), ConnectionState::Discovering);
        assert_eq!(c.peers().len(), 1);
    }

    #[test]
    fn send_appends_local_echo_synchronously() {
        let me = handle("me");
        let b = handle("b");
        let mut c = discovering(me.clone());
        found(&mut c, &b);
        connect(&mut c, &b);
        let actions = c.send("hi").unwrap();
        assert_eq!(
            actions,
            vec![Action::SendReliable {
                to: b.id,
                payload: b"hi".to_vec()
            }]
        );
        let log = c.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "hi");
        assert!(log[0].is_local);
        assert_eq!(log[0].origin.id, me.id);
    }

    #[test]
    fn send_empty_is_noop_and_oversized_is_invalid_input() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        assert!(c.send("").unwrap().is_empty());
        assert!(c.messages().is_empty());
        let big = "a".repeat(channel::MAX_TEXT_LEN + 1);
        assert!(c.send(&big).is_err());
        assert!(c.messages().is_empty());
    }

    #[test]
    fn send_while_not_connected_is_guarded() {
        let mut c = discovering(handle("me"));
        assert!(c.send("hi").unwrap().is_empty());
        assert!(c.messages().is_empty());
    }

    #[test]
    fn receive_appends_remote_message() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        c.handle_event(TransportEvent::DataReceived {
            payload: b"hello".to_vec(),
            from: b.id,
        });
        let log = c.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "hello");
        assert!(!log[0].is_local);
        assert_eq!(log[0].origin.id, b.id);
    }

    #[test]
    fn invalid_payload_never_touches_log_or_state() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        c.handle_event(TransportEvent::DataReceived {
            payload: vec![0xff, 0xfe],
            from: b.id,
        });
        assert!(c.messages().is_empty());
        assert_eq!(c.state(), ConnectionState::Connected);
    }

    #[test]
    fn session_drop_clears_log_and_goes_idle_without_resuming_discovery() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        c.send("hi").unwrap();
        c.handle_event(TransportEvent::ConnectionStateChanged {
            peer: b.clone(),
            state: LinkState::NotConnected,
        });
        assert_eq!(c.state(), ConnectionState::Idle);
        assert!(c.messages().is_empty());
        assert!(c.active_peer().is_none());
    }

    #[test]
    fn stale_not_connected_is_ignored() {
        let b = handle("b");
        let other = handle("other");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        c.handle_event(TransportEvent::ConnectionStateChanged {
            peer: other,
            state: LinkState::NotConnected,
        });
        assert_eq!(c.state(), ConnectionState::Connected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        assert_eq!(c.disconnect(), vec![Action::Disconnect]);
        assert_eq!(c.state(), ConnectionState::Idle);
        assert!(c.disconnect().is_empty());
        assert_eq!(c.state(), ConnectionState::Idle);
    }

    #[test]
    fn inbound_invitation_surfaces_and_awaits() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        let (responder, decision) = recording_responder();
        c.handle_event(TransportEvent::InvitationReceived {
            from: b.clone(),
            responder,
        });
        assert_eq!(c.state(), ConnectionState::AwaitingInvitationResponse);
        assert_eq!(c.pending_invitation().unwrap().id, b.id);
        assert!(decision.lock().unwrap().is_none());
    }

    #[test]
    fn decline_returns_to_prior_discovery_state() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        let (responder, decision) = recording_responder();
        c.handle_event(TransportEvent::InvitationReceived {
            from: b,
            responder,
        });
        c.respond_to_invitation(false);
        assert_eq!(*decision.lock().unwrap(), Some(false));
        assert_eq!(c.state(), ConnectionState::Discovering);
        assert!(c.pending_invitation().is_none());
    }

    #[test]
    fn accept_then_connected_establishes_session() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        let (responder, decision) = recording_responder();
        c.handle_event(TransportEvent::InvitationReceived {
            from: b.clone(),
            responder,
        });
        c.respond_to_invitation(true);
        assert_eq!(*decision.lock().unwrap(), Some(true));
        assert_eq!(c.state(), ConnectionState::AwaitingInvitationResponse);
        connect(&mut c, &b);
        assert_eq!(c.state(), ConnectionState::Connected);
        assert_eq!(c.active_peer().unwrap().id, b.id);
    }

    #[test]
    fn accept_then_failure_returns_to_discovery() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        let (responder, _) = recording_responder();
        c.handle_event(TransportEvent::InvitationReceived {
            from: b.clone(),
            responder,
        });
        c.respond_to_invitation(true);
        c.handle_event(TransportEvent::ConnectionStateChanged {
            peer: b,
            state: LinkState::NotConnected,
        });
        assert_eq!(c.state(), ConnectionState::Discovering);
    }

    #[test]
    fn second_invitation_is_auto_declined_and_first_kept() {
        let b = handle("b");
        let x = handle("x");
        let mut c = discovering(handle("me"));
        let (first, first_decision) = recording_responder();
        let (second, second_decision) = recording_responder();
        c.handle_event(TransportEvent::InvitationReceived {
            from: b.clone(),
            responder: first,
        });
        c.handle_event(TransportEvent::InvitationReceived {
            from: x,
            responder: second,
        });
        // Second declined immediately; first still pending and undecided.
        assert_eq!(*second_decision.lock().unwrap(), Some(false));
        assert!(first_decision.lock().unwrap().is_none());
        assert_eq!(c.pending_invitation().unwrap().id, b.id);
        c.respond_to_invitation(true);
        assert_eq!(*first_decision.lock().unwrap(), Some(true));
    }

    #[test]
    fn invitation_while_connected_is_auto_declined() {
        let b = handle("b");
        let x = handle("x");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        let (responder, decision) = recording_responder();
        c.handle_event(TransportEvent::InvitationReceived {
            from: x,
            responder,
        });
        assert_eq!(*decision.lock().unwrap(), Some(false));
        assert_eq!(c.state(), ConnectionState::Connected);
    }

    #[test]
    fn invite_failure_notifies_without_state_change() {
        let b = handle("b");
        let failed = Arc::new(AtomicBool::new(false));
        let f = failed.clone();
        let mut c = Connectivity::with_notifier(handle("me"), move |n| {
            if matches!(
                n,
                Notification::TransportFailure {
                    op: TransportOp::Invite,
                    ..
                }
            ) {
                f.store(true, Ordering::SeqCst);
            }
        });
        c.enable_discovery();
        found(&mut c, &b);
        c.handle_event(TransportEvent::InviteFailed {
            peer: b,
            reason: "unreachable".into(),
        });
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(c.state(), ConnectionState::Discovering);
    }

    #[test]
    fn send_failure_keeps_local_echo() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        c.send("hi").unwrap();
        c.handle_event(TransportEvent::SendFailed {
            peer: b.id,
            reason: "link reset".into(),
        });
        assert_eq!(c.messages().len(), 1);
    }

    #[test]
    fn shutdown_declines_pending_and_is_idempotent() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        let (responder, decision) = recording_responder();
        c.handle_event(TransportEvent::InvitationReceived {
            from: b,
            responder,
        });
        let actions = c.shutdown();
        assert_eq!(*decision.lock().unwrap(), Some(false));
        assert_eq!(actions, vec![Action::StopAdvertising, Action::StopBrowsing]);
        assert_eq!(c.state(), ConnectionState::Idle);
        assert!(c.shutdown().is_empty());
    }

    #[test]
    fn shutdown_tears_down_active_session() {
        let b = handle("b");
        let mut c = discovering(handle("me"));
        found(&mut c, &b);
        connect(&mut c, &b);
        c.send("hi").unwrap();
        let actions = c.shutdown();
        assert_eq!(actions, vec![Action::Disconnect]);
        assert!(c.messages().is_empty());
        assert_eq!(c.state(), ConnectionState::Idle);
    }

    #[test]
    fn notifications_flow_through_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let b = handle("b");
        let mut c = Connectivity::with_notifier(handle("me"), move |n| {
            s.lock().unwrap().push(n);
        });
        c.enable_discovery();
        found(&mut c, &b);
        connect(&mut c, &b);
        c.send("hi").unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&Notification::StateChanged(ConnectionState::Discovering)));
        assert!(seen.contains(&Notification::PeersChanged));
        assert!(seen.contains(&Notification::StateChanged(ConnectionState::Connected)));
        assert!(seen
            .iter()
            .any(|n| matches!(n, Notification::MessageAppended(m) if m.text == "hi")));
    }
}
