//! Inbound invitations and the one-shot decision token.

use std::fmt;

use crate::peer::PeerHandle;

/// Single-use token for answering an inbound invitation. Wraps the decision
/// callback handed over by the transport.
///
/// Invariants: the callback runs at most once (`respond` consumes it; a
/// second call is a warn-logged no-op), and at least once (an unconsumed
/// token declines on drop, so the transport-side request is never left
/// pending).
pub struct InvitationResponder {
    decide: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl InvitationResponder {
    pub fn new(decide: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            decide: Some(Box::new(decide)),
        }
    }

    /// Deliver the decision. Returns false if the token was already consumed.
    pub fn respond(&mut self, accept: bool) -> bool {
        match self.decide.take() {
            Some(decide) => {
                decide(accept);
                true
            }
            None => {
                tracing::warn!("invitation decision delivered twice; ignoring");
                false
            }
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.decide.is_none()
    }
}

impl Drop for InvitationResponder {
    fn drop(&mut self) {
        if let Some(decide) = self.decide.take() {
            tracing::debug!("invitation token dropped unanswered; declining");
            decide(false);
        }
    }
}

impl fmt::Debug for InvitationResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvitationResponder")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// An inbound invitation awaiting the collaborator's accept/decline.
/// At most one exists at a time; see the facade for the arbitration policy.
#[derive(Debug)]
pub struct PendingInvitation {
    pub from: PeerHandle,
    pub responder: InvitationResponder,
}
