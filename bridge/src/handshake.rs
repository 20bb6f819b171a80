//! Session establishment against the Will and Subscription services.
//!
//! Will registration goes first, since the backend ties the stored will to
//! the same establishment. Session resolution follows: a clean session
//! drops whatever the Subscription Service kept for the client, a resumed
//! one lists it. Everything runs under a single deadline; when it elapses
//! the pending confirmations are dropped and any late reply is ignored.

use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::backend::{BackendMessage, Disposition, ReceiverLink, SenderLink, control_address};
use crate::error::RejectReason;
use crate::session::{State, advance};
use crate::types::{Subscription, Will};

/// Result of session establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Resumed session with the subscriptions kept by the backend.
    Accepted(Vec<Subscription>),
    /// Clean session, nothing kept.
    AcceptedFresh,
    Rejected(RejectReason),
}

impl HandshakeOutcome {
    /// CONNACK session-present flag.
    pub fn session_present(&self) -> bool {
        matches!(self, HandshakeOutcome::Accepted(subs) if !subs.is_empty())
    }

    pub fn is_accepted(&self) -> bool {
        !matches!(self, HandshakeOutcome::Rejected(_))
    }
}

/// Drives will registration and session resolution over a session's links.
pub struct Handshake<'a> {
    client_id: &'a str,
    will_link: Option<&'a mut Box<dyn SenderLink>>,
    subscription_link: &'a mut Box<dyn SenderLink>,
    control: &'a mut Box<dyn ReceiverLink>,
    state: Option<&'a mut State>,
}

impl<'a> Handshake<'a> {
    pub fn new(
        client_id: &'a str,
        subscription_link: &'a mut Box<dyn SenderLink>,
        control: &'a mut Box<dyn ReceiverLink>,
    ) -> Self {
        Self {
            client_id,
            will_link: None,
            subscription_link,
            control,
            state: None,
        }
    }

    /// Set the Will Service link, required to register a will.
    pub fn with_will_link(mut self, link: Option<&'a mut Box<dyn SenderLink>>) -> Self {
        self.will_link = link;
        self
    }

    /// Track the stage in `state` while resolving.
    pub fn with_state(mut self, state: &'a mut State) -> Self {
        self.state = Some(state);
        self
    }

    /// Run both stages under `deadline`.
    pub async fn resolve(
        mut self,
        clean_session: bool,
        will: Option<&Will>,
        deadline: Instant,
    ) -> HandshakeOutcome {
        let client_id = self.client_id;
        let stages = async {
            if let Some(will) = will {
                self.enter(State::WillRegistration);
                self.register_will(will).await;
            }
            self.enter(State::SessionResolution);
            self.resolve_session(clean_session).await
        };

        match timeout_at(deadline, stages).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("handshake for {} timed out", client_id);
                HandshakeOutcome::Rejected(RejectReason::Timeout)
            }
        }
    }

    fn enter(&mut self, stage: State) {
        if let Some(state) = self.state.as_deref_mut() {
            advance(state, stage);
        }
    }

    /// Send the will to the Will Service and wait for its disposition.
    ///
    /// Failure only matters at abnormal close, so it is logged and reported
    /// but never rejects the connection.
    pub async fn register_will(&mut self, will: &Will) -> bool {
        let Some(link) = self.will_link.as_mut() else {
            warn!("no will link for {}, will on {} not registered", self.client_id, will.topic);
            return false;
        };

        match link.send(BackendMessage::WillRegister(will.clone())).await {
            Ok(disposition) if disposition.is_accepted() => {
                debug!("will registered for {} on {}", self.client_id, will.topic);
                true
            }
            Ok(disposition) => {
                warn!("will registration for {} refused: {:?}", self.client_id, disposition);
                false
            }
            Err(_) => {
                warn!("will registration for {} not confirmed", self.client_id);
                false
            }
        }
    }

    /// Close or list the prior session.
    pub async fn resolve_session(&mut self, clean_session: bool) -> HandshakeOutcome {
        let client_id = self.client_id.to_string();

        if clean_session {
            let confirmation = self
                .subscription_link
                .send(BackendMessage::SessionClose { client_id });
            return match confirmation.await {
                Ok(disposition) if disposition.is_accepted() => HandshakeOutcome::AcceptedFresh,
                other => {
                    warn!("session close for {} failed: {:?}", self.client_id, other);
                    HandshakeOutcome::Rejected(RejectReason::ServiceUnavailable)
                }
            };
        }

        let request = BackendMessage::SessionList {
            reply_to: control_address(&client_id),
            client_id,
        };
        match self.subscription_link.send(request).await {
            Ok(disposition) if disposition.is_accepted() => {}
            other => {
                warn!("session list for {} failed: {:?}", self.client_id, other);
                return HandshakeOutcome::Rejected(RejectReason::ServiceUnavailable);
            }
        }

        while let Some(delivery) = self.control.recv().await {
            if let BackendMessage::Subscriptions(subs) = &delivery.message {
                let subs = subs.clone();
                delivery.accept();
                debug!("{} resumes {} subscriptions", self.client_id, subs.len());
                return HandshakeOutcome::Accepted(subs);
            }
            debug!(
                "ignoring {} on control link of {} during handshake",
                delivery.message.subject(),
                self.client_id
            );
            delivery.settle(Disposition::Released);
        }

        warn!("control link of {} detached during handshake", self.client_id);
        HandshakeOutcome::Rejected(RejectReason::ServiceUnavailable)
    }
}
