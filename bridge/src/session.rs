//! Per-connection bridge session.
//!
//! A [`BridgeSession`] owns one MQTT client's backend connection and links and
//! runs the whole protocol translation for it: establishment, subscribe and
//! unsubscribe, both publish directions with their QoS acknowledgement
//! flows, and teardown.
//!
//! The session is driven from a single task. Pending backend confirmations
//! are kept in a [`FuturesUnordered`] polled by the same loop that reads
//! client packets and backend deliveries, so the session state is never
//! shared and needs no locking. Other tasks talk to a running session
//! through its [`SessionHandle`].
//!
//! ```text
//! CONNECTING -> [WILL_REGISTRATION] -> SESSION_RESOLUTION -> READY -> CLOSING -> CLOSED
//!      \______________________________________________________________ REJECTED
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{
    BackendMessage, Connection, Connector, ConnectOptions, Delivery, Disposition, ReceiverLink,
    SenderLink, SUBSCRIPTION_SERVICE_ADDRESS, WILL_SERVICE_ADDRESS, control_address,
    publish_address,
};
use crate::error::{Error, RejectReason, Result};
use crate::handshake::{Handshake, HandshakeOutcome};
use crate::protocol::{self, ConnectReturnCode, Packet};
use crate::qos::GrantedQos;
use crate::topic;
use crate::types::{ConnectRequest, PublishMessage, QoS, Subscription, Will};

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum MQTT message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 131_072;

/// Deliveries forwarded to the client and not yet acknowledged, at most.
/// Every non-zero packet id can be in flight; the publish link is not read
/// while the window is full.
const MAX_INFLIGHT_INBOUND: usize = u16::MAX as usize;

/// Error condition used when detaching the Will link of a client that went
/// away without DISCONNECT.
const ABNORMAL_DETACH: &str = "client disconnected abnormally";

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for establishment, also bounds the session close request at
    /// teardown.
    pub handshake_timeout: Duration,
    /// Maximum MQTT packet size accepted from the client.
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Session lifecycle state.
///
/// States only move forward, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Connecting,
    WillRegistration,
    SessionResolution,
    Ready,
    Closing,
    Closed,
    Rejected,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent DISCONNECT.
    ClientDisconnect,
    /// The transport went away without DISCONNECT.
    TransportClosed,
    /// No packet within 1.5 times the keep-alive.
    KeepAliveTimeout,
    /// The client broke the protocol.
    ProtocolError,
    /// The backend connection was lost.
    BackendLost,
    /// Another connection took over the client id.
    TakenOver,
    /// The gateway is shutting down.
    Shutdown,
    /// Establishment failed.
    Rejected(RejectReason),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnect => write!(f, "client disconnect"),
            CloseReason::TransportClosed => write!(f, "transport closed"),
            CloseReason::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            CloseReason::ProtocolError => write!(f, "protocol error"),
            CloseReason::BackendLost => write!(f, "backend connection lost"),
            CloseReason::TakenOver => write!(f, "client id taken over"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Result of closing a session. Repeated closes return the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    pub reason: CloseReason,
    /// DISCONNECT was received before the close, the will is not dispatched.
    pub graceful: bool,
    /// Errors collected while releasing resources.
    pub teardown_errors: Vec<String>,
}

/// Request sent to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Close(CloseReason),
}

/// Handle to a session running in another task.
#[derive(Clone)]
pub struct SessionHandle {
    client_id: String,
    remote_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    outcome: watch::Receiver<Option<CloseOutcome>>,
}

impl SessionHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Whether both handles refer to the same session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }

    /// Ask the session to close and wait until it has.
    ///
    /// Returns `None` if the session was dropped without closing.
    pub async fn close(&self, reason: CloseReason) -> Option<CloseOutcome> {
        // The session may be gone already; the outcome tells.
        let _ = self.commands.send(Command::Close(reason)).await;
        self.closed().await
    }

    /// Wait for the session to close.
    pub async fn closed(&self) -> Option<CloseOutcome> {
        let mut outcome = self.outcome.clone();
        loop {
            if let Some(done) = outcome.borrow_and_update().clone() {
                return Some(done);
            }
            if outcome.changed().await.is_err() {
                return outcome.borrow().clone();
            }
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("client_id", &self.client_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Sender links used for a topic the client publishes on.
///
/// QoS 2 goes over its own link so its release round trip never queues
/// behind QoS 0/1 traffic on the same topic.
struct PublisherLinks {
    standard: Box<dyn SenderLink>,
    exactly_once: Box<dyn SenderLink>,
}

/// Progress of a client publish towards the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckStage {
    /// Sent to the backend, waiting for its confirmation.
    Forwarding,
    /// PUBREC sent, waiting for the client's PUBREL.
    Received,
    /// Release forwarded, waiting for the backend before PUBCOMP.
    Releasing,
}

#[derive(Debug)]
struct Outbound {
    topic: String,
    qos: QoS,
    stage: AckStage,
}

/// Backend message forwarded to the client, settled on the client's final ack.
struct Inbound {
    delivery: Delivery,
    qos: QoS,
}

/// A backend confirmation the session was waiting for.
enum Completion {
    Published {
        message_id: u16,
        qos: QoS,
        result: Option<Disposition>,
    },
    Released {
        message_id: u16,
        result: Option<Disposition>,
    },
    Subscribed {
        message_id: u16,
        requested: Vec<Subscription>,
        result: Option<Disposition>,
    },
    Unsubscribed {
        message_id: u16,
        filters: Vec<String>,
        result: Option<Disposition>,
    },
}

/// Bridges one MQTT client to the backend.
pub struct BridgeSession {
    config: SessionConfig,
    client_id: String,
    remote_addr: SocketAddr,
    clean_session: bool,
    keep_alive: u16,
    will: Option<Will>,
    username: Option<String>,
    password: Option<String>,

    state: State,
    granted: GrantedQos,

    connection: Option<Box<dyn Connection>>,
    will_link: Option<Box<dyn SenderLink>>,
    subscription_link: Option<Box<dyn SenderLink>>,
    control: Option<Box<dyn ReceiverLink>>,
    inbox: Option<Box<dyn ReceiverLink>>,
    publishers: HashMap<String, PublisherLinks>,

    pending_outbound: HashMap<u16, Outbound>,
    pending_inbound: HashMap<u16, Inbound>,
    confirmations: FuturesUnordered<BoxFuture<'static, Completion>>,
    next_message_id: u16,
    keep_alive_deadline: Option<Instant>,

    graceful: bool,
    client_tx: Option<mpsc::Sender<Packet>>,
    commands_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    outcome_tx: watch::Sender<Option<CloseOutcome>>,
    outcome: Option<CloseOutcome>,
}

impl BridgeSession {
    /// Create a session for an accepted CONNECT. Packets for the client are
    /// written to `client_tx`.
    pub fn new(
        config: SessionConfig,
        request: ConnectRequest,
        remote_addr: SocketAddr,
        client_tx: mpsc::Sender<Packet>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(8);
        let (outcome_tx, _) = watch::channel(None);

        Self {
            config,
            client_id: request.client_id,
            remote_addr,
            clean_session: request.clean_session,
            keep_alive: request.keep_alive,
            will: request.will,
            username: request.username,
            password: request.password,
            state: State::Connecting,
            granted: GrantedQos::new(),
            connection: None,
            will_link: None,
            subscription_link: None,
            control: None,
            inbox: None,
            publishers: HashMap::new(),
            pending_outbound: HashMap::new(),
            pending_inbound: HashMap::new(),
            confirmations: FuturesUnordered::new(),
            next_message_id: 0,
            keep_alive_deadline: None,
            graceful: false,
            client_tx: Some(client_tx),
            commands_tx,
            commands,
            outcome_tx,
            outcome: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Subscriptions granted to the client so far.
    pub fn granted(&self) -> &GrantedQos {
        &self.granted
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            client_id: self.client_id.clone(),
            remote_addr: self.remote_addr,
            commands: self.commands_tx.clone(),
            outcome: self.outcome_tx.subscribe(),
        }
    }

    /// Establish the session and answer the client with CONNACK.
    ///
    /// Returns the session-present flag once READY. On rejection the CONNACK
    /// carries the refusal, every resource is released and the session is
    /// left in [`State::Rejected`].
    pub async fn open(&mut self, connector: &dyn Connector) -> Result<bool> {
        if self.state != State::Connecting {
            return Err(Error::InvalidState(format!(
                "open on session {} in {:?}",
                self.client_id, self.state
            )));
        }
        let deadline = Instant::now() + self.config.handshake_timeout;
        debug!("Client {} connecting to backend", self.client_id);

        let options = ConnectOptions {
            container_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            heartbeat: (self.keep_alive > 0).then(|| Duration::from_secs(self.keep_alive as u64)),
        };
        let connection = match timeout_at(deadline, connector.connect(&options)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(Error::NotAuthorized(e))) => {
                warn!("Client {} not authorized by backend: {}", self.client_id, e);
                return self.reject(RejectReason::NotAuthorized).await;
            }
            Ok(Err(e)) => {
                warn!("Client {} backend connect failed: {}", self.client_id, e);
                return self.reject(RejectReason::ServiceUnavailable).await;
            }
            Err(_) => return self.reject(RejectReason::Timeout).await,
        };
        self.connection = Some(connection);

        if let Err(e) = self.attach_service_links() {
            warn!("Client {} failed to attach service links: {}", self.client_id, e);
            return self.reject(RejectReason::ServiceUnavailable).await;
        }

        let outcome = match (self.subscription_link.as_mut(), self.control.as_mut()) {
            (Some(subscription_link), Some(control)) => {
                Handshake::new(&self.client_id, subscription_link, control)
                    .with_will_link(self.will_link.as_mut())
                    .with_state(&mut self.state)
                    .resolve(self.clean_session, self.will.as_ref(), deadline)
                    .await
            }
            _ => HandshakeOutcome::Rejected(RejectReason::ServiceUnavailable),
        };

        let session_present = outcome.session_present();
        match outcome {
            HandshakeOutcome::Accepted(subscriptions) => {
                self.granted = subscriptions.into_iter().collect();
            }
            HandshakeOutcome::AcceptedFresh => self.granted.clear(),
            HandshakeOutcome::Rejected(reason) => return self.reject(reason).await,
        }

        if let Err(e) = self.attach_inbox() {
            warn!("Client {} failed to attach publish link: {}", self.client_id, e);
            return self.reject(RejectReason::ServiceUnavailable).await;
        }

        advance(&mut self.state, State::Ready);
        self.touch_keep_alive();
        self.send_to_client(protocol::create_connack(
            session_present,
            ConnectReturnCode::Success,
        ))
        .await;

        info!(
            "Client {} connected from {} (clean={}, session_present={}, subscriptions={})",
            self.client_id,
            self.remote_addr,
            self.clean_session,
            session_present,
            self.granted.len()
        );
        Ok(session_present)
    }

    fn attach_service_links(&mut self) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::Backend("not connected".to_string()))?;

        if self.will.is_some() {
            self.will_link = Some(connection.open_sender(WILL_SERVICE_ADDRESS, Some(self.client_id.as_str()))?);
        }
        self.subscription_link = Some(connection.open_sender(SUBSCRIPTION_SERVICE_ADDRESS, None)?);
        self.control = Some(connection.open_receiver(&control_address(&self.client_id))?);
        Ok(())
    }

    fn attach_inbox(&mut self) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::Backend("not connected".to_string()))?;
        self.inbox = Some(connection.open_receiver(&publish_address(&self.client_id))?);
        Ok(())
    }

    async fn reject(&mut self, reason: RejectReason) -> Result<bool> {
        warn!("Client {} rejected: {}", self.client_id, reason);
        advance(&mut self.state, State::Rejected);
        self.send_to_client(protocol::create_connack(false, reason.connack_code()))
            .await;

        // Nothing was ever live; a registered will is withdrawn, not fired.
        let mut errors = Vec::new();
        if let Some(mut link) = self.will_link.take() {
            collect(&mut errors, "will link", link.close());
        }
        self.release(&mut errors);

        self.finish(CloseOutcome {
            reason: CloseReason::Rejected(reason),
            graceful: false,
            teardown_errors: errors,
        });
        Err(Error::ConnectRejected(reason))
    }

    /// Run the READY event loop until the session closes.
    pub async fn run(&mut self, mut client_rx: mpsc::Receiver<Packet>) -> CloseOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        if self.state != State::Ready {
            return self.close(CloseReason::ProtocolError).await;
        }

        let reason = loop {
            let step = tokio::select! {
                packet = client_rx.recv() => match packet {
                    Some(packet) => {
                        self.touch_keep_alive();
                        self.handle_packet(packet).await
                    }
                    None => Some(CloseReason::TransportClosed),
                },

                Some(Command::Close(reason)) = self.commands.recv() => Some(reason),

                delivery = recv_from(&mut self.inbox), if self.pending_inbound.len() < MAX_INFLIGHT_INBOUND => match delivery {
                    Some(delivery) => {
                        self.handle_delivery(delivery).await;
                        None
                    }
                    None => Some(CloseReason::BackendLost),
                },

                delivery = recv_from(&mut self.control) => match delivery {
                    Some(delivery) => {
                        self.handle_control(delivery);
                        None
                    }
                    None => Some(CloseReason::BackendLost),
                },

                Some(completion) = self.confirmations.next(), if !self.confirmations.is_empty() => {
                    self.handle_completion(completion).await;
                    None
                }

                _ = backend_closed(&mut self.connection) => Some(CloseReason::BackendLost),

                _ = keep_alive_expired(self.keep_alive_deadline) => {
                    warn!("Client {} keep-alive timeout ({}s)", self.client_id, self.keep_alive);
                    Some(CloseReason::KeepAliveTimeout)
                }
            };

            if let Some(reason) = step {
                break reason;
            }
        };

        self.close(reason).await
    }

    /// Close the session.
    ///
    /// Only the first call releases anything; later calls return the first
    /// outcome unchanged.
    pub async fn close(&mut self, reason: CloseReason) -> CloseOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        if self.state < State::Ready {
            // Never established: release what there is without a will dispatch.
            let mut errors = Vec::new();
            if let Some(mut link) = self.will_link.take() {
                collect(&mut errors, "will link", link.close());
            }
            self.release(&mut errors);
            advance(&mut self.state, State::Closed);
            return self.finish(CloseOutcome {
                reason,
                graceful: false,
                teardown_errors: errors,
            });
        }

        advance(&mut self.state, State::Closing);
        let graceful = self.graceful || reason == CloseReason::ClientDisconnect;
        debug!("Client {} closing: {} (graceful={})", self.client_id, reason, graceful);

        let mut errors = Vec::new();
        if let Some(mut link) = self.will_link.take() {
            let result = if graceful {
                link.close()
            } else {
                link.detach(ABNORMAL_DETACH)
            };
            collect(&mut errors, "will link", result);
        }

        if self.clean_session && reason != CloseReason::BackendLost {
            if let Some(link) = self.subscription_link.as_mut() {
                let confirmation = link.send(BackendMessage::SessionClose {
                    client_id: self.client_id.clone(),
                });
                match timeout(self.config.handshake_timeout, confirmation).await {
                    Ok(Ok(disposition)) if disposition.is_accepted() => {}
                    Ok(Ok(disposition)) => {
                        errors.push(format!("session close refused: {disposition:?}"))
                    }
                    Ok(Err(_)) => errors.push("session close not confirmed".to_string()),
                    Err(_) => errors.push("session close timed out".to_string()),
                }
            }
        }

        self.release(&mut errors);
        advance(&mut self.state, State::Closed);

        for e in &errors {
            warn!("Client {} teardown: {}", self.client_id, e);
        }
        info!("Client {} disconnected: {}", self.client_id, reason);

        self.finish(CloseOutcome {
            reason,
            graceful,
            teardown_errors: errors,
        })
    }

    /// Release every link and the connection, then let the transport go.
    fn release(&mut self, errors: &mut Vec<String>) {
        if let Some(mut link) = self.subscription_link.take() {
            collect(errors, "subscription link", link.close());
        }
        if let Some(mut link) = self.control.take() {
            collect(errors, "control link", link.close());
        }
        if let Some(mut link) = self.inbox.take() {
            collect(errors, "publish link", link.close());
        }
        for (topic, mut links) in self.publishers.drain() {
            collect(errors, &format!("publisher {topic}"), links.standard.close());
            collect(errors, &format!("publisher {topic}"), links.exactly_once.close());
        }

        // Unacknowledged deliveries go back to the backend.
        for (_, inbound) in self.pending_inbound.drain() {
            inbound.delivery.settle(Disposition::Released);
        }
        self.pending_outbound.clear();
        self.confirmations = FuturesUnordered::new();

        if let Some(mut connection) = self.connection.take() {
            collect(errors, "connection", connection.close());
        }

        // Dropping the last sender ends the writer, which closes the transport.
        self.client_tx = None;
    }

    fn finish(&mut self, outcome: CloseOutcome) -> CloseOutcome {
        self.outcome = Some(outcome.clone());
        self.outcome_tx.send_replace(Some(outcome.clone()));
        outcome
    }

    // ---------------------------------------------------------------------
    // Client packets
    // ---------------------------------------------------------------------

    async fn handle_packet(&mut self, packet: Packet) -> Option<CloseReason> {
        trace!("Client {} sent {}", self.client_id, protocol::packet_name(&packet));

        match packet {
            Packet::Publish(publish) => {
                self.handle_publish(protocol::publish_message(&publish)).await;
            }
            Packet::PubAck(ack) => self.settle_inbound(ack.pkid, QoS::AtLeastOnce),
            Packet::PubRec(rec) => self.handle_pubrec(rec.pkid).await,
            Packet::PubComp(comp) => self.settle_inbound(comp.pkid, QoS::ExactlyOnce),
            Packet::PubRel(rel) => self.handle_pubrel(rel.pkid).await,
            Packet::Subscribe(subscribe) => {
                let requested = subscribe
                    .filters
                    .iter()
                    .map(|f| Subscription::new(f.path.clone(), f.qos.into()))
                    .collect();
                self.handle_subscribe(subscribe.pkid, requested).await;
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe.pkid, unsubscribe.topics);
            }
            Packet::PingReq => self.send_to_client(Packet::PingResp).await,
            Packet::Disconnect => {
                self.graceful = true;
                return Some(CloseReason::ClientDisconnect);
            }
            other => {
                warn!(
                    "Client {} sent unexpected {}",
                    self.client_id,
                    protocol::packet_name(&other)
                );
                return Some(CloseReason::ProtocolError);
            }
        }
        None
    }

    /// Client PUBLISH towards the backend.
    async fn handle_publish(&mut self, msg: PublishMessage) {
        let message_id = msg.message_id;
        let qos = msg.qos;

        if qos != QoS::AtMostOnce {
            if let Some(pending) = self.pending_outbound.get(&message_id) {
                if pending.stage == AckStage::Received {
                    // Already forwarded, only the PUBREC got lost.
                    debug!("Client {} re-sent {}, repeating PUBREC", self.client_id, message_id);
                    self.send_to_client(protocol::create_pubrec(message_id)).await;
                } else {
                    trace!(
                        "Client {} re-sent {} ({:?}) while in flight",
                        self.client_id, message_id, pending.qos
                    );
                }
                return;
            }
        }

        let links = match self.publisher(&msg.topic) {
            Ok(links) => links,
            Err(e) => {
                warn!("Client {} cannot publish on {}: {}", self.client_id, msg.topic, e);
                return;
            }
        };
        let link = match qos {
            QoS::ExactlyOnce => &mut links.exactly_once,
            _ => &mut links.standard,
        };
        let topic = msg.topic.clone();
        let confirmation = link.send(BackendMessage::Publish(msg));

        if qos == QoS::AtMostOnce {
            return;
        }

        self.pending_outbound.insert(
            message_id,
            Outbound {
                topic,
                qos,
                stage: AckStage::Forwarding,
            },
        );
        self.confirmations.push(
            async move {
                Completion::Published {
                    message_id,
                    qos,
                    result: confirmation.await.ok(),
                }
            }
            .boxed(),
        );
    }

    /// Links for `topic`, attached on first use.
    fn publisher(&mut self, topic: &str) -> Result<&mut PublisherLinks> {
        if !self.publishers.contains_key(topic) {
            let connection = self
                .connection
                .as_mut()
                .ok_or_else(|| Error::Backend("not connected".to_string()))?;
            let links = PublisherLinks {
                standard: connection.open_sender(topic, None)?,
                exactly_once: connection.open_sender(topic, None)?,
            };
            debug!("Client {} attached publisher links for {}", self.client_id, topic);
            self.publishers.insert(topic.to_string(), links);
        }
        self.publishers
            .get_mut(topic)
            .ok_or_else(|| Error::LinkClosed(topic.to_string()))
    }

    /// Client PUBREL for a QoS 2 publish towards the backend.
    async fn handle_pubrel(&mut self, message_id: u16) {
        let Some(pending) = self.pending_outbound.get_mut(&message_id) else {
            // Already completed; the PUBCOMP got lost.
            self.send_to_client(protocol::create_pubcomp(message_id)).await;
            return;
        };
        if pending.stage != AckStage::Received {
            trace!("Client {} PUBREL {} while {:?}", self.client_id, message_id, pending.stage);
            return;
        }
        pending.stage = AckStage::Releasing;
        let topic = pending.topic.clone();

        let Some(links) = self.publishers.get_mut(&topic) else {
            warn!("Client {} has no publisher for {} to release {}", self.client_id, topic, message_id);
            self.pending_outbound.remove(&message_id);
            return;
        };
        let confirmation = links
            .exactly_once
            .send(BackendMessage::PublishRelease { message_id });
        self.confirmations.push(
            async move {
                Completion::Released {
                    message_id,
                    result: confirmation.await.ok(),
                }
            }
            .boxed(),
        );
    }

    async fn handle_subscribe(&mut self, message_id: u16, requested: Vec<Subscription>) {
        if let Some(bad) = requested
            .iter()
            .find(|s| topic::validate_filter(&s.filter).is_err())
        {
            warn!("Client {} subscribe with invalid filter {:?}", self.client_id, bad.filter);
            let failed = vec![None; requested.len()];
            self.send_to_client(protocol::create_suback(message_id, &failed))
                .await;
            return;
        }

        let Some(link) = self.subscription_link.as_mut() else {
            let failed = vec![None; requested.len()];
            self.send_to_client(protocol::create_suback(message_id, &failed))
                .await;
            return;
        };

        debug!("Client {} subscribing to {:?}", self.client_id, requested);
        let confirmation = link.send(BackendMessage::Subscribe {
            client_id: self.client_id.clone(),
            message_id,
            subscriptions: requested.clone(),
        });
        self.confirmations.push(
            async move {
                Completion::Subscribed {
                    message_id,
                    requested,
                    result: confirmation.await.ok(),
                }
            }
            .boxed(),
        );
    }

    fn handle_unsubscribe(&mut self, message_id: u16, filters: Vec<String>) {
        let Some(link) = self.subscription_link.as_mut() else {
            warn!("Client {} unsubscribe without subscription link", self.client_id);
            return;
        };

        debug!("Client {} unsubscribing from {:?}", self.client_id, filters);
        let confirmation = link.send(BackendMessage::Unsubscribe {
            client_id: self.client_id.clone(),
            message_id,
            filters: filters.clone(),
        });
        self.confirmations.push(
            async move {
                Completion::Unsubscribed {
                    message_id,
                    filters,
                    result: confirmation.await.ok(),
                }
            }
            .boxed(),
        );
    }

    // ---------------------------------------------------------------------
    // Backend confirmations
    // ---------------------------------------------------------------------

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Published {
                message_id,
                qos,
                result,
            } => {
                if !result.as_ref().is_some_and(Disposition::is_accepted) {
                    warn!(
                        "Client {} publish {} not accepted by backend: {:?}",
                        self.client_id, message_id, result
                    );
                    // Let a retry from the client go through again.
                    self.pending_outbound.remove(&message_id);
                    return;
                }
                match qos {
                    QoS::AtLeastOnce => {
                        self.pending_outbound.remove(&message_id);
                        self.send_to_client(protocol::create_puback(message_id)).await;
                    }
                    QoS::ExactlyOnce => {
                        if let Some(pending) = self.pending_outbound.get_mut(&message_id) {
                            pending.stage = AckStage::Received;
                        }
                        self.send_to_client(protocol::create_pubrec(message_id)).await;
                    }
                    QoS::AtMostOnce => {}
                }
            }

            Completion::Released { message_id, result } => {
                if result.as_ref().is_some_and(Disposition::is_accepted) {
                    self.pending_outbound.remove(&message_id);
                    self.send_to_client(protocol::create_pubcomp(message_id)).await;
                } else {
                    warn!(
                        "Client {} release {} not accepted by backend: {:?}",
                        self.client_id, message_id, result
                    );
                    if let Some(pending) = self.pending_outbound.get_mut(&message_id) {
                        pending.stage = AckStage::Received;
                    }
                }
            }

            Completion::Subscribed {
                message_id,
                requested,
                result,
            } => {
                let granted: Option<Vec<QoS>> = match result {
                    Some(Disposition::Granted(granted)) if granted.len() == requested.len() => {
                        Some(granted)
                    }
                    Some(Disposition::Accepted) => Some(requested.iter().map(|s| s.qos).collect()),
                    other => {
                        warn!("Client {} subscribe {} failed: {:?}", self.client_id, message_id, other);
                        None
                    }
                };

                let codes: Vec<Option<QoS>> = match granted {
                    Some(granted) => {
                        for (sub, qos) in requested.iter().zip(&granted) {
                            self.granted.insert(sub.filter.clone(), *qos);
                        }
                        granted.into_iter().map(Some).collect()
                    }
                    None => vec![None; requested.len()],
                };
                self.send_to_client(protocol::create_suback(message_id, &codes))
                    .await;
            }

            Completion::Unsubscribed {
                message_id,
                filters,
                result,
            } => {
                if result.as_ref().is_some_and(Disposition::is_accepted) {
                    for filter in &filters {
                        self.granted.remove(filter);
                    }
                    self.send_to_client(protocol::create_unsuback(message_id)).await;
                } else {
                    warn!(
                        "Client {} unsubscribe {} failed: {:?}",
                        self.client_id, message_id, result
                    );
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Backend deliveries
    // ---------------------------------------------------------------------

    /// Message for one of the client's subscriptions.
    async fn handle_delivery(&mut self, delivery: Delivery) {
        let BackendMessage::Publish(msg) = &delivery.message else {
            trace!(
                "Client {} ignoring {} on publish link",
                self.client_id,
                delivery.message.subject()
            );
            delivery.accept();
            return;
        };

        let Some((filter, qos)) = self.granted.resolve(&msg.topic, msg.qos) else {
            error!("Client {} not subscribed to {}, dropping", self.client_id, msg.topic);
            let reason = format!("no subscription matches {}", msg.topic);
            delivery.settle(Disposition::Rejected { reason });
            return;
        };
        trace!("Client {} delivery on {} via {} at {:?}", self.client_id, msg.topic, filter, qos);

        let message_id = if qos == QoS::AtMostOnce {
            0
        } else {
            let Some(message_id) = self.allocate_message_id() else {
                warn!(
                    "Client {} has {} deliveries in flight, releasing {}",
                    self.client_id,
                    self.pending_inbound.len(),
                    msg.topic
                );
                delivery.settle(Disposition::Released);
                return;
            };
            message_id
        };
        let forward = PublishMessage {
            message_id,
            qos,
            ..msg.clone()
        };
        self.send_to_client(protocol::create_publish(&forward)).await;

        if qos == QoS::AtMostOnce {
            delivery.accept();
        } else {
            self.pending_inbound.insert(message_id, Inbound { delivery, qos });
        }
    }

    /// Client PUBACK or PUBCOMP: final ack for the given QoS.
    fn settle_inbound(&mut self, message_id: u16, qos: QoS) {
        match self.pending_inbound.get(&message_id) {
            Some(inbound) if inbound.qos == qos => {
                if let Some(inbound) = self.pending_inbound.remove(&message_id) {
                    inbound.delivery.accept();
                }
            }
            Some(inbound) => warn!(
                "Client {} acked {} with {:?} but it was sent at {:?}",
                self.client_id, message_id, qos, inbound.qos
            ),
            None => trace!("Client {} acked unknown {}", self.client_id, message_id),
        }
    }

    async fn handle_pubrec(&mut self, message_id: u16) {
        if self
            .pending_inbound
            .get(&message_id)
            .is_some_and(|inbound| inbound.qos == QoS::ExactlyOnce)
        {
            self.send_to_client(protocol::create_pubrel(message_id)).await;
        } else {
            trace!("Client {} PUBREC for unknown {}", self.client_id, message_id);
        }
    }

    /// Subscription Service traffic after establishment.
    fn handle_control(&mut self, delivery: Delivery) {
        match &delivery.message {
            BackendMessage::PublishRelease { message_id } => {
                // The bridge releases towards the client itself.
                trace!("Client {} backend release {} not forwarded", self.client_id, message_id);
                delivery.accept();
            }
            other => {
                debug!("Client {} ignoring {} on control link", self.client_id, other.subject());
                delivery.settle(Disposition::Released);
            }
        }
    }

    /// Next free packet id for a delivery, `None` when the window is full.
    fn allocate_message_id(&mut self) -> Option<u16> {
        if self.pending_inbound.len() >= MAX_INFLIGHT_INBOUND {
            return None;
        }
        loop {
            self.next_message_id = self.next_message_id.wrapping_add(1);
            if self.next_message_id != 0 && !self.pending_inbound.contains_key(&self.next_message_id) {
                return Some(self.next_message_id);
            }
        }
    }

    fn touch_keep_alive(&mut self) {
        if self.keep_alive > 0 {
            let grace = Duration::from_millis(self.keep_alive as u64 * 1500);
            self.keep_alive_deadline = Some(Instant::now() + grace);
        }
    }

    async fn send_to_client(&mut self, packet: Packet) {
        let Some(tx) = &self.client_tx else {
            return;
        };
        if tx.send(packet).await.is_err() {
            trace!("Client {} writer gone", self.client_id);
        }
    }
}

/// Move `state` forward to `next`. Backward moves are ignored.
pub(crate) fn advance(state: &mut State, next: State) {
    if next <= *state {
        warn!("session state {:?} cannot go back to {:?}", state, next);
        return;
    }
    trace!("session state {:?} -> {:?}", state, next);
    *state = next;
}

fn collect(errors: &mut Vec<String>, what: &str, result: Result<()>) {
    if let Err(e) = result {
        errors.push(format!("{what}: {e}"));
    }
}

async fn recv_from(link: &mut Option<Box<dyn ReceiverLink>>) -> Option<Delivery> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn backend_closed(connection: &mut Option<Box<dyn Connection>>) {
    match connection {
        Some(connection) => connection.closed().await,
        None => std::future::pending().await,
    }
}

async fn keep_alive_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
