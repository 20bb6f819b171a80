//! In-process backend.
//!
//! [`MemoryBroker`] stands in for the AMQP router together with the
//! Subscription Service and the Will Service. It keeps subscriptions per
//! client id across connections, stores wills per Will link name and routes
//! published messages to the publish address of every client with a matching
//! filter. Retained messages and offline queues are not kept.
//!
//! Besides serving the gateway's embedded mode it exposes hooks used by the
//! tests: stalled addresses, connect failures, dropped connections, injected
//! deliveries, an opt-in log of sent messages and link counters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::{
    BackendMessage, Confirmation, ConnectOptions, Connection, Connector, Delivery, Disposition,
    ReceiverLink, SenderLink, SUBSCRIPTION_SERVICE_ADDRESS, WILL_SERVICE_ADDRESS,
    publish_address,
};
use crate::error::{Error, Result};
use crate::topic;
use crate::types::{PublishMessage, QoS, Subscription};

/// How the next connect attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    NotAuthorized,
    Unavailable,
}

/// Link and connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub links_opened: usize,
    pub links_closed: usize,
}

/// Embedded broker configuration.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Highest QoS granted to a subscription.
    pub max_qos: QoS,
    /// Required credentials, anonymous access when `None`.
    pub credentials: Option<(String, String)>,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            credentials: None,
        }
    }
}

#[derive(Default)]
struct State {
    /// address -> attached receiver link
    receivers: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    /// client id -> persisted subscriptions
    sessions: HashMap<String, Vec<Subscription>>,
    /// Will link name -> will
    wills: HashMap<String, crate::types::Will>,
    /// connection id -> (container id, closed signal)
    connections: HashMap<u64, (String, watch::Sender<bool>)>,
    stalled: HashSet<String>,
    refusing: HashSet<String>,
    /// address -> confirmations held back while stalled
    withheld: HashMap<String, Vec<oneshot::Sender<Disposition>>>,
    fail_next_connect: Option<ConnectFailure>,
    recording: bool,
    received: Vec<(String, BackendMessage)>,
    stats: BrokerStats,
}

struct Inner {
    config: MemoryBrokerConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

/// In-process backend shared by all bridge sessions.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Stop confirming (and processing) messages sent to `address`.
    ///
    /// Un-stalling drops the confirmations held back meanwhile, so their
    /// senders see them as never confirmed.
    pub fn set_stalled(&self, address: &str, stalled: bool) {
        let mut state = self.inner.state.lock();
        if stalled {
            state.stalled.insert(address.to_string());
        } else {
            state.stalled.remove(address);
            if let Some(withheld) = state.withheld.remove(address) {
                debug!("dropping {} withheld confirmations for {}", withheld.len(), address);
            }
        }
    }

    /// Keep a copy of every message sent from now on, see [`MemoryBroker::received`].
    ///
    /// Off by default. Stopping clears the log.
    pub fn set_recording(&self, recording: bool) {
        let mut state = self.inner.state.lock();
        state.recording = recording;
        if !recording {
            state.received = Vec::new();
        }
    }

    /// Reject every message sent to `address`.
    pub fn set_refusing(&self, address: &str, refusing: bool) {
        let mut state = self.inner.state.lock();
        if refusing {
            state.refusing.insert(address.to_string());
        } else {
            state.refusing.remove(address);
        }
    }

    /// Make the next connect attempt fail.
    pub fn fail_next_connect(&self, failure: ConnectFailure) {
        self.inner.state.lock().fail_next_connect = Some(failure);
    }

    /// Drop the backend connection opened for `client_id`, as a router would.
    pub fn drop_connection(&self, client_id: &str) -> bool {
        let state = self.inner.state.lock();
        let mut dropped = false;
        for (container, closed_tx) in state.connections.values() {
            if container == client_id {
                let _ = closed_tx.send(true);
                dropped = true;
            }
        }
        dropped
    }

    /// Deliver a message straight to the publish address of `client_id`.
    ///
    /// Returns the confirmation the client session settles, or `None` when
    /// no publish link is attached for the client.
    pub fn inject(&self, client_id: &str, message: PublishMessage) -> Option<Confirmation> {
        let state = self.inner.state.lock();
        let tx = state.receivers.get(&publish_address(client_id))?;
        let (delivery, confirmation) = Delivery::new(BackendMessage::Publish(message));
        tx.send(delivery).ok()?;
        Some(confirmation)
    }

    /// Whether a receiver link is attached to `address`.
    pub fn has_receiver(&self, address: &str) -> bool {
        self.inner.state.lock().receivers.contains_key(address)
    }

    /// Persisted subscriptions of `client_id`.
    pub fn subscriptions(&self, client_id: &str) -> Vec<Subscription> {
        self.inner
            .state
            .lock()
            .sessions
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Seed persisted subscriptions, as left behind by an earlier session.
    pub fn set_subscriptions(&self, client_id: &str, subscriptions: Vec<Subscription>) {
        self.inner
            .state
            .lock()
            .sessions
            .insert(client_id.to_string(), subscriptions);
    }

    /// Will stored for the Will link named `name`.
    pub fn will(&self, name: &str) -> Option<crate::types::Will> {
        self.inner.state.lock().wills.get(name).cloned()
    }

    /// Every message received while recording, with the address it was sent to.
    pub fn received(&self) -> Vec<(String, BackendMessage)> {
        self.inner.state.lock().received.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.state.lock().stats
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn authorize(&self, options: &ConnectOptions) -> Result<()> {
        if let Some(failure) = self.inner.state.lock().fail_next_connect.take() {
            return Err(match failure {
                ConnectFailure::NotAuthorized => {
                    Error::NotAuthorized("sasl authentication failed".to_string())
                }
                ConnectFailure::Unavailable => Error::Backend("connection refused".to_string()),
            });
        }

        if let Some((user, pass)) = &self.inner.config.credentials {
            let ok = options.username.as_deref() == Some(user.as_str())
                && options.password.as_deref() == Some(pass.as_str());
            if !ok {
                return Err(Error::NotAuthorized(format!(
                    "sasl authentication failed for {}",
                    options.username.as_deref().unwrap_or("anonymous")
                )));
            }
        }

        Ok(())
    }

    /// Process a message sent on a sender link.
    fn handle_send(&self, address: &str, link_name: &str, message: BackendMessage) -> Confirmation {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock();

        if state.stalled.contains(address) {
            trace!("withholding {} sent to stalled {}", message.subject(), address);
            state.withheld.entry(address.to_string()).or_default().push(tx);
            return rx;
        }

        if state.refusing.contains(address) {
            let _ = tx.send(Disposition::Rejected {
                reason: format!("{address} refused {}", message.subject()),
            });
            return rx;
        }

        if state.recording {
            state.received.push((address.to_string(), message.clone()));
        }

        let disposition = match address {
            WILL_SERVICE_ADDRESS => self.handle_will_service(&mut state, link_name, message),
            SUBSCRIPTION_SERVICE_ADDRESS => self.handle_subscription_service(&mut state, message),
            topic => Self::handle_topic(&mut state, topic, message),
        };

        let _ = tx.send(disposition);
        rx
    }

    fn handle_will_service(
        &self,
        state: &mut State,
        link_name: &str,
        message: BackendMessage,
    ) -> Disposition {
        match message {
            BackendMessage::WillRegister(will) => {
                debug!("will stored for {} on {}", link_name, will.topic);
                state.wills.insert(link_name.to_string(), will);
                Disposition::Accepted
            }
            other => Disposition::Rejected {
                reason: format!("unexpected {} on will service", other.subject()),
            },
        }
    }

    fn handle_subscription_service(&self, state: &mut State, message: BackendMessage) -> Disposition {
        match message {
            BackendMessage::SessionClose { client_id } => {
                state.sessions.remove(&client_id);
                debug!("session of {} closed", client_id);
                Disposition::Accepted
            }
            BackendMessage::SessionList {
                client_id,
                reply_to,
            } => {
                let subscriptions = state.sessions.get(&client_id).cloned().unwrap_or_default();
                match state.receivers.get(&reply_to) {
                    Some(tx) => {
                        let (delivery, _) =
                            Delivery::new(BackendMessage::Subscriptions(subscriptions));
                        let _ = tx.send(delivery);
                        Disposition::Accepted
                    }
                    None => Disposition::Rejected {
                        reason: format!("no link attached to {reply_to}"),
                    },
                }
            }
            BackendMessage::Subscribe {
                client_id,
                subscriptions,
                ..
            } => {
                if let Some(bad) = subscriptions
                    .iter()
                    .find(|s| topic::validate_filter(&s.filter).is_err())
                {
                    return Disposition::Rejected {
                        reason: format!("invalid filter {}", bad.filter),
                    };
                }

                let max_qos = self.inner.config.max_qos;
                let stored = state.sessions.entry(client_id).or_default();
                let mut granted = Vec::with_capacity(subscriptions.len());
                for sub in subscriptions {
                    let qos = sub.qos.min(max_qos);
                    granted.push(qos);
                    match stored.iter_mut().find(|s| s.filter == sub.filter) {
                        Some(existing) => existing.qos = qos,
                        None => stored.push(Subscription::new(sub.filter, qos)),
                    }
                }
                Disposition::Granted(granted)
            }
            BackendMessage::Unsubscribe {
                client_id, filters, ..
            } => {
                if let Some(stored) = state.sessions.get_mut(&client_id) {
                    stored.retain(|s| !filters.contains(&s.filter));
                }
                Disposition::Accepted
            }
            other => Disposition::Rejected {
                reason: format!("unexpected {} on subscription service", other.subject()),
            },
        }
    }

    fn handle_topic(state: &mut State, topic: &str, message: BackendMessage) -> Disposition {
        match message {
            BackendMessage::Publish(msg) => {
                Self::route(state, topic, msg);
                Disposition::Accepted
            }
            BackendMessage::PublishRelease { .. } => Disposition::Accepted,
            other => Disposition::Rejected {
                reason: format!("unexpected {} on {}", other.subject(), topic),
            },
        }
    }

    fn route(state: &State, topic: &str, msg: PublishMessage) {
        for (client_id, subscriptions) in &state.sessions {
            let matched = topic::select_filter(subscriptions.iter().map(|s| s.filter.as_str()), topic);
            if matched.is_none() {
                continue;
            }
            let Some(tx) = state.receivers.get(&publish_address(client_id)) else {
                trace!("{} offline, dropping message on {}", client_id, topic);
                continue;
            };
            let msg = PublishMessage {
                message_id: 0,
                topic: topic.to_string(),
                dup: false,
                ..msg.clone()
            };
            let (delivery, _) = Delivery::new(BackendMessage::Publish(msg));
            let _ = tx.send(delivery);
        }
    }

    fn close_sender(&self, address: &str, link_name: &str, error: Option<&str>) {
        let mut state = self.inner.state.lock();
        state.stats.links_closed += 1;

        if address != WILL_SERVICE_ADDRESS {
            return;
        }
        let Some(will) = state.wills.remove(link_name) else {
            return;
        };
        match error {
            Some(error) => {
                info!("dispatching will of {} on {} ({})", link_name, will.topic, error);
                let msg = PublishMessage {
                    message_id: 0,
                    topic: will.topic.clone(),
                    qos: will.qos,
                    dup: false,
                    retain: will.retain,
                    payload: will.payload,
                };
                Self::route(&state, &will.topic, msg);
            }
            None => debug!("will of {} discarded", link_name),
        }
    }

    fn close_receiver(&self, address: &str, tx: &mpsc::UnboundedSender<Delivery>) {
        let mut state = self.inner.state.lock();
        state.stats.links_closed += 1;
        // Only detach if a newer link has not taken the address over.
        if state
            .receivers
            .get(address)
            .is_some_and(|current| current.same_channel(tx))
        {
            state.receivers.remove(address);
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn Connection>> {
        self.authorize(options)?;

        let id = self.next_id();
        let (closed_tx, closed_rx) = watch::channel(false);
        {
            let mut state = self.inner.state.lock();
            state
                .connections
                .insert(id, (options.container_id.clone(), closed_tx));
            state.stats.connections_opened += 1;
        }
        debug!("backend connection {} opened for {}", id, options.container_id);

        Ok(Box::new(MemoryConnection {
            id,
            broker: self.clone(),
            closed_rx,
            closed: false,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed_rx: watch::Receiver<bool>,
    closed: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn open_sender(&mut self, address: &str, name: Option<&str>) -> Result<Box<dyn SenderLink>> {
        if self.closed {
            return Err(Error::Backend("connection closed".to_string()));
        }
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("sender-{}", self.broker.next_id()),
        };
        self.broker.inner.state.lock().stats.links_opened += 1;
        Ok(Box::new(MemorySender {
            address: address.to_string(),
            name,
            broker: self.broker.clone(),
            closed: false,
        }))
    }

    fn open_receiver(&mut self, address: &str) -> Result<Box<dyn ReceiverLink>> {
        if self.closed {
            return Err(Error::Backend("connection closed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.inner.state.lock();
            if state.receivers.insert(address.to_string(), tx.clone()).is_some() {
                warn!("receiver on {} replaced", address);
            }
            state.stats.links_opened += 1;
        }
        Ok(Box::new(MemoryReceiver {
            address: address.to_string(),
            broker: self.broker.clone(),
            tx,
            rx,
            closed: false,
        }))
    }

    async fn closed(&mut self) {
        while !*self.closed_rx.borrow_and_update() {
            if self.closed_rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.broker.inner.state.lock();
        state.connections.remove(&self.id);
        state.stats.connections_closed += 1;
        Ok(())
    }
}

struct MemorySender {
    address: String,
    name: String,
    broker: MemoryBroker,
    closed: bool,
}

impl SenderLink for MemorySender {
    fn address(&self) -> &str {
        &self.address
    }

    fn send(&mut self, message: BackendMessage) -> Confirmation {
        if self.closed {
            // Dropping the sender half fails the confirmation.
            let (_, rx) = oneshot::channel();
            return rx;
        }
        self.broker.handle_send(&self.address, &self.name, message)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::LinkClosed(self.address.clone()));
        }
        self.closed = true;
        self.broker.close_sender(&self.address, &self.name, None);
        Ok(())
    }

    fn detach(&mut self, error: &str) -> Result<()> {
        if self.closed {
            return Err(Error::LinkClosed(self.address.clone()));
        }
        self.closed = true;
        self.broker.close_sender(&self.address, &self.name, Some(error));
        Ok(())
    }
}

struct MemoryReceiver {
    address: String,
    broker: MemoryBroker,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

#[async_trait]
impl ReceiverLink for MemoryReceiver {
    fn address(&self) -> &str {
        &self.address
    }

    async fn recv(&mut self) -> Option<Delivery> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::LinkClosed(self.address.clone()));
        }
        self.closed = true;
        self.broker.close_receiver(&self.address, &self.tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::control_address;
    use crate::types::Will;
    use bytes::Bytes;

    fn options(client_id: &str) -> ConnectOptions {
        ConnectOptions {
            container_id: client_id.to_string(),
            username: None,
            password: None,
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_grants_capped_qos() {
        let broker = MemoryBroker::new(MemoryBrokerConfig {
            max_qos: QoS::AtLeastOnce,
            credentials: None,
        });
        let mut conn = broker.connect(&options("c1")).await.unwrap();
        let mut ss = conn.open_sender(SUBSCRIPTION_SERVICE_ADDRESS, None).unwrap();

        let disposition = ss
            .send(BackendMessage::Subscribe {
                client_id: "c1".to_string(),
                message_id: 1,
                subscriptions: vec![
                    Subscription::new("a/+", QoS::ExactlyOnce),
                    Subscription::new("b", QoS::AtMostOnce),
                ],
            })
            .await
            .unwrap();

        assert_eq!(
            disposition,
            Disposition::Granted(vec![QoS::AtLeastOnce, QoS::AtMostOnce])
        );
        assert_eq!(broker.subscriptions("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_list_replies_on_control_address() {
        let broker = MemoryBroker::default();
        broker.set_subscriptions("c1", vec![Subscription::new("x/#", QoS::AtLeastOnce)]);

        let mut conn = broker.connect(&options("c1")).await.unwrap();
        let mut control = conn.open_receiver(&control_address("c1")).unwrap();
        let mut ss = conn.open_sender(SUBSCRIPTION_SERVICE_ADDRESS, None).unwrap();

        let disposition = ss
            .send(BackendMessage::SessionList {
                client_id: "c1".to_string(),
                reply_to: control_address("c1"),
            })
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Accepted);

        let delivery = control.recv().await.unwrap();
        assert_eq!(
            delivery.message,
            BackendMessage::Subscriptions(vec![Subscription::new("x/#", QoS::AtLeastOnce)])
        );
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_clients() {
        let broker = MemoryBroker::default();
        broker.set_subscriptions("sub", vec![Subscription::new("a/+", QoS::AtLeastOnce)]);

        let mut conn = broker.connect(&options("sub")).await.unwrap();
        let mut publish = conn.open_receiver(&publish_address("sub")).unwrap();
        let mut topic = conn.open_sender("a/b", None).unwrap();

        let msg = PublishMessage::new("a/b", Bytes::from_static(b"hi")).with_qos(QoS::ExactlyOnce);
        assert!(topic.send(BackendMessage::Publish(msg)).await.unwrap().is_accepted());

        let delivery = publish.recv().await.unwrap();
        match delivery.message {
            BackendMessage::Publish(msg) => {
                assert_eq!(msg.topic, "a/b");
                assert_eq!(msg.qos, QoS::ExactlyOnce);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_will_dispatched_only_on_error_detach() {
        let broker = MemoryBroker::default();
        broker.set_subscriptions("watcher", vec![Subscription::new("status/#", QoS::AtMostOnce)]);
        let mut watcher = broker.connect(&options("watcher")).await.unwrap();
        let mut inbox = watcher.open_receiver(&publish_address("watcher")).unwrap();

        let will = Will {
            topic: "status/dev".to_string(),
            qos: QoS::AtMostOnce,
            retain: false,
            payload: Bytes::from_static(b"gone"),
        };

        let mut conn = broker.connect(&options("dev")).await.unwrap();
        let mut lwt = conn.open_sender(WILL_SERVICE_ADDRESS, Some("dev")).unwrap();
        lwt.send(BackendMessage::WillRegister(will.clone())).await.unwrap();
        assert_eq!(broker.will("dev"), Some(will.clone()));
        lwt.close().unwrap();
        assert_eq!(broker.will("dev"), None);

        let mut lwt = conn.open_sender(WILL_SERVICE_ADDRESS, Some("dev")).unwrap();
        lwt.send(BackendMessage::WillRegister(will)).await.unwrap();
        lwt.detach("client vanished").unwrap();

        let delivery = inbox.recv().await.unwrap();
        assert!(matches!(delivery.message, BackendMessage::Publish(ref m) if m.topic == "status/dev"));
    }

    #[tokio::test]
    async fn test_credentials_required() {
        let broker = MemoryBroker::new(MemoryBrokerConfig {
            max_qos: QoS::ExactlyOnce,
            credentials: Some(("user".to_string(), "pass".to_string())),
        });

        let err = broker.connect(&options("c1")).await.err().unwrap();
        assert!(matches!(err, Error::NotAuthorized(_)));

        let mut opts = options("c1");
        opts.username = Some("user".to_string());
        opts.password = Some("pass".to_string());
        assert!(broker.connect(&opts).await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_address_never_confirms() {
        let broker = MemoryBroker::default();
        broker.set_stalled(SUBSCRIPTION_SERVICE_ADDRESS, true);
        let mut conn = broker.connect(&options("c1")).await.unwrap();
        let mut ss = conn.open_sender(SUBSCRIPTION_SERVICE_ADDRESS, None).unwrap();

        let mut confirmation = ss.send(BackendMessage::SessionClose {
            client_id: "c1".to_string(),
        });
        tokio::task::yield_now().await;
        assert!(matches!(
            confirmation.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_drop_connection_signals_closed() {
        let broker = MemoryBroker::default();
        let mut conn = broker.connect(&options("c1")).await.unwrap();
        assert!(broker.drop_connection("c1"));
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unstall_drops_withheld_confirmations() {
        let broker = MemoryBroker::default();
        broker.set_stalled("a/b", true);
        let mut conn = broker.connect(&options("c1")).await.unwrap();
        let mut topic = conn.open_sender("a/b", None).unwrap();

        let confirmation = topic.send(BackendMessage::Publish(PublishMessage::new("a/b", Bytes::new())));
        broker.set_stalled("a/b", false);
        assert!(confirmation.await.is_err());

        let confirmation = topic.send(BackendMessage::Publish(PublishMessage::new("a/b", Bytes::new())));
        assert!(confirmation.await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_send_log_only_while_recording() {
        let broker = MemoryBroker::default();
        let mut conn = broker.connect(&options("c1")).await.unwrap();
        let mut topic = conn.open_sender("a/b", None).unwrap();
        let publish = || BackendMessage::Publish(PublishMessage::new("a/b", Bytes::from_static(b"x")));

        for _ in 0..100 {
            topic.send(publish()).await.unwrap();
        }
        assert!(broker.received().is_empty());

        broker.set_recording(true);
        topic.send(publish()).await.unwrap();
        assert_eq!(broker.received(), vec![("a/b".to_string(), publish())]);

        broker.set_recording(false);
        assert!(broker.received().is_empty());
    }
}
