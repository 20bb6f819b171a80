//! AMQP backend link model.
//!
//! The bridge talks to the messaging backend through already-framed
//! messages sent over links. Every message sent on a [`SenderLink`] yields a
//! [`Confirmation`] that resolves with the remote [`Disposition`]; every
//! message received on a [`ReceiverLink`] arrives as a [`Delivery`] that the
//! bridge settles once it is done with it.
//!
//! Addresses:
//!
//! | Address | Direction | Purpose |
//! |---------|-----------|---------|
//! | `$lwt` | out | Will Service (link named after the client id) |
//! | `$subctrl` | out | Subscription Service control requests |
//! | `$mqtt.to.<client-id>.control` | in | Subscription Service replies |
//! | `$mqtt.to.<client-id>.publish` | in | messages for the client's subscriptions |
//! | `<topic>` | out | messages published by the client |

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::{PublishMessage, QoS, Subscription, Will};

/// Will Service address.
pub const WILL_SERVICE_ADDRESS: &str = "$lwt";

/// Subscription Service address.
pub const SUBSCRIPTION_SERVICE_ADDRESS: &str = "$subctrl";

/// Per-client address receiving Subscription Service replies.
pub fn control_address(client_id: &str) -> String {
    format!("$mqtt.to.{client_id}.control")
}

/// Per-client address receiving messages for the client's subscriptions.
pub fn publish_address(client_id: &str) -> String {
    format!("$mqtt.to.{client_id}.publish")
}

/// Message exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// Store the client's will (sent to the Will Service).
    WillRegister(Will),
    /// Drop any persisted session of the client.
    SessionClose { client_id: String },
    /// Ask for the persisted subscriptions, answered on `reply_to`.
    SessionList { client_id: String, reply_to: String },
    /// Add subscriptions.
    Subscribe {
        client_id: String,
        message_id: u16,
        subscriptions: Vec<Subscription>,
    },
    /// Remove subscriptions.
    Unsubscribe {
        client_id: String,
        message_id: u16,
        filters: Vec<String>,
    },
    /// Reply to `SessionList`.
    Subscriptions(Vec<Subscription>),
    /// Application message on a topic.
    Publish(PublishMessage),
    /// Second phase of a QoS 2 publish.
    PublishRelease { message_id: u16 },
}

impl BackendMessage {
    /// Message subject, used for logging.
    pub fn subject(&self) -> &'static str {
        match self {
            BackendMessage::WillRegister(_) => "will",
            BackendMessage::SessionClose { .. } => "close",
            BackendMessage::SessionList { .. } => "list",
            BackendMessage::Subscribe { .. } => "subscribe",
            BackendMessage::Unsubscribe { .. } => "unsubscribe",
            BackendMessage::Subscriptions(_) => "subscriptions",
            BackendMessage::Publish(_) => "publish",
            BackendMessage::PublishRelease { .. } => "pubrel",
        }
    }
}

/// Remote outcome of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    /// Accepted with one granted QoS per requested subscription.
    Granted(Vec<QoS>),
    Rejected { reason: String },
    Released,
}

impl Disposition {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Disposition::Accepted | Disposition::Granted(_))
    }
}

/// Resolves with the remote disposition of a sent message.
///
/// Resolves with an error if the link goes away before the message is settled.
pub type Confirmation = oneshot::Receiver<Disposition>;

/// A received message awaiting settlement.
#[derive(Debug)]
pub struct Delivery {
    pub message: BackendMessage,
    settle: Option<oneshot::Sender<Disposition>>,
}

impl Delivery {
    /// Create a delivery and the confirmation its sender waits on.
    pub fn new(message: BackendMessage) -> (Self, Confirmation) {
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            message,
            settle: Some(tx),
        };
        (delivery, rx)
    }

    /// Settle the delivery with the given outcome.
    pub fn settle(mut self, disposition: Disposition) {
        if let Some(tx) = self.settle.take() {
            // The sender may have given up on the confirmation already.
            let _ = tx.send(disposition);
        }
    }

    pub fn accept(self) {
        self.settle(Disposition::Accepted)
    }
}

/// Options for opening a backend connection on behalf of a client.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Container id used on the backend connection.
    pub container_id: String,
    /// SASL PLAIN credentials, anonymous when absent.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Heartbeat interval, `None` disables it.
    pub heartbeat: Option<Duration>,
}

/// Opens backend connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the backend.
    ///
    /// Fails with [`crate::Error::NotAuthorized`] on a credential or security
    /// failure, any other error means the backend is unavailable.
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn Connection>>;
}

/// An open backend connection.
#[async_trait]
pub trait Connection: Send {
    /// Attach a sender link to `address`. `name` defaults to a generated one.
    fn open_sender(&mut self, address: &str, name: Option<&str>) -> Result<Box<dyn SenderLink>>;

    /// Attach a receiver link to `address`.
    fn open_receiver(&mut self, address: &str) -> Result<Box<dyn ReceiverLink>>;

    /// Resolves when the remote side closes or drops the connection.
    async fn closed(&mut self);

    /// Close the connection.
    fn close(&mut self) -> Result<()>;
}

/// Outgoing link.
pub trait SenderLink: Send {
    fn address(&self) -> &str;

    /// Send a message and get its confirmation.
    fn send(&mut self, message: BackendMessage) -> Confirmation;

    /// Detach the link cleanly.
    fn close(&mut self) -> Result<()>;

    /// Detach the link with an error condition.
    fn detach(&mut self, error: &str) -> Result<()>;
}

/// Incoming link.
#[async_trait]
pub trait ReceiverLink: Send {
    fn address(&self) -> &str;

    /// Next delivery, `None` once the link is detached.
    async fn recv(&mut self) -> Option<Delivery>;

    /// Detach the link.
    fn close(&mut self) -> Result<()>;
}
