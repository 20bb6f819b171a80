//! Common types for mqttbridge.

use bytes::Bytes;
use rumqttc::mqttbytes::v4::Connect;

/// MQTT Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged delivery).
    AtLeastOnce = 1,
    /// Exactly once delivery (assured delivery).
    ExactlyOnce = 2,
}

impl From<QoS> for rumqttc::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<u8> for QoS {
    fn from(v: u8) -> Self {
        match v {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }
}

/// Last will declared by a client in its CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

/// A topic subscription.
///
/// Carries the requested QoS when sent to the Subscription Service and the
/// granted QoS when returned from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

/// A message published on a topic, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    /// MQTT packet identifier (0 for QoS 0).
    pub message_id: u16,
    pub topic: String,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub payload: Bytes,
}

impl PublishMessage {
    /// Create a QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: 0,
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            dup: false,
            retain: false,
            payload: payload.into(),
        }
    }

    /// Set QoS level.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Connection parameters extracted from an MQTT CONNECT.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub clean_session: bool,
    /// Keep-alive in seconds, 0 disables it.
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectRequest {
    /// Create a request for a clean session without will or credentials.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 0,
            will: None,
            username: None,
            password: None,
        }
    }

    /// Set the clean session flag.
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Set the last will.
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set the keep-alive interval in seconds.
    pub fn with_keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set login credentials.
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

impl From<Connect> for ConnectRequest {
    fn from(connect: Connect) -> Self {
        let will = connect.last_will.map(|w| Will {
            topic: String::from_utf8_lossy(w.topic.as_ref()).into_owned(),
            qos: w.qos.into(),
            retain: w.retain,
            payload: Bytes::copy_from_slice(w.message.as_ref()),
        });
        let (username, password) = match connect.login {
            Some(login) => (Some(login.username), Some(login.password)),
            None => (None, None),
        };

        Self {
            client_id: connect.client_id,
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
            will,
            username,
            password,
        }
    }
}
