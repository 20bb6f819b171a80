//! MQTT to AMQP bridge.
//!
//! Bridges MQTT 3.1.1 clients to an AMQP messaging backend. Every client
//! gets its own [`BridgeSession`] that coordinates two backend services:
//!
//! - the **Subscription Service**, which keeps a client's subscriptions
//!   across reconnects when it asks for a persistent session
//! - the **Will Service**, which stores the client's last will and
//!   publishes it if the client goes away without DISCONNECT
//!
//! ## Components
//!
//! - [`topic`]: MQTT topic filter matching
//! - [`qos`]: QoS resolution between publishers and subscribers
//! - [`backend`]: AMQP link model the bridge talks to, plus an in-process
//!   implementation ([`backend::memory`])
//! - [`handshake`]: will registration and session resolution under a deadline
//! - [`BridgeSession`]: per-connection protocol translation
//! - [`Gateway`]: TCP/TLS listener and client id registry
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mqttbridge::backend::memory::MemoryBroker;
//! use mqttbridge::{Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> mqttbridge::Result<()> {
//!     let config = GatewayConfig::from_env()?;
//!     let gateway = Gateway::new(config, Arc::new(MemoryBroker::default()));
//!     gateway.serve().await
//! }
//! ```

pub mod backend;
pub mod config;
mod error;
mod gateway;
pub mod handshake;
pub mod protocol;
pub mod qos;
pub mod registry;
pub mod session;
pub mod topic;
pub mod transport;
mod types;

pub use config::GatewayConfig;
pub use error::{Error, RejectReason, Result};
pub use gateway::Gateway;
pub use handshake::{Handshake, HandshakeOutcome};
pub use qos::{GrantedQos, effective_qos};
pub use registry::Registry;
pub use session::{BridgeSession, CloseOutcome, CloseReason, SessionConfig, SessionHandle, State};
pub use types::{ConnectRequest, PublishMessage, QoS, Subscription, Will};

#[cfg(feature = "tls")]
pub use transport::tls::TlsConfig;
