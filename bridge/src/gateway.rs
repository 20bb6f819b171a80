//! MQTT gateway listener.
//!
//! Accepts MQTT 3.1.1 connections, reads the CONNECT and hands each client
//! to its own [`BridgeSession`] running in a dedicated task. Two helper tasks
//! per connection move packets between the socket and the session: a reader
//! feeding the session's packet channel and a writer draining the packets
//! the session emits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backend::Connector;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, ConnectReturnCode, Packet};
use crate::registry::Registry;
use crate::session::{BridgeSession, CloseReason, SessionConfig};
use crate::transport::Transport;
use crate::types::ConnectRequest;

/// Packets buffered between a session and its socket, per direction.
const CHANNEL_CAPACITY: usize = 64;

/// MQTT listener owning the client id registry.
pub struct Gateway {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            registry: Arc::new(Registry::new()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Sessions currently READY.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the configured address and serve until [`Gateway::shutdown`].
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        #[cfg(feature = "tls")]
        let tls = if self.config.ssl {
            let tls = crate::transport::tls::TlsConfig::from_pem_files(
                &self.config.cert_file,
                &self.config.key_file,
            )?;
            info!(
                "TLS enabled, key {} cert {}",
                self.config.key_file.display(),
                self.config.cert_file.display()
            );
            Some(tls)
        } else {
            None
        };

        info!("MQTT gateway listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            debug!("Accepted connection from {}", addr);

            let ctx = ConnectionContext {
                connector: Arc::clone(&self.connector),
                registry: Arc::clone(&self.registry),
                session_config: self.config.session_config(),
                shutdown: self.shutdown.clone(),
            };

            #[cfg(feature = "tls")]
            let tls = tls.clone();

            tokio::spawn(async move {
                #[cfg(feature = "tls")]
                let transport = match tls {
                    Some(tls) => match tls.accept(stream).await {
                        Ok(transport) => transport,
                        Err(e) => {
                            debug!("TLS handshake with {} failed: {}", addr, e);
                            return;
                        }
                    },
                    None => Transport::Tcp(stream),
                };
                #[cfg(not(feature = "tls"))]
                let transport = Transport::Tcp(stream);
                trace!("Connection from {} over {}", addr, if transport.is_tls() { "TLS" } else { "TCP" });

                if let Err(e) = ctx.handle_connection(transport, addr).await {
                    debug!("Connection from {} ended: {}", addr, e);
                }
            });
        }

        info!("MQTT gateway stopping, closing {} sessions", self.registry.len());
        self.registry.close_all(CloseReason::Shutdown).await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop accepting connections and close every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// What a connection task needs from the gateway.
struct ConnectionContext {
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    session_config: SessionConfig,
    shutdown: CancellationToken,
}

impl ConnectionContext {
    async fn handle_connection<S>(&self, stream: S, addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);
        let max_size = self.session_config.max_message_size;

        let first = tokio::time::timeout(
            self.session_config.handshake_timeout,
            protocol::read_packet(&mut reader, &mut read_buf, max_size),
        )
        .await
        .map_err(|_| Error::Timeout(format!("no CONNECT from {addr}")))??;

        let connect = match first {
            Packet::Connect(connect) => connect,
            other => {
                return Err(Error::UnexpectedPacket {
                    expected: "CONNECT".to_string(),
                    got: protocol::packet_name(&other).to_string(),
                });
            }
        };

        let mut request = ConnectRequest::from(connect);
        if request.client_id.is_empty() {
            if !request.clean_session {
                warn!("CONNECT from {} with empty client id and persistent session", addr);
                let connack = protocol::create_connack(false, ConnectReturnCode::BadClientId);
                protocol::write_packet(&mut writer, connack, max_size).await?;
                return Ok(());
            }
            request.client_id = Uuid::new_v4().to_string();
            debug!("Assigned client id {} to {}", request.client_id, addr);
        }
        info!("CONNECT from MQTT client {} at {}", request.client_id, addr);

        let mut slot = self.registry.claim(&request.client_id).await;

        let (client_tx, mut client_out) = mpsc::channel::<Packet>(CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(async move {
            while let Some(packet) = client_out.recv().await {
                if let Err(e) = protocol::write_packet(&mut writer, packet, max_size).await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut session = BridgeSession::new(self.session_config.clone(), request, addr, client_tx);
        if session.open(self.connector.as_ref()).await.is_err() {
            drop(session);
            let _ = writer_task.await;
            return Ok(());
        }
        slot.register(session.handle());

        let (packets_tx, packets_rx) = mpsc::channel::<Packet>(CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(async move {
            loop {
                match protocol::read_packet(&mut reader, &mut read_buf, max_size).await {
                    Ok(packet) => {
                        if packets_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::ConnectionClosed) => {
                        trace!("Client at {} closed the connection", addr);
                        break;
                    }
                    Err(e) => {
                        debug!("Read from {} failed: {}", addr, e);
                        break;
                    }
                }
            }
        });

        let outcome = if self.shutdown.is_cancelled() {
            session.close(CloseReason::Shutdown).await
        } else {
            session.run(packets_rx).await
        };
        debug!("Session {} closed: {:?}", session.client_id(), outcome);

        reader_task.abort();
        drop(session);
        let _ = writer_task.await;
        drop(slot);
        Ok(())
    }
}
