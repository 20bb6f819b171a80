//! Listener-side transports.
//!
//! - TCP (plain)
//! - TLS (with the `tls` feature)

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use tokio_rustls::server::TlsStream;

/// An accepted client connection.
pub enum Transport {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// TLS stream.
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        match self {
            Transport::Tcp(_) => false,
            #[cfg(feature = "tls")]
            Transport::Tls(_) => true,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(feature = "tls")]
pub mod tls {
    //! TLS listener configuration.

    use std::fs::File;
    use std::io::{self, BufReader};
    use std::path::Path;
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::TlsAcceptor;
    use tokio_rustls::rustls::ServerConfig;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

    use super::Transport;
    use crate::error::{Error, Result};

    /// TLS configuration for the listener.
    #[derive(Clone)]
    pub struct TlsConfig {
        /// The TLS acceptor.
        pub acceptor: TlsAcceptor,
    }

    impl TlsConfig {
        /// Load a PEM certificate chain and private key.
        pub fn from_pem_files(cert_file: &Path, key_file: &Path) -> Result<Self> {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;

            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| Error::InvalidConfig(format!("tls: {e}")))?;

            Ok(Self {
                acceptor: TlsAcceptor::from(Arc::new(config)),
            })
        }

        /// Run the server side of the TLS handshake.
        pub async fn accept(&self, stream: TcpStream) -> io::Result<Transport> {
            let stream = self.acceptor.accept(stream).await?;
            Ok(Transport::Tls(Box::new(stream)))
        }
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let mut reader = BufReader::new(File::open(path)?);
        let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no certificate in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
        let mut reader = BufReader::new(File::open(path)?);
        rustls_pemfile::private_key(&mut reader)?
            .ok_or_else(|| Error::InvalidConfig(format!("no private key in {}", path.display())))
    }
}
