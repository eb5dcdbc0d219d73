use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::{Error, Result};

/// Internal TLS connector wrapper using rustls.
#[derive(Clone)]
pub struct TlsConnectorInner {
    connector: TlsConnector,
}

impl TlsConnectorInner {
    /// Creates a new TLS connector with default secure configuration.
    ///
    /// Uses `webpki-roots` for Mozilla's root certificates and `ring` as the crypto provider.
    pub fn new() -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Performs the TLS handshake over an established TCP stream.
    ///
    /// The hostname is used for SNI and certificate verification, which is
    /// why TLS configurations must always carry one.
    pub async fn connect(&self, hostname: &str, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let server_name =
            ServerName::try_from(hostname.to_string()).map_err(|_| Error::InvalidArgument {
                message: format!("invalid TLS hostname: {hostname}"),
            })?;
        let stream = self.connector.connect(server_name, stream).await?;
        Ok(stream)
    }
}
