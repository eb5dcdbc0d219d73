use std::fmt;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use url::Url;

use crate::core::connection::Transport;
use crate::core::{ClosureCallback, RedisConnection};
use crate::{Error, Result};

/// Builder for configuring and opening a [`RedisConnection`].
///
/// # Example
///
/// ```no_run
/// use redlink::core::builder::ConnectionBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let conn = ConnectionBuilder::new()
///     .address("redis://localhost:6379")
///     .password("secret")
///     .database(0)
///     .connect()
///     .await?;
/// # conn.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ConnectionBuilder {
    address: Option<String>,
    username: Option<String>,
    password: Option<String>,
    database: Option<u8>,
    client_name: Option<String>,
    connect_timeout: Option<Duration>,
    on_unexpected_closure: Option<ClosureCallback>,
}

impl ConnectionBuilder {
    /// Creates a new [`ConnectionBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the Redis server address.
    ///
    /// # Arguments
    ///
    /// * `address` - `redis://host:port`, `rediss://host:port` for TLS, or
    ///   `unix:///path/to/socket`
    #[inline]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the username for ACL authentication.
    ///
    /// # Arguments
    ///
    /// * `username` - Username string; only meaningful together with a password
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password for authentication. Its presence triggers AUTH
    /// during the startup handshake.
    ///
    /// # Arguments
    ///
    /// * `password` - Password string
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the Redis database to SELECT after connecting.
    ///
    /// # Arguments
    ///
    /// * `database` - Database number (0-15)
    #[inline]
    pub fn database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Sets the client connection name.
    ///
    /// # Arguments
    ///
    /// * `name` - Client name displayed in `CLIENT LIST`
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Sets the connection timeout.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for connection establishment
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the callback fired at most once if the server closes the
    /// transport while the connection is still open or subscribed.
    #[inline]
    pub fn on_unexpected_closure(mut self, callback: ClosureCallback) -> Self {
        self.on_unexpected_closure = Some(callback);
        self
    }

    /// Opens the connection: dials the address, performs the TLS handshake
    /// when configured, then runs the startup handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a missing or malformed address,
    /// a username without a password, or a `rediss://` address without the
    /// `tls` feature. Returns [`Error::Io`] when dialing fails and
    /// [`Error::Startup`] when the server rejects a handshake step.
    pub async fn connect(self) -> Result<RedisConnection> {
        let address = self.address.as_deref().ok_or_else(|| Error::InvalidArgument {
            message: "address is required".to_string(),
        })?;
        if self.username.is_some() && self.password.is_none() {
            return Err(Error::InvalidArgument {
                message: "username requires a password".to_string(),
            });
        }

        let url = Url::parse(address).map_err(|_| Error::InvalidArgument {
            message: "invalid address format".to_string(),
        })?;

        match url.scheme() {
            "redis" => {
                let (host, port) = host_port(&url)?;
                let stream = dial(&host, port, self.connect_timeout).await?;
                self.start(Transport::new(stream)).await
            }
            "rediss" => self.connect_tls(&url).await,
            "unix" => self.connect_unix(&url).await,
            other => Err(Error::InvalidArgument {
                message: format!("unsupported scheme: {other}"),
            }),
        }
    }

    #[cfg(feature = "tls")]
    async fn connect_tls(self, url: &Url) -> Result<RedisConnection> {
        let (host, port) = host_port(url)?;
        let stream = dial(&host, port, self.connect_timeout).await?;
        let connector = crate::core::TlsConnectorInner::new()?;
        let stream = connector.connect(&host, stream).await?;
        self.start(Transport::new(stream)).await
    }

    #[cfg(not(feature = "tls"))]
    async fn connect_tls(self, _url: &Url) -> Result<RedisConnection> {
        Err(Error::InvalidArgument {
            message: "rediss:// requires the tls feature".to_string(),
        })
    }

    #[cfg(unix)]
    async fn connect_unix(self, url: &Url) -> Result<RedisConnection> {
        let path = url.path().to_string();
        if path.is_empty() {
            return Err(Error::InvalidArgument {
                message: "unix address is missing a socket path".to_string(),
            });
        }
        let stream = match self.connect_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, tokio::net::UnixStream::connect(&path))
                    .await
                    .map_err(|_| timeout_error())??
            }
            None => tokio::net::UnixStream::connect(&path).await?,
        };
        self.start(Transport::new(stream)).await
    }

    #[cfg(not(unix))]
    async fn connect_unix(self, _url: &Url) -> Result<RedisConnection> {
        Err(Error::InvalidArgument {
            message: "unix sockets are not supported on this platform".to_string(),
        })
    }

    async fn start<S>(self, transport: Transport<S>) -> Result<RedisConnection>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        RedisConnection::start(
            transport,
            self.username,
            self.password,
            self.database,
            self.client_name,
            self.on_unexpected_closure,
        )
        .await
    }
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("client_name", &self.client_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn host_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidArgument {
            message: "missing host in address".to_string(),
        })?
        .to_string();
    Ok((host, url.port().unwrap_or(6379)))
}

async fn dial(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let connect = TcpStream::connect((host, port));
    let stream = match timeout {
        Some(duration) => tokio::time::timeout(duration, connect)
            .await
            .map_err(|_| timeout_error())??,
        None => connect.await?,
    };
    Ok(stream)
}

fn timeout_error() -> Error {
    Error::Io {
        source: io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_new() {
        let builder = ConnectionBuilder::new();
        assert!(builder.address.is_none());
        assert!(builder.password.is_none());
    }

    #[test]
    fn test_builder_chaining() {
        let builder = ConnectionBuilder::new()
            .address("redis://localhost:6379")
            .username("app")
            .password("secret")
            .database(2)
            .client_name("worker")
            .connect_timeout(Duration::from_secs(5));

        assert_eq!(builder.address, Some("redis://localhost:6379".to_string()));
        assert_eq!(builder.username, Some("app".to_string()));
        assert_eq!(builder.password, Some("secret".to_string()));
        assert_eq!(builder.database, Some(2));
        assert_eq!(builder.client_name, Some("worker".to_string()));
        assert_eq!(builder.connect_timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_connect_without_address() {
        let result = ConnectionBuilder::new().connect().await;
        match result {
            Err(Error::InvalidArgument { message }) => {
                assert_eq!(message, "address is required");
            }
            _ => panic!("expected InvalidArgument error"),
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_username_without_password() {
        let result = ConnectionBuilder::new()
            .address("redis://localhost:6379")
            .username("app")
            .connect()
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let result = ConnectionBuilder::new()
            .address("http://localhost:6379")
            .connect()
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn test_connect_rejects_rediss_without_tls_feature() {
        let result = ConnectionBuilder::new()
            .address("rediss://localhost:6380")
            .connect()
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_debug_redacts_password() {
        let builder = ConnectionBuilder::new().password("secret");
        let rendered = format!("{:?}", builder);
        assert!(!rendered.contains("secret"));
    }
}
