use std::fmt;

use tokio::io::{
    self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::error::{Error, Result};
use crate::proto::frame::RespValue;

/// Read buffer size for the socket.
const READ_CHUNK: usize = 4096;

/// An established duplex byte channel to a Redis server.
///
/// This struct wraps an underlying stream (TCP, TLS, Unix socket) and handles
/// RESP value encoding and decoding. Writes are buffered; callers decide per
/// batch whether the buffer is flushed, which is what makes cooperative
/// pipelining possible.
///
/// The transport is used whole during the startup handshake and then split
/// into independent read and write halves for the driver task.
pub struct Transport<S> {
    stream: S,
    decoder: Decoder,
    encoder: Encoder,
}

/// Read half of a split transport. Yields decoded values and reports EOF.
pub struct TransportReader<S> {
    stream: ReadHalf<S>,
    decoder: Decoder,
}

/// Write half of a split transport. Buffers encoded values until flushed.
pub struct TransportWriter<S> {
    stream: BufWriter<WriteHalf<S>>,
    encoder: Encoder,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new transport over the given stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    /// Writes one value and flushes, then reads one reply.
    ///
    /// Used for the startup handshake, before the transport is split and
    /// handed to the driver. EOF during the exchange is an error here: the
    /// server hung up mid-handshake.
    pub async fn request(&mut self, value: &RespValue) -> Result<RespValue> {
        self.encoder.encode(value);
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;

        loop {
            if let Some(value) = self.decoder.decode()? {
                return Ok(value);
            }

            let mut buf = vec![0u8; READ_CHUNK];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.decoder.append(&buf[..n]);
        }
    }

    /// Splits the transport into a read half and a write half.
    ///
    /// This allows the driver task to await inbound values and outbound
    /// requests independently.
    pub fn split(self) -> (TransportReader<S>, TransportWriter<S>) {
        let (read_half, write_half) = io::split(self.stream);
        (
            TransportReader {
                stream: read_half,
                decoder: self.decoder,
            },
            TransportWriter {
                stream: BufWriter::new(write_half),
                encoder: self.encoder,
            },
        )
    }

    /// Shuts the stream down without splitting. Handshake failure path.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl<S> TransportReader<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Reads the next value from the connection.
    ///
    /// Returns `Ok(Some(value))` for a decoded value, `Ok(None)` when the
    /// peer closed the stream cleanly, and an error for malformed data or
    /// socket failure. Cancellation between reads loses nothing: bytes are
    /// moved into the decoder in the same poll that completes the read.
    pub async fn read_value(&mut self) -> Result<Option<RespValue>> {
        loop {
            if let Some(value) = self.decoder.decode()? {
                return Ok(Some(value));
            }

            let mut buf = vec![0u8; READ_CHUNK];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.append(&buf[..n]);
        }
    }
}

impl<S> TransportWriter<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Writes a batch of values, flushing only when asked to.
    ///
    /// With `flush` false the bytes stay in the write buffer until a later
    /// flushed write or an explicit [`flush`](TransportWriter::flush).
    pub async fn write_values(&mut self, values: &[RespValue], flush: bool) -> io::Result<()> {
        for value in values {
            self.encoder.encode(value);
        }
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        if flush {
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// Flushes any buffered writes.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    /// Flushes and shuts down the write side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl<S> fmt::Debug for Transport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish()
    }
}

impl<S> fmt::Debug for TransportReader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportReader").finish()
    }
}

impl<S> fmt::Debug for TransportWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportWriter").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    fn ping_value() -> RespValue {
        RespValue::Array(Some(vec![RespValue::bulk("PING")]))
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = Transport::new(stream);
            let value = transport.request(&ping_value()).await;
            // The server side reads our PING as its "reply" to the PONG it
            // sends below; only the client assertions matter here.
            drop(value);
        };

        let client = async {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut transport = Transport::new(stream);
            let reply = transport
                .request(&RespValue::SimpleString(Bytes::from("PONG")))
                .await
                .unwrap();
            assert_eq!(
                reply,
                RespValue::Array(Some(vec![RespValue::bulk("PING")]))
            );
        };

        tokio::join!(server, client);
    }

    #[tokio::test]
    async fn test_unflushed_writes_stay_buffered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let (_reader, mut writer) = Transport::new(client).split();
        writer.write_values(&[ping_value()], false).await.unwrap();

        let (mut server_reader, _server_writer) = Transport::new(server_stream).split();
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), server_reader.read_value())
                .await;
        assert!(nothing.is_err(), "unflushed write must not reach the peer");

        writer.flush().await.unwrap();
        let value = server_reader.read_value().await.unwrap().unwrap();
        assert_eq!(value, ping_value());
    }

    #[tokio::test]
    async fn test_reader_reports_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        drop(server_stream);

        let (mut reader, _writer) = Transport::new(client).split();
        assert!(reader.read_value().await.unwrap().is_none());
    }
}
