use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::frame::RespValue;

/// A RESP encoder that converts [`RespValue`] types to bytes.
///
/// The encoder accumulates data in an internal buffer and can be used
/// to encode multiple values sequentially, which is how a pipelined batch
/// becomes a single write.
///
/// # Example
///
/// ```
/// use redlink::proto::codec::Encoder;
/// use redlink::proto::frame::RespValue;
///
/// let mut encoder = Encoder::new();
/// encoder.encode(&RespValue::SimpleString("OK".into()));
/// let data = encoder.take();
/// assert_eq!(&data[..], b"+OK\r\n");
/// ```
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Encodes a value into the internal buffer using the RESP wire format.
    ///
    /// # Arguments
    ///
    /// * `value` - The value to encode
    pub fn encode(&mut self, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                self.buf.put_u8(b'+');
                self.buf.extend_from_slice(s);
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(e) => {
                self.buf.put_u8(b'-');
                self.buf.extend_from_slice(e);
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                self.buf.put_u8(b':');
                self.buf.extend_from_slice(n.to_string().as_bytes());
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(s) => {
                self.buf.put_u8(b'$');
                if let Some(data) = s {
                    self.buf
                        .extend_from_slice(data.len().to_string().as_bytes());
                    self.buf.extend_from_slice(b"\r\n");
                    self.buf.extend_from_slice(data);
                } else {
                    self.buf.extend_from_slice(b"-1");
                }
                self.buf.extend_from_slice(b"\r\n");
            }
            RespValue::Array(a) => {
                self.buf.put_u8(b'*');
                if let Some(items) = a {
                    self.buf
                        .extend_from_slice(items.len().to_string().as_bytes());
                    self.buf.extend_from_slice(b"\r\n");
                    for item in items {
                        self.encode(item);
                    }
                } else {
                    self.buf.extend_from_slice(b"-1\r\n");
                }
            }
        }
    }

    /// Takes the encoded data from the buffer, leaving it empty.
    ///
    /// The encoder can be reused afterwards.
    ///
    /// # Returns
    ///
    /// The accumulated bytes
    pub fn take(&mut self) -> Bytes {
        std::mem::take(&mut self.buf).freeze()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a single value to its wire representation.
///
/// Convenience wrapper for call sites that do not keep an encoder around.
pub fn encode_value(value: &RespValue) -> Bytes {
    let mut encoder = Encoder::new();
    encoder.encode(value);
    encoder.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_encode_simple_string() {
        let mut encoder = Encoder::new();
        encoder.encode(&RespValue::SimpleString(Bytes::from("OK")));
        assert_eq!(&encoder.take()[..], b"+OK\r\n");
    }

    #[test]
    fn test_encode_error() {
        let mut encoder = Encoder::new();
        encoder.encode(&RespValue::Error(Bytes::from("ERR")));
        assert_eq!(&encoder.take()[..], b"-ERR\r\n");
    }

    #[test]
    fn test_encode_integer() {
        let mut encoder = Encoder::new();
        encoder.encode(&RespValue::Integer(42));
        assert_eq!(&encoder.take()[..], b":42\r\n");
    }

    #[test]
    fn test_encode_bulk_string() {
        let mut encoder = Encoder::new();
        encoder.encode(&RespValue::BulkString(Some(Bytes::from("hello"))));
        assert_eq!(&encoder.take()[..], b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_encode_bulk_string_null() {
        let mut encoder = Encoder::new();
        encoder.encode(&RespValue::BulkString(None));
        assert_eq!(&encoder.take()[..], b"$-1\r\n");
    }

    #[test]
    fn test_encode_array() {
        let mut encoder = Encoder::new();
        encoder.encode(&RespValue::Array(Some(vec![
            RespValue::BulkString(Some(Bytes::from("foo"))),
            RespValue::BulkString(Some(Bytes::from("bar"))),
        ])));
        assert_eq!(&encoder.take()[..], b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn test_encode_null_array() {
        let mut encoder = Encoder::new();
        encoder.encode(&RespValue::Array(None));
        assert_eq!(&encoder.take()[..], b"*-1\r\n");
    }

    #[test]
    fn test_encode_value_helper() {
        let data = encode_value(&RespValue::Integer(-3));
        assert_eq!(&data[..], b":-3\r\n");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        use crate::proto::codec::Decoder;

        let original = RespValue::Array(Some(vec![
            RespValue::SimpleString(Bytes::from("OK")),
            RespValue::Integer(12),
            RespValue::BulkString(None),
            RespValue::Array(None),
            RespValue::BulkString(Some(Bytes::from("payload"))),
        ]));

        let mut decoder = Decoder::new();
        decoder.append(&encode_value(&original));
        assert_eq!(decoder.decode().unwrap().unwrap(), original);
        assert!(decoder.decode().unwrap().is_none());
    }
}
