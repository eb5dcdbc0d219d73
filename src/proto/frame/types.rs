use bytes::Bytes;

/// A RESP (Redis Serialization Protocol) value.
///
/// This enum represents all value kinds defined in RESP2:
/// - SimpleString: status replies like "OK"
/// - Error: error replies from the server
/// - Integer: numeric replies
/// - BulkString: binary-safe string data, `None` for the null bulk string
/// - Array: nested replies, `None` for the null array
///
/// The null bulk string (`$-1\r\n`) and the null array (`*-1\r\n`) are kept
/// distinct: the former decodes to `BulkString(None)`, the latter to
/// `Array(None)`.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string (+OK).
    SimpleString(Bytes),
    /// Error (-ERR).
    Error(Bytes),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar), `None` when null.
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...), `None` when null.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Builds a bulk string value from anything byte-like.
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(data.into()))
    }

    /// Converts the value to a human-readable string representation.
    ///
    /// For arrays, returns a bracketed list of the printable elements.
    ///
    /// # Returns
    ///
    /// Some(String) if conversion succeeds, None for values without a string
    /// representation (null bulk strings, null arrays).
    pub fn as_display_string(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => String::from_utf8(s.to_vec()).ok(),
            RespValue::Error(e) => String::from_utf8(e.to_vec()).ok(),
            RespValue::Integer(i) => Some(i.to_string()),
            RespValue::BulkString(b) => b
                .as_ref()
                .map(|s| String::from_utf8_lossy(s).into_owned()),
            RespValue::Array(Some(a)) => Some(format!(
                "[{}]",
                a.iter()
                    .filter_map(|f| f.as_display_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            RespValue::Array(None) => None,
        }
    }

    /// Attempts to extract the bytes of a bulk string.
    ///
    /// # Returns
    ///
    /// Some(Bytes) if this is a non-null BulkString, None otherwise
    pub fn as_bulk_string(&self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(b) => b.clone(),
            _ => None,
        }
    }

    /// Attempts to extract the elements of an array.
    ///
    /// # Returns
    ///
    /// Some(`&[RespValue]`) if this is a non-null Array, None otherwise
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(a)) => Some(a),
            _ => None,
        }
    }

    /// Attempts to extract an integer.
    ///
    /// # Returns
    ///
    /// Some(i64) if this is an Integer, None otherwise
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns true if this value is the null bulk string or the null array.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    /// Returns true if this value is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}
