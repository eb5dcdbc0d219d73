use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;

use crate::proto::error::{Error, Result};
use crate::proto::frame::RespValue;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default

/// Nesting ceiling for arrays. Anything deeper is treated as hostile input.
const MAX_DEPTH: usize = 128;

/// A RESP decoder that converts bytes to [`RespValue`] types.
///
/// The decoder handles streaming input and can decode values incrementally.
/// Call [`append`](Decoder::append) to add data, then [`decode`](Decoder::decode)
/// to parse values. Returns `Ok(None)` when more data is needed, consuming
/// nothing from the buffer until a complete top-level value is available.
///
/// # Example
///
/// ```
/// use redlink::proto::codec::Decoder;
/// use redlink::proto::frame::RespValue;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r\n");
/// let value = decoder.decode().unwrap().unwrap();
/// assert_eq!(value, RespValue::SimpleString("OK".into()));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
}

/// Outcome of a line scan: the line's byte range plus the cursor past CRLF.
struct Line {
    start: usize,
    end: usize,
    next: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    ///
    /// # Arguments
    ///
    /// * `max_frame_size` - Maximum size in bytes for a single frame
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes to the internal buffer.
    ///
    /// Call this method when new data arrives from the network.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes to append
    ///
    /// # Note
    ///
    /// Buffer size limits are checked during decode, not append.
    /// This allows for streaming large frames incrementally.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to decode one top-level value from the buffer.
    ///
    /// Returns `Ok(Some(RespValue))` if a complete value was decoded, with
    /// exactly its bytes consumed. Returns `Ok(None)` if more data is
    /// needed, with nothing consumed. Returns `Err(...)` if the data is
    /// malformed, which is fatal to the stream.
    pub fn decode(&mut self) -> Result<Option<RespValue>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.len() > self.max_frame_size {
            return Err(Error::protocol("buffer exceeded maximum frame size"));
        }

        let mut pos = 0;
        match self.parse_value(&mut pos, 0)? {
            Some(value) => {
                self.buf.advance(pos);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parses one value starting at `*pos`, advancing the cursor past it on
    /// success. Never mutates the buffer, so a partial parse costs nothing.
    fn parse_value(&self, pos: &mut usize, depth: usize) -> Result<Option<RespValue>> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("array nesting exceeds maximum depth"));
        }
        if *pos >= self.buf.len() {
            return Ok(None);
        }

        match self.buf[*pos] {
            b'+' => self.parse_simple_string(pos),
            b'-' => self.parse_error(pos),
            b':' => self.parse_integer(pos),
            b'$' => self.parse_bulk_string(pos),
            b'*' => self.parse_array(pos, depth),
            other => Err(Error::protocol(format!(
                "unknown frame type: {}",
                other as char
            ))),
        }
    }

    fn parse_simple_string(&self, pos: &mut usize) -> Result<Option<RespValue>> {
        let line = match self.read_line(*pos + 1)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let data = Bytes::copy_from_slice(&self.buf[line.start..line.end]);
        *pos = line.next;
        Ok(Some(RespValue::SimpleString(data)))
    }

    fn parse_error(&self, pos: &mut usize) -> Result<Option<RespValue>> {
        let line = match self.read_line(*pos + 1)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let data = Bytes::copy_from_slice(&self.buf[line.start..line.end]);
        *pos = line.next;
        Ok(Some(RespValue::Error(data)))
    }

    fn parse_integer(&self, pos: &mut usize) -> Result<Option<RespValue>> {
        let line = match self.read_line(*pos + 1)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let num = parse_i64(&self.buf[line.start..line.end])?;
        *pos = line.next;
        Ok(Some(RespValue::Integer(num)))
    }

    fn parse_bulk_string(&self, pos: &mut usize) -> Result<Option<RespValue>> {
        let line = match self.read_line(*pos + 1)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let len = parse_i64(&self.buf[line.start..line.end])?;

        if len == -1 {
            *pos = line.next;
            return Ok(Some(RespValue::BulkString(None)));
        }
        if len < 0 {
            return Err(Error::protocol("negative bulk string length"));
        }

        let len = len as usize;
        if len > self.max_frame_size {
            return Err(Error::protocol(
                "bulk string length exceeds maximum frame size",
            ));
        }

        if self.buf.len() < line.next + len + 2 {
            return Ok(None);
        }
        if &self.buf[line.next + len..line.next + len + 2] != b"\r\n" {
            return Err(Error::protocol("bulk string payload not CRLF terminated"));
        }

        let data = Bytes::copy_from_slice(&self.buf[line.next..line.next + len]);
        *pos = line.next + len + 2;
        Ok(Some(RespValue::BulkString(Some(data))))
    }

    fn parse_array(&self, pos: &mut usize, depth: usize) -> Result<Option<RespValue>> {
        let line = match self.read_line(*pos + 1)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let len = parse_i64(&self.buf[line.start..line.end])?;

        if len == -1 {
            *pos = line.next;
            return Ok(Some(RespValue::Array(None)));
        }
        if len < 0 {
            return Err(Error::protocol("negative array length"));
        }

        let len = len as usize;

        // Assume a minimum of 16 bytes per element when sanity checking the
        // declared count against the frame budget.
        if len > self.max_frame_size / 16 {
            return Err(Error::protocol("array length exceeds reasonable maximum"));
        }

        let mut cursor = line.next;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            match self.parse_value(&mut cursor, depth + 1)? {
                Some(value) => items.push(value),
                None => return Ok(None),
            }
        }

        *pos = cursor;
        Ok(Some(RespValue::Array(Some(items))))
    }

    /// Scans for the CRLF-terminated line starting at `start`.
    ///
    /// Returns `Ok(None)` when the terminator has not arrived yet. A bare LF,
    /// or a CR not followed by LF, is a protocol error.
    fn read_line(&self, start: usize) -> Result<Option<Line>> {
        let mut i = start;
        while i < self.buf.len() {
            match self.buf[i] {
                b'\n' => return Err(Error::protocol("line feed without carriage return")),
                b'\r' => {
                    if i + 1 >= self.buf.len() {
                        return Ok(None);
                    }
                    if self.buf[i + 1] != b'\n' {
                        return Err(Error::protocol("carriage return without line feed"));
                    }
                    return Ok(Some(Line {
                        start,
                        end: i,
                        next: i + 2,
                    }));
                }
                _ => i += 1,
            }
        }
        Ok(None)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_i64(data: &[u8]) -> Result<i64> {
    std::str::from_utf8(data)
        .map_err(|e| Error::protocol(e.to_string()))?
        .parse::<i64>()
        .map_err(|e| Error::protocol(e.to_string()))
}
