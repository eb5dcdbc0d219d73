use crate::proto::error::{Error, Result};
use crate::proto::frame::RespValue;
use bytes::Bytes;

/// A command ready to be sent to Redis.
///
/// Commands are built using the builder pattern and converted to RESP
/// arrays of bulk strings for transmission over the connection.
///
/// # Example
///
/// ```
/// use redlink::core::command::{get, Cmd};
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// let get_cmd = get("key");
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "SUBSCRIBE")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Appends an argument to the command.
    ///
    /// # Arguments
    ///
    /// * `arg` - The argument value
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Returns the command name, i.e. the first element of the argument list.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Converts the command to a RESP array of bulk strings.
    #[inline]
    pub fn into_value(self) -> RespValue {
        RespValue::Array(Some(
            self.args
                .into_iter()
                .map(|b| RespValue::BulkString(Some(b)))
                .collect(),
        ))
    }
}

/// The boundary contract between typed command wrappers and the connection.
///
/// A signature carries one or more commands (so a single signature may
/// represent a pipeline) and knows how to decode the final reply into its
/// typed response. The connection consumes signatures via
/// [`execute`](crate::core::RedisConnection::execute).
pub trait CommandSignature {
    /// The decoded response type.
    type Response;

    /// The commands to transmit, in issue order.
    fn commands(&self) -> Vec<Cmd>;

    /// Decodes the reply to the last command of the signature.
    fn make_response(&self, value: RespValue) -> Result<Self::Response>;
}

impl CommandSignature for Cmd {
    type Response = RespValue;

    fn commands(&self) -> Vec<Cmd> {
        vec![self.clone()]
    }

    fn make_response(&self, value: RespValue) -> Result<RespValue> {
        Ok(value)
    }
}

/// A pipelined sequence of commands decoded by the reply to its last member.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Cmd>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command to the pipeline.
    pub fn push(mut self, cmd: Cmd) -> Self {
        self.commands.push(cmd);
        self
    }

    /// Number of commands queued in the pipeline.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true when the pipeline holds no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandSignature for Pipeline {
    type Response = RespValue;

    fn commands(&self) -> Vec<Cmd> {
        self.commands.clone()
    }

    fn make_response(&self, value: RespValue) -> Result<RespValue> {
        Ok(value)
    }
}

/// Commands a subscribed connection may still issue.
const SUBSCRIBER_MODE_COMMANDS: &[&[u8]] = &[
    b"SUBSCRIBE",
    b"UNSUBSCRIBE",
    b"PSUBSCRIBE",
    b"PUNSUBSCRIBE",
    b"PING",
    b"QUIT",
];

/// Returns true when `name` may be sent while the connection is subscribed.
pub(crate) fn allowed_in_subscriber_mode(name: &[u8]) -> bool {
    SUBSCRIBER_MODE_COMMANDS
        .iter()
        .any(|allowed| name.eq_ignore_ascii_case(allowed))
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates an ECHO command.
#[inline]
pub fn echo(msg: impl Into<Bytes>) -> Cmd {
    Cmd::new("ECHO").arg(msg)
}

/// Creates a QUIT command.
#[inline]
pub fn quit() -> Cmd {
    Cmd::new("QUIT")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").arg(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").arg(key).arg(value)
}

/// Creates a SETEX command.
#[inline]
pub fn setex(key: impl Into<Bytes>, seconds: u64, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SETEX")
        .arg(key)
        .arg(seconds.to_string())
        .arg(value)
}

/// Creates a PUBLISH command.
#[inline]
pub fn publish(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> Cmd {
    Cmd::new("PUBLISH").arg(channel).arg(message)
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}

/// Creates a SELECT command.
#[inline]
pub fn select(db: u8) -> Cmd {
    Cmd::new("SELECT").arg(db.to_string())
}

/// Creates a CLIENT SETNAME command.
#[inline]
pub fn client_setname(name: impl Into<Bytes>) -> Cmd {
    Cmd::new("CLIENT").arg("SETNAME").arg(name)
}

/// Creates a SUBSCRIBE command for the given channels.
#[inline]
pub fn subscribe(channels: &[Bytes]) -> Cmd {
    let mut cmd = Cmd::new("SUBSCRIBE");
    for channel in channels {
        cmd = cmd.arg(channel.clone());
    }
    cmd
}

/// Creates an UNSUBSCRIBE command; no channels means all of them.
#[inline]
pub fn unsubscribe(channels: &[Bytes]) -> Cmd {
    let mut cmd = Cmd::new("UNSUBSCRIBE");
    for channel in channels {
        cmd = cmd.arg(channel.clone());
    }
    cmd
}

/// Creates a PSUBSCRIBE command for the given patterns.
#[inline]
pub fn psubscribe(patterns: &[Bytes]) -> Cmd {
    let mut cmd = Cmd::new("PSUBSCRIBE");
    for pattern in patterns {
        cmd = cmd.arg(pattern.clone());
    }
    cmd
}

/// Creates a PUNSUBSCRIBE command; no patterns means all of them.
#[inline]
pub fn punsubscribe(patterns: &[Bytes]) -> Cmd {
    let mut cmd = Cmd::new("PUNSUBSCRIBE");
    for pattern in patterns {
        cmd = cmd.arg(pattern.clone());
    }
    cmd
}

/// Checks that a reply is `+OK`.
///
/// # Returns
///
/// `Ok(())` for the OK status reply; `Error::Server` for an error reply;
/// `Error::Protocol` for anything else.
#[inline]
pub fn expect_ok(value: RespValue) -> Result<()> {
    match value {
        RespValue::SimpleString(ref s) if &s[..] == b"OK" => Ok(()),
        RespValue::Error(e) => Err(Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        other => Err(Error::Protocol {
            message: format!("expected OK, got {:?}", other),
        }),
    }
}

/// Converts a reply to optional bytes.
///
/// Null bulk strings and null arrays convert to `None`.
#[inline]
pub fn to_bytes(value: RespValue) -> Result<Option<Bytes>> {
    match value {
        RespValue::BulkString(b) => Ok(b),
        RespValue::SimpleString(s) => Ok(Some(s)),
        RespValue::Array(None) => Ok(None),
        RespValue::Error(e) => Err(Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        other => Err(Error::Protocol {
            message: format!("expected bulk string, got {:?}", other),
        }),
    }
}

/// Converts a reply to an integer.
#[inline]
pub fn to_int(value: RespValue) -> Result<i64> {
    match value {
        RespValue::Integer(i) => Ok(i),
        RespValue::Error(e) => Err(Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        other => Err(Error::Protocol {
            message: format!("expected integer, got {:?}", other),
        }),
    }
}

/// Converts an integer reply to a boolean (1 is true, anything else false).
#[inline]
pub fn to_bool(value: RespValue) -> Result<bool> {
    Ok(to_int(value)? == 1)
}

/// Converts a reply to a UTF-8 string.
#[inline]
pub fn to_string(value: RespValue) -> Result<String> {
    match to_bytes(value)? {
        Some(b) => String::from_utf8(b.to_vec()).map_err(|_| Error::Protocol {
            message: "reply is not valid UTF-8".to_string(),
        }),
        None => Err(Error::Protocol {
            message: "unexpected null reply".to_string(),
        }),
    }
}
