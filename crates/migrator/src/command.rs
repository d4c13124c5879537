//! Wire commands
//!
//! Commands are encoded as arrays of bulk strings, the request form every
//! RESP server accepts:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n
//! ```

use std::fmt::{self, Display};

use bytes::{BufMut, Bytes, BytesMut};
use kvport_source::{DataType, FieldValue, ScoreMember, display_key};
use tracing::warn;

/// Write operations the migrator emits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// `SET`, one per string key
    Set,
    /// `EXPIRE`, trailing a collection's data commands
    Expire,
    /// `RPUSH`, list elements in order
    RPush,
    /// `HMSET`, field and value pairs
    HMSet,
    /// `SADD`, set members
    SAdd,
    /// `ZADD`, score and member pairs
    ZAdd,
}

impl Operation {
    /// Command name as sent on the wire
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "SET",
            Self::Expire => "EXPIRE",
            Self::RPush => "RPUSH",
            Self::HMSet => "HMSET",
            Self::SAdd => "SADD",
            Self::ZAdd => "ZADD",
        }
    }

    /// Element-carrying operation for a collection type
    pub const fn for_collection(data_type: DataType) -> Option<Self> {
        match data_type {
            DataType::Strings => None,
            DataType::Lists => Some(Self::RPush),
            DataType::Hashes => Some(Self::HMSet),
            DataType::Sets => Some(Self::SAdd),
            DataType::ZSets => Some(Self::ZAdd),
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write command: an operation and its arguments, key first
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireCommand {
    operation: Operation,
    args: Vec<Bytes>,
}

impl WireCommand {
    /// Start a command on `key` with no further arguments
    pub fn new(operation: Operation, key: Bytes) -> Self {
        Self {
            operation,
            args: vec![key],
        }
    }

    /// `SET key value [EX seconds]`
    pub fn set(key: Bytes, value: Bytes, expire_secs: Option<u64>) -> Self {
        let mut command = Self::new(Operation::Set, key);
        command.push_arg(value);
        if let Some(secs) = expire_secs {
            command.push_arg(Bytes::from_static(b"EX"));
            command.push_arg(Bytes::from(secs.to_string()));
        }
        command
    }

    /// `EXPIRE key seconds`
    pub fn expire(key: Bytes, secs: u64) -> Self {
        let mut command = Self::new(Operation::Expire, key);
        command.push_arg(Bytes::from(secs.to_string()));
        command
    }

    /// Append one argument
    pub fn push_arg(&mut self, arg: Bytes) {
        self.args.push(arg);
    }

    /// The command's operation
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    /// The key the command writes to
    pub fn key(&self) -> &Bytes {
        &self.args[0]
    }

    /// Arguments after the operation name, key included
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        let header = array_header_len(self.args.len() + 1);
        let name = bulk_len(self.operation.as_str().len());
        header + name + self.args.iter().map(|arg| bulk_len(arg.len())).sum::<usize>()
    }

    /// Encode as a RESP array of bulk strings
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the RESP encoding to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(b'*');
        buf.put_slice((self.args.len() + 1).to_string().as_bytes());
        buf.put_slice(b"\r\n");
        put_bulk(buf, self.operation.as_str().as_bytes());
        for arg in &self.args {
            put_bulk(buf, arg);
        }
    }
}

impl Display for WireCommand {
    /// Space-separated, lossy rendering for logs and assertions
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation.as_str())?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

fn digits(n: usize) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}

fn array_header_len(count: usize) -> usize {
    1 + digits(count) + 2
}

fn bulk_len(len: usize) -> usize {
    1 + digits(len) + 2 + len + 2
}

/// Render a sorted-set score as the shortest decimal that parses back to it
///
/// NaN has no representation a `ZADD` accepts and renders as `None`.
pub fn format_score(score: f64) -> Option<String> {
    if score.is_nan() {
        None
    } else if score.is_infinite() {
        Some(if score > 0.0 { "inf" } else { "-inf" }.to_string())
    } else {
        Some(score.to_string())
    }
}

/// Something that expands into one or more command arguments
pub trait CommandElement {
    /// Append this element's arguments to `command`
    fn push_args(&self, command: &mut WireCommand);
}

impl CommandElement for Bytes {
    fn push_args(&self, command: &mut WireCommand) {
        command.push_arg(self.clone());
    }
}

impl CommandElement for FieldValue {
    fn push_args(&self, command: &mut WireCommand) {
        command.push_arg(self.field.clone());
        command.push_arg(self.value.clone());
    }
}

impl CommandElement for ScoreMember {
    fn push_args(&self, command: &mut WireCommand) {
        let Some(score) = format_score(self.score) else {
            warn!(
                "Dropping member {} of {} with a NaN score",
                display_key(&self.member),
                display_key(command.key())
            );
            return;
        };
        command.push_arg(Bytes::from(score));
        command.push_arg(self.member.clone());
    }
}
