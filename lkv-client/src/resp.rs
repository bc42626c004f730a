//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies, keeping
//! allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Each call consumes exactly one reply frame.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//! 5. **Explicit Absence**: Null bulk strings and null arrays decode to `None`,
//!    never to an empty value.

use std::fmt;
use std::io::{self, BufRead};

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::{Arg, Command};
use crate::error::{ClientError, ClientResult, ProtocolError, UsageError};

/// Payload substituted for acknowledgements read through [`read_ack`].
pub const ACK_SENTINEL: &str = "QUEUED";

/// Largest bulk payload accepted from the server (matches the server default).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on up-front array allocation; longer arrays grow as they decode.
const MAX_PREALLOC_ITEMS: usize = 1024;

/// Deepest array nesting the decoder accepts.
pub const MAX_DEPTH: usize = 128;

/// Decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// :123 replies.
    Integer(i64),
    /// +OK or +PONG style replies.
    SimpleString(String),
    /// $... bulk strings, with None for the null bulk string.
    BulkString(Option<Bytes>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<Value>>),
}

impl Value {
    /// Builds a present simple string.
    pub fn simple(text: impl Into<String>) -> Self {
        Value::SimpleString(text.into())
    }

    /// Builds a present bulk string.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Value::BulkString(Some(data.into()))
    }

    /// Builds a present array.
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Some(items))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::SimpleString(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(Some(data)) => Some(&data[..]),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(Some(items)) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// True for the null bulk string and the null array.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::BulkString(None) | Value::Array(None))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(value) => write!(f, "(integer) {}", value),
            Value::SimpleString(text) => f.write_str(text),
            Value::BulkString(Some(data)) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Value::BulkString(None) | Value::Array(None) => f.write_str("(nil)"),
            Value::Array(Some(items)) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Encodes a command in wire form, inline or framed.
///
/// Inline text containing CR or LF is rejected before anything is written.
pub fn encode(command: &Command<'_>, out: &mut BytesMut) -> ClientResult<()> {
    match command {
        Command::Inline(text) => encode_inline(text, out),
        Command::Args(args) => {
            encode_command(args, out);
            Ok(())
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[Arg<'_>], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_decimal(out, args.len() as i64);
    out.put_slice(b"\r\n");
    for arg in args {
        encode_arg(arg, out);
    }
}

/// Encodes an inline command: the bare text line plus CRLF.
pub fn encode_inline(text: &str, out: &mut BytesMut) -> ClientResult<()> {
    if text.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(UsageError::InvalidInline.into());
    }
    out.put_slice(text.as_bytes());
    out.put_slice(b"\r\n");
    Ok(())
}

/// Encodes a value in reply framing.
pub fn encode_value(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Integer(value) => {
            out.put_u8(b':');
            push_decimal(out, *value);
            out.put_slice(b"\r\n");
        }
        Value::SimpleString(text) => {
            out.put_u8(b'+');
            out.put_slice(text.as_bytes());
            out.put_slice(b"\r\n");
        }
        Value::BulkString(Some(data)) => push_bulk(out, data),
        Value::BulkString(None) => out.put_slice(b"$-1\r\n"),
        Value::Array(Some(items)) => {
            out.put_u8(b'*');
            push_decimal(out, items.len() as i64);
            out.put_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Array(None) => out.put_slice(b"*-1\r\n"),
    }
}

fn encode_arg(arg: &Arg<'_>, out: &mut BytesMut) {
    match arg {
        Arg::Text(text) => push_bulk(out, text.as_bytes()),
        Arg::Bytes(data) => push_bulk(out, data),
        Arg::Int(value) => {
            let mut digits = [0u8; 20];
            push_bulk(out, decimal(*value, &mut digits));
        }
        Arg::IntFrame(value) => {
            out.put_u8(b':');
            push_decimal(out, *value);
            out.put_slice(b"\r\n");
        }
        Arg::Concat(parts) => {
            out.put_u8(b'$');
            push_decimal(out, concat_len(parts) as i64);
            out.put_slice(b"\r\n");
            push_concat(out, parts);
            out.put_slice(b"\r\n");
        }
        Arg::Null => out.put_slice(b"$-1\r\n"),
    }
}

fn concat_len(parts: &[Arg<'_>]) -> usize {
    parts
        .iter()
        .map(|part| match part {
            Arg::Text(text) => text.len(),
            Arg::Bytes(data) => data.len(),
            Arg::Int(value) | Arg::IntFrame(value) => decimal(*value, &mut [0u8; 20]).len(),
            Arg::Concat(nested) => concat_len(nested),
            Arg::Null => 0,
        })
        .sum()
}

fn push_concat(out: &mut BytesMut, parts: &[Arg<'_>]) {
    for part in parts {
        match part {
            Arg::Text(text) => out.put_slice(text.as_bytes()),
            Arg::Bytes(data) => out.put_slice(data),
            Arg::Int(value) | Arg::IntFrame(value) => push_decimal(out, *value),
            Arg::Concat(nested) => push_concat(out, nested),
            Arg::Null => {}
        }
    }
}

fn push_bulk(out: &mut BytesMut, data: &[u8]) {
    out.put_u8(b'$');
    push_decimal(out, data.len() as i64);
    out.put_slice(b"\r\n");
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

fn push_decimal(out: &mut BytesMut, value: i64) {
    let mut digits = [0u8; 20];
    out.put_slice(decimal(value, &mut digits));
}

fn decimal(value: i64, buf: &mut [u8; 20]) -> &[u8] {
    // Write digits into a small stack buffer to avoid heap allocations.
    // i64::MIN needs all 20 bytes including the sign.
    let mut magnitude = value.unsigned_abs();
    let mut idx = buf.len();
    loop {
        idx -= 1;
        buf[idx] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }
    if value < 0 {
        idx -= 1;
        buf[idx] = b'-';
    }
    &buf[idx..]
}

/// Reads one RESP value from the buffered reader.
///
/// Arrays nested deeper than [`MAX_DEPTH`] fail with
/// `ProtocolError::NestingTooDeep`.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<Value> {
    read_value(reader, line_buf, 0)
}

fn read_value<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>, depth: usize) -> ClientResult<Value> {
    read_line(reader, line_buf)?;
    decode_line(reader, line_buf, depth)
}

/// Reads one acknowledgement, skipping the payload of simple strings.
///
/// A `+...` frame is consumed without parsing and replaced by
/// [`ACK_SENTINEL`]. Any other frame goes through [`read_reply`], so error
/// replies still surface.
pub fn read_ack<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<Value> {
    let first = reader.fill_buf()?.first().copied();
    match first {
        None => Err(ClientError::ConnectionClosed),
        Some(b'+') => {
            skip_line(reader)?;
            Ok(Value::SimpleString(ACK_SENTINEL.to_string()))
        }
        Some(_) => read_reply(reader, line_buf),
    }
}

fn decode_line<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>, depth: usize) -> ClientResult<Value> {
    let marker = match line_buf.first() {
        Some(&marker) => marker,
        None => return Err(ProtocolError::InvalidType(b'\r').into()),
    };

    match marker {
        b'+' => {
            let text = std::str::from_utf8(&line_buf[1..]).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(Value::SimpleString(text.to_string()))
        }
        b'-' => {
            let message = String::from_utf8_lossy(&line_buf[1..]).into_owned();
            Err(ProtocolError::ErrorReply(message).into())
        }
        b':' => Ok(Value::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            read_bulk(reader, len)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            read_array(reader, len, line_buf, depth)
        }
        other => Err(ProtocolError::InvalidType(other).into()),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> ClientResult<Value> {
    if len == -1 {
        return Ok(Value::BulkString(None));
    }
    if !(0..=MAX_BULK_LEN).contains(&len) {
        return Err(ProtocolError::InvalidLength(len).into());
    }

    let mut data = vec![0u8; len as usize];
    read_exact(reader, &mut data)?;

    let mut crlf = [0u8; 2];
    read_exact(reader, &mut crlf)?;
    if crlf != *b"\r\n" {
        return Err(ProtocolError::MissingCrlf.into());
    }

    Ok(Value::BulkString(Some(Bytes::from(data))))
}

fn read_array<R: BufRead>(reader: &mut R, len: i64, line_buf: &mut Vec<u8>, depth: usize) -> ClientResult<Value> {
    if depth >= MAX_DEPTH {
        return Err(ProtocolError::NestingTooDeep(depth).into());
    }
    if len == -1 {
        return Ok(Value::Array(None));
    }
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len).into());
    }

    let len = len as usize;
    let mut items = Vec::with_capacity(len.min(MAX_PREALLOC_ITEMS));
    let mut first_error = None;
    for _ in 0..len {
        match read_value(reader, line_buf, depth + 1) {
            Ok(item) => items.push(item),
            // Keep consuming so the stream stays aligned on the next frame.
            Err(ClientError::Protocol(ProtocolError::ErrorReply(message))) => {
                first_error.get_or_insert(message);
            }
            Err(err) => return Err(err),
        }
    }

    match first_error {
        Some(message) => Err(ProtocolError::ErrorReply(message).into()),
        None => Ok(Value::Array(Some(items))),
    }
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 || buf.last() != Some(&b'\n') {
        return Err(ClientError::ConnectionClosed);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ProtocolError::MissingCrlf.into());
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn skip_line<R: BufRead>(reader: &mut R) -> ClientResult<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Err(ClientError::ConnectionClosed);
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

fn read_exact<R: BufRead>(reader: &mut R, buf: &mut [u8]) -> ClientResult<()> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => ClientError::ConnectionClosed,
        _ => ClientError::Io(err),
    })
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidInteger(String::from_utf8_lossy(data).into_owned()).into())
}
