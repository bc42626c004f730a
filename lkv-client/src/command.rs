//! # Command Arguments
//!
//! Purpose: Describe an outgoing command as borrowed arguments so callers can
//! mix text, binary payloads and integers without copying them first.
//!
//! ## Design Principles
//! 1. **Borrow-Friendly API**: `Arg` borrows `&str`/`&[u8]` from the caller.
//! 2. **Conversion Traits**: `From` impls let `["SET", "k", "v"]` act as a command.
//! 3. **Explicit Absence**: `Arg::Null` encodes the null bulk string, never an
//!    empty one.

/// One element of a command vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg<'a> {
    /// UTF-8 text, framed as a bulk string.
    Text(&'a str),
    /// Raw bytes, framed as a bulk string.
    Bytes(&'a [u8]),
    /// Integer, framed as a bulk string of its decimal text.
    Int(i64),
    /// Integer, framed as a RESP integer (`:42\r\n`).
    IntFrame(i64),
    /// Pieces concatenated into a single bulk string with one combined length.
    Concat(Vec<Arg<'a>>),
    /// The null bulk string (`$-1\r\n`).
    Null,
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Text(value)
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(value: &'a String) -> Self {
        Arg::Text(value.as_str())
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Arg<'a> {
    fn from(value: &'a [u8; N]) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a> From<&'a Vec<u8>> for Arg<'a> {
    fn from(value: &'a Vec<u8>) -> Self {
        Arg::Bytes(value.as_slice())
    }
}

impl From<i64> for Arg<'_> {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl<'a, T: Into<Arg<'a>>> From<Option<T>> for Arg<'a> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Null, Into::into)
    }
}

/// A complete command: either an inline text line or a framed argument array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Sent as `text\r\n` with no framing.
    Inline(&'a str),
    /// Sent as an array of bulk strings.
    Args(Vec<Arg<'a>>),
}

impl<'a> Command<'a> {
    /// Builds a framed command from any argument convertibles.
    pub fn args<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Arg<'a>>,
    {
        Command::Args(args.into_iter().map(Into::into).collect())
    }

    /// Appends one argument, turning an inline command into a framed one.
    pub fn arg(self, arg: impl Into<Arg<'a>>) -> Self {
        let mut args = match self {
            Command::Args(args) => args,
            Command::Inline(text) => text.split_ascii_whitespace().map(Arg::Text).collect(),
        };
        args.push(arg.into());
        Command::Args(args)
    }
}

impl<'a> From<&'a str> for Command<'a> {
    fn from(value: &'a str) -> Self {
        Command::Inline(value)
    }
}

impl<'a, T: Into<Arg<'a>>, const N: usize> From<[T; N]> for Command<'a> {
    fn from(value: [T; N]) -> Self {
        Command::args(value)
    }
}

impl<'a, T: Into<Arg<'a>>> From<Vec<T>> for Command<'a> {
    fn from(value: Vec<T>) -> Self {
        Command::args(value)
    }
}

impl<'a, T> From<&'a [T]> for Command<'a>
where
    T: Copy + Into<Arg<'a>>,
{
    fn from(value: &'a [T]) -> Self {
        Command::args(value.iter().copied())
    }
}
