//! # LiteKV Sync Client
//!
//! Purpose: Provide a lightweight, synchronous RESP2 client with pipelining,
//! MULTI/EXEC transactions and connection pooling.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections to avoid repeated connects.
//! 2. **Explicit Modes**: Pipelines and transactions are closure scopes over a
//!    three-state connection mode, never loose flags.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Example
//! ```no_run
//! use lkv_client::{Client, ClientError, Value};
//!
//! # fn main() -> Result<(), ClientError> {
//! let client = Client::connect("127.0.0.1:6379")?;
//! assert_eq!(client.send("PING")?, Value::simple("PONG"));
//!
//! let replies = client.pipeline(|p| {
//!     p.send(["SET", "foo", "bar"])?;
//!     p.send(["GET", "foo"])
//! })?;
//! assert_eq!(replies.len(), 2);
//! # Ok(())
//! # }
//! ```

mod client;
mod command;
mod connection;
mod error;
mod pool;
mod resp;

pub use client::{Client, ClientConfig};
pub use command::{Arg, Command};
pub use connection::{Connection, Mode, Pipeline, Transaction, Transport};
pub use error::{ClientError, ClientResult, ProtocolError, UsageError};
pub use pool::{ConnectionFactory, Pool, PoolConfig, PooledConnection, TcpConnector};
pub use resp::{encode, encode_command, encode_inline, encode_value, read_ack, read_reply, Value, ACK_SENTINEL, MAX_DEPTH};
