//! # Connection and Mode State Machine
//!
//! Purpose: Own one transport and run commands over it in one of three modes:
//! immediate round trips, deferred pipelines, or MULTI/EXEC transactions.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: `Mode` is a single enum; scopes enter and exit
//!    it through one transition function that rejects overlap.
//! 2. **Scope Handles**: Commands inside a scope go through `Pipeline` or
//!    `Transaction`, whose `send` returns `()`. Per-command replies do not exist
//!    until the scope closes.
//! 3. **Buffer Reuse**: Encoding and line parsing reuse per-connection buffers.
//! 4. **Fail Closed**: Any failure that can leave unread bytes on the wire marks
//!    the connection broken; later use reports a usage error.
//!
//! ## Flush Discipline
//! ```text
//! Normal       encode -> flush -> read reply
//! Pipeline     encode ............................ close: flush once -> read N replies
//! Transaction  MULTI -> (encode -> flush -> read ack)* -> EXEC -> read array
//! ```

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::command::Command;
use crate::error::{ClientError, ClientResult, UsageError};
use crate::resp::{self, Value};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Blocking bidirectional byte stream a connection runs over.
pub trait Transport: Read + Write {
    /// Closes the stream. The default only flushes pending writes.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Transport for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Command mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Each command is flushed and answered immediately.
    Normal,
    /// Commands are buffered until the scope closes.
    Pipeline,
    /// Commands are acknowledged one by one and committed with EXEC.
    Transaction,
}

/// Single connection with reusable buffers.
pub struct Connection<T> {
    id: u64,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<T>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
    mode: Mode,
    queued: usize,
    broken: bool,
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("queued", &self.queued)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<T: Transport> Connection<T> {
    /// Wraps a transport. Every connection gets a process-unique id.
    pub fn new(transport: T) -> Self {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            reader: BufReader::new(transport),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
            mode: Mode::Normal,
            queued: 0,
            broken: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Replies owed by the server for the open scope.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// True once a failed exchange left the stream in an unknown state.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Borrows the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.reader.get_ref()
    }

    /// Sends one command and waits for its reply.
    ///
    /// Accepts inline text (`"PING"`) or an argument list (`["GET", "k"]`).
    pub fn send<'a>(&mut self, command: impl Into<Command<'a>>) -> ClientResult<Value> {
        let command = command.into();
        self.ensure_usable()?;
        self.ensure_normal()?;
        let result = self.round_trip(&command);
        self.settle(result)
    }

    /// Runs `body` as a pipeline and returns every reply in send order.
    ///
    /// Commands are buffered and flushed once when `body` returns. If `body`
    /// fails, the buffered commands are dropped unsent and its error is
    /// returned.
    pub fn pipeline<F, E>(&mut self, body: F) -> Result<Vec<Value>, E>
    where
        F: FnOnce(&mut Pipeline<'_, T>) -> Result<(), E>,
        E: From<ClientError>,
    {
        self.ensure_usable()?;
        self.enter(Mode::Pipeline)?;

        if let Err(err) = body(&mut Pipeline { conn: &mut *self }) {
            self.write_buf.clear();
            self.exit();
            return Err(err);
        }

        Ok(self.close_pipeline()?)
    }

    /// Runs `body` inside MULTI/EXEC and returns the EXEC reply.
    ///
    /// The reply is an array with one entry per queued command, or the null
    /// array when the server discarded the transaction. If `body` fails on a
    /// healthy connection, DISCARD is sent and the body's error is returned.
    pub fn transaction<F, E>(&mut self, body: F) -> Result<Value, E>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> Result<(), E>,
        E: From<ClientError>,
    {
        self.send(["MULTI"])?;
        self.enter(Mode::Transaction)?;

        if let Err(err) = body(&mut Transaction { conn: &mut *self }) {
            if !self.broken {
                self.exit();
                if let Err(discard_err) = self.send(["DISCARD"]) {
                    debug!(conn = self.id, error = %discard_err, "discard after failed transaction body failed");
                }
            }
            return Err(err);
        }

        let queued = self.queued;
        self.exit();
        trace!(conn = self.id, queued, "committing transaction");
        Ok(self.send(["EXEC"])?)
    }

    /// Closes the transport. Unflushed pipeline data is discarded.
    pub fn close(self) -> ClientResult<()> {
        trace!(conn = self.id, "closing connection");
        let mut transport = self.reader.into_inner();
        transport.close()?;
        Ok(())
    }

    pub(crate) fn enter(&mut self, mode: Mode) -> ClientResult<()> {
        if self.mode != Mode::Normal {
            return Err(UsageError::ScopeActive { active: self.mode }.into());
        }
        trace!(conn = self.id, ?mode, "entering scope");
        self.mode = mode;
        self.queued = 0;
        Ok(())
    }

    fn exit(&mut self) {
        trace!(conn = self.id, mode = ?self.mode, "leaving scope");
        self.mode = Mode::Normal;
        self.queued = 0;
    }

    fn close_pipeline(&mut self) -> ClientResult<Vec<Value>> {
        let queued = self.queued;
        if queued > 0 {
            trace!(conn = self.id, queued, "flushing pipeline");
            let flushed = self.flush();
            if let Err(err) = self.settle(flushed) {
                self.exit();
                return Err(err);
            }
        }
        self.exit();

        let mut replies = Vec::with_capacity(queued);
        for idx in 0..queued {
            match self.receive() {
                Ok(value) => replies.push(value),
                Err(err) => {
                    // Replies after this one are still on the wire.
                    if idx + 1 < queued || !err.keeps_stream_aligned() {
                        self.mark_broken(&err);
                    }
                    return Err(err);
                }
            }
        }
        Ok(replies)
    }

    fn round_trip(&mut self, command: &Command<'_>) -> ClientResult<Value> {
        self.write_command(command)?;
        self.flush()?;
        self.receive()
    }

    fn write_command(&mut self, command: &Command<'_>) -> ClientResult<()> {
        resp::encode(command, &mut self.write_buf)
    }

    fn flush(&mut self) -> ClientResult<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        self.write_buf.clear();
        Ok(())
    }

    fn receive(&mut self) -> ClientResult<Value> {
        resp::read_reply(&mut self.reader, &mut self.line_buf)
    }

    fn receive_ack(&mut self) -> ClientResult<Value> {
        resp::read_ack(&mut self.reader, &mut self.line_buf)
    }

    fn ensure_usable(&self) -> ClientResult<()> {
        if self.broken {
            return Err(UsageError::Broken { id: self.id }.into());
        }
        Ok(())
    }

    fn ensure_normal(&self) -> ClientResult<()> {
        if self.mode != Mode::Normal {
            return Err(UsageError::ScopeActive { active: self.mode }.into());
        }
        Ok(())
    }

    /// Marks the connection broken when `result` failed in a way that can
    /// leave the stream misaligned.
    fn settle<R>(&mut self, result: ClientResult<R>) -> ClientResult<R> {
        if let Err(err) = &result {
            let aligned = match err {
                ClientError::Usage(_) => true,
                _ => self.mode == Mode::Normal && err.keeps_stream_aligned(),
            };
            if !aligned {
                self.mark_broken(err);
            }
        }
        result
    }

    fn mark_broken(&mut self, err: &ClientError) {
        debug!(conn = self.id, mode = ?self.mode, error = %err, "connection marked broken");
        self.broken = true;
    }
}

/// Handle for queuing commands inside [`Connection::pipeline`].
pub struct Pipeline<'c, T> {
    conn: &'c mut Connection<T>,
}

impl<T: Transport> Pipeline<'_, T> {
    /// Buffers a command. Nothing is written until the scope closes.
    pub fn send<'a>(&mut self, command: impl Into<Command<'a>>) -> ClientResult<()> {
        self.conn.ensure_usable()?;
        self.conn.write_command(&command.into())?;
        self.conn.queued += 1;
        Ok(())
    }

    /// Commands buffered so far.
    pub fn queued(&self) -> usize {
        self.conn.queued
    }
}

/// Handle for queuing commands inside [`Connection::transaction`].
pub struct Transaction<'c, T> {
    conn: &'c mut Connection<T>,
}

impl<T: Transport> Transaction<'_, T> {
    /// Sends a command and consumes the server's acknowledgement.
    ///
    /// The acknowledgement payload is skipped, not parsed; error replies
    /// still fail the call and break the connection. Once broken, every
    /// later send fails with `UsageError::Broken`.
    pub fn send<'a>(&mut self, command: impl Into<Command<'a>>) -> ClientResult<()> {
        let command = command.into();
        let conn = &mut *self.conn;
        conn.ensure_usable()?;
        let result = conn
            .write_command(&command)
            .and_then(|()| conn.flush())
            .and_then(|()| conn.receive_ack());
        conn.settle(result)?;
        conn.queued += 1;
        Ok(())
    }

    /// Commands acknowledged so far.
    pub fn queued(&self) -> usize {
        self.conn.queued
    }
}
