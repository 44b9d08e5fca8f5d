//! Nonblocking client handle.
//!
//! [`Client`] is the surface the [`Connection`](crate::Connection) drives. It
//! follows libpq's asynchronous API: a handshake advanced by repeated
//! `connect_poll` calls, `send_*` calls that only queue bytes, `flush` to push
//! them out, and `consume_input` / `is_busy` / `get_result` to collect the
//! answer. Nothing here ever blocks on the socket.
//!
//! [`WireConnector`] produces the real implementation over TCP or a Unix
//! socket; tests substitute scripted clients.

mod result;
mod socket;
mod wire;

use std::os::fd::BorrowedFd;

use crate::error::Result;
use crate::protocol::types::Oid;
use crate::request::Params;

pub use result::{ColumnInfo, PgResult, ResultStatus};
pub use wire::{MAX_PENDING_NOTIFICATIONS, Notification, WireClient, WireConnector};

/// Progress of a connect or reset handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Wait until the socket is readable, then poll again
    Reading,
    /// Wait until the socket is writable, then poll again
    Writing,
    /// The session is established
    Ok,
    /// The handshake failed; see [`Client::error_message`]
    Failed,
}

/// Outcome of [`Client::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// The output buffer is empty
    Done,
    /// Data remains; wait for write readiness and flush again
    Pending,
}

/// What the server told us about the session at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub backend_pid: u32,
    pub server_params: Vec<(String, String)>,
}

impl SessionInfo {
    /// Look up a server parameter such as `server_version`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A nonblocking PostgreSQL client handle.
pub trait Client {
    /// The socket the handshake or session currently runs on.
    fn socket(&self) -> Option<BorrowedFd<'_>>;

    /// Advance the connect handshake by one step.
    fn connect_poll(&mut self) -> PollingStatus;

    /// Close the socket and begin a new handshake with the same settings.
    fn reset_start(&mut self) -> Result<()>;

    /// Advance the reset handshake by one step.
    fn reset_poll(&mut self) -> PollingStatus;

    /// Queue Parse/Bind/Describe/Execute/Sync for an unnamed statement.
    fn send_query_params(&mut self, sql: &str, params: &Params) -> Result<()>;

    /// Queue Parse/Sync for a named statement.
    fn send_prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()>;

    /// Queue Bind/Describe/Execute/Sync for a named statement.
    fn send_query_prepared(&mut self, name: &str, params: &Params) -> Result<()>;

    /// Write as much queued output as the socket accepts.
    fn flush(&mut self) -> Result<FlushStatus>;

    /// Read whatever input is available and parse complete messages.
    fn consume_input(&mut self) -> Result<()>;

    /// True while a request cycle has not reached ReadyForQuery.
    fn is_busy(&self) -> bool;

    /// Next finished result, or `None` if there is nothing (more) to return.
    fn get_result(&mut self) -> Option<PgResult>;

    /// Description of the most recent failure, empty if none.
    fn error_message(&self) -> String;

    fn session_info(&self) -> SessionInfo;
}

/// Opens client handles.
pub trait Connector {
    type Client: Client;

    /// Begin connecting. Fails only when no handle could be produced at all,
    /// e.g. for an unparsable connection string or an unresolvable host.
    fn connect_start(&mut self, conninfo: &str) -> Result<Self::Client>;
}
