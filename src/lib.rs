//! A nonblocking PostgreSQL client driven by a readiness-based event loop.
//!
//! # Features
//!
//! - **One socket, one request in flight**: requests queue in FIFO order and
//!   complete in that order
//! - **Bring your own loop**: the [`EventLoop`] trait covers registration and a
//!   retry timer; [`reactor::ReactorHandle`] is a ready-made one
//! - **Reconnects**: a lost session is re-established on a fixed interval
//!   without losing queued requests
//! - **Sans-I/O protocol layer**: handshake and result collection are state
//!   machines over plain buffers
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use zero_postgres_evented::{Connection, Token, WireConnector};
//! use zero_postgres_evented::reactor::ReactorHandle;
//!
//! fn main() -> std::io::Result<()> {
//!     let reactor = ReactorHandle::new()?;
//!     let mut conn = Connection::connect(
//!         "postgres://postgres@localhost/postgres",
//!         reactor.clone(),
//!         Token(0),
//!         WireConnector,
//!         |ready| println!("connect: {:?}", ready.map(|s| s.backend_pid)),
//!     );
//!     conn.query("SELECT 1::int8", |rows| println!("{:?}", rows));
//!
//!     while !conn.is_closed() {
//!         for (_token, event) in reactor.poll(Some(Duration::from_millis(100)))? {
//!             conn.handle(event);
//!         }
//!         if conn.queue_len() == 0 && !conn.has_in_flight() {
//!             conn.disconnect();
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod buffer_set;
pub mod client;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod opts;
pub mod protocol;
pub mod reactor;
pub mod request;
pub mod state;
pub mod value;

pub use client::{
    Client, ColumnInfo, Connector, FlushStatus, PgResult, PollingStatus, ResultStatus,
    SessionInfo, WireClient, WireConnector,
};
pub use connection::{Connection, State};
pub use error::{Error, ErrorKind, Result};
pub use event_loop::{Event, EventLoop, Interest, Token};
pub use opts::{Opts, SslMode};
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use request::{Params, Pending, RequestFlags, RequestKind, Response, pending};
pub use value::{ResultSet, Row, Value};
