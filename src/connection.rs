//! One server connection driven by readiness events.
//!
//! A [`Connection`] owns a [`Client`] handle, a duplicate of its socket and a
//! FIFO of [`Request`]s. The host routes every [`Event`] for the connection's
//! [`Token`] to [`Connection::handle`]; the connection reacts by advancing the
//! handshake, sending the next request or collecting a result, and updates its
//! registration with the [`EventLoop`] accordingly.
//!
//! Exactly one request is on the wire at a time. Completion handlers run in
//! enqueue order, from inside `handle`, and must not call back into the same
//! connection.
//!
//! Lifecycle:
//!
//! ```text
//! New ──connect──▶ Connecting ──ok──▶ Connected ◀──ok── Resetting
//!                     │   ▲               │                ▲   │
//!        first attempt│   │timer      lost│           timer│   │failed
//!          fails: done│   │               ▼                │   ▼
//!                     │  BadConnection ◀──┘            BadReset
//!                     ▼
//!                  Closing ──deregistered──▶ New
//! ```

use std::borrow::Cow;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::client::{Client, Connector, FlushStatus, PgResult, PollingStatus, SessionInfo};
use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::{Event, EventLoop, Interest, Token};
use crate::protocol::types::{FormatCode, Oid};
use crate::request::{
    Completion, Params, Request, RequestFlags, RequestKind, Response, SqlText,
};
use crate::value::ResultSet;

/// Longest connection string kept; longer input is cut.
pub const MAX_CONNINFO_LENGTH: usize = 1048;

/// Delay before a lost connection is retried.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing open
    New,
    /// Fresh handshake in progress
    Connecting,
    /// Reset handshake in progress on the existing client handle
    Resetting,
    Connected,
    /// Waiting for the retry timer to start a fresh handshake
    BadConnection,
    /// Waiting for the retry timer to start a reset handshake
    BadReset,
    /// Waiting for the event loop to acknowledge a deregistration
    Closing,
}

/// What to do once a deregistration is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterClose {
    Release,
    Connect,
    Reset,
}

type ConnectCallback = Box<dyn FnOnce(Result<SessionInfo>)>;

/// A nonblocking connection to one PostgreSQL server.
pub struct Connection<C: Connector, L: EventLoop> {
    conninfo: SqlText,
    connector: C,
    event_loop: L,
    token: Token,
    state: State,
    client: Option<C::Client>,
    /// Duplicate of the client's socket; this is what the event loop watches
    fd: Option<OwnedFd>,
    registered: bool,
    interest: Interest,
    in_flight: Option<Request>,
    queue: VecDeque<Request>,
    error_kind: ErrorKind,
    error_message: String,
    reconnect_interval: Duration,
    timer_armed: bool,
    on_connect: Option<ConnectCallback>,
    ever_connected: bool,
    /// No further requests are accepted
    closed: bool,
    disconnected: bool,
    after_close: Option<AfterClose>,
}

impl<C: Connector, L: EventLoop> Connection<C, L> {
    /// Start connecting to `conninfo`.
    ///
    /// `on_connect` is called exactly once: with the session details when the
    /// first handshake succeeds, or with the error when it fails. A failure to
    /// even start (bad connection string, unresolvable host, event loop
    /// refusing the socket) is reported before this returns. The first attempt
    /// is never retried.
    pub fn connect(
        conninfo: &str,
        event_loop: L,
        token: Token,
        connector: C,
        on_connect: impl FnOnce(Result<SessionInfo>) + 'static,
    ) -> Self {
        let mut conn = Self {
            conninfo: SqlText::new(Cow::Owned(conninfo.to_owned()), false, MAX_CONNINFO_LENGTH),
            connector,
            event_loop,
            token,
            state: State::New,
            client: None,
            fd: None,
            registered: false,
            interest: Interest::NONE,
            in_flight: None,
            queue: VecDeque::new(),
            error_kind: ErrorKind::None,
            error_message: String::new(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            timer_armed: false,
            on_connect: Some(Box::new(on_connect)),
            ever_connected: false,
            closed: false,
            disconnected: false,
            after_close: None,
        };
        conn.start_connection();
        conn
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Kind of the most recent error.
    pub fn error(&self) -> ErrorKind {
        self.error_kind
    }

    /// Message of the most recent error, empty if none.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Requests waiting to be sent, not counting the one in flight.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Readiness currently requested from the event loop.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Session details while connected.
    pub fn session_info(&self) -> Option<SessionInfo> {
        match (self.state, &self.client) {
            (State::Connected, Some(client)) => Some(client.session_info()),
            _ => None,
        }
    }

    /// The client handle, e.g. to read notifications from a `WireClient`.
    pub fn client_mut(&mut self) -> Option<&mut C::Client> {
        self.client.as_mut()
    }

    /// Delay between a connection loss and the next attempt. Applies to the
    /// next timer armed.
    pub fn set_reconnect_interval(&mut self, interval: Duration) {
        self.reconnect_interval = interval;
    }

    // === Requests ===

    /// Run `sql` with no parameters.
    pub fn query(
        &mut self,
        sql: impl Into<Cow<'static, str>>,
        on_done: impl FnOnce(Result<ResultSet>) + 'static,
    ) {
        self.query_params(sql, &[], &[], &[], on_done);
    }

    /// Run `sql` with bind parameters. `values` entries of `None` are NULL.
    pub fn query_params(
        &mut self,
        sql: impl Into<Cow<'static, str>>,
        types: &[Oid],
        values: &[Option<Arc<[u8]>>],
        formats: &[FormatCode],
        on_done: impl FnOnce(Result<ResultSet>) + 'static,
    ) {
        let params = Params::new(types, values, formats);
        self.enqueue(
            RequestKind::Query,
            Some(sql.into()),
            None,
            &params,
            RequestFlags::NON_VOLATILE_QUERY_STRING,
            Box::new(move |response| on_done(decode(response))),
        );
    }

    /// Create the named statement `name`.
    pub fn prepare(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        sql: impl Into<Cow<'static, str>>,
        param_types: &[Oid],
        on_done: impl FnOnce(Result<()>) + 'static,
    ) {
        let params = Params::new(param_types, &[], &[]);
        self.enqueue(
            RequestKind::Prepare,
            Some(sql.into()),
            Some(name.into()),
            &params,
            RequestFlags::NON_VOLATILE_QUERY_STRING | RequestFlags::NON_VOLATILE_NAME_STRING,
            Box::new(move |response| on_done(response.into_result().map(drop))),
        );
    }

    /// Execute the named statement `name`.
    pub fn execute_prepared(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        values: &[Option<Arc<[u8]>>],
        formats: &[FormatCode],
        on_done: impl FnOnce(Result<ResultSet>) + 'static,
    ) {
        let params = Params::new(&[], values, formats);
        self.enqueue(
            RequestKind::ExecutePrepared,
            None,
            Some(name.into()),
            &params,
            RequestFlags::NON_VOLATILE_NAME_STRING,
            Box::new(move |response| on_done(decode(response))),
        );
    }

    /// Append a request to the queue.
    ///
    /// Text is copied and capped unless `flags` marks it non-volatile. The
    /// parameter arrays are always copied; value bytes are shared. On a
    /// closed connection the completion runs immediately with a
    /// `BadConnection` error.
    pub fn enqueue(
        &mut self,
        kind: RequestKind,
        query: Option<Cow<'static, str>>,
        name: Option<Cow<'static, str>>,
        params: &Params,
        flags: RequestFlags,
        completion: Completion,
    ) {
        let request = Request::new(kind, query, name, params, flags, completion);
        if self.closed {
            request.complete(Response::failed(
                Error::BadConnection("connection is closed".into()),
                None,
            ));
            return;
        }
        self.queue.push_back(request);
        trace!(queued = self.queue.len(), "request queued");
        if self.state == State::Connected && self.in_flight.is_none() {
            self.set_interest(self.interest | Interest::WRITABLE);
        }
    }

    /// Close the connection. Queued and in-flight requests are dropped
    /// without running their completions, and so is a pending connect
    /// notification. Safe to call in any state, any number of times.
    ///
    /// Resources are released once the event loop acknowledges the
    /// deregistration, or immediately if nothing is registered.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        debug!(state = ?self.state, "disconnect");
        self.disconnected = true;
        self.closed = true;
        self.on_connect = None;
        self.stop_timer();
        if self.state == State::Closing {
            self.after_close = Some(AfterClose::Release);
        } else if self.registered {
            self.close_then(AfterClose::Release);
        } else {
            self.release();
        }
    }

    /// Drop the session and run a reset handshake on the same client handle.
    ///
    /// The in-flight request, if any, fails with `BadConnection`; queued
    /// requests are sent once the reset completes.
    pub fn reset(&mut self) -> Result<()> {
        if self.state != State::Connected {
            return Err(Error::InvalidUsage(format!(
                "cannot reset a connection in state {:?}",
                self.state
            )));
        }
        debug!("reset requested");
        self.fail_in_flight("connection reset");
        if self.registered {
            self.close_then(AfterClose::Reset);
        } else {
            self.begin_reset();
        }
        Ok(())
    }

    // === Events ===

    /// React to an event the event loop reported for this connection's token.
    pub fn handle(&mut self, event: Event) {
        trace!(state = ?self.state, ?event, "event");
        match event {
            Event::Ready(ready) => {
                let ready = ready & self.interest;
                if ready.is_empty() {
                    return;
                }
                match self.state {
                    State::Connecting | State::Resetting => self.advance_handshake(),
                    State::Connected => self.on_ready(ready),
                    _ => {}
                }
            }
            Event::Timer => self.on_timer(),
            Event::Deregistered => self.on_deregistered(),
        }
    }

    fn on_ready(&mut self, ready: Interest) {
        if ready.is_writable() {
            self.on_writable();
        }
        if ready.is_readable() && self.state == State::Connected {
            self.on_readable();
        }
    }

    fn on_writable(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let mut interest = self.interest | Interest::READABLE;
        match client.flush() {
            Err(e) => return self.lose_connection(e),
            Ok(FlushStatus::Pending) => interest = Interest::BOTH,
            Ok(FlushStatus::Done) => {
                interest = interest.remove(Interest::WRITABLE);
                if self.in_flight.is_none() && self.dispatch() {
                    let Some(client) = self.client.as_mut() else {
                        return;
                    };
                    match client.flush() {
                        Err(e) => return self.lose_connection(e),
                        Ok(FlushStatus::Pending) => interest = Interest::BOTH,
                        Ok(FlushStatus::Done) => {}
                    }
                }
                if self.state != State::Connected {
                    return;
                }
            }
        }
        self.set_interest(interest);
    }

    /// Send the queue head. Returns true if a request went in flight.
    fn dispatch(&mut self) -> bool {
        let Some(request) = self.queue.pop_front() else {
            return false;
        };
        let Some(client) = self.client.as_mut() else {
            self.queue.push_front(request);
            return false;
        };

        let query = request.query.as_ref().map_or("", SqlText::as_str);
        let name = request.name.as_ref().map_or("", SqlText::as_str);
        debug!(kind = ?request.kind, name, "dispatch");
        let sent = match request.kind {
            RequestKind::Query => client.send_query_params(query, &request.params),
            RequestKind::Prepare => client.send_prepare(name, query, &request.params.types),
            RequestKind::ExecutePrepared => client.send_query_prepared(name, &request.params),
        };

        match sent {
            Ok(()) => {
                self.in_flight = Some(request);
                true
            }
            Err(e) => {
                let message = format!("could not send request: {}", e);
                request.complete(Response::failed(Error::BadConnection(message.clone()), None));
                self.lose_connection(Error::BadConnection(message));
                false
            }
        }
    }

    fn on_readable(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if let Err(e) = client.consume_input() {
            return self.lose_connection(e);
        }
        if client.is_busy() {
            return;
        }
        let Some(result) = client.get_result() else {
            return;
        };
        let extra = client.get_result();

        match self.in_flight.take() {
            Some(request) => {
                let response = self.classify(result);
                request.complete(response);
            }
            None => warn!(
                status = ?result.status(),
                message = %result.error_message(),
                "dropping result with no request in flight"
            ),
        }

        if let Some(extra) = extra {
            warn!(status = ?extra.status(), "unexpected extra result; reconnecting");
            return self.lose_connection(Error::Protocol(
                "server sent more than one result for a request".into(),
            ));
        }

        if !self.queue.is_empty() {
            self.set_interest(self.interest | Interest::WRITABLE);
        }
    }

    fn classify(&mut self, result: PgResult) -> Response {
        if result.status().is_success() {
            return Response::ok(result);
        }
        let mut message = result.error_message();
        if message.is_empty() {
            message = format!("request failed with status {:?}", result.status());
        }
        self.set_error(ErrorKind::BadQuery, &message);
        Response::failed(Error::BadQuery(message), Some(result))
    }

    fn on_timer(&mut self) {
        if !self.timer_armed {
            return;
        }
        self.timer_armed = false;
        debug!(state = ?self.state, "retry timer fired");
        match self.state {
            State::BadReset if self.registered => self.close_then(AfterClose::Reset),
            State::BadReset => self.begin_reset(),
            State::BadConnection if self.registered => self.close_then(AfterClose::Connect),
            State::BadConnection => {
                self.client = None;
                self.start_connection();
            }
            _ => {}
        }
    }

    fn on_deregistered(&mut self) {
        self.registered = false;
        if self.state != State::Closing {
            return;
        }
        self.fd = None;
        match self.after_close.take() {
            Some(AfterClose::Connect) => {
                self.client = None;
                self.start_connection();
            }
            Some(AfterClose::Reset) => self.begin_reset(),
            Some(AfterClose::Release) | None => self.release(),
        }
    }

    // === Handshakes ===

    fn start_connection(&mut self) {
        debug_assert!(!self.registered);
        self.fd = None;
        self.client = None;
        let client = match self.connector.connect_start(self.conninfo.as_str()) {
            Ok(client) => client,
            Err(e) => return self.handshake_failed(to_bad_connection(e)),
        };
        let fd = match client.socket() {
            Some(socket) => socket.try_clone_to_owned(),
            None => return self.handshake_failed(bad_connection("client has no socket")),
        };
        self.client = Some(client);
        match fd {
            Ok(fd) => self.watch(fd, State::Connecting),
            Err(e) => self.handshake_failed(bad_connection(&format!(
                "could not duplicate socket: {}",
                e
            ))),
        }
    }

    fn begin_reset(&mut self) {
        debug_assert!(!self.registered);
        self.fd = None;
        self.state = State::Resetting;
        let Some(client) = self.client.as_mut() else {
            return self.start_connection();
        };
        if let Err(e) = client.reset_start() {
            return self.handshake_failed(to_bad_connection(e));
        }
        let fd = match client.socket() {
            Some(socket) => socket.try_clone_to_owned(),
            None => return self.handshake_failed(bad_connection("client has no socket")),
        };
        match fd {
            Ok(fd) => self.watch(fd, State::Resetting),
            Err(e) => self.handshake_failed(bad_connection(&format!(
                "could not duplicate socket: {}",
                e
            ))),
        }
    }

    /// Register `fd` for write readiness and enter `state`.
    fn watch(&mut self, fd: OwnedFd, state: State) {
        self.state = state;
        if let Err(e) = self
            .event_loop
            .register(self.token, fd.as_raw_fd(), Interest::WRITABLE)
        {
            return self.handshake_failed(bad_connection(&format!(
                "could not register socket with the event loop: {}",
                e
            )));
        }
        debug!(?state, fd = fd.as_raw_fd(), "handshake started");
        self.fd = Some(fd);
        self.registered = true;
        self.interest = Interest::WRITABLE;
    }

    fn advance_handshake(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let status = if self.state == State::Resetting {
            client.reset_poll()
        } else {
            client.connect_poll()
        };
        trace!(?status, "handshake step");
        match status {
            PollingStatus::Reading => self.set_interest(Interest::READABLE),
            PollingStatus::Writing => self.set_interest(Interest::WRITABLE),
            PollingStatus::Ok => {
                let session = client.session_info();
                debug!(backend_pid = session.backend_pid, "connected");
                self.state = State::Connected;
                self.ever_connected = true;
                self.set_interest(Interest::BOTH);
                if let Some(on_connect) = self.on_connect.take() {
                    on_connect(Ok(session));
                }
            }
            PollingStatus::Failed => {
                let message = client.error_message();
                self.handshake_failed(bad_connection(&message));
            }
        }
    }

    /// A handshake could not start or did not finish.
    fn handshake_failed(&mut self, error: Error) {
        let message = error.to_string();
        self.set_error(ErrorKind::BadConnection, &message);
        debug!(state = ?self.state, %message, "handshake failed");

        if !self.ever_connected {
            self.closed = true;
            if let Some(on_connect) = self.on_connect.take() {
                on_connect(Err(error));
            }
            for request in self.queue.drain(..) {
                request.complete(Response::failed(
                    Error::BadConnection(message.clone()),
                    None,
                ));
            }
            if self.registered {
                self.close_then(AfterClose::Release);
            } else {
                self.release();
            }
            return;
        }

        self.state = if self.state == State::Resetting {
            State::BadReset
        } else {
            State::BadConnection
        };
        self.quiesce();
        self.arm_timer();
    }

    /// The session broke while connected.
    fn lose_connection(&mut self, error: Error) {
        let message = match &error {
            Error::BadConnection(message) => message.clone(),
            other => other.to_string(),
        };
        warn!(%message, "connection lost");
        self.set_error(ErrorKind::BadConnection, &message);
        self.fail_in_flight(&message);
        self.state = State::BadConnection;
        self.quiesce();
        self.arm_timer();
    }

    fn fail_in_flight(&mut self, message: &str) {
        if let Some(request) = self.in_flight.take() {
            request.complete(Response::failed(
                Error::BadConnection(message.to_string()),
                None,
            ));
        }
    }

    // === Event loop bookkeeping ===

    fn set_interest(&mut self, interest: Interest) {
        if !self.registered || interest == self.interest {
            return;
        }
        match self.event_loop.reregister(self.token, interest) {
            Ok(()) => self.interest = interest,
            Err(e) => {
                let error = bad_connection(&format!("could not update event loop interest: {}", e));
                if self.state == State::Connected {
                    self.lose_connection(error);
                } else {
                    self.handshake_failed(error);
                }
            }
        }
    }

    /// Stop reporting readiness but keep the registration.
    fn quiesce(&mut self) {
        if self.registered && !self.interest.is_empty() {
            if let Err(e) = self.event_loop.reregister(self.token, Interest::NONE) {
                warn!("could not clear event loop interest: {}", e);
            }
        }
        self.interest = Interest::NONE;
    }

    fn close_then(&mut self, next: AfterClose) {
        self.state = State::Closing;
        self.after_close = Some(next);
        self.interest = Interest::NONE;
        if let Err(e) = self.event_loop.deregister(self.token) {
            // Nothing will acknowledge; carry on as if it had.
            warn!("could not deregister socket: {}", e);
            self.on_deregistered();
        }
    }

    fn arm_timer(&mut self) {
        match self
            .event_loop
            .start_timer(self.token, self.reconnect_interval)
        {
            Ok(()) => self.timer_armed = true,
            Err(e) => {
                warn!("could not arm retry timer: {}", e);
                self.set_error(
                    ErrorKind::BadConnection,
                    &format!("could not arm retry timer: {}", e),
                );
                self.closed = true;
                let message = self.error_message.clone();
                for request in self.queue.drain(..) {
                    request.complete(Response::failed(
                        Error::BadConnection(message.clone()),
                        None,
                    ));
                }
                if self.registered {
                    self.close_then(AfterClose::Release);
                } else {
                    self.release();
                }
            }
        }
    }

    fn stop_timer(&mut self) {
        if self.timer_armed {
            self.event_loop.stop_timer(self.token);
            self.timer_armed = false;
        }
    }

    fn release(&mut self) {
        debug!("released");
        self.fd = None;
        self.client = None;
        self.in_flight = None;
        self.queue.clear();
        self.interest = Interest::NONE;
        self.after_close = None;
        self.state = State::New;
    }

    fn set_error(&mut self, kind: ErrorKind, message: &str) {
        self.error_kind = kind;
        self.error_message.clear();
        self.error_message.push_str(message);
    }
}

impl<C: Connector, L: EventLoop> Drop for Connection<C, L> {
    fn drop(&mut self) {
        self.stop_timer();
        if self.registered {
            let _ = self.event_loop.deregister(self.token);
        }
    }
}

impl<C: Connector, L: EventLoop> std::fmt::Debug for Connection<C, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("state", &self.state)
            .field("interest", &self.interest)
            .field("in_flight", &self.in_flight.is_some())
            .field("queued", &self.queue.len())
            .field("error", &self.error_kind)
            .finish_non_exhaustive()
    }
}

fn bad_connection(message: &str) -> Error {
    Error::BadConnection(message.to_string())
}

fn to_bad_connection(error: Error) -> Error {
    match error {
        Error::BadConnection(_) => error,
        other => Error::BadConnection(other.to_string()),
    }
}

fn decode(response: Response) -> Result<ResultSet> {
    let result = response.into_result()?;
    ResultSet::from_pg(&result)
}
