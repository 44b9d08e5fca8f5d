//! [`Client`] over a real socket.

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd};

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::{ErrorResponse, RawMessage, msg_type};
use crate::protocol::codec::next_frame;
use crate::protocol::frontend::extended::MAX_PARAMS;
use crate::protocol::frontend::{
    write_bind, write_describe_portal, write_execute, write_parse, write_sync, write_terminate,
};
use crate::protocol::types::{Oid, TransactionStatus};
use crate::request::Params;
use crate::state::startup::handle_async_message;
use crate::state::{Action, AsyncMessage, ResponseStateMachine, StartupStateMachine};

use super::socket::{ReadStatus, Stream};
use super::{Client, Connector, FlushStatus, PgResult, PollingStatus, SessionInfo};

/// Notifications kept for [`WireClient::take_notification`]; the oldest are
/// dropped beyond this.
pub const MAX_PENDING_NOTIFICATIONS: usize = 1024;

/// A LISTEN/NOTIFY notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub pid: u32,
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// TCP/Unix connect in progress
    Connecting,
    /// Startup packet sent, authenticating
    Startup,
    Ready,
    Failed,
}

/// Opens [`WireClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireConnector;

impl Connector for WireConnector {
    type Client = WireClient;

    fn connect_start(&mut self, conninfo: &str) -> Result<WireClient> {
        WireClient::connect_start(Opts::try_from(conninfo)?)
    }
}

/// Nonblocking PostgreSQL client over TCP or a Unix socket.
///
/// LISTEN/NOTIFY notifications queue up until taken with
/// [`take_notification`](Self::take_notification), at most
/// [`MAX_PENDING_NOTIFICATIONS`] of them.
pub struct WireClient {
    opts: Opts,
    stream: Option<Stream>,
    phase: Phase,
    buffers: BufferSet,
    startup: Option<StartupStateMachine>,
    cycle: Option<ResponseStateMachine>,
    results: VecDeque<PgResult>,
    notifications: VecDeque<Notification>,
    session: SessionInfo,
    transaction_status: TransactionStatus,
    error: String,
    /// A FATAL/PANIC error the server sent; it explains a hang-up that follows
    fatal: Option<String>,
    /// Read failure held back until the data before it has been handed out
    deferred: Option<Error>,
}

impl WireClient {
    /// Begin connecting to the server described by `opts`.
    pub fn connect_start(opts: Opts) -> Result<Self> {
        let mut client = Self {
            opts,
            stream: None,
            phase: Phase::Failed,
            buffers: BufferSet::new(),
            startup: None,
            cycle: None,
            results: VecDeque::new(),
            notifications: VecDeque::new(),
            session: SessionInfo::default(),
            transaction_status: TransactionStatus::Idle,
            error: String::new(),
            fatal: None,
            deferred: None,
        };
        client.open()?;
        Ok(client)
    }

    fn open(&mut self) -> Result<()> {
        self.buffers.clear();
        self.cycle = None;
        self.results.clear();
        self.fatal = None;
        self.deferred = None;
        self.session = SessionInfo::default();
        let stream = Stream::connect_start(&self.opts).map_err(|e| {
            Error::BadConnection(format!(
                "could not connect to server at \"{}\" port {}: {}",
                self.opts.host, self.opts.port, e
            ))
        })?;
        tracing::debug!(host = %self.opts.host, port = self.opts.port, "connect started");
        self.stream = Some(stream);
        self.phase = Phase::Connecting;
        Ok(())
    }

    /// Transaction state reported by the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Take the oldest LISTEN/NOTIFY notification received so far.
    pub fn take_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    fn fail(&mut self, error: &Error) -> PollingStatus {
        tracing::debug!("handshake failed: {}", error);
        self.error = error.to_string();
        self.phase = Phase::Failed;
        self.stream = None;
        self.startup = None;
        PollingStatus::Failed
    }

    fn on_async_message(&mut self, msg: AsyncMessage) {
        match msg {
            AsyncMessage::Notice(fields) => tracing::warn!("server notice: {}", fields),
            AsyncMessage::Notification {
                pid,
                channel,
                payload,
            } => {
                if self.notifications.len() >= MAX_PENDING_NOTIFICATIONS {
                    if let Some(dropped) = self.notifications.pop_front() {
                        tracing::warn!(
                            channel = %dropped.channel,
                            "notification queue full; dropping the oldest"
                        );
                    }
                }
                self.notifications.push_back(Notification {
                    pid,
                    channel,
                    payload,
                });
            }
            AsyncMessage::ParameterChanged { name, value } => {
                match self.session.server_params.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 = value,
                    None => self.session.server_params.push((name, value)),
                }
            }
        }
    }

    fn stream(&mut self) -> Result<&mut Stream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::BadConnection("no connection to the server".into()))
    }

    fn fill_read_buffer(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::BadConnection("no connection to the server".into()))?;
        match stream.read_available(&mut self.buffers.read_buffer) {
            Ok(ReadStatus::WouldBlock) => Ok(()),
            Ok(ReadStatus::Eof) => Err(Error::BadConnection(
                "server closed the connection unexpectedly".into(),
            )),
            Err(e) => Err(Error::BadConnection(format!(
                "could not receive data from server: {}",
                e
            ))),
        }
    }

    /// A lost connection is best explained by the FATAL error preceding it.
    fn explain(&self, error: Error) -> Error {
        match (&self.fatal, error) {
            (Some(text), Error::BadConnection(_)) => Error::BadConnection(text.clone()),
            (_, error) => error,
        }
    }

    fn note_error_response(&mut self, payload: &[u8]) -> Result<()> {
        let error = ErrorResponse::parse(payload)?;
        if error.fields.is_fatal() {
            let text = error.fields.to_string();
            self.error.clone_from(&text);
            self.fatal = Some(text);
        }
        Ok(())
    }

    /// Input processing hit a dead end; the handle is unusable from here on.
    fn broken(&mut self, error: Error) -> Result<()> {
        self.error = message_of(&error);
        self.phase = Phase::Failed;
        Err(error)
    }

    fn poll_handshake(&mut self) -> Result<PollingStatus> {
        if self.phase == Phase::Connecting {
            if !self.stream()?.poll_connected()? {
                return Ok(PollingStatus::Writing);
            }
            let mut startup = StartupStateMachine::new(self.opts.clone());
            startup.start(&mut self.buffers.write_buffer)?;
            self.startup = Some(startup);
            self.phase = Phase::Startup;
        }

        if self.flush()? == FlushStatus::Pending {
            return Ok(PollingStatus::Writing);
        }

        // A closed socket still has to give up what was sent before the close,
        // typically the ErrorResponse explaining it.
        let read = self.fill_read_buffer();

        let mut offset = 0;
        let mut finished = false;
        while let Some(frame) = next_frame(&self.buffers.read_buffer[offset..])? {
            let startup = self
                .startup
                .as_mut()
                .ok_or_else(|| Error::Protocol("startup state machine missing".into()))?;
            let start = offset + frame.payload_start;
            let end = offset + frame.end;
            let msg = RawMessage::new(frame.type_byte, &self.buffers.read_buffer[start..end]);
            let action = startup.step(msg, &mut self.buffers.write_buffer)?;
            offset = end;
            match action {
                Action::ReadMessage | Action::Write => {}
                Action::HandleAsyncMessage(msg) => self.on_async_message(msg),
                Action::Finished => {
                    finished = true;
                    break;
                }
            }
        }
        self.buffers.consume_read(offset);

        if finished {
            if let Some(startup) = self.startup.take() {
                self.session.backend_pid = startup.backend_key().map_or(0, |k| k.process_id());
                self.session
                    .server_params
                    .extend(startup.server_params().iter().cloned());
                self.transaction_status = startup.transaction_status();
            }
            self.phase = Phase::Ready;
            tracing::debug!(pid = self.session.backend_pid, "session established");
            return Ok(PollingStatus::Ok);
        }

        read?;
        if self.flush()? == FlushStatus::Pending {
            Ok(PollingStatus::Writing)
        } else {
            Ok(PollingStatus::Reading)
        }
    }

    /// Refuse what the 16-bit counts and 32-bit lengths of Parse/Bind cannot encode.
    fn check_params(types: &[Oid], params: &Params) -> Result<()> {
        for (what, count) in [
            ("parameter types", types.len()),
            ("parameter values", params.values.len()),
            ("parameter formats", params.formats.len()),
        ] {
            if count > MAX_PARAMS {
                return Err(Error::InvalidUsage(format!(
                    "too many {}: {} (at most {})",
                    what, count, MAX_PARAMS
                )));
            }
        }
        let too_long = params
            .values
            .iter()
            .flatten()
            .any(|value| i32::try_from(value.len()).is_err());
        if too_long {
            return Err(Error::InvalidUsage(
                "parameter value longer than 2147483647 bytes".into(),
            ));
        }
        Ok(())
    }

    fn begin_cycle(&mut self, cycle: ResponseStateMachine) -> Result<()> {
        if self.phase != Phase::Ready {
            if self.error.is_empty() {
                return Err(Error::BadConnection("connection is not established".into()));
            }
            return Err(Error::BadConnection(self.error.clone()));
        }
        if self.cycle.is_some() || !self.results.is_empty() {
            return Err(Error::InvalidUsage(
                "another command is already in progress".into(),
            ));
        }
        self.cycle = Some(cycle);
        Ok(())
    }

    fn process_messages(&mut self) -> Result<()> {
        let mut offset = 0;
        while let Some(frame) = next_frame(&self.buffers.read_buffer[offset..])? {
            let start = offset + frame.payload_start;
            let end = offset + frame.end;
            if frame.type_byte == msg_type::ERROR_RESPONSE {
                let payload = self.buffers.read_buffer[start..end].to_vec();
                self.note_error_response(&payload)?;
            }
            let msg = RawMessage::new(frame.type_byte, &self.buffers.read_buffer[start..end]);

            let action = match self.cycle.as_mut() {
                Some(cycle) => {
                    let action = cycle.step(msg)?;
                    while let Some(result) = cycle.pop_result() {
                        self.results.push_back(result);
                    }
                    if cycle.is_finished() {
                        self.transaction_status = cycle.transaction_status();
                        self.cycle = None;
                    }
                    action
                }
                None if msg.type_byte == msg_type::ERROR_RESPONSE => {
                    // Typically a FATAL sent just before the server hangs up.
                    let error = ErrorResponse::parse(msg.payload)?;
                    self.results.push_back(PgResult::from_error(error.fields));
                    Action::ReadMessage
                }
                None if RawMessage::is_async_type(msg.type_byte) => handle_async_message(msg)?,
                None => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message '{}' with no command in progress",
                        frame.type_byte as char
                    )));
                }
            };
            offset = end;

            if let Action::HandleAsyncMessage(msg) = action {
                self.on_async_message(msg);
            }
        }
        self.buffers.consume_read(offset);
        Ok(())
    }
}

impl Client for WireClient {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        self.stream.as_ref().map(|s| s.as_fd())
    }

    fn connect_poll(&mut self) -> PollingStatus {
        match self.phase {
            Phase::Ready => PollingStatus::Ok,
            Phase::Failed => PollingStatus::Failed,
            Phase::Connecting | Phase::Startup => match self.poll_handshake() {
                Ok(status) => status,
                Err(e) => self.fail(&e),
            },
        }
    }

    fn reset_start(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            self.buffers.write_buffer.clear();
            self.buffers.write_pos = 0;
            write_terminate(&mut self.buffers.write_buffer);
            // Best effort; the socket is dropped right after.
            let _ = stream.write_available(&self.buffers.write_buffer);
        }
        self.stream = None;
        self.startup = None;
        self.error.clear();
        self.open().inspect_err(|e| {
            self.error = e.to_string();
            self.phase = Phase::Failed;
        })
    }

    fn reset_poll(&mut self) -> PollingStatus {
        self.connect_poll()
    }

    fn send_query_params(&mut self, sql: &str, params: &Params) -> Result<()> {
        Self::check_params(&params.types, params)?;
        self.begin_cycle(ResponseStateMachine::for_execute())?;
        let out = &mut self.buffers.write_buffer;
        write_parse(out, "", sql, &params.types);
        write_bind(out, "", &params.values, &params.formats);
        write_describe_portal(out, "");
        write_execute(out, "", 0);
        write_sync(out);
        Ok(())
    }

    fn send_prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()> {
        Self::check_params(param_types, &Params::default())?;
        self.begin_cycle(ResponseStateMachine::for_prepare())?;
        let out = &mut self.buffers.write_buffer;
        write_parse(out, name, sql, param_types);
        write_sync(out);
        Ok(())
    }

    fn send_query_prepared(&mut self, name: &str, params: &Params) -> Result<()> {
        Self::check_params(&[], params)?;
        self.begin_cycle(ResponseStateMachine::for_execute())?;
        let out = &mut self.buffers.write_buffer;
        write_bind(out, name, &params.values, &params.formats);
        write_describe_portal(out, "");
        write_execute(out, "", 0);
        write_sync(out);
        Ok(())
    }

    fn flush(&mut self) -> Result<FlushStatus> {
        if self.buffers.pending_write().is_empty() {
            return Ok(FlushStatus::Done);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::BadConnection("no connection to the server".into()))?;
        let written = stream
            .write_available(self.buffers.pending_write())
            .inspect_err(|e| self.error = e.to_string())?;
        self.buffers.advance_write(written);
        if self.buffers.pending_write().is_empty() {
            Ok(FlushStatus::Done)
        } else {
            Ok(FlushStatus::Pending)
        }
    }

    fn consume_input(&mut self) -> Result<()> {
        if let Some(e) = self.deferred.take() {
            return self.broken(e);
        }
        let before = self.buffers.read_buffer.len();
        let read = self.fill_read_buffer();
        let arrived = self.buffers.read_buffer.len() > before;
        if let Err(e) = self.process_messages() {
            return self.broken(e);
        }
        let Err(e) = read else {
            return Ok(());
        };
        let e = self.explain(e);

        // The cycle will never see its ReadyForQuery. Results it already
        // completed, such as the FATAL error explaining the hang-up, are
        // still handed out.
        let salvaged = self.cycle.is_some() && !self.results.is_empty();
        if salvaged {
            self.cycle = None;
        }
        if arrived || salvaged {
            tracing::debug!("connection lost after input; reporting it on the next call");
            self.error = message_of(&e);
            self.phase = Phase::Failed;
            self.deferred = Some(e);
            return Ok(());
        }
        self.broken(e)
    }

    fn is_busy(&self) -> bool {
        self.cycle.is_some()
    }

    fn get_result(&mut self) -> Option<PgResult> {
        if self.is_busy() {
            return None;
        }
        self.results.pop_front()
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }

    fn session_info(&self) -> SessionInfo {
        self.session.clone()
    }
}

fn message_of(error: &Error) -> String {
    match error {
        Error::BadConnection(message) => message.clone(),
        other => other.to_string(),
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        if self.phase != Phase::Ready {
            return;
        }
        if let Some(stream) = self.stream.as_mut() {
            let mut buf = Vec::new();
            write_terminate(&mut buf);
            let _ = stream.write_available(&buf);
        }
    }
}
