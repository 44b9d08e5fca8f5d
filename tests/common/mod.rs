//! Deterministic stand-ins for the event loop and the client library.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use zero_postgres_evented::protocol::types::oid;
use zero_postgres_evented::{
    Client, ColumnInfo, Connector, Error, Event, EventLoop, FlushStatus, FormatCode, Interest,
    Oid, Params, PgResult, PollingStatus, Result, SessionInfo, Token,
};

// === Event loop ===

#[derive(Debug, Default)]
pub struct LoopState {
    pub registrations: HashMap<Token, (RawFd, Interest)>,
    pub timers: HashMap<Token, Duration>,
    pub acks: Vec<Token>,
    pub register_calls: usize,
    pub deregister_calls: usize,
    pub fail_register: bool,
    pub fail_timer: bool,
}

/// Records what a connection asks for; the test decides which events happen.
#[derive(Debug, Clone, Default)]
pub struct FakeLoop(pub Rc<RefCell<LoopState>>);

impl FakeLoop {
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.0.borrow().registrations.get(&token).map(|(_, i)| *i)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.0.borrow().registrations.contains_key(&token)
    }

    pub fn timer(&self, token: Token) -> Option<Duration> {
        self.0.borrow().timers.get(&token).copied()
    }

    /// Deregistrations not yet acknowledged.
    pub fn take_acks(&self) -> Vec<Token> {
        std::mem::take(&mut self.0.borrow_mut().acks)
    }

    /// Fire the timer for `token` if it is armed.
    pub fn take_timer(&self, token: Token) -> bool {
        self.0.borrow_mut().timers.remove(&token).is_some()
    }
}

impl EventLoop for FakeLoop {
    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        state.register_calls += 1;
        if state.fail_register {
            return Err(io::Error::other("register refused"));
        }
        assert!(
            !state.registrations.contains_key(&token),
            "token registered twice"
        );
        state.registrations.insert(token, (fd, interest));
        Ok(())
    }

    fn reregister(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        let entry = state
            .registrations
            .get_mut(&token)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        entry.1 = interest;
        Ok(())
    }

    fn deregister(&mut self, token: Token) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        state.deregister_calls += 1;
        state
            .registrations
            .remove(&token)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        state.acks.push(token);
        Ok(())
    }

    fn start_timer(&mut self, token: Token, after: Duration) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        if state.fail_timer {
            return Err(io::Error::other("timer refused"));
        }
        state.timers.insert(token, after);
        Ok(())
    }

    fn stop_timer(&mut self, token: Token) {
        self.0.borrow_mut().timers.remove(&token);
    }
}

// === Client ===

#[derive(Debug, Default)]
pub struct Script {
    /// Statuses returned by successive `connect_poll` calls; `Ok` once empty
    pub connect_steps: VecDeque<PollingStatus>,
    /// Statuses returned by successive `reset_poll` calls; `Ok` once empty
    pub reset_steps: VecDeque<PollingStatus>,
    /// Number of upcoming `connect_start` calls that fail
    pub connect_start_failures: usize,
    pub fail_reset_start: bool,
    pub fail_send: bool,
    pub fail_consume: bool,
    /// Flushes after a send answer `Pending` this many times before `Done`
    pub flush_pending: usize,
    /// A send queued output that has not been flushed yet
    pub output_queued: bool,
    pub busy: bool,
    /// Results the server has "sent"
    pub results: VecDeque<PgResult>,
    /// Every interesting client call, in order
    pub log: Vec<String>,
    pub conninfos: Vec<String>,
    pub connects: usize,
    pub resets: usize,
    pub clients_alive: usize,
    pub error: String,
}

impl Script {
    pub fn shared() -> Rc<RefCell<Script>> {
        Rc::new(RefCell::new(Script::default()))
    }
}

pub struct FakeClient {
    script: Rc<RefCell<Script>>,
    socket: Option<(UnixStream, UnixStream)>,
}

impl FakeClient {
    fn open_socket(&mut self) {
        self.socket = Some(UnixStream::pair().unwrap());
    }
}

impl Drop for FakeClient {
    fn drop(&mut self) {
        self.script.borrow_mut().clients_alive -= 1;
    }
}

impl Client for FakeClient {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(|(a, _)| a.as_fd())
    }

    fn connect_poll(&mut self) -> PollingStatus {
        let status = self
            .script
            .borrow_mut()
            .connect_steps
            .pop_front()
            .unwrap_or(PollingStatus::Ok);
        if status == PollingStatus::Failed {
            self.socket = None;
        }
        status
    }

    fn reset_start(&mut self) -> Result<()> {
        let mut script = self.script.borrow_mut();
        script.resets += 1;
        script.log.push("reset_start".into());
        if script.fail_reset_start {
            return Err(Error::BadConnection("reset refused".into()));
        }
        drop(script);
        self.open_socket();
        Ok(())
    }

    fn reset_poll(&mut self) -> PollingStatus {
        let status = self
            .script
            .borrow_mut()
            .reset_steps
            .pop_front()
            .unwrap_or(PollingStatus::Ok);
        if status == PollingStatus::Failed {
            self.script.borrow_mut().error = "reset failed".into();
        }
        status
    }

    fn send_query_params(&mut self, sql: &str, params: &Params) -> Result<()> {
        let mut script = self.script.borrow_mut();
        if script.fail_send {
            return Err(Error::BadConnection("broken pipe".into()));
        }
        script.log.push(format!("send {} ({} params)", sql, params.len()));
        script.output_queued = true;
        Ok(())
    }

    fn send_prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()> {
        let mut script = self.script.borrow_mut();
        if script.fail_send {
            return Err(Error::BadConnection("broken pipe".into()));
        }
        script
            .log
            .push(format!("prepare {} {} {:?}", name, sql, param_types));
        script.output_queued = true;
        Ok(())
    }

    fn send_query_prepared(&mut self, name: &str, params: &Params) -> Result<()> {
        let mut script = self.script.borrow_mut();
        if script.fail_send {
            return Err(Error::BadConnection("broken pipe".into()));
        }
        script
            .log
            .push(format!("execute {} ({} params)", name, params.len()));
        script.output_queued = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<FlushStatus> {
        let mut script = self.script.borrow_mut();
        if script.output_queued && script.flush_pending > 0 {
            script.flush_pending -= 1;
            return Ok(FlushStatus::Pending);
        }
        script.output_queued = false;
        Ok(FlushStatus::Done)
    }

    fn consume_input(&mut self) -> Result<()> {
        let mut script = self.script.borrow_mut();
        if script.fail_consume {
            script.error = "server closed the connection unexpectedly".into();
            return Err(Error::BadConnection(script.error.clone()));
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.script.borrow().busy
    }

    fn get_result(&mut self) -> Option<PgResult> {
        let mut script = self.script.borrow_mut();
        let result = script.results.pop_front();
        if result.is_some() {
            script.log.push("result".into());
        }
        result
    }

    fn error_message(&self) -> String {
        self.script.borrow().error.clone()
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            backend_pid: 4242,
            server_params: vec![("server_version".into(), "16.0".into())],
        }
    }
}

#[derive(Clone)]
pub struct FakeConnector(pub Rc<RefCell<Script>>);

impl Connector for FakeConnector {
    type Client = FakeClient;

    fn connect_start(&mut self, conninfo: &str) -> Result<FakeClient> {
        let mut script = self.0.borrow_mut();
        script.conninfos.push(conninfo.to_string());
        script.connects += 1;
        if script.connect_start_failures > 0 {
            script.connect_start_failures -= 1;
            return Err(Error::BadConnection(
                "could not translate host name \"nowhere.invalid\"".into(),
            ));
        }
        script.clients_alive += 1;
        drop(script);
        let mut client = FakeClient {
            script: Rc::clone(&self.0),
            socket: None,
        };
        client.open_socket();
        Ok(client)
    }
}

// === Results ===

/// One int8 column holding `value`.
pub fn int8_result(value: i64) -> PgResult {
    PgResult::with_rows(
        vec![ColumnInfo::new("n", oid::INT8, FormatCode::Binary)],
        &[vec![Some(&value.to_be_bytes()[..])]],
    )
}

/// A failed result as the server reports a bad statement.
pub fn error_result(message: &str) -> PgResult {
    PgResult::from_error(zero_postgres_evented::error::ErrorFields {
        severity: Some("ERROR".into()),
        code: Some("42601".into()),
        message: Some(message.into()),
        ..Default::default()
    })
}

pub const TOKEN: Token = Token(7);

pub fn writable() -> Event {
    Event::Ready(Interest::WRITABLE)
}

pub fn readable() -> Event {
    Event::Ready(Interest::READABLE)
}
