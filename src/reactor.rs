//! A ready-made [`EventLoop`] over the `polling` crate.
//!
//! [`PollReactor`] multiplexes any number of connections on one thread. Hosts
//! that already run their own loop implement [`EventLoop`] instead.
//!
//! ```ignore
//! let reactor = ReactorHandle::new()?;
//! let mut conn = Connection::connect(url, reactor.clone(), Token(1), WireConnector, on_connect);
//! loop {
//!     for (token, event) in reactor.poll(Some(Duration::from_millis(100)))? {
//!         conn.handle(event);
//!     }
//! }
//! ```
//!
//! # Safety
//!
//! Registrations keep only the raw descriptor. The owner must keep it open
//! until [`Event::Deregistered`] is delivered for its token, which is the
//! contract [`EventLoop::deregister`] already states.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use polling::{Event as PollEvent, Poller};
use tracing::trace;

use crate::event_loop::{Event, EventLoop, Interest, Token};

#[derive(Debug)]
struct Registration {
    raw_fd: RawFd,
    interest: Interest,
}

/// Single-threaded reactor with one-shot timers.
pub struct PollReactor {
    poller: Poller,
    registrations: HashMap<Token, Registration>,
    timers: HashMap<Token, Instant>,
    /// Deregistrations not yet reported
    acks: VecDeque<Token>,
    poll_events: Vec<PollEvent>,
}

impl PollReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            registrations: HashMap::new(),
            timers: HashMap::new(),
            acks: VecDeque::new(),
            poll_events: Vec::new(),
        })
    }

    fn interest_to_poll_event(token: Token, interest: Interest) -> PollEvent {
        let key = token.0;
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(key),
            (true, false) => PollEvent::readable(key),
            (false, true) => PollEvent::writable(key),
            (false, false) => PollEvent::none(key),
        }
    }

    fn poll_event_to_interest(event: &PollEvent) -> Interest {
        let mut interest = Interest::NONE;
        if event.readable {
            interest |= Interest::READABLE;
        }
        if event.writable {
            interest |= Interest::WRITABLE;
        }
        interest
    }

    /// Nothing registered, no timers armed and no acknowledgements pending.
    pub fn is_idle(&self) -> bool {
        self.registrations.is_empty() && self.timers.is_empty() && self.acks.is_empty()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// Wait for events, at most `timeout` (forever if `None`) or until the
    /// next timer is due.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Event)>> {
        let now = Instant::now();
        let mut wait = timeout;
        if let Some(deadline) = self.timers.values().min() {
            let until = deadline.saturating_duration_since(now);
            wait = Some(wait.map_or(until, |w| w.min(until)));
        }
        if !self.acks.is_empty() {
            wait = Some(Duration::ZERO);
        }

        self.poll_events.clear();
        match self.poller.wait(&mut self.poll_events, wait) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let mut out = Vec::new();
        for poll_event in &self.poll_events {
            let token = Token(poll_event.key);
            let Some(reg) = self.registrations.get(&token) else {
                continue;
            };
            let ready = Self::poll_event_to_interest(poll_event) & reg.interest;
            // Registrations are one-shot in `polling`; arm again unless quiesced,
            // where a hung-up socket would otherwise report forever.
            if !reg.interest.is_empty() {
                // SAFETY: the descriptor stays open until its deregistration is
                // acknowledged, and it is still registered here.
                let fd = unsafe { BorrowedFd::borrow_raw(reg.raw_fd) };
                self.poller
                    .modify(&fd, Self::interest_to_poll_event(token, reg.interest))?;
            }
            if !ready.is_empty() {
                trace!(token = token.0, ?ready, "ready");
                out.push((token, Event::Ready(ready)));
            }
        }

        let now = Instant::now();
        let mut due: Vec<(Token, Instant)> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(token, deadline)| (*token, *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);
        for (token, _) in due {
            self.timers.remove(&token);
            trace!(token = token.0, "timer");
            out.push((token, Event::Timer));
        }

        out.extend(self.acks.drain(..).map(|token| (token, Event::Deregistered)));
        Ok(out)
    }
}

impl EventLoop for PollReactor {
    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.registrations.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        // SAFETY: the caller keeps `fd` open until the deregistration is
        // acknowledged; it is only borrowed for this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .add(&borrowed, Self::interest_to_poll_event(token, interest))?;
        self.registrations.insert(token, Registration { raw_fd: fd, interest });
        Ok(())
    }

    fn reregister(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let reg = self
            .registrations
            .get_mut(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        // SAFETY: the descriptor is registered, so it is still open.
        let fd = unsafe { BorrowedFd::borrow_raw(reg.raw_fd) };
        self.poller
            .modify(&fd, Self::interest_to_poll_event(token, interest))?;
        reg.interest = interest;
        Ok(())
    }

    fn deregister(&mut self, token: Token) -> io::Result<()> {
        let reg = self
            .registrations
            .remove(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        // SAFETY: the descriptor is registered, so it is still open.
        let fd = unsafe { BorrowedFd::borrow_raw(reg.raw_fd) };
        self.poller.delete(&fd)?;
        self.acks.push_back(token);
        Ok(())
    }

    fn start_timer(&mut self, token: Token, after: Duration) -> io::Result<()> {
        self.timers.insert(token, Instant::now() + after);
        Ok(())
    }

    fn stop_timer(&mut self, token: Token) {
        self.timers.remove(&token);
    }
}

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("registrations", &self.registrations.len())
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

/// Shared handle to a [`PollReactor`].
///
/// Each connection holds a clone; the host keeps one to call [`poll`](Self::poll).
#[derive(Debug, Clone)]
pub struct ReactorHandle(Rc<RefCell<PollReactor>>);

impl ReactorHandle {
    pub fn new() -> io::Result<Self> {
        Ok(Self(Rc::new(RefCell::new(PollReactor::new()?))))
    }

    /// See [`PollReactor::poll`]. Events are returned rather than dispatched
    /// so handlers may call back into the reactor.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Event)>> {
        self.0.borrow_mut().poll(timeout)
    }

    pub fn is_idle(&self) -> bool {
        self.0.borrow().is_idle()
    }
}

impl EventLoop for ReactorHandle {
    fn register(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.0.borrow_mut().register(token, fd, interest)
    }

    fn reregister(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        self.0.borrow_mut().reregister(token, interest)
    }

    fn deregister(&mut self, token: Token) -> io::Result<()> {
        self.0.borrow_mut().deregister(token)
    }

    fn start_timer(&mut self, token: Token, after: Duration) -> io::Result<()> {
        self.0.borrow_mut().start_timer(token, after)
    }

    fn stop_timer(&mut self, token: Token) {
        self.0.borrow_mut().stop_timer(token)
    }
}
