//! Connection state machine and dispatcher, driven by a fake event loop and a
//! scripted client.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use zero_postgres_evented::connection::{DEFAULT_RECONNECT_INTERVAL, MAX_CONNINFO_LENGTH};
use zero_postgres_evented::{
    Connection, Error, ErrorKind, Event, Interest, PollingStatus, ResultSet, State, Value,
    pending,
};

type Conn = Connection<FakeConnector, FakeLoop>;
type Notified = Rc<RefCell<Vec<Result<u32, (ErrorKind, String)>>>>;

struct Harness {
    script: Rc<RefCell<Script>>,
    ev: FakeLoop,
    conn: Conn,
    notified: Notified,
}

fn setup(configure: impl FnOnce(&mut Script)) -> Harness {
    setup_with("host=localhost user=postgres", configure)
}

fn setup_with(conninfo: &str, configure: impl FnOnce(&mut Script)) -> Harness {
    let script = Script::shared();
    configure(&mut script.borrow_mut());
    let ev = FakeLoop::default();
    let notified: Notified = Rc::default();
    let sink = Rc::clone(&notified);
    let conn = Connection::connect(
        conninfo,
        ev.clone(),
        TOKEN,
        FakeConnector(Rc::clone(&script)),
        move |outcome| {
            sink.borrow_mut().push(
                outcome
                    .map(|session| session.backend_pid)
                    .map_err(|e| (e.kind(), e.to_string())),
            );
        },
    );
    Harness {
        script,
        ev,
        conn,
        notified,
    }
}

fn connected() -> Harness {
    let mut h = setup(|_| {});
    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::Connected);
    h
}

impl Harness {
    fn log(&self) -> Vec<String> {
        self.script.borrow().log.clone()
    }

    fn respond(&mut self, result: zero_postgres_evented::PgResult) {
        self.script.borrow_mut().results.push_back(result);
        self.conn.handle(readable());
    }

    fn ack(&mut self) {
        for token in self.ev.take_acks() {
            self.conn.handle(Event::Deregistered);
            assert_eq!(token, TOKEN);
        }
    }

    fn fire_timer(&mut self) {
        assert!(self.ev.take_timer(TOKEN), "no timer armed");
        self.conn.handle(Event::Timer);
    }

    /// Queue a query whose outcome is recorded in the script log.
    fn logged_query(&mut self, label: &'static str) {
        let script = Rc::clone(&self.script);
        self.conn.query(format!("SELECT '{}'", label), move |outcome| {
            let entry = match outcome {
                Ok(set) => format!("done {} rows={}", label, set.len()),
                Err(e) => format!("done {} err={:?}", label, e.kind()),
            };
            script.borrow_mut().log.push(entry);
        });
    }
}

// === Connect ===

#[test]
fn test_connect_success_notifies_once() {
    let mut h = setup(|s| {
        s.connect_steps = [PollingStatus::Writing, PollingStatus::Reading].into();
    });
    assert_eq!(h.conn.state(), State::Connecting);
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::WRITABLE));

    h.conn.handle(writable());
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::WRITABLE));
    h.conn.handle(writable());
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::READABLE));
    assert!(h.notified.borrow().is_empty());

    h.conn.handle(readable());
    assert_eq!(h.conn.state(), State::Connected);
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::BOTH));
    assert_eq!(*h.notified.borrow(), vec![Ok(4242)]);
    assert_eq!(
        h.conn.session_info().unwrap().param("server_version"),
        Some("16.0")
    );
    assert!(h.conn.client_mut().is_some());

    // More readiness never notifies again.
    h.conn.handle(Event::Ready(Interest::BOTH));
    assert_eq!(h.notified.borrow().len(), 1);
}

#[test]
fn test_connect_start_failure_is_reported_without_retry() {
    let h = setup(|s| s.connect_start_failures = 1);

    let notified = h.notified.borrow();
    assert_eq!(notified.len(), 1);
    let (kind, message) = notified[0].clone().unwrap_err();
    assert_eq!(kind, ErrorKind::BadConnection);
    assert!(!message.is_empty());

    assert_eq!(h.conn.state(), State::New);
    assert_eq!(h.conn.error(), ErrorKind::BadConnection);
    assert!(h.conn.error_message().contains("nowhere.invalid"));
    assert!(h.conn.is_closed());
    assert_eq!(h.ev.timer(TOKEN), None);
    assert_eq!(h.script.borrow().connects, 1);
}

#[test]
fn test_first_handshake_failure_releases_and_fails_queue() {
    let mut h = setup(|s| {
        s.connect_steps = [PollingStatus::Failed].into();
        s.error = "connection refused".into();
    });
    h.logged_query("a");
    h.logged_query("b");

    h.conn.handle(writable());
    assert_eq!(h.notified.borrow().len(), 1);
    assert_eq!(
        h.notified.borrow()[0].clone().unwrap_err().0,
        ErrorKind::BadConnection
    );
    assert_eq!(
        h.log(),
        vec![
            "done a err=BadConnection".to_string(),
            "done b err=BadConnection".to_string()
        ]
    );
    assert_eq!(h.conn.state(), State::Closing);
    assert_eq!(h.ev.timer(TOKEN), None);

    h.ack();
    assert_eq!(h.conn.state(), State::New);
    assert_eq!(h.script.borrow().clients_alive, 0);
    assert_eq!(h.script.borrow().connects, 1);

    // Nothing more is accepted.
    h.logged_query("c");
    assert_eq!(h.log().last().unwrap(), "done c err=BadConnection");
}

#[test]
fn test_register_failure_is_reported() {
    let script = Script::shared();
    let ev = FakeLoop::default();
    ev.0.borrow_mut().fail_register = true;
    let outcome = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);
    let conn = Connection::connect(
        "host=localhost",
        ev.clone(),
        TOKEN,
        FakeConnector(Rc::clone(&script)),
        move |r| *sink.borrow_mut() = Some(r.map(|_| ()).map_err(|e| e.kind())),
    );
    assert_eq!(*outcome.borrow(), Some(Err(ErrorKind::BadConnection)));
    assert_eq!(conn.state(), State::New);
    assert!(conn.error_message().contains("event loop"));
    assert_eq!(script.borrow().clients_alive, 0);
}

#[test]
fn test_conninfo_is_capped() {
    let long = format!("host=localhost application_name={}", "x".repeat(2000));
    let h = setup_with(&long, |_| {});
    let seen = h.script.borrow().conninfos[0].clone();
    assert_eq!(seen.len(), MAX_CONNINFO_LENGTH);
    assert!(long.starts_with(&seen));
}

// === Dispatch ===

#[test]
fn test_query_decodes_integer() {
    let mut h = connected();
    let got: Rc<RefCell<Option<ResultSet>>> = Rc::default();
    let sink = Rc::clone(&got);
    h.conn
        .query("SELECT 1::int8", move |r| *sink.borrow_mut() = Some(r.unwrap()));

    h.conn.handle(writable());
    assert!(h.conn.has_in_flight());
    h.respond(int8_result(1));

    let set = got.borrow_mut().take().unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.rows()[0].len(), 1);
    assert_eq!(set.rows()[0][0], Value::Integer(1));
    assert!(!h.conn.has_in_flight());
}

#[test]
fn test_requests_complete_in_order_one_at_a_time() {
    let mut h = setup(|_| {});
    for label in ["r0", "r1", "r2", "r3", "r4"] {
        h.logged_query(label);
    }
    assert_eq!(h.conn.queue_len(), 5);

    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::Connected);

    for i in 0..5 {
        h.conn.handle(writable());
        // Writable again while in flight sends nothing.
        h.conn.handle(Event::Ready(Interest::BOTH));
        h.respond(int8_result(i));
    }

    let mut expected = Vec::new();
    for i in 0..5 {
        expected.push(format!("send SELECT 'r{}' (0 params)", i));
        expected.push("result".to_string());
        expected.push(format!("done r{} rows=1", i));
    }
    assert_eq!(h.log(), expected);
    assert_eq!(h.conn.queue_len(), 0);
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::READABLE));
}

#[test]
fn test_enqueue_while_idle_requests_write_readiness() {
    let mut h = connected();
    h.conn.handle(writable());
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::READABLE));

    h.logged_query("x");
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::BOTH));
}

#[test]
fn test_prepare_and_execute() {
    let mut h = connected();
    let prepared = Rc::new(Cell::new(false));
    let flag = Rc::clone(&prepared);
    h.conn.prepare("by_id", "SELECT $1::int8", &[20], move |r| {
        r.unwrap();
        flag.set(true);
    });
    let value: Arc<[u8]> = Arc::from(&5_i64.to_be_bytes()[..]);
    let rows: Rc<RefCell<Vec<Value>>> = Rc::default();
    let sink = Rc::clone(&rows);
    h.conn.execute_prepared(
        "by_id",
        &[Some(value)],
        &[zero_postgres_evented::FormatCode::Binary],
        move |r| sink.borrow_mut().extend(r.unwrap().into_rows().remove(0).into_values()),
    );

    h.conn.handle(writable());
    h.respond(zero_postgres_evented::PgResult::new(
        zero_postgres_evented::ResultStatus::CommandOk,
    ));
    assert!(prepared.get());

    h.conn.handle(writable());
    h.respond(int8_result(5));
    assert_eq!(*rows.borrow(), vec![Value::Integer(5)]);

    assert_eq!(h.log()[0], "prepare by_id SELECT $1::int8 [20]");
    assert_eq!(h.log()[2], "execute by_id (1 params)");
}

#[test]
fn test_server_error_is_bad_query() {
    let mut h = connected();
    let got = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&got);
    h.conn.query("SELEC 1", move |r| *sink.borrow_mut() = Some(r));
    h.conn.handle(writable());
    h.respond(error_result("syntax error at or near \"SELEC\""));

    let err = got.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadQuery);
    assert!(err.to_string().contains("syntax error"));
    assert_eq!(h.conn.error(), ErrorKind::BadQuery);
    assert_eq!(h.conn.state(), State::Connected);
}

#[test]
fn test_raw_failed_result_reaches_low_level_handler() {
    let mut h = connected();
    let got = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&got);
    h.conn.enqueue(
        zero_postgres_evented::RequestKind::Query,
        Some("SELEC 1".into()),
        None,
        &zero_postgres_evented::Params::default(),
        zero_postgres_evented::RequestFlags::NONE,
        Box::new(move |response| *sink.borrow_mut() = Some(response)),
    );
    h.conn.handle(writable());
    h.respond(error_result("syntax error"));

    let response = got.borrow_mut().take().unwrap();
    assert!(matches!(response.error, Some(Error::BadQuery(_))));
    let result = response.result.unwrap();
    assert_eq!(result.error_fields().unwrap().code.as_deref(), Some("42601"));
}

#[test]
fn test_flush_pending_keeps_write_interest() {
    let mut h = connected();
    h.logged_query("big");
    h.script.borrow_mut().flush_pending = 1;

    // Sent, but the output did not drain: both directions wanted.
    h.conn.handle(writable());
    assert!(h.conn.has_in_flight());
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::BOTH));

    // Drained; nothing else goes out while the request is in flight.
    h.logged_query("after");
    h.conn.handle(writable());
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::READABLE));
    assert_eq!(h.log(), vec!["send SELECT 'big' (0 params)".to_string()]);
    assert_eq!(h.conn.queue_len(), 1);
}

#[test]
fn test_orphan_result_is_dropped() {
    let mut h = connected();
    h.respond(int8_result(9));
    assert_eq!(h.conn.state(), State::Connected);
    assert_eq!(h.log(), vec!["result".to_string()]);
}

#[test]
fn test_busy_client_defers_result() {
    let mut h = connected();
    h.logged_query("slow");
    h.conn.handle(writable());
    h.script.borrow_mut().busy = true;
    h.respond(int8_result(1));
    assert!(h.conn.has_in_flight());

    h.script.borrow_mut().busy = false;
    h.conn.handle(readable());
    assert_eq!(h.log().last().unwrap(), "done slow rows=1");
}

#[test]
fn test_pending_future_receives_outcome() {
    let mut h = connected();
    let (complete, mut outcome) = pending::<zero_postgres_evented::Result<ResultSet>>();
    h.conn.query("SELECT 1::int8", complete);
    assert!(outcome.try_take().is_none());

    h.conn.handle(writable());
    h.respond(int8_result(1));
    let set: ResultSet = outcome.try_take().unwrap().unwrap().unwrap();
    assert_eq!(set.rows()[0][0].as_i64(), Some(1));
}

// === Connection loss and retry ===

#[test]
fn test_connection_loss_fails_in_flight_and_reconnects() {
    let mut h = connected();
    h.conn.set_reconnect_interval(Duration::from_millis(250));
    h.logged_query("lost");
    h.logged_query("kept");
    h.conn.handle(writable());

    h.script.borrow_mut().fail_consume = true;
    h.conn.handle(readable());
    assert_eq!(h.log().last().unwrap(), "done lost err=BadConnection");
    assert_eq!(h.conn.state(), State::BadConnection);
    assert_eq!(h.conn.error(), ErrorKind::BadConnection);
    assert_eq!(h.conn.queue_len(), 1);
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::NONE));
    assert_eq!(h.ev.timer(TOKEN), Some(Duration::from_millis(250)));

    h.script.borrow_mut().fail_consume = false;
    h.fire_timer();
    assert_eq!(h.conn.state(), State::Closing);
    h.ack();
    assert_eq!(h.conn.state(), State::Connecting);
    assert_eq!(h.script.borrow().connects, 2);
    assert_eq!(h.script.borrow().clients_alive, 1);

    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::Connected);
    // The connect notification already happened.
    assert_eq!(h.notified.borrow().len(), 1);

    h.conn.handle(writable());
    h.respond(int8_result(2));
    assert_eq!(h.log().last().unwrap(), "done kept rows=1");
}

#[test]
fn test_failed_reconnect_keeps_retrying() {
    let mut h = connected();
    h.script.borrow_mut().fail_consume = true;
    h.conn.handle(readable());
    assert_eq!(h.ev.timer(TOKEN), Some(DEFAULT_RECONNECT_INTERVAL));

    {
        let mut script = h.script.borrow_mut();
        script.fail_consume = false;
        script.connect_start_failures = 1;
    }
    h.fire_timer();
    h.ack();
    assert_eq!(h.conn.state(), State::BadConnection);
    assert_eq!(h.ev.timer(TOKEN), Some(DEFAULT_RECONNECT_INTERVAL));

    h.script.borrow_mut().connect_steps = [PollingStatus::Failed].into();
    h.fire_timer();
    assert_eq!(h.conn.state(), State::Connecting);
    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::BadConnection);
    assert!(h.ev.timer(TOKEN).is_some());

    h.fire_timer();
    h.ack();
    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::Connected);
    assert_eq!(h.script.borrow().connects, 4);
    assert_eq!(h.notified.borrow().len(), 1);
    assert!(!h.conn.is_closed());
}

#[test]
fn test_send_failure_loses_connection() {
    let mut h = connected();
    h.script.borrow_mut().fail_send = true;
    h.logged_query("doomed");
    h.logged_query("next");
    h.conn.handle(writable());

    assert_eq!(h.log(), vec!["done doomed err=BadConnection".to_string()]);
    assert!(!h.conn.has_in_flight());
    assert_eq!(h.conn.queue_len(), 1);
    assert_eq!(h.conn.state(), State::BadConnection);
    assert!(h.ev.timer(TOKEN).is_some());
}

#[test]
fn test_extra_result_tears_down_and_reconnects() {
    let mut h = connected();
    h.logged_query("one");
    h.conn.handle(writable());
    h.script.borrow_mut().results.push_back(int8_result(1));
    h.respond(int8_result(2));

    assert_eq!(
        h.log(),
        vec![
            "send SELECT 'one' (0 params)".to_string(),
            "result".to_string(),
            "result".to_string(),
            "done one rows=1".to_string(),
        ]
    );
    assert_eq!(h.conn.state(), State::BadConnection);
    assert!(h.ev.timer(TOKEN).is_some());

    h.fire_timer();
    h.ack();
    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::Connected);
}

// === Reset ===

#[test]
fn test_reset_retries_with_reset_handshake() {
    let mut h = connected();
    h.logged_query("cut");
    h.logged_query("survives");
    h.conn.handle(writable());
    h.script.borrow_mut().reset_steps = [PollingStatus::Reading, PollingStatus::Failed].into();

    h.conn.reset().unwrap();
    assert_eq!(h.log().last().unwrap(), "done cut err=BadConnection");
    assert_eq!(h.conn.state(), State::Closing);

    h.ack();
    assert_eq!(h.conn.state(), State::Resetting);
    assert_eq!(h.script.borrow().resets, 1);
    h.conn.handle(writable());
    assert_eq!(h.ev.interest(TOKEN), Some(Interest::READABLE));
    h.conn.handle(readable());
    assert_eq!(h.conn.state(), State::BadReset);
    assert!(h.ev.timer(TOKEN).is_some());

    h.fire_timer();
    h.ack();
    assert_eq!(h.conn.state(), State::Resetting);
    assert_eq!(h.script.borrow().resets, 2);
    // Same client handle throughout.
    assert_eq!(h.script.borrow().connects, 1);

    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::Connected);
    h.conn.handle(writable());
    h.respond(int8_result(3));
    assert_eq!(h.log().last().unwrap(), "done survives rows=1");
}

#[test]
fn test_reset_requires_connected() {
    let mut h = setup(|_| {});
    assert!(matches!(h.conn.reset(), Err(Error::InvalidUsage(_))));
}

// === Disconnect ===

struct DropCounter(Rc<Cell<usize>>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

#[test]
fn test_disconnect_drops_requests_after_ack() {
    let mut h = connected();
    let dropped = Rc::new(Cell::new(0));
    let called = Rc::new(Cell::new(0));
    for _ in 0..4 {
        let guard = DropCounter(Rc::clone(&dropped));
        let called = Rc::clone(&called);
        h.conn.query("SELECT 1", move |_| {
            let _guard = &guard;
            called.set(called.get() + 1);
        });
    }
    // One goes in flight, three stay queued.
    h.conn.handle(writable());
    assert!(h.conn.has_in_flight());

    h.conn.disconnect();
    assert_eq!(h.conn.state(), State::Closing);
    assert!(!h.ev.is_registered(TOKEN));
    assert_eq!(dropped.get(), 0);
    assert_eq!(h.script.borrow().clients_alive, 1);

    h.ack();
    assert_eq!(h.conn.state(), State::New);
    assert_eq!(dropped.get(), 4);
    assert_eq!(called.get(), 0);
    assert_eq!(h.script.borrow().clients_alive, 0);

    h.conn.disconnect();
    assert_eq!(h.ev.0.borrow().deregister_calls, 1);

    h.logged_query("late");
    assert_eq!(h.log().last().unwrap(), "done late err=BadConnection");
}

#[test]
fn test_disconnect_while_waiting_for_retry_stops_timer() {
    let mut h = connected();
    h.script.borrow_mut().fail_consume = true;
    h.conn.handle(readable());
    assert!(h.ev.timer(TOKEN).is_some());

    h.conn.disconnect();
    assert_eq!(h.ev.timer(TOKEN), None);
    h.ack();
    assert_eq!(h.conn.state(), State::New);
    assert_eq!(h.script.borrow().clients_alive, 0);
}

#[test]
fn test_disconnect_before_connect_drops_notification() {
    let mut h = setup(|_| {});
    h.conn.disconnect();
    h.ack();
    assert_eq!(h.conn.state(), State::New);
    assert!(h.notified.borrow().is_empty());

    // Late readiness for the old registration is ignored.
    h.conn.handle(writable());
    assert_eq!(h.conn.state(), State::New);
    assert!(h.notified.borrow().is_empty());
}

#[test]
fn test_disconnect_during_closing_releases() {
    let mut h = connected();
    h.logged_query("in flight");
    h.conn.handle(writable());
    h.conn.reset().unwrap();
    assert_eq!(h.conn.state(), State::Closing);

    h.conn.disconnect();
    h.ack();
    assert_eq!(h.conn.state(), State::New);
    assert_eq!(h.script.borrow().resets, 0);
}
