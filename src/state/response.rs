//! Extended query response state machine.
//!
//! Collects everything the server sends between a request's first message and
//! the ReadyForQuery that closes its Sync into [`PgResult`]s.

use std::collections::VecDeque;

use crate::client::{ColumnInfo, PgResult, ResultStatus};
use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, ErrorResponse, RawMessage, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::types::TransactionStatus;

use super::action::Action;
use super::startup::handle_async_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the command's outcome
    Collecting,
    /// Outcome known, waiting for ReadyForQuery
    WaitingReady,
    Finished,
}

/// Extended query response state machine.
pub struct ResponseStateMachine {
    state: State,
    /// Parse + Sync only: ParseComplete is the whole answer
    parse_only: bool,
    parse_complete: bool,
    produced: usize,
    current: PgResult,
    completed: VecDeque<PgResult>,
    transaction_status: TransactionStatus,
}

impl ResponseStateMachine {
    /// Response to Parse + Bind + Describe + Execute + Sync.
    pub fn for_execute() -> Self {
        Self::new(false)
    }

    /// Response to Parse + Sync.
    pub fn for_prepare() -> Self {
        Self::new(true)
    }

    fn new(parse_only: bool) -> Self {
        Self {
            state: State::Collecting,
            parse_only,
            parse_complete: false,
            produced: 0,
            current: PgResult::new(ResultStatus::CommandOk),
            completed: VecDeque::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// True once ReadyForQuery was seen.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Take the next completed result.
    pub fn pop_result(&mut self) -> Option<PgResult> {
        self.completed.pop_front()
    }

    fn complete(&mut self, status: ResultStatus) {
        let mut result = std::mem::replace(
            &mut self.current,
            PgResult::new(ResultStatus::CommandOk),
        );
        result.set_status(status);
        self.completed.push_back(result);
        self.produced += 1;
        self.state = State::WaitingReady;
    }

    /// Process one backend message.
    pub fn step(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        if self.state == State::Finished {
            return Err(Error::Protocol(format!(
                "Message '{}' after ReadyForQuery",
                msg.type_byte as char
            )));
        }

        match msg.type_byte {
            msg_type::PARSE_COMPLETE => {
                self.parse_complete = true;
            }
            msg_type::BIND_COMPLETE
            | msg_type::NO_DATA
            | msg_type::CLOSE_COMPLETE
            | msg_type::PARAMETER_DESCRIPTION => {}
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(msg.payload)?;
                let columns = desc
                    .fields()
                    .iter()
                    .map(|field| ColumnInfo {
                        name: field.name.to_string(),
                        tail: *field.tail,
                    })
                    .collect();
                self.current.set_columns(columns);
            }
            msg_type::DATA_ROW => {
                self.current.push_row(msg.payload)?;
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(msg.payload)?;
                self.current.set_command_tag(complete.tag);
                let status = if self.current.columns().is_empty() {
                    ResultStatus::CommandOk
                } else {
                    ResultStatus::TuplesOk
                };
                self.complete(status);
            }
            msg_type::EMPTY_QUERY_RESPONSE => self.complete(ResultStatus::EmptyQuery),
            msg_type::PORTAL_SUSPENDED => self.complete(ResultStatus::TuplesOk),
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(msg.payload)?;
                self.current = PgResult::from_error(error.fields);
                self.complete(ResultStatus::FatalError);
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                if self.produced == 0 {
                    if self.parse_only && self.parse_complete {
                        self.complete(ResultStatus::CommandOk);
                    } else {
                        tracing::warn!("ReadyForQuery without a command outcome");
                        self.complete(ResultStatus::BadResponse);
                    }
                }
                self.state = State::Finished;
                return Ok(Action::Finished);
            }
            msg_type::NOTICE_RESPONSE
            | msg_type::NOTIFICATION_RESPONSE
            | msg_type::PARAMETER_STATUS => return handle_async_message(msg),
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected message '{}' in query response",
                    other as char
                )));
            }
        }

        Ok(Action::ReadMessage)
    }
}
