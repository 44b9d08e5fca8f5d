//! Connection startup and authentication state machine.

use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::auth::NotificationResponse;
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, NoticeResponse, ParameterStatus,
    RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage};

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Initial,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Startup state machine: StartupMessage through the first ReadyForQuery.
pub struct StartupStateMachine {
    state: StartupState,
    options: Opts,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
}

impl StartupStateMachine {
    pub fn new(options: Opts) -> Self {
        Self {
            state: StartupState::Initial,
            options,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
        }
    }

    pub fn state(&self) -> StartupState {
        self.state
    }

    /// Backend process ID and cancellation key.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Server parameters reported during startup.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Encode the StartupMessage into `out`.
    pub fn start(&mut self, out: &mut Vec<u8>) -> Result<Action> {
        if self.options.ssl_mode == SslMode::Require {
            self.state = StartupState::Failed;
            return Err(Error::Unsupported("sslmode=require: TLS is not available".into()));
        }

        let mut params: Vec<(&str, &str)> = vec![
            ("user", &self.options.user),
            ("client_encoding", "UTF8"),
        ];
        if let Some(db) = &self.options.database {
            params.push(("database", db));
        }
        if let Some(app) = &self.options.application_name {
            params.push(("application_name", app));
        }
        for (name, value) in &self.options.params {
            params.push((name, value));
        }

        write_startup(out, &params);
        self.state = StartupState::WaitingAuth;
        Ok(Action::Write)
    }

    /// Process one backend message.
    pub fn step(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        let result = self.dispatch(msg, out);
        if result.is_err() {
            self.state = StartupState::Failed;
        }
        result
    }

    fn dispatch(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        if msg.type_byte == msg_type::ERROR_RESPONSE {
            return Err(ErrorResponse::parse(msg.payload)?.into_error());
        }

        if msg.type_byte == msg_type::NOTICE_RESPONSE
            || msg.type_byte == msg_type::NOTIFICATION_RESPONSE
        {
            return handle_async_message(msg);
        }

        match self.state {
            StartupState::WaitingAuth => self.handle_auth_request(msg, out),
            StartupState::SaslInProgress => self.handle_sasl_message(msg, out),
            StartupState::WaitingAuthResult => self.handle_auth_result(msg),
            StartupState::WaitingReady => self.handle_ready_message(msg),
            _ => Err(Error::Protocol(format!(
                "Unexpected message '{}' in state {:?}",
                msg.type_byte as char, self.state
            ))),
        }
    }

    fn password(&self) -> Result<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn expect_auth<'m>(msg: RawMessage<'m>) -> Result<AuthenticationMessage<'m>> {
        if msg.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "Expected Authentication message, got '{}'",
                msg.type_byte as char
            )));
        }
        AuthenticationMessage::parse(msg.payload)
    }

    fn handle_auth_request(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        match Self::expect_auth(msg)? {
            AuthenticationMessage::Ok => {
                self.state = StartupState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                write_password(out, self.password()?);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::Write)
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.options.user, self.password()?, &salt);
                write_password(out, &hashed);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::Write)
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&"SCRAM-SHA-256") {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism. Server offers: {:?}",
                        mechanisms
                    )));
                }

                let scram = ScramClient::new(self.password()?);
                write_sasl_initial_response(
                    out,
                    "SCRAM-SHA-256",
                    scram.client_first_message().as_bytes(),
                );
                self.scram_client = Some(scram);
                self.state = StartupState::SaslInProgress;
                Ok(Action::Write)
            }
            other => Err(Error::Unsupported(format!(
                "Unsupported authentication method: {:?}",
                other
            ))),
        }
    }

    fn handle_sasl_message(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        let auth = Self::expect_auth(msg)?;
        let scram = self
            .scram_client
            .as_mut()
            .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

        match auth {
            AuthenticationMessage::SaslContinue { data } => {
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {}", e)))?;
                let client_final = scram.process_server_first(server_first)?;
                write_sasl_response(out, client_final.as_bytes());
                Ok(Action::Write)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {}", e)))?;
                scram.verify_server_final(server_final)?;
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected SASL message: {:?}",
                other
            ))),
        }
    }

    fn handle_auth_result(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        match Self::expect_auth(msg)? {
            AuthenticationMessage::Ok => {
                self.scram_client = None;
                self.state = StartupState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!("Unexpected auth result: {:?}", other))),
        }
    }

    fn handle_ready_message(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        match msg.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_key = Some(*BackendKeyData::parse(msg.payload)?);
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = StartupState::Ready;
                Ok(Action::Finished)
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                tracing::debug!("server negotiated protocol version down, continuing with 3.0");
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}

/// Decode a message that may arrive outside of any request cycle.
pub(crate) fn handle_async_message(msg: RawMessage<'_>) -> Result<Action> {
    let async_msg = match msg.type_byte {
        msg_type::NOTICE_RESPONSE => AsyncMessage::Notice(NoticeResponse::parse(msg.payload)?.fields),
        msg_type::PARAMETER_STATUS => {
            let param = ParameterStatus::parse(msg.payload)?;
            AsyncMessage::ParameterChanged {
                name: param.name.to_string(),
                value: param.value.to_string(),
            }
        }
        msg_type::NOTIFICATION_RESPONSE => {
            let notification = NotificationResponse::parse(msg.payload)?;
            AsyncMessage::Notification {
                pid: notification.pid,
                channel: notification.channel.to_string(),
                payload: notification.payload.to_string(),
            }
        }
        other => {
            return Err(Error::Protocol(format!(
                "Unknown async message type: '{}'",
                other as char
            )));
        }
    };
    Ok(Action::HandleAsyncMessage(async_msg))
}
