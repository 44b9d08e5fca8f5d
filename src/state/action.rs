//! Action types for state machine I/O requests.

use crate::error::ErrorFields;

/// Action requested by a state machine after consuming one backend message.
///
/// Outgoing bytes are appended to the write buffer passed to `step()`; the
/// caller sends them whenever the socket allows.
#[derive(Debug)]
pub enum Action {
    /// Feed the next backend message to `step()`.
    ReadMessage,

    /// Flush the write buffer, then feed the next backend message.
    Write,

    /// An asynchronous message arrived. Handle it and keep reading.
    HandleAsyncMessage(AsyncMessage),

    /// The state machine has finished successfully.
    Finished,
}

/// Asynchronous message from the server.
///
/// These can arrive at any time, including in the middle of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification {
        /// PID of the notifying backend process
        pid: u32,
        channel: String,
        payload: String,
    },

    /// Non-fatal notice/warning from server.
    Notice(ErrorFields),

    /// Server parameter value changed.
    ParameterChanged { name: String, value: String },
}
