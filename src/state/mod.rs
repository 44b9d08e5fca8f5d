//! Sans-I/O state machines for PostgreSQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! They consume one backend message at a time and produce `Action` values
//! that tell the caller what to do next.

pub mod action;
pub mod response;
pub mod startup;

pub use action::{Action, AsyncMessage};
pub use response::ResponseStateMachine;
pub use startup::{StartupState, StartupStateMachine};
