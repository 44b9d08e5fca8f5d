//! PostgreSQL wire protocol implementation.
//!
//! # Structure
//!
//! - `backend`: Server → Client messages (parsing)
//! - `frontend`: Client → Server messages (encoding)
//! - `codec`: Low-level encoding/decoding primitives and message framing
//! - `types`: Common protocol types (FormatCode, Oid, TransactionStatus, type OIDs)

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use backend::RawMessage;
pub use codec::{Frame, next_frame};
pub use types::{FormatCode, Oid, TransactionStatus};
