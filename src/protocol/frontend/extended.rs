//! Extended query protocol messages.
//!
//! Every request this crate issues asks for binary results.

use std::sync::Arc;

use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::{FormatCode, Oid};

/// Most parameters, formats or types one Parse/Bind can carry. Counts go on
/// the wire as 16-bit fields the server reads unsigned.
pub const MAX_PARAMS: usize = u16::MAX as usize;

/// Write a Parse message. Callers keep `param_oids` within [`MAX_PARAMS`].
///
/// An empty `name` targets the unnamed statement. A zero OID lets the server
/// infer that parameter's type.
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_i32(oid as i32);
    }
    msg.finish();
}

/// Write a Bind message for the unnamed portal. Callers keep both slices
/// within [`MAX_PARAMS`] and each value within `i32::MAX` bytes.
///
/// `formats` follows the wire rules: empty means all text, one entry applies
/// to every parameter, otherwise one per value. `None` values are sent as NULL.
pub fn write_bind(
    buf: &mut Vec<u8>,
    statement: &str,
    values: &[Option<Arc<[u8]>>],
    formats: &[FormatCode],
) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr("");
    msg.write_cstr(statement);

    msg.write_i16(formats.len() as i16);
    for &format in formats {
        msg.write_i16(format as i16);
    }

    msg.write_i16(values.len() as i16);
    for value in values {
        match value {
            Some(bytes) => {
                msg.write_i32(bytes.len() as i32);
                msg.write_bytes(bytes);
            }
            None => msg.write_i32(-1),
        }
    }

    msg.write_i16(1);
    msg.write_i16(FormatCode::Binary as i16);
    msg.finish();
}

/// Write an Execute message. `max_rows` of 0 means no limit.
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_i32(max_rows as i32);
    msg.finish();
}

/// Write a Describe message for a portal.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Sync message, closing the extended-query cycle.
pub fn write_sync(buf: &mut Vec<u8>) {
    MessageBuilder::new(buf, super::msg_type::SYNC).finish();
}
