//! Query-related backend messages.

use std::mem::size_of;

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_i32};
use crate::protocol::types::{FormatCode, Oid};

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub table_oid: U32BE,
    /// Column attribute number (0 if not a table column)
    pub column_id: I16BE,
    /// Data type OID
    pub type_oid: U32BE,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: I16BE,
    /// Type modifier (type-specific)
    pub type_modifier: I32BE,
    /// Format code (0=text, 1=binary)
    pub format: U16BE,
}

impl FieldDescriptionTail {
    /// Build a tail for a computed column of the given type.
    pub fn synthetic(type_oid: Oid, format: FormatCode) -> Self {
        Self {
            table_oid: U32BE::new(0),
            column_id: I16BE::new(0),
            type_oid: U32BE::new(type_oid),
            type_size: I16BE::new(-1),
            type_modifier: I32BE::new(-1),
            format: U16BE::new(format as u16),
        }
    }
}

/// Field description within a RowDescription.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescription<'a> {
    /// Field name
    pub name: &'a str,
    /// Fixed-size metadata
    pub tail: &'a FieldDescriptionTail,
}

/// RowDescription message - describes the columns in a result set.
#[derive(Debug)]
pub struct RowDescription<'a> {
    fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (head, mut data) = read_bytes(payload, 2)?;
        let num_fields = u16::from_be_bytes([head[0], head[1]]) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        const TAIL_SIZE: usize = size_of::<FieldDescriptionTail>();

        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            let (tail_bytes, rest) = read_bytes(rest, TAIL_SIZE)?;
            let tail = FieldDescriptionTail::ref_from_bytes(tail_bytes)
                .map_err(|e| Error::Protocol(format!("FieldDescription tail: {e:?}")))?;
            fields.push(FieldDescription { name, tail });
            data = rest;
        }

        Ok(Self { fields })
    }

    /// Get field descriptions.
    pub fn fields(&self) -> &[FieldDescription<'a>] {
        &self.fields
    }
}

/// DataRow message - contains a single row of data.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: u16,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (head, columns_data) = read_bytes(payload, 2)?;
        Ok(Self {
            num_columns: u16::from_be_bytes([head[0], head[1]]),
            columns_data,
        })
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.num_columns as usize
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Check that the payload holds exactly `len()` well-formed values.
    ///
    /// [`iter`](Self::iter) stops early on a truncated payload; call this
    /// first where a short row must not pass for a complete one.
    pub fn validate(&self) -> Result<()> {
        let mut data = self.columns_data;
        for index in 0..self.num_columns {
            let (len, rest) = read_i32(data)
                .map_err(|_| Error::Protocol(format!("DataRow: value {} truncated", index)))?;
            data = rest;
            if len == -1 {
                continue;
            }
            let len = usize::try_from(len)
                .map_err(|_| Error::Protocol(format!("DataRow: value {} has length {}", index, len)))?;
            let (_, rest) = read_bytes(data, len)
                .map_err(|_| Error::Protocol(format!("DataRow: value {} truncated", index)))?;
            data = rest;
        }
        if !data.is_empty() {
            return Err(Error::Protocol(format!(
                "DataRow: {} trailing bytes",
                data.len()
            )));
        }
        Ok(())
    }

    /// Iterate over column values. `None` represents NULL.
    pub fn iter(&self) -> DataRowIter<'a> {
        DataRowIter {
            remaining: self.columns_data,
        }
    }
}

/// Iterator over column values in a DataRow.
#[derive(Debug, Clone)]
pub struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let len;
        (len, self.remaining) = self.remaining.split_at_checked(4)?;
        let len = i32::from_be_bytes([len[0], len[1], len[2], len[3]]);

        if len < 0 {
            return Some(None);
        }

        let value;
        (value, self.remaining) = self.remaining.split_at_checked(len as usize)?;
        Some(Some(value))
    }
}

/// CommandComplete message - indicates successful completion of a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "UPDATE 10")
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }
}

/// Parse the number of rows affected from a command tag.
pub fn rows_affected(tag: &str) -> Option<u64> {
    let parts: Vec<&str> = tag.split_whitespace().collect();

    match parts.as_slice() {
        ["INSERT", _oid, count] => count.parse().ok(),
        [
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "COPY" | "MOVE" | "FETCH",
            count,
        ] => count.parse().ok(),
        _ => None,
    }
}
