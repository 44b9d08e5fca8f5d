//! Typed column values decoded from binary results.
//!
//! A [`ResultSet`] is built from a [`PgResult`] by resolving one [`Decoder`]
//! per column from its type OID and format code, then running every cell of
//! that column through it. Types without a decoder become
//! [`Value::NotImplemented`] instead of failing the row.

use crate::client::{ColumnInfo, PgResult};
use crate::error::{Error, Result};
use crate::protocol::backend::query::rows_affected;
use crate::protocol::types::{FormatCode, Oid, oid};

/// Milliseconds from the Unix epoch to 2000-01-01.
const PG_EPOCH_MILLIS: i64 = 946_684_800_000;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Amount in hundredths split as `whole` and `remainder` (`value / 100`, `value % 100`)
    Money { whole: i64, remainder: i64 },
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
    Text(Vec<u8>),
    /// The column type has no decoder
    NotImplemented,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Text value as UTF-8, if it is valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes()
            .and_then(|bytes| simdutf8::basic::from_utf8(bytes).ok())
    }

    /// Epoch milliseconds of a timestamp or date value.
    pub fn as_timestamp_millis(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ms) => Some(*ms),
            _ => None,
        }
    }

    #[cfg(feature = "with-chrono")]
    pub fn as_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.as_timestamp_millis()
            .and_then(chrono::DateTime::from_timestamp_millis)
    }
}

/// How one column's cells are turned into [`Value`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Money,
    Date,
    Timestamp,
    /// Bytes kept verbatim (text-like types and every text-format column)
    Text,
    /// jsonb: a version byte followed by the JSON text
    Jsonb,
    Unsupported,
}

impl Decoder {
    /// Pick the decoder for a column.
    pub fn resolve(type_oid: Oid, format: FormatCode) -> Self {
        if format == FormatCode::Text {
            return Decoder::Text;
        }
        match type_oid {
            oid::BOOL => Decoder::Bool,
            oid::INT2 => Decoder::Int2,
            oid::INT4 => Decoder::Int4,
            oid::INT8 => Decoder::Int8,
            oid::FLOAT4 => Decoder::Float4,
            oid::FLOAT8 => Decoder::Float8,
            oid::MONEY => Decoder::Money,
            oid::DATE => Decoder::Date,
            oid::TIMESTAMP | oid::TIMESTAMPTZ => Decoder::Timestamp,
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::JSON => Decoder::Text,
            oid::JSONB => Decoder::Jsonb,
            _ => Decoder::Unsupported,
        }
    }

    /// Decode one cell; `None` is NULL.
    #[expect(
        clippy::integer_division,
        clippy::integer_division_remainder_used,
        clippy::modulo_arithmetic,
        reason = "money splits cents and timestamps truncate microseconds toward zero"
    )]
    pub fn decode(self, bytes: Option<&[u8]>) -> Result<Value> {
        let Some(bytes) = bytes else {
            return Ok(Value::Null);
        };
        Ok(match self {
            Decoder::Bool => Value::Boolean(fixed::<1>(bytes, "bool")?[0] != 0),
            Decoder::Int2 => Value::Integer(i16::from_be_bytes(fixed(bytes, "int2")?).into()),
            Decoder::Int4 => Value::Integer(i32::from_be_bytes(fixed(bytes, "int4")?).into()),
            Decoder::Int8 => Value::Integer(i64::from_be_bytes(fixed(bytes, "int8")?)),
            Decoder::Float4 => Value::Float(f32::from_be_bytes(fixed(bytes, "float4")?).into()),
            Decoder::Float8 => Value::Float(f64::from_be_bytes(fixed(bytes, "float8")?)),
            Decoder::Money => {
                let cents = i64::from_be_bytes(fixed(bytes, "money")?);
                Value::Money {
                    whole: cents / 100,
                    remainder: cents % 100,
                }
            }
            Decoder::Date => {
                let days = i64::from(i32::from_be_bytes(fixed(bytes, "date")?));
                Value::Timestamp(days * MILLIS_PER_DAY + PG_EPOCH_MILLIS)
            }
            Decoder::Timestamp => {
                let micros = i64::from_be_bytes(fixed(bytes, "timestamp")?);
                Value::Timestamp(micros.saturating_add(PG_EPOCH_MILLIS * 1000) / 1000)
            }
            Decoder::Text => Value::Text(bytes.to_vec()),
            Decoder::Jsonb => match bytes.split_first() {
                Some((1, json)) => Value::Text(json.to_vec()),
                Some((version, _)) => {
                    return Err(Error::Decode(format!("unsupported jsonb version: {}", version)));
                }
                None => return Err(Error::Decode("empty jsonb value".into())),
            },
            Decoder::Unsupported => Value::NotImplemented,
        })
    }
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::Decode(format!("invalid {} length: {}", what, bytes.len())))
}

/// One decoded row, in column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.0[index]
    }
}

/// Decoded rows of one result, in server order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    command_tag: String,
}

impl ResultSet {
    /// Decode every row of `result`.
    pub fn from_pg(result: &PgResult) -> Result<Self> {
        let decoders: Vec<Decoder> = result
            .columns()
            .iter()
            .map(|c| Decoder::resolve(c.type_oid(), c.format()))
            .collect();

        let mut rows = Vec::with_capacity(result.len());
        for data_row in result.rows() {
            let data_row = data_row?;
            if data_row.len() != decoders.len() {
                return Err(Error::Decode(format!(
                    "row has {} values, expected {}",
                    data_row.len(),
                    decoders.len()
                )));
            }
            let values = decoders
                .iter()
                .zip(data_row.iter())
                .map(|(decoder, cell)| decoder.decode(cell))
                .collect::<Result<Vec<_>>>()?;
            if values.len() != decoders.len() {
                return Err(Error::Decode("truncated DataRow".into()));
            }
            rows.push(Row(values));
        }

        Ok(Self {
            columns: result.columns().to_vec(),
            rows,
            command_tag: result.command_tag().to_string(),
        })
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn get(&self, row: usize) -> Option<&Row> {
        self.rows.get(row)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Row count reported in the command tag, e.g. 3 for `UPDATE 3`.
    pub fn rows_affected(&self) -> Option<u64> {
        rows_affected(&self.command_tag)
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
