#![forbid(unsafe_code)]
//! Records, fields, and the row logging outcome.

use crate::primitives::bytes::{buf::Cursor, var, ByteHolder};
use crate::types::{RecordId, Result, StoreError};

/// Slot-table bytes charged per record on top of its encoding.
pub const SLOT_SIZE: usize = 4;

const FIELD_NULL: u8 = 0;
const FIELD_VALUE: u8 = 1;
const FIELD_LONG: u8 = 2;

const FLAG_DELETED: u8 = 0x01;

/// One column of a stored record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    /// SQL null.
    Null,
    /// Inline bytes.
    Value(Vec<u8>),
    /// Pointer to the head of a long-column chain on overflow pages.
    Long {
        /// First page of the chain.
        page: u64,
        /// Record on that page.
        record: RecordId,
    },
}

impl Field {
    /// Convenience constructor for an inline value.
    pub fn value(bytes: impl Into<Vec<u8>>) -> Self {
        Field::Value(bytes.into())
    }

    /// Inline bytes, if any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        let mut scratch = Vec::new();
        self.encode(&mut scratch);
        scratch.len()
    }

    /// Appends the encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Field::Null => out.push(FIELD_NULL),
            Field::Value(bytes) => {
                out.push(FIELD_VALUE);
                var::put_bytes(bytes, out);
            }
            Field::Long { page, record } => {
                out.push(FIELD_LONG);
                var::encode_u64(*page, out);
                var::encode_u64(u64::from(record.0), out);
            }
        }
    }

    /// Reads one field.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        match cur.read_u8()? {
            FIELD_NULL => Ok(Field::Null),
            FIELD_VALUE => Ok(Field::Value(cur.read_bytes()?.to_vec())),
            FIELD_LONG => Ok(Field::Long {
                page: cur.read_var_u64()?,
                record: RecordId(cur.read_var_u32()?),
            }),
            _ => Err(StoreError::Corruption("unknown field tag")),
        }
    }
}

/// Encodes a run of fields with a leading count.
pub fn encode_fields(fields: &[Field], out: &mut Vec<u8>) {
    var::encode_u64(fields.len() as u64, out);
    for field in fields {
        field.encode(out);
    }
}

/// Inverse of [`encode_fields`].
pub fn decode_fields(cur: &mut Cursor<'_>) -> Result<Vec<Field>> {
    let count = cur.read_var_u64()?;
    if count > cur.remaining() as u64 {
        return Err(StoreError::Corruption("field count exceeds record"));
    }
    (0..count).map(|_| Field::decode(cur)).collect()
}

/// A record as stored in one slot of a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    /// Stable id, unique on the page.
    pub id: RecordId,
    /// Delete mark.
    pub deleted: bool,
    /// Extra bytes held back for in-place growth.
    pub reserved: u32,
    /// Columns.
    pub fields: Vec<Field>,
}

impl StoredRecord {
    /// A live record with no reserved space.
    pub fn new(id: RecordId, fields: Vec<Field>) -> Self {
        Self {
            id,
            deleted: false,
            reserved: 0,
            fields,
        }
    }

    /// Appends the record image to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        var::encode_u64(u64::from(self.id.0), out);
        out.push(if self.deleted { FLAG_DELETED } else { 0 });
        var::encode_u64(u64::from(self.reserved), out);
        encode_fields(&self.fields, out);
    }

    /// The record image as an owned buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Reads one record image.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let id = RecordId(cur.read_var_u32()?);
        let flags = cur.read_u8()?;
        if flags & !FLAG_DELETED != 0 {
            return Err(StoreError::Corruption("unknown record flags"));
        }
        let reserved = cur.read_var_u32()?;
        let fields = decode_fields(cur)?;
        Ok(Self {
            id,
            deleted: flags & FLAG_DELETED != 0,
            reserved,
            fields,
        })
    }

    /// Decodes a record image that must span all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let record = Self::decode(&mut cur)?;
        cur.finish()?;
        Ok(record)
    }

    /// Bytes this record takes on a page, reserved space and slot included.
    pub fn space_used(&self) -> usize {
        let mut scratch = Vec::new();
        self.encode(&mut scratch);
        SLOT_SIZE + scratch.len() + self.reserved as usize
    }
}

/// Partially logged row handed back when a column is too long for the page.
#[derive(Debug)]
pub struct RowResume {
    /// Encoded columns before `next_column`, ready to be reused.
    pub buffer: ByteHolder,
    /// Index of the long column.
    pub next_column: usize,
    /// Bytes left on the page after the buffered columns.
    pub remaining_space: usize,
}

/// Result of laying out a row on a page.
#[derive(Debug)]
pub enum RowLogOutcome {
    /// Every column fit.
    Complete,
    /// Columns before `next_column` were stored; the caller continues from
    /// there on another page.
    Split {
        /// First column that did not fit.
        next_column: usize,
    },
    /// A column exceeds the long-column threshold. Nothing was stored.
    LongColumn(RowResume),
}

impl RowLogOutcome {
    /// Column to continue from, or `None` when the row is complete.
    pub fn next_column(&self) -> Option<usize> {
        match self {
            RowLogOutcome::Complete => None,
            RowLogOutcome::Split { next_column } => Some(*next_column),
            RowLogOutcome::LongColumn(resume) => Some(resume.next_column),
        }
    }
}
