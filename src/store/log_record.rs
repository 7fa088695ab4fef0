#![forbid(unsafe_code)]
//! Transaction log records.
//!
//! Every payload appended to the log starts with a kind byte, the owning
//! transaction, and the LSN of that transaction's previous record (zero for
//! none). Operation records carry their optional data after the operation;
//! compensation records carry the LSN they undo and the next LSN still to be
//! undone.

use crate::primitives::bytes::{buf::Cursor, var};
use crate::store::ops::Operation;
use crate::types::{Lsn, Result, StoreError, TxnId};

const KIND_BEGIN: u8 = 1;
const KIND_OP: u8 = 2;
const KIND_CLR: u8 = 3;
const KIND_END: u8 = 4;

/// Body of a decoded log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogBody {
    /// First record of a transaction.
    Begin,
    /// An undoable operation and its optional data.
    Op {
        /// The operation.
        op: Operation,
        /// Optional data handed to `do_me` and `undo_me`.
        data: Vec<u8>,
    },
    /// A compensation record.
    Clr {
        /// The compensation operation, without its undone operation attached.
        op: Operation,
        /// Record this one compensates.
        undone: Lsn,
        /// Next record of the transaction still to be undone.
        undo_next: Option<Lsn>,
    },
    /// Last record of a transaction.
    End {
        /// Whether the transaction rolled back.
        aborted: bool,
    },
}

/// One decoded log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Owning transaction.
    pub txn: TxnId,
    /// Previous record of the same transaction.
    pub prev: Option<Lsn>,
    /// Record payload.
    pub body: LogBody,
}

fn header(kind: u8, txn: TxnId, prev: Option<Lsn>) -> Vec<u8> {
    let mut out = vec![kind];
    var::encode_u64(txn.0, &mut out);
    var::encode_u64(Lsn::encode_opt(prev), &mut out);
    out
}

/// Encodes a `Begin` record.
pub fn encode_begin(txn: TxnId) -> Vec<u8> {
    header(KIND_BEGIN, txn, None)
}

/// Encodes an operation record.
pub fn encode_op(txn: TxnId, prev: Option<Lsn>, op: &Operation, data: &[u8]) -> Vec<u8> {
    let mut out = header(KIND_OP, txn, prev);
    op.encode(&mut out);
    var::put_bytes(data, &mut out);
    out
}

/// Encodes a compensation record.
pub fn encode_clr(
    txn: TxnId,
    prev: Option<Lsn>,
    clr: &Operation,
    undone: Lsn,
    undo_next: Option<Lsn>,
) -> Vec<u8> {
    let mut out = header(KIND_CLR, txn, prev);
    clr.encode(&mut out);
    var::encode_u64(undone.0, &mut out);
    var::encode_u64(Lsn::encode_opt(undo_next), &mut out);
    out
}

/// Encodes an `End` record.
pub fn encode_end(txn: TxnId, prev: Option<Lsn>, aborted: bool) -> Vec<u8> {
    let mut out = header(KIND_END, txn, prev);
    out.push(u8::from(aborted));
    out
}

impl LogRecord {
    /// Decodes a payload read from the log.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(payload);
        let kind = cur.read_u8()?;
        let txn = TxnId(cur.read_var_u64()?);
        let prev = Lsn::decode_opt(cur.read_var_u64()?);
        let body = match kind {
            KIND_BEGIN => LogBody::Begin,
            KIND_OP => {
                let op = Operation::decode(&mut cur)?;
                let data = cur.read_bytes()?.to_vec();
                LogBody::Op { op, data }
            }
            KIND_CLR => {
                let op = Operation::decode(&mut cur)?;
                let undone = Lsn::decode_opt(cur.read_var_u64()?)
                    .ok_or(StoreError::Corruption("compensation record without undone lsn"))?;
                let undo_next = Lsn::decode_opt(cur.read_var_u64()?);
                LogBody::Clr {
                    op,
                    undone,
                    undo_next,
                }
            }
            KIND_END => LogBody::End {
                aborted: match cur.read_u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(StoreError::Corruption("bad end record flag")),
                },
            },
            _ => return Err(StoreError::Corruption("unknown log record kind")),
        };
        cur.finish()?;
        Ok(Self { txn, prev, body })
    }
}
