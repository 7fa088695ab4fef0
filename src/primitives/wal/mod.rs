#![forbid(unsafe_code)]
//! Append-only write-ahead log file.
//!
//! The file opens with a 32-byte header, followed by frames laid out as
//! `[len u32][crc u32][payload]`. A record's LSN is the byte offset of its
//! frame, so LSNs grow monotonically and a record can be read back directly.
//! Appended frames stay in an in-memory tail until [`LogFile::flush_to`] writes
//! them; anything not flushed is lost on a crash.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{frame_crc32, Checksum, Crc32Fast, Lsn, Result, StoreError};

const LOG_MAGIC: [u8; 4] = *b"RSLG";
const LOG_FORMAT_VERSION: u16 = 1;
/// Length of the file header; the first record lives at this offset.
pub const LOG_HEADER_LEN: u64 = 32;
const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_PAYLOAD: u32 = 64 << 20;

/// Counters describing log activity since open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Records appended.
    pub records_appended: u64,
    /// Payload plus framing bytes appended.
    pub bytes_appended: u64,
    /// Writes of the buffered tail to the file.
    pub flushes: u64,
    /// fsync calls.
    pub syncs: u64,
    /// Bytes dropped from a torn tail when the log was opened.
    pub torn_bytes_discarded: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; LOG_HEADER_LEN as usize] {
        let mut buf = [0u8; LOG_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        let crc = header_crc(&buf);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; LOG_HEADER_LEN as usize]) -> Result<Self> {
        if src[0..4] != LOG_MAGIC {
            return Err(StoreError::Corruption("log magic mismatch"));
        }
        if u16::from_be_bytes([src[4], src[5]]) != LOG_FORMAT_VERSION {
            return Err(StoreError::Corruption("log format version mismatch"));
        }
        let mut crc_raw = [0u8; 4];
        crc_raw.copy_from_slice(&src[28..32]);
        if u32::from_be_bytes(crc_raw) != header_crc(src) {
            return Err(StoreError::Corruption("log header crc mismatch"));
        }
        let mut salt = [0u8; 8];
        salt.copy_from_slice(&src[8..16]);
        Ok(Self {
            salt: u64::from_be_bytes(salt),
        })
    }
}

fn header_crc(buf: &[u8; LOG_HEADER_LEN as usize]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&buf[..28]);
    hasher.finalize()
}

struct LogState {
    /// Bytes `[LOG_HEADER_LEN, durable_end)` are in the file.
    durable_end: u64,
    /// Frames appended after `durable_end`, not yet written.
    tail: Vec<u8>,
    synced_end: u64,
    stats: LogStats,
}

impl LogState {
    fn end(&self) -> u64 {
        self.durable_end + self.tail.len() as u64
    }
}

/// The write-ahead log.
pub struct LogFile {
    io: Arc<dyn FileIo>,
    header: FileHeader,
    state: Mutex<LogState>,
}

impl LogFile {
    /// Opens the log in `io`, creating a fresh header when the file is empty.
    ///
    /// An incomplete or corrupt frame at the end is treated as a torn write
    /// and cut off; every frame before it stays readable.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        let header = if len < LOG_HEADER_LEN {
            let header = FileHeader {
                salt: rand::random(),
            };
            io.write_at(0, &header.encode())?;
            io.truncate(LOG_HEADER_LEN)?;
            io.sync_all()?;
            header
        } else {
            let mut raw = [0u8; LOG_HEADER_LEN as usize];
            io.read_at(0, &mut raw)?;
            FileHeader::decode(&raw)?
        };
        let file_len = io.len()?;
        let log = Self {
            io,
            header,
            state: Mutex::new(LogState {
                durable_end: file_len,
                tail: Vec::new(),
                synced_end: file_len,
                stats: LogStats::default(),
            }),
        };
        let valid_end = log.valid_end()?;
        if valid_end < file_len {
            warn!(
                valid_end,
                file_len,
                discarded = file_len - valid_end,
                "wal.open.torn_tail"
            );
            log.io.truncate(valid_end)?;
            log.io.sync_all()?;
            let mut state = log.state.lock();
            state.durable_end = valid_end;
            state.synced_end = valid_end;
            state.stats.torn_bytes_discarded = file_len - valid_end;
        }
        Ok(log)
    }

    fn valid_end(&self) -> Result<u64> {
        let mut off = LOG_HEADER_LEN;
        loop {
            match self.read_frame(off) {
                Ok(Some((_, next))) => off = next,
                Ok(None) | Err(StoreError::Corruption(_)) => return Ok(off),
                Err(err) => return Err(err),
            }
        }
    }

    /// Appends a record, returning its LSN. The record is not durable until
    /// a flush covers it.
    pub fn append(&self, payload: &[u8]) -> Result<Lsn> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_PAYLOAD)
            .ok_or(StoreError::Invalid("log record too large"))?;
        let mut state = self.state.lock();
        let lsn = state.end();
        let crc = frame_crc32(lsn, self.header.salt, payload);
        state.tail.extend_from_slice(&len.to_be_bytes());
        state.tail.extend_from_slice(&crc.to_be_bytes());
        state.tail.extend_from_slice(payload);
        state.stats.records_appended += 1;
        state.stats.bytes_appended += (FRAME_HEADER_LEN + payload.len()) as u64;
        Ok(Lsn(lsn))
    }

    /// Writes every buffered frame up to and including `lsn` to the file,
    /// then fsyncs if `sync` is set.
    pub fn flush_to(&self, lsn: Lsn, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        if lsn.0 >= state.durable_end && !state.tail.is_empty() {
            let tail = std::mem::take(&mut state.tail);
            if let Err(err) = self.io.write_at(state.durable_end, &tail) {
                state.tail = tail;
                return Err(err);
            }
            state.durable_end += tail.len() as u64;
            state.stats.flushes += 1;
            debug!(durable_end = state.durable_end, "wal.flush");
        }
        if sync && state.synced_end < state.durable_end.min(lsn.0.saturating_add(1)) {
            self.io.sync_all()?;
            state.synced_end = state.durable_end;
            state.stats.syncs += 1;
        }
        Ok(())
    }

    /// Flushes everything appended so far.
    pub fn flush_all(&self, sync: bool) -> Result<()> {
        let end = self.end_lsn();
        self.flush_to(end, sync)
    }

    /// LSN the next append will receive.
    pub fn end_lsn(&self) -> Lsn {
        Lsn(self.state.lock().end())
    }

    /// Everything below this offset is in the file.
    pub fn durable_lsn(&self) -> Lsn {
        Lsn(self.state.lock().durable_end)
    }

    /// Reads the record at `lsn`.
    pub fn read(&self, lsn: Lsn) -> Result<Vec<u8>> {
        self.read_frame(lsn.0)?
            .map(|(payload, _)| payload)
            .ok_or(StoreError::Corruption("log record missing"))
    }

    /// Iterates records from the first one onwards.
    pub fn scan(&self) -> LogScan<'_> {
        LogScan {
            log: self,
            next: LOG_HEADER_LEN,
        }
    }

    /// Counters since open.
    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }

    /// Reads the frame at `off`, returning its payload and the next offset,
    /// or `None` at the end of the log.
    fn read_frame(&self, off: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        let payload = {
            let state = self.state.lock();
            if off >= state.end() {
                return Ok(None);
            }
            if off < LOG_HEADER_LEN {
                return Err(StoreError::Corruption("lsn inside log header"));
            }
            if off >= state.durable_end {
                let start = (off - state.durable_end) as usize;
                let frame = state
                    .tail
                    .get(start..start + FRAME_HEADER_LEN)
                    .ok_or(StoreError::Corruption("log frame truncated"))?;
                head.copy_from_slice(frame);
                let len = frame_len(&head)?;
                let body = start + FRAME_HEADER_LEN;
                state
                    .tail
                    .get(body..body + len)
                    .ok_or(StoreError::Corruption("log frame truncated"))?
                    .to_vec()
            } else {
                if off + FRAME_HEADER_LEN as u64 > state.durable_end {
                    return Err(StoreError::Corruption("log frame truncated"));
                }
                self.io.read_at(off, &mut head)?;
                let len = frame_len(&head)?;
                let body = off + FRAME_HEADER_LEN as u64;
                if body + len as u64 > state.durable_end {
                    return Err(StoreError::Corruption("log frame truncated"));
                }
                let mut payload = vec![0u8; len];
                self.io.read_at(body, &mut payload)?;
                payload
            }
        };
        let stored_crc = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        if stored_crc != frame_crc32(off, self.header.salt, &payload) {
            return Err(StoreError::Corruption("log frame crc mismatch"));
        }
        let next = off + (FRAME_HEADER_LEN + payload.len()) as u64;
        Ok(Some((payload, next)))
    }
}

fn frame_len(head: &[u8; FRAME_HEADER_LEN]) -> Result<usize> {
    let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    if len > MAX_FRAME_PAYLOAD {
        return Err(StoreError::Corruption("log frame length out of range"));
    }
    Ok(len as usize)
}

/// Forward scan over the log.
pub struct LogScan<'a> {
    log: &'a LogFile,
    next: u64,
}

impl<'a> LogScan<'a> {
    /// Returns the next record and its LSN.
    pub fn next_record(&mut self) -> Result<Option<(Lsn, Vec<u8>)>> {
        match self.log.read_frame(self.next)? {
            Some((payload, next)) => {
                let lsn = Lsn(self.next);
                self.next = next;
                Ok(Some((lsn, payload)))
            }
            None => Ok(None),
        }
    }
}
