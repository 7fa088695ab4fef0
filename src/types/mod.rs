#![forbid(unsafe_code)]
//! Identifiers, the error type, and the on-disk page header shared by every layer.

use std::fmt;

pub mod checksum;

pub use checksum::{frame_crc32, page_crc32, Checksum, Crc32Fast};

/// Identity of a container (one heap or index file).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ContainerKey {
    /// Segment the container lives in.
    pub segment: u32,
    /// Container number, unique within the segment.
    pub container: u64,
}

impl ContainerKey {
    /// Builds a key from a segment and container number.
    pub const fn new(segment: u32, container: u64) -> Self {
        Self { segment, container }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.segment, self.container)
    }
}

/// Identity of one page inside a container.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageKey {
    /// Owning container.
    pub container: ContainerKey,
    /// Page number within the container.
    pub page_number: u64,
}

impl PageKey {
    /// Builds a page key.
    pub const fn new(container: ContainerKey, page_number: u64) -> Self {
        Self {
            container,
            page_number,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({},{})", self.page_number, self.container)
    }
}

/// Stable identifier of a record on a page. Unlike a slot number it never shifts.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordId(pub u32);

impl RecordId {
    /// First id handed out on a freshly initialised page.
    pub const FIRST: RecordId = RecordId(6);
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log sequence number: the byte offset of a record in the log file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Encodes an optional LSN as a single integer, zero meaning none.
    ///
    /// Offset zero is always inside the log file header, so it never names a record.
    pub fn encode_opt(lsn: Option<Lsn>) -> u64 {
        lsn.map(|l| l.0).unwrap_or(0)
    }

    /// Inverse of [`Lsn::encode_opt`].
    pub fn decode_opt(raw: u64) -> Option<Lsn> {
        (raw != 0).then_some(Lsn(raw))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// What a version mismatch was found on during redo.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VersionedObject {
    /// A page, by key.
    Page(PageKey),
    /// A container, by key.
    Container(ContainerKey),
}

impl fmt::Display for VersionedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionedObject::Page(key) => write!(f, "{key}"),
            VersionedObject::Container(key) => write!(f, "Container{key}"),
        }
    }
}

/// Errors raised by the page and log layer.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Bytes on disk or in the log could not be decoded.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller passed an argument the layer cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The container could not be resolved.
    #[error("container {0} not found")]
    ContainerNotFound(ContainerKey),
    /// The page could not be resolved.
    #[error("{0} not found")]
    PageNotFound(PageKey),
    /// The target page has no room for the requested change.
    #[error("no space on {page}: need {needed} bytes, {available} available")]
    NoSpace {
        /// Page that ran out of room.
        page: PageKey,
        /// Bytes the change required.
        needed: usize,
        /// Bytes that were free.
        available: usize,
    },
    /// A record id expected on a page during undo was not there.
    #[error("record {record} not found on {page} while undoing {op}")]
    RecordNotFound {
        /// Page that was searched.
        page: PageKey,
        /// Record id being undone.
        record: RecordId,
        /// Name of the operation being undone.
        op: &'static str,
    },
    /// The live version is behind the logged version: a log record is missing.
    #[error("log corrupted, missing log record: {object} is at version {live}, log expects {logged}")]
    MissingLogRecord {
        /// Page or container carrying the version.
        object: VersionedObject,
        /// Version captured in the log record.
        logged: u64,
        /// Version found on the live object.
        live: u64,
    },
    /// Any other internal invariant violation.
    #[error("internal consistency violation: {0}")]
    Consistency(String),
    /// A latch was not immediately available.
    #[error("resource busy")]
    Busy,
    /// The transaction was used outside of its lifecycle.
    #[error("transaction state: {0}")]
    Transaction(&'static str),
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] crate::options::ConfigError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Builds a consistency error and reports it; callers must treat it as fatal.
    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(detail = %msg, "store.consistency_violation");
        StoreError::Consistency(msg)
    }
}

pub mod page {
    //! Fixed header written at the start of every page image.

    use core::convert::TryFrom;

    use super::{Lsn, Result, StoreError};

    /// Magic bytes opening every page image.
    pub const PAGE_MAGIC: [u8; 4] = *b"RSPG";
    /// Page image format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    /// Length of the fixed page header.
    pub const PAGE_HDR_LEN: usize = 48;

    pub mod header {
        //! Byte offsets for fixed header fields.
        #![allow(missing_docs)]

        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const PAGE_STATUS: usize = 7;
        pub const PAGE_SIZE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..20;
        pub const VERSION: Range<usize> = 20..28;
        pub const LAST_LSN: Range<usize> = 28..36;
        pub const BODY_LEN: Range<usize> = 36..40;
        pub const RESERVED: Range<usize> = 40..44;
        pub const CRC32: Range<usize> = 44..48;
    }

    /// Kind of page stored in a container.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Slotted page holding records.
        Stored = 1,
        /// Allocation page tracking other pages' status.
        Alloc = 2,
    }

    impl TryFrom<u8> for PageKind {
        type Error = StoreError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Stored),
                2 => Ok(PageKind::Alloc),
                _ => Err(StoreError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Kind of page.
        pub kind: PageKind,
        /// Raw page status byte.
        pub status: u8,
        /// Page size in bytes.
        pub page_size: u32,
        /// Page number.
        pub page_no: u64,
        /// Page version at the time the image was written.
        pub version: u64,
        /// LSN of the last log record applied to the page.
        pub last_lsn: Option<Lsn>,
        /// Number of body bytes following the header.
        pub body_len: u32,
        /// CRC over the whole image with this field zeroed.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Writes the header into `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(StoreError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&PAGE_FORMAT_VERSION.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind as u8;
            hdr[header::PAGE_STATUS] = self.status;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.to_be_bytes());
            hdr[header::VERSION].copy_from_slice(&self.version.to_be_bytes());
            hdr[header::LAST_LSN].copy_from_slice(&Lsn::encode_opt(self.last_lsn).to_be_bytes());
            hdr[header::BODY_LEN].copy_from_slice(&self.body_len.to_be_bytes());
            hdr[header::RESERVED].fill(0);
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Reads a header from `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(StoreError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(StoreError::Corruption("invalid page magic"));
            }
            if be_u16(&hdr[header::FORMAT_VERSION]) != PAGE_FORMAT_VERSION {
                return Err(StoreError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED].iter().any(|&b| b != 0) {
                return Err(StoreError::Corruption("page header reserved bytes not zero"));
            }
            Ok(Self {
                kind: PageKind::try_from(hdr[header::PAGE_KIND])?,
                status: hdr[header::PAGE_STATUS],
                page_size: be_u32(&hdr[header::PAGE_SIZE]),
                page_no: be_u64(&hdr[header::PAGE_NO]),
                version: be_u64(&hdr[header::VERSION]),
                last_lsn: Lsn::decode_opt(be_u64(&hdr[header::LAST_LSN])),
                body_len: be_u32(&hdr[header::BODY_LEN]),
                crc32: be_u32(&hdr[header::CRC32]),
            })
        }
    }

    /// Zeroes the CRC field so the image can be checksummed.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(StoreError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    fn be_u16(src: &[u8]) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&src[..2]);
        u16::from_be_bytes(raw)
    }

    fn be_u32(src: &[u8]) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&src[..4]);
        u32::from_be_bytes(raw)
    }

    fn be_u64(src: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&src[..8]);
        u64::from_be_bytes(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::page::{self, PageHeader, PageKind};
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        let header = PageHeader {
            kind: PageKind::Alloc,
            status: 1,
            page_size: page::DEFAULT_PAGE_SIZE,
            page_no: 42,
            version: 7,
            last_lsn: Some(Lsn(96)),
            body_len: 12,
            crc32: 0xDEADBEEF,
        };
        header.encode(&mut buf).unwrap();
        assert_eq!(PageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn clear_crc32_zeroes_field() {
        let mut buf = [0xFFu8; page::PAGE_HDR_LEN];
        page::clear_crc32(&mut buf).unwrap();
        assert!(buf[page::header::CRC32].iter().all(|&b| b == 0));
    }

    #[test]
    fn page_kind_from_u8_rejects_unknown() {
        assert!(PageKind::try_from(0).is_err());
    }

    #[test]
    fn optional_lsn_uses_zero_as_none() {
        assert_eq!(Lsn::encode_opt(None), 0);
        assert_eq!(Lsn::decode_opt(0), None);
        assert_eq!(Lsn::decode_opt(Lsn::encode_opt(Some(Lsn(33)))), Some(Lsn(33)));
    }
}
