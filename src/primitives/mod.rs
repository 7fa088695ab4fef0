//! Low-level building blocks: byte encoding, file I/O, and the log file.

/// Byte buffers and variable-length integer encoding.
pub mod bytes;

/// File abstractions behind containers and the log.
pub mod io;

/// The write-ahead log file.
pub mod wal;
