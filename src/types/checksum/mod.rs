#![forbid(unsafe_code)]
//! CRC32 helpers for page images and log frames.

use super::ContainerKey;

/// Incremental checksum over a byte stream.
pub trait Checksum {
    /// Clears the accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a page image, salted with the page's identity so that an image
/// written at the wrong offset or into the wrong container is rejected.
pub fn page_crc32(container: ContainerKey, page_no: u64, image: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&container.segment.to_be_bytes());
    hasher.update(&container.container.to_be_bytes());
    hasher.update(&page_no.to_be_bytes());
    hasher.update(image);
    hasher.finalize()
}

/// Checksum of a log frame payload, chained on the frame's own offset.
pub fn frame_crc32(lsn: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&lsn.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
