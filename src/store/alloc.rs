#![forbid(unsafe_code)]
//! Allocation extents: the body of an allocation page.
//!
//! An allocation page tracks a contiguous run of pages starting at
//! `first_page`. The extent grows as pages are added; pages past its end are
//! implicitly free. Allocation pages form a forward chain when one extent is
//! full.

use core::convert::TryFrom;

use crate::primitives::bytes::{buf::Cursor, var};
use crate::types::{Result, StoreError};

/// Status of one tracked page.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AllocStatus {
    /// In use.
    Allocated = 0,
    /// Released by a transaction that has not yet committed.
    Deallocated = 1,
    /// Available for reuse.
    Free = 2,
}

impl TryFrom<u8> for AllocStatus {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AllocStatus::Allocated),
            1 => Ok(AllocStatus::Deallocated),
            2 => Ok(AllocStatus::Free),
            _ => Err(StoreError::Corruption("unknown allocation status")),
        }
    }
}

/// Status table for the pages one allocation page manages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocExtent {
    first_page: u64,
    capacity: u32,
    statuses: Vec<AllocStatus>,
    next_alloc_page: Option<u64>,
    next_alloc_offset: u64,
}

impl AllocExtent {
    /// Empty extent managing `capacity` pages from `first_page` on.
    pub fn new(first_page: u64, capacity: u32) -> Self {
        Self {
            first_page,
            capacity,
            statuses: Vec::new(),
            next_alloc_page: None,
            next_alloc_offset: 0,
        }
    }

    /// First page this extent manages.
    pub fn first_page(&self) -> u64 {
        self.first_page
    }

    /// Number of pages this extent can manage.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Pages currently inside the extent.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// True when no page has ever been tracked.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Last page number this extent may hold.
    pub fn last_managed_page(&self) -> u64 {
        self.first_page + u64::from(self.capacity) - 1
    }

    /// Whether `page` falls in this extent's range.
    pub fn manages(&self, page: u64) -> bool {
        page >= self.first_page && page <= self.last_managed_page()
    }

    /// Next allocation page in the chain.
    pub fn next_alloc_page(&self) -> Option<u64> {
        self.next_alloc_page
    }

    /// File offset of the next allocation page.
    pub fn next_alloc_offset(&self) -> u64 {
        self.next_alloc_offset
    }

    fn index(&self, page: u64) -> Result<usize> {
        if !self.manages(page) {
            return Err(StoreError::Invalid("page not managed by this allocation page"));
        }
        Ok((page - self.first_page) as usize)
    }

    /// Status of `page`; pages past the extent's end are free.
    pub fn status(&self, page: u64) -> Result<AllocStatus> {
        let idx = self.index(page)?;
        Ok(self.statuses.get(idx).copied().unwrap_or(AllocStatus::Free))
    }

    /// Sets `page` to `status`, growing the extent if needed. Returns the
    /// previous status.
    pub fn set_status(&mut self, page: u64, status: AllocStatus) -> Result<AllocStatus> {
        let idx = self.index(page)?;
        if idx >= self.statuses.len() {
            self.statuses.resize(idx + 1, AllocStatus::Free);
        }
        let prev = self.statuses[idx];
        self.statuses[idx] = status;
        Ok(prev)
    }

    /// First free page, extending the extent when every tracked page is in
    /// use. Returns `None` when the extent is full.
    pub fn find_free(&self) -> Option<u64> {
        if let Some(idx) = self.statuses.iter().position(|s| *s == AllocStatus::Free) {
            return Some(self.first_page + idx as u64);
        }
        (self.statuses.len() < self.capacity as usize)
            .then(|| self.first_page + self.statuses.len() as u64)
    }

    /// Pages whose status is `status`.
    pub fn pages_with(&self, status: AllocStatus) -> impl Iterator<Item = u64> + '_ {
        self.statuses
            .iter()
            .enumerate()
            .filter(move |(_, s)| **s == status)
            .map(move |(idx, _)| self.first_page + idx as u64)
    }

    /// Relative index of the highest page that is not free, or -1.
    pub fn highest_in_use(&self) -> i64 {
        self.statuses
            .iter()
            .rposition(|s| *s != AllocStatus::Free)
            .map(|idx| idx as i64)
            .unwrap_or(-1)
    }

    /// Relative index of the last page in the extent, or -1 when empty.
    pub fn highest_page(&self) -> i64 {
        self.statuses.len() as i64 - 1
    }

    /// Links the next allocation page.
    pub fn chain(&mut self, next_page: u64, next_offset: u64) {
        self.next_alloc_page = Some(next_page);
        self.next_alloc_offset = next_offset;
    }

    /// Removes the forward link.
    pub fn unchain(&mut self) {
        self.next_alloc_page = None;
        self.next_alloc_offset = 0;
    }

    /// Checks that [`AllocExtent::compress`] would succeed. Returns the
    /// number of pages kept.
    pub fn check_compress(&self, new_highest: i64, truncated: u64) -> Result<usize> {
        let keep = usize::try_from(new_highest + 1)
            .map_err(|_| StoreError::Invalid("compress below -1"))?;
        if keep as u64 + truncated != self.statuses.len() as u64 {
            return Err(StoreError::consistency(format!(
                "compress of {} + {} pages does not match extent of {}",
                keep,
                truncated,
                self.statuses.len()
            )));
        }
        if self.statuses[keep..].iter().any(|s| *s != AllocStatus::Free) {
            return Err(StoreError::consistency(
                "compress would truncate a page that is not free",
            ));
        }
        Ok(keep)
    }

    /// Cuts `truncated` trailing pages, leaving `new_highest` (relative,
    /// -1 for none) as the last page.
    pub fn compress(&mut self, new_highest: i64, truncated: u64) -> Result<()> {
        let keep = self.check_compress(new_highest, truncated)?;
        self.statuses.truncate(keep);
        Ok(())
    }

    /// Restores the extent to `new_highest + 1 + truncated` pages. The
    /// restored pages are free; their contents are not brought back.
    pub fn undo_compress(&mut self, new_highest: i64, truncated: u64) -> Result<()> {
        let keep = usize::try_from(new_highest + 1)
            .map_err(|_| StoreError::Invalid("compress below -1"))?;
        let restored = keep + truncated as usize;
        if restored > self.capacity as usize {
            return Err(StoreError::consistency("undo compress beyond extent capacity"));
        }
        if self.statuses.len() < restored {
            self.statuses.resize(restored, AllocStatus::Free);
        }
        Ok(())
    }

    /// Appends the extent encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        var::encode_u64(self.first_page, out);
        var::encode_u64(u64::from(self.capacity), out);
        var::encode_u64(self.next_alloc_page.unwrap_or(0), out);
        var::encode_u64(self.next_alloc_offset, out);
        var::encode_u64(self.statuses.len() as u64, out);
        out.extend(self.statuses.iter().map(|s| *s as u8));
    }

    /// Reads an extent.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let first_page = cur.read_var_u64()?;
        let capacity = cur.read_var_u32()?;
        let next = cur.read_var_u64()?;
        let next_alloc_offset = cur.read_var_u64()?;
        let len = cur.read_var_u64()?;
        if len > u64::from(capacity) {
            return Err(StoreError::Corruption("allocation extent longer than capacity"));
        }
        let statuses = cur
            .take(len as usize)?
            .iter()
            .map(|b| AllocStatus::try_from(*b))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            first_page,
            capacity,
            statuses,
            // Page 0 is always the first allocation page, never a successor.
            next_alloc_page: (next != 0).then_some(next),
            next_alloc_offset,
        })
    }
}
