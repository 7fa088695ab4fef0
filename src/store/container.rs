#![forbid(unsafe_code)]
//! Containers and the registry that resolves them.
//!
//! A container file starts with one header block of `page_size` bytes; page
//! `n` lives at offset `(n + 1) * page_size`. Page 0 is always the first
//! allocation page. Pages are cached in memory once touched and written back
//! only by [`Container::flush`], after the log is forced past their last LSN.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::primitives::bytes::{buf::Cursor, var};
use crate::primitives::io::{ContainerStorage, FileIo};
use crate::primitives::wal::LogFile;
use crate::store::page::{Page, PageFormat, PageFrame, PageLatch};
use crate::types::{Checksum, ContainerKey, Crc32Fast, PageKey, Result, StoreError};

const CONTAINER_MAGIC: [u8; 4] = *b"RSCN";
const CONTAINER_FORMAT_VERSION: u16 = 1;
const FLAG_DROPPED: u8 = 0x01;

/// Segment holding regular, logged containers.
pub const DATA_SEGMENT: u32 = 0;
/// Segment holding temporary containers; emptied whenever the store opens.
pub const TEMP_SEGMENT: u32 = 1;

/// Page number of the first allocation page.
pub const FIRST_ALLOC_PAGE: u64 = 0;

/// Everything needed to recreate a container from nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateInfo {
    /// Page size in bytes.
    pub page_size: u32,
    /// Pages per allocation extent.
    pub alloc_extent_pages: u32,
    /// Long-column threshold percentage.
    pub overflow_threshold: u8,
    /// Unlogged container.
    pub temporary: bool,
}

impl CreateInfo {
    /// Appends the encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        var::encode_u64(u64::from(self.page_size), out);
        var::encode_u64(u64::from(self.alloc_extent_pages), out);
        out.push(self.overflow_threshold);
        out.push(u8::from(self.temporary));
    }

    /// Reads an encoded create info.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let info = Self {
            page_size: cur.read_var_u32()?,
            alloc_extent_pages: cur.read_var_u32()?,
            overflow_threshold: cur.read_u8()?,
            temporary: cur.read_u8()? != 0,
        };
        if info.page_size < 512 || info.alloc_extent_pages == 0 {
            return Err(StoreError::Corruption("container create info out of range"));
        }
        Ok(info)
    }
}

struct ContainerState {
    version: u64,
    dropped: bool,
    removed: bool,
    header_dirty: bool,
    /// Pages at or past this number are gone from the file even if stale
    /// images are still there.
    page_limit: Option<u64>,
    frames: BTreeMap<u64, PageFrame>,
}

/// Result of one container flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Page images written.
    pub pages_written: u64,
}

/// One open container.
pub struct Container {
    key: ContainerKey,
    info: CreateInfo,
    io: Arc<dyn FileIo>,
    state: Mutex<ContainerState>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("key", &self.key)
            .field("info", &self.info)
            .finish()
    }
}

impl Container {
    /// Writes a new container to `io`: the header at version 0 and an
    /// initialised first allocation page.
    pub fn create(key: ContainerKey, io: Arc<dyn FileIo>, info: CreateInfo) -> Result<Arc<Self>> {
        io.truncate(0)?;
        let container = Arc::new(Self {
            key,
            info,
            io,
            state: Mutex::new(ContainerState {
                version: 0,
                dropped: false,
                removed: false,
                header_dirty: false,
                page_limit: None,
                frames: BTreeMap::new(),
            }),
        });
        let mut alloc = Page::blank(PageKey::new(key, FIRST_ALLOC_PAGE), info.page_size);
        alloc.init_page(
            None,
            &PageFormat::Alloc {
                first_page: FIRST_ALLOC_PAGE + 1,
                capacity: info.alloc_extent_pages,
            },
        )?;
        container.write_header(&container.state.lock())?;
        container
            .io
            .write_at(container.page_offset(FIRST_ALLOC_PAGE), &alloc.encode_image()?)?;
        container.io.sync_all()?;
        debug!(container = %key, "container.create");
        Ok(container)
    }

    /// Opens an existing container file.
    pub fn open(key: ContainerKey, io: Arc<dyn FileIo>) -> Result<Arc<Self>> {
        let mut fixed = [0u8; 32];
        io.read_at(0, &mut fixed)?;
        if fixed[0..4] != CONTAINER_MAGIC {
            return Err(StoreError::Corruption("container magic mismatch"));
        }
        if u16::from_be_bytes([fixed[4], fixed[5]]) != CONTAINER_FORMAT_VERSION {
            return Err(StoreError::Corruption("container format version mismatch"));
        }
        let body_len = u16::from_be_bytes([fixed[6], fixed[7]]) as usize;
        let mut header = vec![0u8; 12 + body_len];
        io.read_at(0, &mut header)?;
        let mut stored_crc = [0u8; 4];
        stored_crc.copy_from_slice(&header[8..12]);
        if u32::from_be_bytes(stored_crc) != header_crc(&header) {
            return Err(StoreError::Corruption("container header crc mismatch"));
        }
        let mut cur = Cursor::new(&header[12..]);
        let flags = cur.read_u8()?;
        let version = cur.read_var_u64()?;
        let info = CreateInfo::decode(&mut cur)?;
        cur.finish()?;
        Ok(Arc::new(Self {
            key,
            info,
            io,
            state: Mutex::new(ContainerState {
                version,
                dropped: flags & FLAG_DROPPED != 0,
                removed: false,
                header_dirty: false,
                page_limit: None,
                frames: BTreeMap::new(),
            }),
        }))
    }

    fn write_header(&self, state: &ContainerState) -> Result<()> {
        let mut body = Vec::new();
        body.push(if state.dropped { FLAG_DROPPED } else { 0 });
        var::encode_u64(state.version, &mut body);
        self.info.encode(&mut body);
        let mut header = Vec::with_capacity(12 + body.len());
        header.extend_from_slice(&CONTAINER_MAGIC);
        header.extend_from_slice(&CONTAINER_FORMAT_VERSION.to_be_bytes());
        header.extend_from_slice(&(body.len() as u16).to_be_bytes());
        header.extend_from_slice(&[0u8; 4]);
        header.extend_from_slice(&body);
        let crc = header_crc(&header);
        header[8..12].copy_from_slice(&crc.to_be_bytes());
        self.io.write_at(0, &header)
    }

    /// Key of this container.
    pub fn key(&self) -> ContainerKey {
        self.key
    }

    /// Creation parameters.
    pub fn info(&self) -> CreateInfo {
        self.info
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.info.page_size
    }

    /// Temporary containers are never logged.
    pub fn is_temporary(&self) -> bool {
        self.info.temporary
    }

    /// Number of container-level operations applied.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Records one container-level change.
    pub fn bump_version(&self) {
        let mut state = self.state.lock();
        state.version += 1;
        state.header_dirty = true;
    }

    /// Dropped by a transaction, awaiting removal.
    pub fn is_dropped(&self) -> bool {
        self.state.lock().dropped
    }

    /// Sets the dropped flag.
    pub fn set_dropped(&self, dropped: bool) {
        let mut state = self.state.lock();
        state.dropped = dropped;
        state.header_dirty = true;
    }

    /// True once the file has been deleted.
    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub(crate) fn mark_removed(&self) {
        let mut state = self.state.lock();
        state.removed = true;
        state.frames.clear();
    }

    fn page_offset(&self, page_no: u64) -> u64 {
        (page_no + 1) * u64::from(self.info.page_size)
    }

    fn page_key(&self, page_no: u64) -> PageKey {
        PageKey::new(self.key, page_no)
    }

    /// Cached frame for `page_no`, loading it from the file if present.
    fn frame(&self, page_no: u64, create: bool) -> Result<Option<PageFrame>> {
        let mut state = self.state.lock();
        if state.removed {
            return Err(StoreError::ContainerNotFound(self.key));
        }
        if let Some(frame) = state.frames.get(&page_no) {
            return Ok(Some(frame.clone()));
        }
        let beyond_limit = state.page_limit.map_or(false, |limit| page_no >= limit);
        let loaded = if beyond_limit {
            None
        } else {
            self.load_page(page_no)?
        };
        let page = match (loaded, create) {
            (Some(page), _) => page,
            (None, true) => Page::blank(self.page_key(page_no), self.info.page_size),
            (None, false) => return Ok(None),
        };
        let frame = Arc::new(Mutex::new(page));
        state.frames.insert(page_no, frame.clone());
        Ok(Some(frame))
    }

    fn load_page(&self, page_no: u64) -> Result<Option<Page>> {
        let offset = self.page_offset(page_no);
        let page_size = u64::from(self.info.page_size);
        if self.io.len()? < offset + page_size {
            return Ok(None);
        }
        let mut image = vec![0u8; page_size as usize];
        self.io.read_at(offset, &mut image)?;
        // Holes left by writing a later page first read back as zeroes.
        if image.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        Page::decode_image(self.page_key(page_no), &image).map(Some)
    }

    /// Latches an existing page, waiting for the current holder.
    pub fn latch_page(&self, page_no: u64) -> Result<PageLatch> {
        let frame = self
            .frame(page_no, false)?
            .ok_or_else(|| StoreError::PageNotFound(self.page_key(page_no)))?;
        Ok(frame.lock_arc())
    }

    /// Latches a page without waiting, failing with [`StoreError::Busy`].
    pub fn try_latch_page(&self, page_no: u64) -> Result<PageLatch> {
        let frame = self
            .frame(page_no, false)?
            .ok_or_else(|| StoreError::PageNotFound(self.page_key(page_no)))?;
        frame.try_lock_arc().ok_or(StoreError::Busy)
    }

    /// Latches a page, materialising a blank invalid page if it does not exist.
    pub fn latch_or_blank(&self, page_no: u64) -> Result<PageLatch> {
        let frame = self
            .frame(page_no, true)?
            .ok_or_else(|| StoreError::PageNotFound(self.page_key(page_no)))?;
        Ok(frame.lock_arc())
    }

    /// Latches a page if it exists.
    pub fn latch_if_present(&self, page_no: u64) -> Result<Option<PageLatch>> {
        Ok(self.frame(page_no, false)?.map(|frame| frame.lock_arc()))
    }

    /// Forgets every page at or past `first_gone`. The file is cut back on
    /// the next flush; until then stale images past the cut are ignored.
    pub fn discard_pages_from(&self, first_gone: u64) {
        let mut state = self.state.lock();
        state.frames.retain(|page_no, _| *page_no < first_gone);
        state.page_limit = Some(state.page_limit.map_or(first_gone, |l| l.min(first_gone)));
        debug!(container = %self.key, first_gone, "container.discard_pages");
    }

    /// Page numbers currently cached.
    pub fn cached_pages(&self) -> Vec<u64> {
        self.state.lock().frames.keys().copied().collect()
    }

    /// Resets a temporary container to an empty first allocation page.
    pub fn truncate_unlogged(&self) -> Result<()> {
        if !self.info.temporary {
            return Err(StoreError::Invalid("only temporary containers truncate unlogged"));
        }
        self.discard_pages_from(FIRST_ALLOC_PAGE + 1);
        let mut alloc = self.latch_page(FIRST_ALLOC_PAGE)?;
        alloc.init_page(
            None,
            &PageFormat::Alloc {
                first_page: FIRST_ALLOC_PAGE + 1,
                capacity: self.info.alloc_extent_pages,
            },
        )?;
        debug!(container = %self.key, "container.truncate_unlogged");
        Ok(())
    }

    /// Writes every dirty page and the header, obeying the WAL rule: the log
    /// is forced up to a page's last LSN before the page is written.
    ///
    /// Each page is latched while it is written, so a page marked pre-dirty
    /// by an in-flight change is written only after that change lands.
    pub fn flush(&self, log: &LogFile) -> Result<FlushStats> {
        let (frames, limit, header) = {
            let mut state = self.state.lock();
            if state.removed {
                return Ok(FlushStats::default());
            }
            let frames: Vec<_> = state.frames.values().cloned().collect();
            let header = state.header_dirty;
            state.header_dirty = false;
            (frames, state.page_limit.take(), header)
        };
        if let Some(limit) = limit {
            self.io.truncate(self.page_offset(limit))?;
        }
        let mut stats = FlushStats::default();
        for frame in frames {
            let mut page = frame.lock();
            if !page.is_dirty() {
                continue;
            }
            if let Some(lsn) = page.last_lsn() {
                log.flush_to(lsn, true)?;
            }
            self.io
                .write_at(self.page_offset(page.key().page_number), &page.encode_image()?)?;
            page.mark_clean();
            stats.pages_written += 1;
        }
        if header {
            let state = self.state.lock();
            self.write_header(&state)?;
        }
        self.io.sync_all()?;
        Ok(stats)
    }
}

fn header_crc(header: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&header[..8]);
    hasher.update(&header[12..]);
    hasher.finalize()
}

/// Resolves container keys to open containers; the data factory of the store.
pub struct ContainerRegistry {
    storage: Arc<dyn ContainerStorage>,
    containers: RwLock<HashMap<ContainerKey, Arc<Container>>>,
    next_id: AtomicU64,
}

impl ContainerRegistry {
    /// Opens every container `storage` knows of. Temporary containers from a
    /// previous run are deleted.
    pub fn open(storage: Arc<dyn ContainerStorage>) -> Result<Self> {
        let mut containers = HashMap::new();
        let mut max_id = 0;
        for key in storage.list()? {
            max_id = max_id.max(key.container);
            if key.segment == TEMP_SEGMENT {
                storage.remove(key)?;
                continue;
            }
            let Some(io) = storage.open(key, false)? else {
                continue;
            };
            if io.len()? == 0 {
                // Created but never initialised before a crash.
                storage.remove(key)?;
                continue;
            }
            containers.insert(key, Container::open(key, io)?);
        }
        info!(containers = containers.len(), "container.registry.open");
        Ok(Self {
            storage,
            containers: RwLock::new(containers),
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    /// Open container for `key`, if any.
    pub fn find(&self, key: ContainerKey) -> Option<Arc<Container>> {
        self.containers.read().get(&key).cloned()
    }

    /// Open container for `key`.
    pub fn get(&self, key: ContainerKey) -> Result<Arc<Container>> {
        self.find(key).ok_or(StoreError::ContainerNotFound(key))
    }

    /// Reserves a key no container has used.
    pub fn allocate_key(&self, temporary: bool) -> ContainerKey {
        let segment = if temporary { TEMP_SEGMENT } else { DATA_SEGMENT };
        ContainerKey::new(segment, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Creates a container under a fresh key.
    pub fn create(&self, info: CreateInfo) -> Result<Arc<Container>> {
        self.create_at(self.allocate_key(info.temporary), info)
    }

    /// Creates a container under `key`, replacing any file already there.
    pub fn create_at(&self, key: ContainerKey, info: CreateInfo) -> Result<Arc<Container>> {
        let io = self
            .storage
            .open(key, true)?
            .ok_or(StoreError::ContainerNotFound(key))?;
        let container = Container::create(key, io, info)?;
        self.next_id.fetch_max(key.container + 1, Ordering::SeqCst);
        self.containers.write().insert(key, container.clone());
        Ok(container)
    }

    /// Deletes the container's file and forgets it. Missing containers are
    /// not an error.
    pub fn remove(&self, key: ContainerKey) -> Result<()> {
        let removed = self.containers.write().remove(&key);
        if let Some(container) = removed {
            container.mark_removed();
        }
        self.storage.remove(key)?;
        debug!(container = %key, "container.remove");
        Ok(())
    }

    /// Every open container.
    pub fn all(&self) -> Vec<Arc<Container>> {
        let mut all: Vec<_> = self.containers.read().values().cloned().collect();
        all.sort_by_key(|c| c.key());
        all
    }
}
