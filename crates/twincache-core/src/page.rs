//! Host page cache primitives.
//!
//! A page is the fixed-size unit of the OS-managed cache that backs mapped
//! access. The host owns page lifetime and locking; this crate only drives
//! state transitions through the [`Page`] capability and asks the host for
//! resident pages through [`PageCache`].
//!
//! ## Locking Context
//!
//! Whoever holds a page's lock owns its contents. Engine calls made by the
//! synchronizer always run with the page lock held and no other lock taken.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::engine::MapRegion;
use crate::error::Result;
use crate::object::FileObject;

/// Per-page state operations provided by the host.
pub trait Page: Send + Sync {
    /// Page index within the file, in page-size units.
    fn index(&self) -> u64;

    /// Size of the page in bytes.
    fn size(&self) -> usize;

    /// Block until the page lock is acquired.
    fn lock(&self);

    /// Acquire the lock only if it is free.
    fn try_lock(&self) -> bool;

    fn unlock(&self);
    fn is_locked(&self) -> bool;

    fn set_uptodate(&self);
    fn clear_uptodate(&self);
    fn is_uptodate(&self) -> bool;

    fn set_error(&self);
    fn clear_error(&self);
    fn has_error(&self) -> bool;

    fn set_dirty(&self);
    fn clear_dirty(&self);
    fn is_dirty(&self) -> bool;

    /// Make CPU-written page contents visible to other mappings.
    fn flush_dcache(&self);

    /// Copy page bytes starting at `offset` into `dst`; returns bytes copied.
    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize;

    /// Copy `src` into the page starting at `offset`; returns bytes copied.
    fn write_at(&self, offset: usize, src: &[u8]) -> usize;
}

/// Writeback sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritebackMode {
    /// Background pass: skip pages that are busy.
    #[default]
    Background,
    /// Integrity pass: wait for every dirty page (fsync).
    All,
}

/// Host-supplied description of a flush request, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritebackControl {
    pub mode: WritebackMode,
    /// Maximum number of pages to write in this pass.
    pub nr_to_write: usize,
    /// First byte of the range to flush.
    pub range_start: u64,
    /// Last byte (inclusive) of the range to flush.
    pub range_end: u64,
}

impl Default for WritebackControl {
    fn default() -> Self {
        Self {
            mode: WritebackMode::Background,
            nr_to_write: usize::MAX,
            range_start: 0,
            range_end: u64::MAX,
        }
    }
}

impl WritebackControl {
    /// Flush everything, waiting on busy pages.
    pub fn sync_all() -> Self {
        Self {
            mode: WritebackMode::All,
            ..Self::default()
        }
    }

    /// Whether the page with `index` falls in the requested byte range.
    pub fn covers(&self, index: u64, page_size: usize) -> bool {
        let start = index.saturating_mul(page_size as u64);
        let end = start.saturating_add(page_size as u64 - 1);
        start <= self.range_end && end >= self.range_start
    }
}

/// Callback invoked for each dirty page during a writeback walk. The page is
/// locked and its dirty bit already cleared; the callback must unlock it.
pub type WritepageFn<'a, P> = dyn FnMut(&P) -> Result<()> + 'a;

/// Host page cache services used by the synchronizer and the write path.
pub trait PageCache: Send + Sync {
    type Page: Page + 'static;

    fn page_size(&self) -> usize;

    /// Host page-table setup for a region the engine already accepted.
    fn setup_mapping(&self, object: &FileObject, region: &MapRegion) -> Result<()>;

    /// Resident page lookup. Never creates a page.
    fn find_page(&self, object: &FileObject, index: u64) -> Option<Arc<Self::Page>>;

    /// Walk the object's dirty pages covered by `wbc`, lock each, clear its
    /// dirty bit and hand it to `writepage`. Whether a failure ends the walk
    /// is host policy.
    fn write_cache_pages(
        &self,
        object: &FileObject,
        wbc: &WritebackControl,
        writepage: &mut WritepageFn<'_, Self::Page>,
    ) -> Result<()>;
}

const PG_UPTODATE: u8 = 1 << 0;
const PG_ERROR: u8 = 1 << 1;
const PG_DIRTY: u8 = 1 << 2;

/// In-memory page with a blocking lock, state bits and a byte buffer.
#[derive(Debug)]
pub struct CachePage {
    index: u64,
    locked: Mutex<bool>,
    unlocked: Condvar,
    state: AtomicU8,
    data: Mutex<Vec<u8>>,
    unlocks: AtomicUsize,
    dcache_flushes: AtomicUsize,
}

impl CachePage {
    /// A zeroed, unlocked page.
    pub fn new(index: u64, size: usize) -> Self {
        Self {
            index,
            locked: Mutex::new(false),
            unlocked: Condvar::new(),
            state: AtomicU8::new(0),
            data: Mutex::new(vec![0u8; size]),
            unlocks: AtomicUsize::new(0),
            dcache_flushes: AtomicUsize::new(0),
        }
    }

    /// A page as the host creates it on first touch: present and locked.
    pub fn new_locked(index: u64, size: usize) -> Self {
        let page = Self::new(index, size);
        *page.locked.lock().unwrap_or_else(|e| e.into_inner()) = true;
        page
    }

    /// Number of unlocks performed on this page so far.
    pub fn unlock_count(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn dcache_flush_count(&self) -> usize {
        self.dcache_flushes.load(Ordering::SeqCst)
    }

    /// Snapshot of the page contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_bit(&self, bit: u8) {
        self.state.fetch_or(bit, Ordering::SeqCst);
    }

    fn clear_bit(&self, bit: u8) {
        self.state.fetch_and(!bit, Ordering::SeqCst);
    }

    fn test_bit(&self, bit: u8) -> bool {
        self.state.load(Ordering::SeqCst) & bit != 0
    }
}

impl Page for CachePage {
    fn index(&self) -> u64 {
        self.index
    }

    fn size(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        while *locked {
            locked = self
                .unlocked
                .wait(locked)
                .unwrap_or_else(|e| e.into_inner());
        }
        *locked = true;
    }

    fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(*locked, "unlock of unlocked page {}", self.index);
        *locked = false;
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        drop(locked);
        self.unlocked.notify_one();
    }

    fn is_locked(&self) -> bool {
        *self.locked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_uptodate(&self) {
        self.set_bit(PG_UPTODATE);
    }

    fn clear_uptodate(&self) {
        self.clear_bit(PG_UPTODATE);
    }

    fn is_uptodate(&self) -> bool {
        self.test_bit(PG_UPTODATE)
    }

    fn set_error(&self) {
        self.set_bit(PG_ERROR);
    }

    fn clear_error(&self) {
        self.clear_bit(PG_ERROR);
    }

    fn has_error(&self) -> bool {
        self.test_bit(PG_ERROR)
    }

    fn set_dirty(&self) {
        self.set_bit(PG_DIRTY);
    }

    fn clear_dirty(&self) {
        self.clear_bit(PG_DIRTY);
    }

    fn is_dirty(&self) -> bool {
        self.test_bit(PG_DIRTY)
    }

    fn flush_dcache(&self) {
        // Coherent memory; only count for observability.
        self.dcache_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if offset >= data.len() {
            return 0;
        }
        let n = dst.len().min(data.len() - offset);
        dst[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if offset >= data.len() {
            return 0;
        }
        let n = src.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&src[..n]);
        n
    }
}
