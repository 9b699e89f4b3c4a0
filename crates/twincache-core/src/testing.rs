//! In-memory engine and host page cache for exercising the synchronizer.
//!
//! `MemEngine` keeps each file as a byte vector plus an attribute word and
//! supports one-shot fault injection per primitive. `MemPageCache` plays the
//! host: it creates pages only when asked to fault them in or to read ahead,
//! and implements the dirty-page writeback walk.
//!
//! # Usage
//!
//! ```ignore
//! use twincache_core::testing::{MemEngine, MemPageCache};
//!
//! let engine = Arc::new(MemEngine::new(4096));
//! let cache = Arc::new(MemPageCache::new(4096));
//! let obj = FileObject::regular(1, 1000);
//! engine.create(&obj, b"hello");
//! ```

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use twincache_config::{CacheConfig, WritebackConfig};

use crate::engine::{DirEmit, DirEntry, Engine, EngineResult, MapRegion, VmFlags};
use crate::error::{Errno, Result};
use crate::flags::ZnodeFlags;
use crate::object::{Credential, FileKind, FileObject, OpenFlags, OpenMode};
use crate::page::{CachePage, Page, PageCache, WritebackControl, WritebackMode, WritepageFn};
use crate::sync::CacheSynchronizer;
use crate::uio::Uio;

/// Number of calls made to each engine primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCalls {
    pub open: usize,
    pub close: usize,
    pub read: usize,
    pub write: usize,
    pub sync: usize,
    pub readdir: usize,
    pub map_region: usize,
    pub get_pages: usize,
    pub put_page: usize,
    pub get_flags: usize,
    pub set_flags: usize,
}

#[derive(Debug, Default)]
struct Faults {
    open: Option<Errno>,
    read: Option<Errno>,
    write: Option<Errno>,
    sync: Option<Errno>,
    map: Option<Errno>,
    put_page: Option<Errno>,
    set_flags: Option<Errno>,
    /// Successful get_pages calls still allowed before failing.
    get_pages: Option<(usize, Errno)>,
}

#[derive(Debug, Default)]
struct MemFile {
    data: Vec<u8>,
    /// Logical size; bytes past `data` read as zeros.
    size: u64,
    flags: ZnodeFlags,
    entries: Vec<(String, u64, FileKind)>,
}

/// Engine holding every file in memory.
#[derive(Debug)]
pub struct MemEngine {
    page_size: usize,
    files: DashMap<u64, MemFile>,
    faults: Mutex<Faults>,
    calls: Mutex<EngineCalls>,
    last_getpages: Mutex<Vec<u64>>,
}

impl MemEngine {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            files: DashMap::new(),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(EngineCalls::default()),
            last_getpages: Mutex::new(Vec::new()),
        }
    }

    /// Create (or replace) the object's contents.
    pub fn create(&self, object: &FileObject, data: &[u8]) {
        self.files.insert(
            object.id(),
            MemFile {
                data: data.to_vec(),
                size: data.len() as u64,
                ..MemFile::default()
            },
        );
    }

    /// Set the logical size. Growing leaves a sparse zero tail.
    pub fn truncate(&self, object: &FileObject, size: u64) {
        let mut file = self.files.entry(object.id()).or_default();
        if (file.data.len() as u64) > size {
            file.data.truncate(size as usize);
        }
        file.size = size;
    }

    /// Add a directory entry to a directory object.
    pub fn add_entry(&self, dir: &FileObject, name: &str, ino: u64, kind: FileKind) {
        self.files
            .entry(dir.id())
            .or_default()
            .entries
            .push((name.to_string(), ino, kind));
    }

    /// Snapshot of the engine copy of a file.
    pub fn contents(&self, object: &FileObject) -> Vec<u8> {
        self.files
            .get(&object.id())
            .map(|f| f.data.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> EngineCalls {
        lock(&self.calls).clone()
    }

    /// Page indices of the most recent get_pages call, in the order given.
    pub fn last_getpages_order(&self) -> Vec<u64> {
        lock(&self.last_getpages).clone()
    }

    pub fn fail_next_open(&self, errno: Errno) {
        lock(&self.faults).open = Some(errno);
    }

    pub fn fail_next_read(&self, errno: Errno) {
        lock(&self.faults).read = Some(errno);
    }

    pub fn fail_next_write(&self, errno: Errno) {
        lock(&self.faults).write = Some(errno);
    }

    pub fn fail_next_sync(&self, errno: Errno) {
        lock(&self.faults).sync = Some(errno);
    }

    pub fn fail_next_map(&self, errno: Errno) {
        lock(&self.faults).map = Some(errno);
    }

    pub fn fail_next_getpages(&self, errno: Errno) {
        self.fail_getpages_after(0, errno);
    }

    /// Let `successes` get_pages calls through, then fail one.
    pub fn fail_getpages_after(&self, successes: usize, errno: Errno) {
        lock(&self.faults).get_pages = Some((successes, errno));
    }

    pub fn fail_next_putpage(&self, errno: Errno) {
        lock(&self.faults).put_page = Some(errno);
    }

    pub fn fail_next_setattr(&self, errno: Errno) {
        lock(&self.faults).set_flags = Some(errno);
    }

    fn count(&self, f: impl FnOnce(&mut EngineCalls)) {
        f(&mut lock(&self.calls));
    }

    fn take_fault(&self, f: impl FnOnce(&mut Faults) -> Option<Errno>) -> EngineResult<()> {
        match f(&mut lock(&self.faults)) {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn take_getpages_fault(&self) -> EngineResult<()> {
        let mut faults = lock(&self.faults);
        match faults.get_pages {
            Some((0, errno)) => {
                faults.get_pages = None;
                Err(errno)
            }
            Some((n, errno)) => {
                faults.get_pages = Some((n - 1, errno));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn file(&self, object: &FileObject) -> EngineResult<dashmap::mapref::one::RefMut<'_, u64, MemFile>> {
        self.files.get_mut(&object.id()).ok_or(Errno::ENOENT)
    }
}

impl Engine for MemEngine {
    fn open(
        &self,
        object: &FileObject,
        _mode: OpenMode,
        _flags: OpenFlags,
        _cred: &Credential,
    ) -> EngineResult<()> {
        self.count(|c| c.open += 1);
        self.take_fault(|f| f.open.take())?;
        self.file(object).map(|_| ())
    }

    fn close(
        &self,
        object: &FileObject,
        _flags: OpenFlags,
        _cred: &Credential,
    ) -> EngineResult<()> {
        self.count(|c| c.close += 1);
        self.file(object).map(|_| ())
    }

    fn read(
        &self,
        object: &FileObject,
        uio: &mut Uio<'_>,
        _flags: OpenFlags,
        _cred: &Credential,
    ) -> EngineResult<()> {
        self.count(|c| c.read += 1);
        self.take_fault(|f| f.read.take())?;
        let file = self.file(object)?;
        let off = uio.offset();
        if off >= file.size {
            return Ok(());
        }
        let end = file.size.min(off + uio.resid() as u64);
        let stored = file.data.len() as u64;
        let mut at = off;
        if at < stored {
            let stop = end.min(stored);
            uio.copy_out(&file.data[at as usize..stop as usize]);
            at = stop;
        }
        if at < end {
            uio.copy_out(&vec![0u8; (end - at) as usize]);
        }
        Ok(())
    }

    fn write(
        &self,
        object: &FileObject,
        uio: &mut Uio<'_>,
        _flags: OpenFlags,
        _cred: &Credential,
    ) -> EngineResult<()> {
        self.count(|c| c.write += 1);
        self.take_fault(|f| f.write.take())?;
        let mut file = self.file(object)?;
        if file.flags.contains(ZnodeFlags::IMMUTABLE) {
            return Err(Errno::EPERM);
        }
        let off = uio.offset() as usize;
        let src = uio.pending();
        let end = off + src.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[off..end].copy_from_slice(src);
        file.size = file.size.max(end as u64);
        let n = src.len();
        uio.advance(n);
        Ok(())
    }

    fn sync(&self, object: &FileObject, _datasync: bool, _cred: &Credential) -> EngineResult<()> {
        self.count(|c| c.sync += 1);
        self.take_fault(|f| f.sync.take())?;
        self.file(object).map(|_| ())
    }

    fn readdir(
        &self,
        object: &FileObject,
        cursor: &mut u64,
        emit: &mut DirEmit<'_>,
        _cred: &Credential,
    ) -> EngineResult<()> {
        self.count(|c| c.readdir += 1);
        let entries = self.file(object)?.entries.clone();
        for (i, (name, ino, kind)) in entries.into_iter().enumerate().skip(*cursor as usize) {
            let entry = DirEntry {
                name,
                ino,
                kind,
                next: i as u64 + 1,
            };
            if !emit(&entry) {
                break;
            }
            *cursor = entry.next;
        }
        Ok(())
    }

    fn map_region(
        &self,
        object: &FileObject,
        _pgoff: u64,
        _addr: u64,
        len: u64,
        flags: VmFlags,
    ) -> EngineResult<()> {
        self.count(|c| c.map_region += 1);
        self.take_fault(|f| f.map.take())?;
        let file = self.file(object)?;
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        if flags.contains(VmFlags::WRITE | VmFlags::SHARED)
            && file.flags.intersects(ZnodeFlags::IMMUTABLE | ZnodeFlags::APPENDONLY)
        {
            return Err(Errno::EPERM);
        }
        Ok(())
    }

    fn get_pages(&self, object: &FileObject, pages: &[&dyn Page]) -> EngineResult<()> {
        self.count(|c| c.get_pages += 1);
        *lock(&self.last_getpages) = pages.iter().map(|p| p.index()).collect();
        self.take_getpages_fault()?;

        let file = self.file(object)?;
        for page in pages {
            let off = page.index() as usize * self.page_size;
            let mut buf = vec![0u8; page.size()];
            if off < file.data.len() {
                let n = buf.len().min(file.data.len() - off);
                buf[..n].copy_from_slice(&file.data[off..off + n]);
            }
            page.write_at(0, &buf);
        }
        Ok(())
    }

    fn put_page(
        &self,
        object: &FileObject,
        page: &dyn Page,
        _wbc: &WritebackControl,
    ) -> EngineResult<()> {
        self.count(|c| c.put_page += 1);
        self.take_fault(|f| f.put_page.take())?;

        let mut file = self.file(object)?;
        let off = page.index() * self.page_size as u64;
        if off >= file.size {
            // Entirely past EOF: nothing to persist.
            return Ok(());
        }
        let (off, n) = (off as usize, (page.size() as u64).min(file.size - off) as usize);
        if file.data.len() < off + n {
            file.data.resize(off + n, 0);
        }
        page.read_at(0, &mut file.data[off..off + n]);
        Ok(())
    }

    fn get_attribute_flags(&self, object: &FileObject) -> EngineResult<ZnodeFlags> {
        self.count(|c| c.get_flags += 1);
        Ok(self.file(object)?.flags)
    }

    fn set_attribute_flags(&self, object: &FileObject, flags: ZnodeFlags) -> EngineResult<()> {
        self.count(|c| c.set_flags += 1);
        self.take_fault(|f| f.set_flags.take())?;
        self.file(object)?.flags = flags;
        Ok(())
    }

    fn size(&self, object: &FileObject) -> EngineResult<u64> {
        Ok(self.file(object)?.size)
    }
}

/// Host page cache fake keyed by (object id, page index).
#[derive(Debug)]
pub struct MemPageCache {
    page_size: usize,
    pages: DashMap<(u64, u64), Arc<CachePage>>,
    mappings: AtomicUsize,
    readahead_window: usize,
    stop_on_error: bool,
}

impl MemPageCache {
    pub fn new(page_size: usize) -> Self {
        let cache = CacheConfig {
            page_size,
            ..CacheConfig::default()
        };
        Self::with_config(&cache, &WritebackConfig::default())
    }

    /// Page size and readahead window from `cache`, writeback policy from
    /// `writeback`.
    pub fn with_config(cache: &CacheConfig, writeback: &WritebackConfig) -> Self {
        Self {
            page_size: cache.effective_page_size(),
            pages: DashMap::new(),
            mappings: AtomicUsize::new(0),
            readahead_window: cache.effective_readahead(),
            stop_on_error: writeback.stop_on_error,
        }
    }

    /// Number of successful mapping setups.
    pub fn mappings(&self) -> usize {
        self.mappings.load(Ordering::SeqCst)
    }

    /// Resident pages of `object`.
    pub fn page_count(&self, object: &FileObject) -> usize {
        self.pages
            .iter()
            .filter(|e| e.key().0 == object.id())
            .count()
    }

    /// Demand fault: return the uptodate page at `index`, creating and
    /// filling it if needed.
    pub fn fault<E: Engine + ?Sized>(
        &self,
        sync: &CacheSynchronizer<E, MemPageCache>,
        object: &FileObject,
        index: u64,
    ) -> Result<Arc<CachePage>> {
        let (page, created) = match self.pages.entry((object.id(), index)) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let page = Arc::new(CachePage::new_locked(index, self.page_size));
                e.insert(Arc::clone(&page));
                (page, true)
            }
        };

        if !created {
            page.lock();
            if page.is_uptodate() {
                page.unlock();
                return Ok(page);
            }
        }

        sync.populate_page(object, &page)?;
        Ok(page)
    }

    /// Read ahead `range` one window at a time. In each window every page
    /// not yet resident is created locked and the batch is handed over in
    /// host (reverse) order. A failed window ends the readahead; later
    /// windows are never created.
    pub fn readahead<E: Engine + ?Sized>(
        &self,
        sync: &CacheSynchronizer<E, MemPageCache>,
        object: &FileObject,
        range: Range<u64>,
    ) -> Result<usize> {
        let window = self.readahead_window as u64;
        let mut added = 0;
        let mut start = range.start;
        while start < range.end {
            let end = range.end.min(start.saturating_add(window));
            let mut batch = Vec::new();
            for index in start..end {
                if let Entry::Vacant(e) = self.pages.entry((object.id(), index)) {
                    let page = Arc::new(CachePage::new_locked(index, self.page_size));
                    e.insert(Arc::clone(&page));
                    batch.push(page);
                }
            }
            batch.reverse();
            sync.populate_pages(object, &batch)?;
            added += batch.len();
            start = end;
        }
        Ok(added)
    }

    /// CPU store through the mapping into a resident page; marks it dirty.
    /// Returns false if the page is not resident.
    pub fn store(&self, object: &FileObject, index: u64, offset: usize, bytes: &[u8]) -> bool {
        match self.find_page(object, index) {
            Some(page) => {
                page.write_at(offset, bytes);
                page.set_dirty();
                true
            }
            None => false,
        }
    }
}

impl PageCache for MemPageCache {
    type Page = CachePage;

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn setup_mapping(&self, _object: &FileObject, _region: &MapRegion) -> Result<()> {
        self.mappings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn find_page(&self, object: &FileObject, index: u64) -> Option<Arc<CachePage>> {
        self.pages
            .get(&(object.id(), index))
            .map(|e| Arc::clone(e.value()))
    }

    fn write_cache_pages(
        &self,
        object: &FileObject,
        wbc: &WritebackControl,
        writepage: &mut WritepageFn<'_, CachePage>,
    ) -> Result<()> {
        let mut dirty: Vec<Arc<CachePage>> = self
            .pages
            .iter()
            .filter(|e| e.key().0 == object.id())
            .map(|e| Arc::clone(e.value()))
            .filter(|p| p.is_dirty() && wbc.covers(p.index(), self.page_size))
            .collect();
        dirty.sort_by_key(|p| p.index());

        let mut written = 0;
        let mut first_err = None;
        for page in dirty {
            if written >= wbc.nr_to_write {
                break;
            }
            match wbc.mode {
                WritebackMode::Background => {
                    if !page.try_lock() {
                        continue;
                    }
                }
                WritebackMode::All => page.lock(),
            }
            if !page.is_dirty() {
                page.unlock();
                continue;
            }
            page.clear_dirty();

            match writepage(&page) {
                Ok(()) => written += 1,
                Err(err) => {
                    // Keep it for the next pass.
                    page.set_dirty();
                    first_err.get_or_insert(err);
                    if self.stop_on_error {
                        break;
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
