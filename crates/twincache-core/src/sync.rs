//! Dual cache synchronizer.
//!
//! Plain read/write traffic is served by the engine's own cache. Memory
//! mapped access needs the host page cache, so a mapped file is cached
//! twice and the two copies are kept in step:
//!
//! - Pages enter the host cache only when the host faults them in
//!   ([`CacheSynchronizer::populate_page`] / [`CacheSynchronizer::populate_pages`]).
//!   Read and write never create pages.
//! - A write updates the engine and then every page of the written range
//!   that is already resident ([`CacheSynchronizer::update_pages`]).
//! - A read of a mapped file prefers resident uptodate pages over the
//!   engine copy, since stores through the mapping land in the page first
//!   ([`CacheSynchronizer::overlay_resident`]).
//! - Pages dirtied through the mapping reach the engine via writeback
//!   ([`CacheSynchronizer::flush_page`] / [`CacheSynchronizer::flush_range`]).
//!
//! Every populate or flush call unlocks each page it was handed exactly
//! once, whatever the engine returns.

use std::sync::Arc;

use twincache_config::{log_sync_debug, log_sync_warn};

use crate::engine::{Engine, EngineResult, MapRegion};
use crate::error::Result;
use crate::object::FileObject;
use crate::page::{Page, PageCache, WritebackControl};

pub struct CacheSynchronizer<E: ?Sized, C> {
    engine: Arc<E>,
    cache: Arc<C>,
}

impl<E, C> CacheSynchronizer<E, C>
where
    E: Engine + ?Sized,
    C: PageCache,
{
    pub fn new(engine: Arc<E>, cache: Arc<C>) -> Self {
        Self { engine, cache }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Register a mapping with the engine, set it up in the host and mark
    /// the object mapped. An engine refusal stops before host setup.
    pub fn establish_mapping(&self, object: &FileObject, region: &MapRegion) -> Result<()> {
        self.engine
            .map_region(object, region.pgoff, region.start, region.len(), region.flags)?;
        self.cache.setup_mapping(object, region)?;
        object.mark_mapped();

        log_sync_debug!(
            "Mapping established",
            object = object.id(),
            pgoff = region.pgoff,
            len = region.len()
        );
        Ok(())
    }

    /// Fill one locked, not-uptodate page from the engine and unlock it.
    pub fn populate_page(&self, object: &FileObject, page: &C::Page) -> Result<()> {
        debug_assert!(page.is_locked());

        let result = self.engine.get_pages(object, &[page as &dyn Page]);
        if let Err(errno) = result {
            log_sync_warn!(
                "Page fill failed",
                object = object.id(),
                index = page.index(),
                errno = errno.code()
            );
        }
        finish_page_io(page, &result);
        result.map_err(Into::into)
    }

    /// Fill a readahead batch. `pages` is in host order, which is the
    /// reverse of file order; all pages are locked.
    ///
    /// The whole batch goes to the engine in one call, in file order. On
    /// failure every page is marked error and all of them are unlocked
    /// before the error is returned.
    pub fn populate_pages(&self, object: &FileObject, pages: &[Arc<C::Page>]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let forward: Vec<&dyn Page> = pages
            .iter()
            .rev()
            .map(|p| p.as_ref() as &dyn Page)
            .collect();

        let result = self.engine.get_pages(object, &forward);
        if let Err(errno) = result {
            log_sync_warn!(
                "Readahead fill failed, releasing batch",
                object = object.id(),
                pages = forward.len(),
                errno = errno.code()
            );
        } else {
            log_sync_debug!("Readahead filled", object = object.id(), pages = forward.len());
        }

        for &page in &forward {
            finish_page_io(page, &result);
        }
        result.map_err(Into::into)
    }

    /// Write one locked page back to the engine and unlock it.
    pub fn flush_page(
        &self,
        object: &FileObject,
        page: &C::Page,
        wbc: &WritebackControl,
    ) -> Result<()> {
        let result = self.engine.put_page(object, page, wbc);
        if let Err(errno) = result {
            log_sync_warn!(
                "Page writeback failed",
                object = object.id(),
                index = page.index(),
                errno = errno.code()
            );
        }
        finish_page_io(page, &result);
        result.map_err(Into::into)
    }

    /// Write back every dirty page in the range described by `wbc`.
    pub fn flush_range(&self, object: &FileObject, wbc: &WritebackControl) -> Result<()> {
        self.cache
            .write_cache_pages(object, wbc, &mut |page| self.flush_page(object, page, wbc))
    }

    /// Copy freshly written bytes into pages of `[pos, pos + data.len())`
    /// that are already resident. No page is created.
    pub fn update_pages(&self, object: &FileObject, pos: u64, data: &[u8]) -> usize {
        let mut updated = 0;
        for (index, page_off, range) in page_spans(pos, data.len(), self.cache.page_size()) {
            let Some(page) = self.cache.find_page(object, index) else {
                continue;
            };
            page.lock();
            page.write_at(page_off, &data[range]);
            page.flush_dcache();
            page.unlock();
            updated += 1;
        }

        if updated > 0 {
            log_sync_debug!(
                "Write propagated to resident pages",
                object = object.id(),
                pos = pos,
                pages = updated
            );
        }
        updated
    }

    /// Overwrite `buf` (read from the engine at `pos`) with the bytes of any
    /// resident uptodate page covering it.
    pub fn overlay_resident(&self, object: &FileObject, pos: u64, buf: &mut [u8]) -> usize {
        let mut used = 0;
        for (index, page_off, range) in page_spans(pos, buf.len(), self.cache.page_size()) {
            let Some(page) = self.cache.find_page(object, index) else {
                continue;
            };
            page.lock();
            if page.is_uptodate() {
                page.read_at(page_off, &mut buf[range]);
                used += 1;
            }
            page.unlock();
        }
        used
    }
}

/// Record the outcome of a fill or flush on the page and release it.
fn finish_page_io<P: Page + ?Sized>(page: &P, result: &EngineResult<()>) {
    if result.is_ok() {
        page.clear_error();
        page.set_uptodate();
        page.flush_dcache();
    } else {
        page.set_error();
        page.clear_uptodate();
    }
    page.unlock();
}

/// Split `[pos, pos + len)` into per-page pieces:
/// `(page index, offset within page, range within the caller's buffer)`.
fn page_spans(
    pos: u64,
    len: usize,
    page_size: usize,
) -> impl Iterator<Item = (u64, usize, std::ops::Range<usize>)> {
    let ps = page_size as u64;
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let at = pos + done as u64;
        let index = at / ps;
        let page_off = (at % ps) as usize;
        let n = (page_size - page_off).min(len - done);
        let range = done..done + n;
        done += n;
        Some((index, page_off, range))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VmFlags;
    use crate::error::{Errno, Error};
    use crate::page::CachePage;
    use crate::testing::{MemEngine, MemPageCache};

    const PS: usize = 4096;

    fn setup() -> (
        Arc<MemEngine>,
        Arc<MemPageCache>,
        CacheSynchronizer<MemEngine, MemPageCache>,
        Arc<FileObject>,
    ) {
        let engine = Arc::new(MemEngine::new(PS));
        let cache = Arc::new(MemPageCache::new(PS));
        let sync = CacheSynchronizer::new(Arc::clone(&engine), Arc::clone(&cache));
        let obj = FileObject::regular(1, 1000);
        let data: Vec<u8> = (0..PS * 4).map(|i| (i / PS) as u8 + 1).collect();
        engine.create(&obj, &data);
        (engine, cache, sync, obj)
    }

    fn region(pages: u64) -> MapRegion {
        MapRegion::new(0, 0x1000_0000, pages * PS as u64, VmFlags::READ | VmFlags::SHARED)
    }

    #[test]
    fn test_page_spans() {
        let spans: Vec<_> = page_spans(4090, 10, 4096).collect();
        assert_eq!(spans, vec![(0, 4090, 0..6), (1, 0, 6..10)]);
        assert_eq!(page_spans(0, 0, 4096).count(), 0);
    }

    #[test]
    fn test_establish_mapping_marks_object() {
        let (engine, cache, sync, obj) = setup();
        sync.establish_mapping(&obj, &region(2)).unwrap();
        assert!(obj.is_mapped());
        assert_eq!(engine.calls().map_region, 1);
        assert_eq!(cache.mappings(), 1);
    }

    #[test]
    fn test_establish_mapping_engine_refusal_skips_host() {
        let (engine, cache, sync, obj) = setup();
        engine.fail_next_map(Errno::EACCES);
        let err = sync.establish_mapping(&obj, &region(1)).unwrap_err();
        assert_eq!(err, Error::Engine(Errno::EACCES));
        assert!(!obj.is_mapped());
        assert_eq!(cache.mappings(), 0);
    }

    #[test]
    fn test_populate_page_success() {
        let (_engine, _cache, sync, obj) = setup();
        let page = CachePage::new_locked(2, PS);
        sync.populate_page(&obj, &page).unwrap();

        assert!(page.is_uptodate());
        assert!(!page.has_error());
        assert!(!page.is_locked());
        assert_eq!(page.unlock_count(), 1);
        assert_eq!(page.dcache_flush_count(), 1);
        assert!(page.contents().iter().all(|&b| b == 3));
    }

    #[test]
    fn test_populate_page_failure_marks_error_and_unlocks() {
        let (engine, _cache, sync, obj) = setup();
        engine.fail_next_getpages(Errno::EIO);
        let page = CachePage::new_locked(0, PS);
        page.set_uptodate();

        let err = sync.populate_page(&obj, &page).unwrap_err();
        assert_eq!(err, Error::Engine(Errno::EIO));
        assert!(page.has_error());
        assert!(!page.is_uptodate());
        assert_eq!(page.unlock_count(), 1);
    }

    #[test]
    fn test_populate_pages_forward_order() {
        let (engine, _cache, sync, obj) = setup();
        // host order is reverse file order
        let pages: Vec<Arc<CachePage>> = (0..3)
            .rev()
            .map(|i| Arc::new(CachePage::new_locked(i, PS)))
            .collect();

        sync.populate_pages(&obj, &pages).unwrap();

        assert_eq!(engine.last_getpages_order(), vec![0, 1, 2]);
        for page in &pages {
            assert!(page.is_uptodate());
            assert_eq!(page.unlock_count(), 1);
            assert!(page.contents().iter().all(|&b| b == page.index() as u8 + 1));
        }
    }

    #[test]
    fn test_populate_pages_batch_failure_unlocks_everything() {
        let (engine, _cache, sync, obj) = setup();
        engine.fail_next_getpages(Errno::EIO);
        let pages: Vec<Arc<CachePage>> = (0..4)
            .rev()
            .map(|i| Arc::new(CachePage::new_locked(i, PS)))
            .collect();

        let err = sync.populate_pages(&obj, &pages).unwrap_err();
        assert_eq!(err, Error::Engine(Errno::EIO));
        for page in &pages {
            assert!(!page.is_locked());
            assert_eq!(page.unlock_count(), 1);
            assert!(page.has_error());
            assert!(!page.is_uptodate());
        }
    }

    fn reverse_batch(n: u64) -> Vec<Arc<CachePage>> {
        (0..n)
            .rev()
            .map(|i| Arc::new(CachePage::new_locked(i, PS)))
            .collect()
    }

    #[test]
    fn test_populate_pages_large_batch_single_call() {
        let (engine, _cache, sync, obj) = setup();
        let pages = reverse_batch(40);

        sync.populate_pages(&obj, &pages).unwrap();
        assert_eq!(engine.calls().get_pages, 1);
        assert_eq!(engine.last_getpages_order(), (0..40).collect::<Vec<u64>>());
        assert!(pages.iter().all(|p| p.is_uptodate() && p.unlock_count() == 1));
    }

    #[test]
    fn test_populate_pages_large_batch_failure_marks_all() {
        let (engine, _cache, sync, obj) = setup();
        engine.fail_next_getpages(Errno::EIO);
        let pages = reverse_batch(40);

        let err = sync.populate_pages(&obj, &pages).unwrap_err();
        assert_eq!(err, Error::Engine(Errno::EIO));
        assert_eq!(engine.calls().get_pages, 1);
        let errored = pages.iter().filter(|p| p.has_error()).count();
        assert_eq!(errored, 40);
        assert!(pages.iter().all(|p| !p.is_uptodate()));
        assert!(pages.iter().all(|p| !p.is_locked() && p.unlock_count() == 1));
    }

    #[test]
    fn test_populate_pages_empty_batch() {
        let (engine, _cache, sync, obj) = setup();
        sync.populate_pages(&obj, &[]).unwrap();
        assert_eq!(engine.calls().get_pages, 0);
    }

    #[test]
    fn test_flush_page_success_and_failure() {
        let (engine, _cache, sync, obj) = setup();
        let page = CachePage::new_locked(1, PS);
        page.write_at(0, b"dirty bytes");

        sync.flush_page(&obj, &page, &WritebackControl::default())
            .unwrap();
        assert_eq!(&engine.contents(&obj)[PS..PS + 11], b"dirty bytes");
        assert!(page.is_uptodate());
        assert_eq!(page.unlock_count(), 1);

        engine.fail_next_putpage(Errno::ENOSPC);
        page.lock();
        let err = sync
            .flush_page(&obj, &page, &WritebackControl::default())
            .unwrap_err();
        assert_eq!(err, Error::Engine(Errno::ENOSPC));
        assert!(page.has_error());
        assert!(!page.is_uptodate());
        assert_eq!(page.unlock_count(), 2);
    }

    #[test]
    fn test_update_pages_only_touches_resident() {
        let (_engine, cache, sync, obj) = setup();
        sync.establish_mapping(&obj, &region(4)).unwrap();
        let page1 = cache.fault(&sync, &obj, 1).unwrap();

        let before = cache.page_count(&obj);
        let updated = sync.update_pages(&obj, PS as u64 - 2, b"xxyy");
        assert_eq!(updated, 1);
        assert_eq!(cache.page_count(&obj), before);
        assert_eq!(&page1.contents()[..2], b"yy");
    }

    #[test]
    fn test_overlay_prefers_uptodate_pages() {
        let (_engine, cache, sync, obj) = setup();
        sync.establish_mapping(&obj, &region(4)).unwrap();
        let page = cache.fault(&sync, &obj, 0).unwrap();
        cache.store(&obj, 0, 0, b"mmap");

        let mut buf = [1u8; 6];
        assert_eq!(sync.overlay_resident(&obj, 0, &mut buf), 1);
        assert_eq!(&buf, b"mmap\x01\x01");
        assert!(page.is_dirty());
    }
}
