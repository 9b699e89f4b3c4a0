//! Host-facing file operations.
//!
//! Each entry point adapts one host callback onto the engine, the I/O vector
//! adapter, the flag translator or the cache synchronizer.

use std::sync::Arc;

use twincache_config::{log_file_debug, log_file_warn};

use crate::engine::{DirEmit, Engine, MapRegion};
use crate::error::{Error, Result};
use crate::flags;
use crate::object::{Credential, FileKind, FileHandle, FileObject, OpenFlags, OpenMode};
use crate::page::{PageCache, WritebackControl};
use crate::sync::CacheSynchronizer;
use crate::uio::{read_common, write_common, UioSeg};

/// Largest size a regular file may have to be opened without
/// `OpenFlags::LARGEFILE`.
pub const MAX_NON_LFS: u64 = (1 << 31) - 1;

/// Origin of an `llseek` offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

pub struct FileOperations<E: ?Sized, C> {
    sync: CacheSynchronizer<E, C>,
}

impl<E, C> FileOperations<E, C>
where
    E: Engine + ?Sized,
    C: PageCache,
{
    pub fn new(engine: Arc<E>, cache: Arc<C>) -> Self {
        Self {
            sync: CacheSynchronizer::new(engine, cache),
        }
    }

    pub fn synchronizer(&self) -> &CacheSynchronizer<E, C> {
        &self.sync
    }

    fn engine(&self) -> &E {
        self.sync.engine()
    }

    pub fn open(
        &self,
        object: Arc<FileObject>,
        mode: OpenMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<FileHandle> {
        if object.kind() == FileKind::Regular
            && !flags.contains(OpenFlags::LARGEFILE)
            && self.engine().size(&object)? > MAX_NON_LFS
        {
            return Err(Error::Overflow);
        }

        self.engine().open(&object, mode, flags, cred)?;
        log_file_debug!("Opened", object = object.id(), flags = flags.bits());
        Ok(FileHandle::new(object, mode, flags))
    }

    pub fn release(&self, handle: FileHandle, cred: &Credential) -> Result<()> {
        self.engine().close(&handle.object, handle.flags, cred)?;
        Ok(())
    }

    /// Read at the handle position and advance it.
    ///
    /// A mapped file may hold bytes stored through the mapping that have not
    /// been written back yet; those win over the engine copy.
    pub fn read(
        &self,
        handle: &mut FileHandle,
        buf: &mut [u8],
        cred: &Credential,
    ) -> Result<usize> {
        let object = Arc::clone(&handle.object);
        if object.is_dir() {
            return Err(Error::IsDirectory);
        }

        let pos = handle.pos;
        let n = read_common(self.engine(), &object, buf, pos, UioSeg::User, handle.flags, cred)?;
        if object.is_mapped() {
            self.sync.overlay_resident(&object, pos, &mut buf[..n]);
        }

        handle.pos = pos + n as u64;
        Ok(n)
    }

    /// Write at the handle position (or at end of file for `APPEND`) and
    /// advance it. Resident pages of a mapped file are updated before this
    /// returns.
    pub fn write(&self, handle: &mut FileHandle, buf: &[u8], cred: &Credential) -> Result<usize> {
        let object = Arc::clone(&handle.object);
        if object.is_dir() {
            return Err(Error::IsDirectory);
        }

        let pos = if handle.flags.contains(OpenFlags::APPEND) {
            self.engine().size(&object)?
        } else {
            handle.pos
        };
        let n = write_common(self.engine(), &object, buf, pos, UioSeg::User, handle.flags, cred)?;
        if object.is_mapped() {
            self.sync.update_pages(&object, pos, &buf[..n]);
        }

        handle.pos = pos + n as u64;
        Ok(n)
    }

    pub fn llseek(&self, handle: &mut FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => handle.pos,
            Whence::End => self.engine().size(&handle.object)?,
        };
        let target = i64::try_from(base)
            .ok()
            .and_then(|base| base.checked_add(offset))
            .filter(|&target| target >= 0)
            .ok_or(Error::InvalidSeek { offset })?;

        handle.pos = target as u64;
        Ok(handle.pos)
    }

    /// Write back pages dirtied through a mapping, then have the engine make
    /// the file durable.
    pub fn fsync(&self, handle: &FileHandle, datasync: bool, cred: &Credential) -> Result<()> {
        let object = &handle.object;
        if object.is_mapped() {
            self.sync.flush_range(object, &WritebackControl::sync_all())?;
        }
        self.engine().sync(object, datasync, cred)?;
        Ok(())
    }

    /// List directory entries from the handle position. The position
    /// follows the engine cursor.
    pub fn readdir(
        &self,
        handle: &mut FileHandle,
        emit: &mut DirEmit<'_>,
        cred: &Credential,
    ) -> Result<()> {
        let mut cursor = handle.pos;
        let result = self.engine().readdir(&handle.object, &mut cursor, emit, cred);
        handle.pos = cursor;
        result.map_err(Into::into)
    }

    pub fn mmap(&self, handle: &FileHandle, region: &MapRegion) -> Result<()> {
        if let Err(err) = self.sync.establish_mapping(&handle.object, region) {
            log_file_warn!(
                "Mapping refused",
                object = handle.object.id(),
                errno = err.errno().code()
            );
            return Err(err);
        }
        Ok(())
    }

    pub fn ioctl(
        &self,
        handle: &FileHandle,
        cmd: u32,
        arg: &mut u32,
        cred: &Credential,
    ) -> Result<()> {
        flags::ioctl(self.engine(), &handle.object, cmd, arg, cred)
    }

    // Address-space operations.

    pub fn readpage(&self, object: &FileObject, page: &C::Page) -> Result<()> {
        self.sync.populate_page(object, page)
    }

    pub fn readpages(&self, object: &FileObject, pages: &[Arc<C::Page>]) -> Result<()> {
        self.sync.populate_pages(object, pages)
    }

    pub fn writepage(
        &self,
        object: &FileObject,
        page: &C::Page,
        wbc: &WritebackControl,
    ) -> Result<()> {
        self.sync.flush_page(object, page, wbc)
    }

    pub fn writepages(&self, object: &FileObject, wbc: &WritebackControl) -> Result<()> {
        self.sync.flush_range(object, wbc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DirEntry, VmFlags};
    use crate::error::Errno;
    use crate::flags::{InodeFlags, FS_IOC_GETFLAGS, FS_IOC_SETFLAGS};
    use crate::page::{CachePage, Page};
    use crate::testing::{MemEngine, MemPageCache};

    const PS: usize = 4096;

    fn setup() -> (Arc<MemEngine>, Arc<MemPageCache>, FileOperations<MemEngine, MemPageCache>) {
        let engine = Arc::new(MemEngine::new(PS));
        let cache = Arc::new(MemPageCache::new(PS));
        let ops = FileOperations::new(Arc::clone(&engine), Arc::clone(&cache));
        (engine, cache, ops)
    }

    fn owner() -> Credential {
        Credential::new(1000, 1000)
    }

    fn open_file(
        engine: &MemEngine,
        ops: &FileOperations<MemEngine, MemPageCache>,
        data: &[u8],
        flags: OpenFlags,
    ) -> FileHandle {
        let obj = FileObject::regular(1, 1000);
        engine.create(&obj, data);
        ops.open(obj, OpenMode::READ | OpenMode::WRITE, flags, &owner())
            .unwrap()
    }

    fn map_all(ops: &FileOperations<MemEngine, MemPageCache>, handle: &FileHandle, pages: u64) {
        let flags = VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED;
        let region = MapRegion::new(0, 0x2000_0000, pages * PS as u64, flags);
        ops.mmap(handle, &region).unwrap();
    }

    #[test]
    fn test_write_through_to_faulted_page() {
        let (engine, cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, &vec![0u8; PS * 2], OpenFlags::empty());
        map_all(&ops, &fh, 2);

        let page = cache.fault(ops.synchronizer(), fh.object(), 0).unwrap();
        assert_eq!(engine.calls().get_pages, 1);

        assert_eq!(ops.write(&mut fh, b"0123456789", &owner()).unwrap(), 10);
        assert_eq!(&page.contents()[..10], b"0123456789");
        assert_eq!(engine.calls().get_pages, 1);
        assert!(!page.is_locked());
    }

    #[test]
    fn test_write_creates_no_pages() {
        let (engine, cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, b"", OpenFlags::empty());
        map_all(&ops, &fh, 4);

        ops.write(&mut fh, &vec![5u8; PS * 3], &owner()).unwrap();
        assert_eq!(cache.page_count(fh.object()), 0);
        assert_eq!(engine.contents(fh.object()).len(), PS * 3);
    }

    #[test]
    fn test_read_advances_by_bytes_moved() {
        let (engine, _cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, &[3u8; 1000], OpenFlags::empty());

        let mut buf = vec![0u8; 4096];
        assert_eq!(ops.read(&mut fh, &mut buf, &owner()).unwrap(), 1000);
        assert_eq!(fh.pos(), 1000);
        assert_eq!(ops.read(&mut fh, &mut buf, &owner()).unwrap(), 0);
        assert_eq!(fh.pos(), 1000);
    }

    #[test]
    fn test_mapped_read_sees_unflushed_store() {
        let (engine, cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, &[b'a'; 16], OpenFlags::empty());
        map_all(&ops, &fh, 1);
        cache.fault(ops.synchronizer(), fh.object(), 0).unwrap();
        assert!(cache.store(fh.object(), 0, 2, b"ZZ"));

        let mut buf = [0u8; 6];
        ops.read(&mut fh, &mut buf, &owner()).unwrap();
        assert_eq!(&buf, b"aaZZaa");
        assert_eq!(&engine.contents(fh.object())[..6], b"aaaaaa");
    }

    #[test]
    fn test_failed_read_keeps_position() {
        let (engine, _cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, &[1u8; 64], OpenFlags::empty());
        ops.llseek(&mut fh, 5, Whence::Set).unwrap();
        engine.fail_next_read(Errno::EIO);

        let mut buf = [0u8; 16];
        let err = ops.read(&mut fh, &mut buf, &owner()).unwrap_err();
        assert_eq!(err, Error::Engine(Errno::EIO));
        assert_eq!(fh.pos(), 5);

        assert_eq!(ops.read(&mut fh, &mut buf, &owner()).unwrap(), 16);
        assert_eq!(fh.pos(), 21);
    }

    #[test]
    fn test_failed_write_leaves_position_and_pages() {
        let (engine, cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, &[b'a'; PS], OpenFlags::empty());
        map_all(&ops, &fh, 1);
        let page = cache.fault(ops.synchronizer(), fh.object(), 0).unwrap();
        let before = page.contents();
        engine.fail_next_write(Errno::ENOSPC);

        let err = ops.write(&mut fh, b"zzzz", &owner()).unwrap_err();
        assert_eq!(err, Error::Engine(Errno::ENOSPC));
        assert_eq!(fh.pos(), 0);
        assert_eq!(page.contents(), before);
        assert_eq!(engine.contents(fh.object()), vec![b'a'; PS]);
        assert!(!page.is_locked());
    }

    #[test]
    fn test_fsync_propagates_engine_error() {
        let (engine, _cache, ops) = setup();
        let fh = open_file(&engine, &ops, b"x", OpenFlags::empty());
        engine.fail_next_sync(Errno::EIO);

        let err = ops.fsync(&fh, false, &owner()).unwrap_err();
        assert_eq!(err, Error::Engine(Errno::EIO));
        assert_eq!(engine.calls().sync, 1);
    }

    #[test]
    fn test_append_writes_at_end() {
        let (engine, _cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, b"head", OpenFlags::APPEND);
        ops.write(&mut fh, b"-tail", &owner()).unwrap();
        assert_eq!(engine.contents(fh.object()), b"head-tail");
        assert_eq!(fh.pos(), 9);
    }

    #[test]
    fn test_directory_read_rejected() {
        let (engine, _cache, ops) = setup();
        let dir = FileObject::directory(2, 1000);
        engine.create(&dir, b"");
        let mut fh = ops.open(dir, OpenMode::READ, OpenFlags::empty(), &owner()).unwrap();

        let err = ops.read(&mut fh, &mut [0u8; 8], &owner()).unwrap_err();
        assert_eq!(err, Error::IsDirectory);
    }

    #[test]
    fn test_open_large_file_requires_largefile() {
        let (engine, _cache, ops) = setup();
        let obj = FileObject::regular(3, 1000);
        engine.create(&obj, b"");
        engine.truncate(&obj, MAX_NON_LFS + 1);

        let err = ops
            .open(Arc::clone(&obj), OpenMode::READ, OpenFlags::empty(), &owner())
            .unwrap_err();
        assert_eq!(err, Error::Overflow);
        assert_eq!(engine.calls().open, 0);

        assert!(ops
            .open(obj, OpenMode::READ, OpenFlags::LARGEFILE, &owner())
            .is_ok());
    }

    #[test]
    fn test_open_propagates_engine_error() {
        let (engine, _cache, ops) = setup();
        let obj = FileObject::regular(4, 1000);
        engine.create(&obj, b"");
        engine.fail_next_open(Errno::EACCES);

        let err = ops
            .open(obj, OpenMode::READ, OpenFlags::empty(), &owner())
            .unwrap_err();
        assert_eq!(err, Error::Engine(Errno::EACCES));
    }

    #[test]
    fn test_llseek() {
        let (engine, _cache, ops) = setup();
        let mut fh = open_file(&engine, &ops, &[0u8; 100], OpenFlags::empty());

        assert_eq!(ops.llseek(&mut fh, 10, Whence::Set).unwrap(), 10);
        assert_eq!(ops.llseek(&mut fh, 5, Whence::Current).unwrap(), 15);
        assert_eq!(ops.llseek(&mut fh, -20, Whence::End).unwrap(), 80);
        assert_eq!(
            ops.llseek(&mut fh, -200, Whence::End).unwrap_err(),
            Error::InvalidSeek { offset: -200 }
        );
        assert_eq!(fh.pos(), 80);
    }

    #[test]
    fn test_fsync_flushes_mapped_dirty_pages() {
        let (engine, cache, ops) = setup();
        let fh = open_file(&engine, &ops, &[0u8; PS * 2], OpenFlags::empty());
        map_all(&ops, &fh, 2);
        cache.fault(ops.synchronizer(), fh.object(), 1).unwrap();
        cache.store(fh.object(), 1, 0, b"dirty");

        ops.fsync(&fh, false, &owner()).unwrap();
        assert_eq!(&engine.contents(fh.object())[PS..PS + 5], b"dirty");
        assert_eq!(engine.calls().put_page, 1);
        assert_eq!(engine.calls().sync, 1);
    }

    #[test]
    fn test_fsync_unmapped_skips_writeback() {
        let (engine, _cache, ops) = setup();
        let fh = open_file(&engine, &ops, b"x", OpenFlags::empty());
        ops.fsync(&fh, true, &owner()).unwrap();
        assert_eq!(engine.calls().put_page, 0);
        assert_eq!(engine.calls().sync, 1);
    }

    #[test]
    fn test_readdir_resumes_at_cursor() {
        let (engine, _cache, ops) = setup();
        let dir = FileObject::directory(5, 1000);
        engine.create(&dir, b"");
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            engine.add_entry(&dir, name, 10 + i as u64, FileKind::Regular);
        }
        let mut fh = ops.open(dir, OpenMode::READ, OpenFlags::empty(), &owner()).unwrap();

        let mut seen = Vec::new();
        ops.readdir(
            &mut fh,
            &mut |e: &DirEntry| {
                if seen.len() == 2 {
                    return false;
                }
                seen.push(e.name.clone());
                true
            },
            &owner(),
        )
        .unwrap();
        assert_eq!(seen, ["a", "b"]);
        assert_eq!(fh.pos(), 2);

        let mut rest = Vec::new();
        ops.readdir(
            &mut fh,
            &mut |e: &DirEntry| {
                rest.push(e.name.clone());
                true
            },
            &owner(),
        )
        .unwrap();
        assert_eq!(rest, ["c"]);
    }

    #[test]
    fn test_ioctl_through_handle() {
        let (engine, _cache, ops) = setup();
        let fh = open_file(&engine, &ops, b"", OpenFlags::empty());

        let mut arg = (InodeFlags::APPEND | InodeFlags::NOATIME).bits();
        ops.ioctl(&fh, FS_IOC_SETFLAGS, &mut arg, &owner()).unwrap();

        let mut out = 0;
        ops.ioctl(&fh, FS_IOC_GETFLAGS, &mut out, &owner()).unwrap();
        assert_eq!(out, arg);
    }

    #[test]
    fn test_mmap_refused_leaves_unmapped() {
        let (engine, cache, ops) = setup();
        let fh = open_file(&engine, &ops, b"abc", OpenFlags::empty());
        engine.fail_next_map(Errno::ENOMEM);

        let region = MapRegion::new(0, 0x1000, PS as u64, VmFlags::READ);
        assert_eq!(ops.mmap(&fh, &region).unwrap_err(), Error::Engine(Errno::ENOMEM));
        assert!(!fh.object().is_mapped());
        assert_eq!(cache.mappings(), 0);
    }

    #[test]
    fn test_address_space_forwarders() {
        let (engine, _cache, ops) = setup();
        let fh = open_file(&engine, &ops, &[4u8; PS], OpenFlags::empty());

        let page = CachePage::new_locked(0, PS);
        ops.readpage(fh.object(), &page).unwrap();
        assert!(page.is_uptodate());

        page.lock();
        page.write_at(0, b"back");
        ops.writepage(fh.object(), &page, &WritebackControl::default())
            .unwrap();
        assert_eq!(&engine.contents(fh.object())[..4], b"back");
        assert_eq!(page.unlock_count(), 2);
    }

    #[test]
    fn test_release_closes() {
        let (engine, _cache, ops) = setup();
        let fh = open_file(&engine, &ops, b"", OpenFlags::empty());
        ops.release(fh, &owner()).unwrap();
        assert_eq!(engine.calls().close, 1);
    }
}
