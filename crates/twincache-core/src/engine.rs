//! Storage engine interface.
//!
//! The engine owns the authoritative bytes and attributes of every file and
//! keeps its own cache for all plain read/write traffic. Status codes are
//! normalized to [`Errno`] at this boundary (see [`Errno::from_status`]), so
//! nothing above it handles raw signed integers.

use bitflags::bitflags;

use crate::error::Errno;
use crate::flags::ZnodeFlags;
use crate::object::{Credential, FileKind, FileObject, OpenFlags, OpenMode};
use crate::page::{Page, WritebackControl};
use crate::uio::Uio;

pub type EngineResult<T> = std::result::Result<T, Errno>;

bitflags! {
    /// Protection and sharing flags of a mapped region (`VM_*` values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VmFlags: u64 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
        const SHARED = 0x8;
    }
}

/// A virtual memory region being mapped onto a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRegion {
    /// File offset of the region, in pages.
    pub pgoff: u64,
    /// First virtual address.
    pub start: u64,
    /// One past the last virtual address.
    pub end: u64,
    pub flags: VmFlags,
}

impl MapRegion {
    pub fn new(pgoff: u64, start: u64, len: u64, flags: VmFlags) -> Self {
        Self {
            pgoff,
            start,
            end: start.saturating_add(len),
            flags,
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One directory entry handed to a readdir emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
    /// Cursor value that resumes after this entry.
    pub next: u64,
}

/// Readdir emitter. Returns `false` once the caller's buffer is full; the
/// engine must stop without advancing the cursor past the rejected entry.
pub type DirEmit<'a> = dyn FnMut(&DirEntry) -> bool + 'a;

/// Primitive operations offered by the storage engine.
pub trait Engine: Send + Sync {
    fn open(
        &self,
        object: &FileObject,
        mode: OpenMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> EngineResult<()>;

    fn close(&self, object: &FileObject, flags: OpenFlags, cred: &Credential)
        -> EngineResult<()>;

    /// Fill `uio` from `uio.offset()`, decrementing its residual by the
    /// bytes produced. Reading past end of file is not an error.
    fn read(
        &self,
        object: &FileObject,
        uio: &mut Uio<'_>,
        flags: OpenFlags,
        cred: &Credential,
    ) -> EngineResult<()>;

    /// Consume `uio` at `uio.offset()`, decrementing its residual by the
    /// bytes stored.
    fn write(
        &self,
        object: &FileObject,
        uio: &mut Uio<'_>,
        flags: OpenFlags,
        cred: &Credential,
    ) -> EngineResult<()>;

    fn sync(&self, object: &FileObject, datasync: bool, cred: &Credential) -> EngineResult<()>;

    fn readdir(
        &self,
        object: &FileObject,
        cursor: &mut u64,
        emit: &mut DirEmit<'_>,
        cred: &Credential,
    ) -> EngineResult<()>;

    /// Validate and register a mapping of `len` bytes starting at page
    /// `pgoff`, placed at virtual address `addr`.
    fn map_region(
        &self,
        object: &FileObject,
        pgoff: u64,
        addr: u64,
        len: u64,
        flags: VmFlags,
    ) -> EngineResult<()>;

    /// Fill every page in `pages` (file order) from the engine cache. Pages
    /// are locked by the caller; the engine does not change page state.
    fn get_pages(&self, object: &FileObject, pages: &[&dyn Page]) -> EngineResult<()>;

    /// Persist the bytes of one locked page into the engine.
    fn put_page(
        &self,
        object: &FileObject,
        page: &dyn Page,
        wbc: &WritebackControl,
    ) -> EngineResult<()>;

    fn get_attribute_flags(&self, object: &FileObject) -> EngineResult<ZnodeFlags>;

    fn set_attribute_flags(&self, object: &FileObject, flags: ZnodeFlags) -> EngineResult<()>;

    /// Current file size in bytes.
    fn size(&self, object: &FileObject) -> EngineResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_region_len() {
        let region = MapRegion::new(2, 0x7f00_0000, 8192, VmFlags::READ | VmFlags::SHARED);
        assert_eq!(region.len(), 8192);
        assert_eq!(region.end, 0x7f00_2000);
        assert!(!region.is_empty());
    }
}
