//! I/O vector adapter.
//!
//! Turns a flat `(buffer, offset)` request into the single-segment vector the
//! engine consumes, and turns the residual the engine leaves behind back into
//! a byte count.

use twincache_config::log_sync_trace;

use crate::engine::Engine;
use crate::error::Result;
use crate::object::{Credential, FileObject, OpenFlags};

/// Largest representable file offset.
pub const MAXOFFSET: u64 = i64::MAX as u64;

/// Address space the buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UioSeg {
    User,
    Kernel,
}

/// The caller's buffer; its variant fixes the transfer direction.
#[derive(Debug)]
pub enum UioBuf<'a> {
    /// Engine fills the buffer.
    Read(&'a mut [u8]),
    /// Engine consumes the buffer.
    Write(&'a [u8]),
}

impl UioBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            UioBuf::Read(buf) => buf.len(),
            UioBuf::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-segment I/O vector.
#[derive(Debug)]
pub struct Uio<'a> {
    buf: UioBuf<'a>,
    resid: usize,
    offset: u64,
    limit: u64,
    seg: UioSeg,
}

impl<'a> Uio<'a> {
    pub fn new(buf: UioBuf<'a>, offset: u64, seg: UioSeg) -> Self {
        let resid = buf.len();
        Self {
            buf,
            resid,
            offset,
            limit: MAXOFFSET,
            seg,
        }
    }

    pub fn for_read(buf: &'a mut [u8], offset: u64, seg: UioSeg) -> Self {
        Self::new(UioBuf::Read(buf), offset, seg)
    }

    pub fn for_write(buf: &'a [u8], offset: u64, seg: UioSeg) -> Self {
        Self::new(UioBuf::Write(buf), offset, seg)
    }

    /// Requested length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes not yet moved.
    pub fn resid(&self) -> usize {
        self.resid
    }

    /// File offset of the next byte to move.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn segment(&self) -> UioSeg {
        self.seg
    }

    pub fn is_read(&self) -> bool {
        matches!(self.buf, UioBuf::Read(_))
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> usize {
        self.len() - self.resid
    }

    /// Engine side of a read: copy `src` into the unfilled part of the
    /// buffer. Returns bytes copied; zero for a write vector.
    pub fn copy_out(&mut self, src: &[u8]) -> usize {
        let done = self.transferred();
        let n = match &mut self.buf {
            UioBuf::Read(buf) => {
                let n = src.len().min(self.resid);
                buf[done..done + n].copy_from_slice(&src[..n]);
                n
            }
            UioBuf::Write(_) => 0,
        };
        self.advance(n);
        n
    }

    /// Engine side of a write: the bytes still to be stored. Empty for a
    /// read vector.
    pub fn pending(&self) -> &[u8] {
        match &self.buf {
            UioBuf::Write(buf) => &buf[self.len() - self.resid..],
            UioBuf::Read(_) => &[],
        }
    }

    /// Mark `n` bytes as moved.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.resid);
        self.resid -= n;
        self.offset = self.offset.saturating_add(n as u64);
    }
}

/// Move bytes between `buf` and the engine at file offset `pos`.
///
/// Returns the number of bytes actually moved, which is short at end of
/// file. Engine failures are returned unchanged with no partial count.
pub fn transfer<E: Engine + ?Sized>(
    engine: &E,
    object: &FileObject,
    buf: UioBuf<'_>,
    pos: u64,
    seg: UioSeg,
    flags: OpenFlags,
    cred: &Credential,
) -> Result<usize> {
    let mut uio = Uio::new(buf, pos, seg);
    let len = uio.len();

    if uio.is_read() {
        engine.read(object, &mut uio, flags, cred)?;
    } else {
        engine.write(object, &mut uio, flags, cred)?;
    }

    let moved = len - uio.resid();
    log_sync_trace!(
        "Transfer complete",
        object = object.id(),
        pos = pos,
        requested = len,
        moved = moved
    );
    Ok(moved)
}

/// Read from the engine into `buf`.
pub fn read_common<E: Engine + ?Sized>(
    engine: &E,
    object: &FileObject,
    buf: &mut [u8],
    pos: u64,
    seg: UioSeg,
    flags: OpenFlags,
    cred: &Credential,
) -> Result<usize> {
    transfer(engine, object, UioBuf::Read(buf), pos, seg, flags, cred)
}

/// Write `buf` into the engine.
pub fn write_common<E: Engine + ?Sized>(
    engine: &E,
    object: &FileObject,
    buf: &[u8],
    pos: u64,
    seg: UioSeg,
    flags: OpenFlags,
    cred: &Credential,
) -> Result<usize> {
    transfer(engine, object, UioBuf::Write(buf), pos, seg, flags, cred)
}
