//! File objects, open handles and caller credentials.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

/// User id.
pub type Uid = u32;

/// What kind of object the engine holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

/// Engine-visible unit of truth for one file.
///
/// Bytes and attributes live in the engine; this only carries identity and
/// the mapping state that the synchronizer needs.
#[derive(Debug)]
pub struct FileObject {
    id: u64,
    kind: FileKind,
    owner: Uid,
    mapped: Mutex<bool>,
}

impl FileObject {
    pub fn new(id: u64, kind: FileKind, owner: Uid) -> Self {
        Self {
            id,
            kind,
            owner,
            mapped: Mutex::new(false),
        }
    }

    pub fn regular(id: u64, owner: Uid) -> Arc<Self> {
        Arc::new(Self::new(id, FileKind::Regular, owner))
    }

    pub fn directory(id: u64, owner: Uid) -> Arc<Self> {
        Arc::new(Self::new(id, FileKind::Directory, owner))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn owner(&self) -> Uid {
        self.owner
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Whether a mapping has ever been established on this object.
    pub fn is_mapped(&self) -> bool {
        *self.mapped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that a mapping exists. Never cleared by this layer.
    pub(crate) fn mark_mapped(&self) {
        let mut mapped = self.mapped.lock().unwrap_or_else(|e| e.into_inner());
        *mapped = true;
    }
}

bitflags! {
    /// Capabilities relevant to this layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// Bypass ownership checks on objects (CAP_FOWNER).
        const FOWNER = 1 << 0;
    }
}

/// Identity of the caller, already acquired by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: Uid,
    pub gid: u32,
    pub caps: Capabilities,
}

impl Credential {
    pub fn new(uid: Uid, gid: u32) -> Self {
        Self {
            uid,
            gid,
            caps: Capabilities::empty(),
        }
    }

    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            caps: Capabilities::all(),
        }
    }

    pub fn with_caps(mut self, caps: Capabilities) -> Self {
        self.caps |= caps;
        self
    }

    /// Owner of `object`, or holding the override capability.
    pub fn is_owner_or_cap(&self, object: &FileObject) -> bool {
        self.uid == object.owner() || self.caps.contains(Capabilities::FOWNER)
    }
}

bitflags! {
    /// Access mode of an open handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Open flags carried by a handle, using the Linux `O_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const APPEND = libc::O_APPEND as u32;
        const NONBLOCK = libc::O_NONBLOCK as u32;
        const DSYNC = libc::O_DSYNC as u32;
        const SYNC = libc::O_SYNC as u32;
        const DIRECT = libc::O_DIRECT as u32;
        // libc reports 0 on 64-bit targets; keep the kernel's bit so the
        // large-file check stays observable.
        const LARGEFILE = 0o100000;
    }
}

/// Per-open state. The offset is only mutated through `&mut self`, so
/// callers serialize read/write on one handle.
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) object: Arc<FileObject>,
    pub(crate) mode: OpenMode,
    pub(crate) flags: OpenFlags,
    pub(crate) pos: u64,
}

impl FileHandle {
    pub(crate) fn new(object: Arc<FileObject>, mode: OpenMode, flags: OpenFlags) -> Self {
        Self {
            object,
            mode,
            flags,
            pos: 0,
        }
    }

    pub fn object(&self) -> &Arc<FileObject> {
        &self.object
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current byte offset.
    pub fn pos(&self) -> u64 {
        self.pos
    }
}
