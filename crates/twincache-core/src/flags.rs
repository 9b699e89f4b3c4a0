//! Attribute flag translation and the flag control commands.
//!
//! The engine keeps a wide internal attribute word ([`ZnodeFlags`]). Only six
//! of its bits have a Linux inode-flag equivalent ([`InodeFlags`], the
//! `FS_*_FL` values used by `chattr`/`lsattr`). Everything else is dropped on
//! the way out and preserved on the way in.

use bitflags::bitflags;
use twincache_config::log_flags_debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::object::{Credential, FileObject};

bitflags! {
    /// Engine-internal attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ZnodeFlags: u64 {
        const READONLY       = 0x0000_0001_0000_0000;
        const HIDDEN         = 0x0000_0002_0000_0000;
        const SYSTEM         = 0x0000_0004_0000_0000;
        const ARCHIVE        = 0x0000_0008_0000_0000;
        const IMMUTABLE      = 0x0000_0010_0000_0000;
        const NOUNLINK       = 0x0000_0020_0000_0000;
        const APPENDONLY     = 0x0000_0040_0000_0000;
        const NODUMP         = 0x0000_0080_0000_0000;
        const OPAQUE         = 0x0000_0100_0000_0000;
        const AV_QUARANTINED = 0x0000_0200_0000_0000;
        const AV_MODIFIED    = 0x0000_0400_0000_0000;
        const REPARSE        = 0x0000_0800_0000_0000;
        const OFFLINE        = 0x0000_1000_0000_0000;
        const SPARSE         = 0x0000_2000_0000_0000;
        // Linux-only additions for chattr compatibility.
        const DIRSYNC        = 0x0001_0000_0000_0000;
        const SYNC           = 0x0002_0000_0000_0000;
        const NOATIME        = 0x0004_0000_0000_0000;

        /// Bits with an `FS_*_FL` equivalent.
        const LINUX_MAPPABLE = Self::IMMUTABLE.bits()
            | Self::APPENDONLY.bits()
            | Self::NODUMP.bits()
            | Self::DIRSYNC.bits()
            | Self::SYNC.bits()
            | Self::NOATIME.bits();
    }
}

bitflags! {
    /// Linux inode flags as exchanged through `FS_IOC_{GET,SET}FLAGS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InodeFlags: u32 {
        const SECRM        = 0x0000_0001;
        const UNRM         = 0x0000_0002;
        const COMPR        = 0x0000_0004;
        const SYNC         = 0x0000_0008;
        const IMMUTABLE    = 0x0000_0010;
        const APPEND       = 0x0000_0020;
        const NODUMP       = 0x0000_0040;
        const NOATIME      = 0x0000_0080;
        const INDEX        = 0x0000_1000;
        const JOURNAL_DATA = 0x0000_4000;
        const NOTAIL       = 0x0000_8000;
        const DIRSYNC      = 0x0001_0000;
        const TOPDIR       = 0x0002_0000;
        const EXTENT       = 0x0008_0000;
    }
}

/// Flags a user may see (`FS_FL_USER_VISIBLE`).
pub const FS_FL_USER_VISIBLE: u32 = 0x0003_DFFF;

/// Flags a user may request (`FS_FL_USER_MODIFIABLE`).
pub const FS_FL_USER_MODIFIABLE: u32 = 0x0003_80FF;

/// `FS_IOC_GETFLAGS` on LP64.
pub const FS_IOC_GETFLAGS: u32 = 0x8008_6601;
/// `FS_IOC_SETFLAGS` on LP64.
pub const FS_IOC_SETFLAGS: u32 = 0x4008_6602;
/// 32-bit compat `FS_IOC32_GETFLAGS`.
pub const FS_IOC32_GETFLAGS: u32 = 0x8004_6601;
/// 32-bit compat `FS_IOC32_SETFLAGS`.
pub const FS_IOC32_SETFLAGS: u32 = 0x4004_6602;

const FLAG_MAP: [(ZnodeFlags, InodeFlags); 6] = [
    (ZnodeFlags::IMMUTABLE, InodeFlags::IMMUTABLE),
    (ZnodeFlags::APPENDONLY, InodeFlags::APPEND),
    (ZnodeFlags::NODUMP, InodeFlags::NODUMP),
    (ZnodeFlags::DIRSYNC, InodeFlags::DIRSYNC),
    (ZnodeFlags::SYNC, InodeFlags::SYNC),
    (ZnodeFlags::NOATIME, InodeFlags::NOATIME),
];

/// The external flags this layer can store.
pub const SUPPORTED_FLAGS: InodeFlags = InodeFlags::IMMUTABLE
    .union(InodeFlags::APPEND)
    .union(InodeFlags::NODUMP)
    .union(InodeFlags::DIRSYNC)
    .union(InodeFlags::SYNC)
    .union(InodeFlags::NOATIME);

/// Map internal attribute bits to the user-visible inode flags.
pub fn to_external(internal: ZnodeFlags) -> InodeFlags {
    let mut external = InodeFlags::empty();
    for (znode, inode) in FLAG_MAP {
        if internal.contains(znode) {
            external |= inode;
        }
    }
    InodeFlags::from_bits_retain(external.bits() & FS_FL_USER_VISIBLE)
}

/// Map inode flags back to internal bits. Unrecognized bits are dropped.
pub fn from_external(external: InodeFlags) -> ZnodeFlags {
    let mut internal = ZnodeFlags::empty();
    for (znode, inode) in FLAG_MAP {
        if external.contains(inode) {
            internal |= znode;
        }
    }
    internal
}

/// Read an object's flags in the external representation.
pub fn get_flags<E: Engine + ?Sized>(engine: &E, object: &FileObject) -> Result<InodeFlags> {
    let internal = engine.get_attribute_flags(object)?;
    let external = to_external(internal);
    log_flags_debug!(
        "Get flags",
        object = object.id(),
        internal = internal.bits(),
        external = external.bits()
    );
    Ok(external)
}

/// Check a set-flags request against the access policy.
///
/// Permission is checked before support, so an unprivileged caller asking
/// for an unsupported bit sees `PermissionDenied`.
pub fn check_set_flags(
    object: &FileObject,
    requested: InodeFlags,
    cred: &Credential,
) -> Result<()> {
    if requested.bits() & !FS_FL_USER_MODIFIABLE != 0 || !cred.is_owner_or_cap(object) {
        return Err(Error::PermissionDenied);
    }

    let unsupported = requested.bits() & !SUPPORTED_FLAGS.bits();
    if unsupported != 0 {
        return Err(Error::Unsupported { flags: unsupported });
    }

    Ok(())
}

/// Replace an object's Linux-mappable flags with `requested`.
///
/// Internal bits without an external equivalent are left as they are.
pub fn set_flags<E: Engine + ?Sized>(
    engine: &E,
    object: &FileObject,
    requested: InodeFlags,
    cred: &Credential,
) -> Result<()> {
    check_set_flags(object, requested, cred)?;

    let current = engine.get_attribute_flags(object)?;
    let updated = current.difference(ZnodeFlags::LINUX_MAPPABLE) | from_external(requested);
    log_flags_debug!(
        "Set flags",
        object = object.id(),
        requested = requested.bits(),
        internal = updated.bits()
    );
    engine.set_attribute_flags(object, updated)?;
    Ok(())
}

/// Dispatch a flag control command. `arg` is the caller's flag word: written
/// for a get, read for a set. Any other command is `UnknownCommand`.
pub fn ioctl<E: Engine + ?Sized>(
    engine: &E,
    object: &FileObject,
    cmd: u32,
    arg: &mut u32,
    cred: &Credential,
) -> Result<()> {
    match cmd {
        FS_IOC_GETFLAGS | FS_IOC32_GETFLAGS => {
            *arg = get_flags(engine, object)?.bits();
            Ok(())
        }
        FS_IOC_SETFLAGS | FS_IOC32_SETFLAGS => {
            set_flags(engine, object, InodeFlags::from_bits_retain(*arg), cred)
        }
        _ => Err(Error::UnknownCommand { cmd }),
    }
}

/// Render a flag word the way `lsattr` names its bits; unknown bits are shown
/// as a trailing hex remainder.
pub fn describe(flags: InodeFlags) -> String {
    let mut names: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect();
    let unknown = flags.bits() & !InodeFlags::all().bits();
    if unknown != 0 {
        names.push(format!("{:#x}", unknown));
    }
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(",")
    }
}
