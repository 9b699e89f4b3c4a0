//! # twincache-core
//!
//! Keeps a storage engine's private cache and the host page cache coherent
//! for one file.
//!
//! Ordinary read/write goes straight to the engine. Once a file is memory
//! mapped, its pages also live in the host cache and the two copies are
//! synchronized page by page.
//!
//! ## Layers
//!
//! ```text
//! FileOperations (file)          host entry points
//!   ├── uio                      flat buffer <-> engine I/O vector
//!   ├── flags                    attribute flag translation, ioctl
//!   └── CacheSynchronizer (sync) populate / flush / write-through
//!         ├── Engine             authoritative bytes and attributes
//!         └── PageCache          host pages (mapped access only)
//! ```

pub mod engine;
pub mod error;
pub mod file;
pub mod flags;
pub mod object;
pub mod page;
pub mod sync;
pub mod testing;
pub mod uio;

pub use engine::{DirEmit, DirEntry, Engine, EngineResult, MapRegion, VmFlags};
pub use error::{Errno, Error, Result};
pub use file::{FileOperations, Whence, MAX_NON_LFS};
pub use flags::{InodeFlags, ZnodeFlags};
pub use object::{Capabilities, Credential, FileHandle, FileKind, FileObject, OpenFlags, OpenMode};
pub use page::{CachePage, Page, PageCache, WritebackControl, WritebackMode};
pub use sync::CacheSynchronizer;
pub use uio::{Uio, UioBuf, UioSeg};
