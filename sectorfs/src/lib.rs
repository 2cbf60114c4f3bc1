//! A teaching file system for a single simulated disk of 128 byte sectors.
//!
//! Files are described by one sector [`FileHeader`]s that index their data
//! through up to three levels of nested headers, names live in fixed size
//! [`Directory`] tables that may nest, and free space is tracked by a
//! [`Bitmap`] with one bit per sector. The disk itself sits behind the
//! [`io::SectorStorage`] trait; [`io::FileSectorEmulator`] backs it with a
//! host file.
mod alloc;
mod dir;
mod fs;
pub mod io;
mod node;
mod openfile;

pub use crate::alloc::{Bitmap, FreeSectorMap, State};
pub use crate::dir::{DirEntry, Directory, DIR_ENTRY_SIZE};
pub use crate::fs::{
    FileSystem, FsError, DIRECTORY_SECTOR, FILE_NAME_MAX_LEN, FREE_MAP_SECTOR, NUM_DIR_ENTRIES,
    NUM_SECTORS, SECTOR_SIZE,
};
pub use crate::node::{
    FileHeader, Indirection, MAX_DIRECT_SIZE, MAX_DOUBLE_INDIRECT_SIZE, MAX_SINGLE_INDIRECT_SIZE,
    MAX_TRIPLE_INDIRECT_SIZE, NUM_DIRECT,
};
pub use crate::openfile::OpenFile;
