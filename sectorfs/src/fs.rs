use std::io::Write;

use crate::alloc::{Bitmap, FreeSectorMap};
use crate::dir::Directory;
use crate::io::{SectorId, SectorStorage};
use crate::node::FileHeader;
use crate::openfile::OpenFile;

use log::{debug, info};
use thiserror::Error;

pub const SECTOR_SIZE: usize = 128;
/// Sectors on a device built without an explicit count.
pub const NUM_SECTORS: usize = 32768;

/// Known locations.
pub const FREE_MAP_SECTOR: SectorId = 0;
pub const DIRECTORY_SECTOR: SectorId = 1;

pub const NUM_DIR_ENTRIES: usize = 64;
pub const FILE_NAME_MAX_LEN: usize = 9;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: usize, max: usize },
    #[error("not enough free sectors")]
    NoSpace,
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("directory is full")]
    DirectoryFull,
    #[error("found no file at {0}")]
    DoesNotExist(String),
    #[error("{0} is not a directory")]
    NotADirectory(String),
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("offset {offset} is past the end of a {length} byte file")]
    OffsetOutOfRange { offset: usize, length: usize },
    #[error("corrupted file system: {0}")]
    Corrupted(String),
    #[error("disk i/o failed")]
    Io(#[from] std::io::Error),
}

/// Splits an absolute path into its parent directory and final name.
fn split_path(path: &str) -> Result<(&str, &str), FsError> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(
            "path must start with \"/\"".to_string(),
        ));
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(i) => Ok((&trimmed[..i], &trimmed[i + 1..])),
        None => Err(FsError::InvalidArgument(format!("{:?} names the root directory", path))),
    }
}

/// A single disk file system with a hierarchy of fixed size directories.
///
/// # Layout
/// ===========================================================================
/// | Free map header | Root directory header | Free map, directories, files |
/// ===========================================================================
///
/// Sector 0 holds the header of the free-map file and sector 1 the header of
/// the root directory file; everything else is claimed through the free map.
/// Mutating operations load the free map, work on the in-memory copy and only
/// write it back once they have fully succeeded.
pub struct FileSystem<T: SectorStorage> {
    dev: T,
    free_map_file: OpenFile,
    directory_file: OpenFile,
}

impl<T: SectorStorage> FileSystem<T> {
    /// Initializes an empty file system onto owned sector storage.
    pub fn format(mut dev: T) -> Result<Self, FsError> {
        let num_sectors = dev.sector_count();
        info!("formatting a {} sector disk", num_sectors);
        if num_sectors <= DIRECTORY_SECTOR as usize {
            return Err(FsError::InvalidArgument(format!(
                "{} sectors cannot hold a file system",
                num_sectors
            )));
        }

        let mut free_map = Bitmap::new(num_sectors);
        let directory = Directory::new(NUM_DIR_ENTRIES);
        free_map.mark(FREE_MAP_SECTOR);
        free_map.mark(DIRECTORY_SECTOR);

        let map_size = free_map.byte_len();
        let mut map_hdr = FileHeader::new();
        map_hdr.allocate(&mut dev, &mut free_map, map_size)?;
        let mut dir_hdr = FileHeader::new();
        dir_hdr.allocate(&mut dev, &mut free_map, Directory::file_size(NUM_DIR_ENTRIES))?;
        map_hdr.write_back(&mut dev, FREE_MAP_SECTOR)?;
        dir_hdr.write_back(&mut dev, DIRECTORY_SECTOR)?;

        let free_map_file = OpenFile::from_header(FREE_MAP_SECTOR, map_hdr);
        let directory_file = OpenFile::from_header(DIRECTORY_SECTOR, dir_hdr);
        free_map.write_back(&mut dev, &free_map_file)?;
        directory.write_back(&mut dev, &directory_file)?;
        dev.sync_disk()?;

        Ok(FileSystem {
            dev,
            free_map_file,
            directory_file,
        })
    }

    /// Attaches to a device that already holds a file system.
    pub fn mount(mut dev: T) -> Result<Self, FsError> {
        let free_map_file = OpenFile::open(&mut dev, FREE_MAP_SECTOR)?;
        let directory_file = OpenFile::open(&mut dev, DIRECTORY_SECTOR)?;

        let expected_map = Bitmap::new(dev.sector_count()).byte_len();
        if free_map_file.length() != expected_map
            || directory_file.length() != Directory::file_size(NUM_DIR_ENTRIES)
        {
            return Err(FsError::Corrupted("disk is not formatted".to_string()));
        }
        info!("mounted a {} sector disk", dev.sector_count());
        Ok(FileSystem {
            dev,
            free_map_file,
            directory_file,
        })
    }

    pub fn device(&self) -> &T {
        &self.dev
    }

    pub fn into_device(self) -> T {
        self.dev
    }

    pub fn sync(&mut self) -> Result<(), FsError> {
        self.dev.sync_disk()?;
        Ok(())
    }

    /// Creates a file of a fixed size. The size cannot change afterwards.
    pub fn create(&mut self, path: &str, size: usize) -> Result<SectorId, FsError> {
        let (sector, _) = self.create_entry(path, size, false)?;
        info!("created {} ({} bytes) at sector {}", path, size, sector);
        Ok(sector)
    }

    /// Creates an empty directory.
    pub fn mkdir(&mut self, path: &str) -> Result<SectorId, FsError> {
        let (sector, hdr) = self.create_entry(path, Directory::file_size(NUM_DIR_ENTRIES), true)?;
        // Data sectors may still hold an old table.
        let file = OpenFile::from_header(sector, hdr);
        Directory::new(NUM_DIR_ENTRIES).write_back(&mut self.dev, &file)?;
        info!("created directory {} at sector {}", path, sector);
        Ok(sector)
    }

    fn create_entry(
        &mut self,
        path: &str,
        size: usize,
        is_dir: bool,
    ) -> Result<(SectorId, FileHeader), FsError> {
        let (parent, name) = split_path(path)?;
        let parent_sector = self.dir_sector(parent)?;
        let (mut directory, directory_file) = self.open_directory(parent_sector)?;
        let mut free_map = self.load_free_map()?;

        let sector = free_map.find_and_set().ok_or(FsError::NoSpace)?;
        directory.add(name, sector, is_dir)?;
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut self.dev, &mut free_map, size)?;

        hdr.write_back(&mut self.dev, sector)?;
        directory.write_back(&mut self.dev, &directory_file)?;
        free_map.write_back(&mut self.dev, &self.free_map_file)?;
        Ok((sector, hdr))
    }

    /// Opens the file or directory at `path`.
    pub fn open(&mut self, path: &str) -> Result<OpenFile, FsError> {
        let root = self.load_directory(DIRECTORY_SECTOR)?;
        let sector = root
            .get_dir_sector(&mut self.dev, path)?
            .ok_or_else(|| FsError::DoesNotExist(path.to_string()))?;
        OpenFile::open(&mut self.dev, sector)
    }

    /// Reads the whole file at `path`.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        let file = self.open(path)?;
        let mut buf = vec![0; file.length()];
        let n = file.read_at(&mut self.dev, &mut buf, 0)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes `data` into the file at `path` starting at `position`, returning
    /// how many bytes fit.
    pub fn write_file(&mut self, path: &str, position: usize, data: &[u8]) -> Result<usize, FsError> {
        let file = self.open(path)?;
        file.write_at(&mut self.dev, data, position)
    }

    /// Removes a file, or a directory when it is empty or `recursive` is set,
    /// returning all of its sectors to the free map.
    pub fn remove(&mut self, path: &str, recursive: bool) -> Result<(), FsError> {
        let (parent, name) = split_path(path)?;
        let parent_sector = self.dir_sector(parent)?;
        let (mut directory, directory_file) = self.open_directory(parent_sector)?;
        let entry = *directory
            .entry(name)
            .ok_or_else(|| FsError::DoesNotExist(path.to_string()))?;
        let mut free_map = self.load_free_map()?;

        let mut ancestors = vec![parent_sector];
        self.release(path, entry.sector(), entry.is_dir(), recursive, &mut free_map, &mut ancestors)?;
        directory.remove(name)?;

        directory.write_back(&mut self.dev, &directory_file)?;
        free_map.write_back(&mut self.dev, &self.free_map_file)?;
        info!("removed {}", path);
        Ok(())
    }

    fn release(
        &mut self,
        path: &str,
        sector: SectorId,
        is_dir: bool,
        recursive: bool,
        free_map: &mut Bitmap,
        ancestors: &mut Vec<SectorId>,
    ) -> Result<(), FsError> {
        if is_dir {
            if ancestors.contains(&sector) {
                return Err(FsError::Corrupted(format!("{} contains itself", path)));
            }
            let (sub, _) = self.open_directory(sector)?;
            if !sub.is_empty() && !recursive {
                return Err(FsError::DirectoryNotEmpty(path.to_string()));
            }
            ancestors.push(sector);
            for child in sub.entries() {
                let child_path = format!("{}/{}", path.trim_end_matches('/'), child.name());
                self.release(&child_path, child.sector(), child.is_dir(), true, free_map, ancestors)?;
            }
            ancestors.pop();
        }
        debug!("releasing {} at sector {}", path, sector);
        let hdr = FileHeader::fetch_from(&mut self.dev, sector)?;
        hdr.deallocate(&mut self.dev, free_map)?;
        free_map.clear(sector);
        Ok(())
    }

    /// Names in the directory at `path`.
    pub fn list(&mut self, path: &str) -> Result<Vec<String>, FsError> {
        let sector = self.dir_sector(path)?;
        let (directory, _) = self.open_directory(sector)?;
        Ok(directory.list().map(String::from).collect())
    }

    /// Writes the tree below `path` to `out`.
    pub fn recursive_list(&mut self, path: &str, out: &mut dyn Write) -> Result<(), FsError> {
        let sector = self.dir_sector(path)?;
        let (directory, _) = self.open_directory(sector)?;
        directory.recursive_list(&mut self.dev, 0, out)
    }

    /// Dumps the header and contents of the file at `path`.
    pub fn print_file(&mut self, path: &str, out: &mut dyn Write) -> Result<(), FsError> {
        let file = self.open(path)?;
        file.header().print(&mut self.dev, out)
    }

    pub fn free_sectors(&mut self) -> Result<usize, FsError> {
        Ok(self.load_free_map()?.num_clear())
    }

    /// Dumps the free map, the root directory and every file in it. For debugging.
    pub fn print(&mut self, out: &mut dyn Write) -> Result<(), FsError> {
        writeln!(out, "Bit map file header:")?;
        self.free_map_file.header().print(&mut self.dev, out)?;
        writeln!(out)?;
        writeln!(out, "Directory file header:")?;
        self.directory_file.header().print(&mut self.dev, out)?;
        writeln!(out)?;
        writeln!(out, "Free sectors: {}", self.free_sectors()?)?;
        let root = self.load_directory(DIRECTORY_SECTOR)?;
        root.print(&mut self.dev, out)
    }

    fn load_free_map(&mut self) -> Result<Bitmap, FsError> {
        let mut free_map = Bitmap::new(self.dev.sector_count());
        free_map.fetch_from(&mut self.dev, &self.free_map_file)?;
        Ok(free_map)
    }

    fn load_directory(&mut self, sector: SectorId) -> Result<Directory, FsError> {
        Ok(self.open_directory(sector)?.0)
    }

    fn open_directory(&mut self, sector: SectorId) -> Result<(Directory, OpenFile), FsError> {
        let file = if sector == DIRECTORY_SECTOR {
            self.directory_file.clone()
        } else {
            OpenFile::open(&mut self.dev, sector)?
        };
        let mut directory = Directory::new(NUM_DIR_ENTRIES);
        directory.fetch_from(&mut self.dev, &file)?;
        Ok((directory, file))
    }

    /// Sector of the directory at `path`, which must exist and be a directory.
    fn dir_sector(&mut self, path: &str) -> Result<SectorId, FsError> {
        if path == "/" {
            return Ok(DIRECTORY_SECTOR);
        }
        let (parent, name) = split_path(path)?;
        let parent_sector = self.dir_sector(parent)?;
        let directory = self.load_directory(parent_sector)?;
        match directory.entry(name) {
            Some(entry) if entry.is_dir() => Ok(entry.sector()),
            Some(_) => Err(FsError::NotADirectory(path.to_string())),
            None => Err(FsError::DoesNotExist(path.to_string())),
        }
    }
}
