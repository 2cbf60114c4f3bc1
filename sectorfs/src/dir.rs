use std::io::Write;

use crate::fs::{FsError, DIRECTORY_SECTOR, FILE_NAME_MAX_LEN};
use crate::io::{SectorId, SectorStorage};
use crate::node::FileHeader;
use crate::openfile::OpenFile;

use log::debug;
use zerocopy::{AsBytes, FromBytes};

pub const DIR_ENTRY_SIZE: usize = std::mem::size_of::<DirEntry>();

const _: () = assert!(DIR_ENTRY_SIZE == 16);

/// One slot of a directory table. Names are NUL padded and hold at most
/// `FILE_NAME_MAX_LEN` bytes.
#[repr(C)]
#[derive(AsBytes, FromBytes, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    in_use: u8,
    is_dir: u8,
    name: [u8; FILE_NAME_MAX_LEN + 1],
    /// Sector of the file header of the entry.
    sector: SectorId,
}

impl DirEntry {
    const EMPTY: DirEntry = DirEntry {
        in_use: 0,
        is_dir: 0,
        name: [0; FILE_NAME_MAX_LEN + 1],
        sector: 0,
    };

    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn sector(&self) -> SectorId {
        self.sector
    }

    fn name_bytes(&self) -> &[u8] {
        let bounded = &self.name[..FILE_NAME_MAX_LEN];
        let len = bounded.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_MAX_LEN);
        &bounded[..len]
    }

    /// Names always come from a `&str` or from a table `fetch_from` checked.
    pub fn name(&self) -> &str {
        std::str::from_utf8(self.name_bytes()).unwrap_or_default()
    }
}

/// Cuts `name` down to what a directory entry stores, never splitting a
/// character.
fn bounded(name: &str) -> &[u8] {
    let mut len = name.len().min(FILE_NAME_MAX_LEN);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    &name.as_bytes()[..len]
}

/// A fixed size table of names and header locations. The table never grows;
/// once every slot is used no more entries can be added.
///
/// The table is persisted as the contents of a file, see `fetch_from` and
/// `write_back`.
#[derive(Debug, Clone, PartialEq)]
pub struct Directory {
    table: Vec<DirEntry>,
}

impl Directory {
    /// An empty directory with room for `size` entries.
    pub fn new(size: usize) -> Self {
        Self {
            table: vec![DirEntry::EMPTY; size],
        }
    }

    /// Bytes needed to persist a directory of `size` entries.
    pub fn file_size(size: usize) -> usize {
        size * DIR_ENTRY_SIZE
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Read the table from the directory file.
    pub fn fetch_from<T: SectorStorage>(&mut self, dev: &mut T, file: &OpenFile) -> Result<(), FsError> {
        let mut buf = vec![0; Directory::file_size(self.table.len())];
        let read = file.read_at(dev, &mut buf, 0)?;
        if read != buf.len() {
            return Err(FsError::Corrupted(format!(
                "directory file at sector {} holds {} bytes, expected {}",
                file.sector(),
                read,
                buf.len()
            )));
        }
        for (entry, raw) in self.table.iter_mut().zip(buf.chunks_exact(DIR_ENTRY_SIZE)) {
            *entry = DirEntry::read_from(raw).unwrap_or(DirEntry::EMPTY);
        }
        if let Some(index) = self
            .table
            .iter()
            .position(|e| e.in_use() && std::str::from_utf8(e.name_bytes()).is_err())
        {
            return Err(FsError::Corrupted(format!(
                "entry {} of directory file at sector {} has a name that is not UTF-8",
                index,
                file.sector()
            )));
        }
        Ok(())
    }

    /// Write the table back to the directory file.
    pub fn write_back<T: SectorStorage>(&self, dev: &mut T, file: &OpenFile) -> Result<(), FsError> {
        let bytes = self.table.as_slice().as_bytes();
        let written = file.write_at(dev, bytes, 0)?;
        if written != bytes.len() {
            return Err(FsError::Corrupted(format!(
                "directory file at sector {} accepted {} bytes, expected {}",
                file.sector(),
                written,
                bytes.len()
            )));
        }
        Ok(())
    }

    /// Position of `name` in the table.
    pub fn find_index(&self, name: &str) -> Option<usize> {
        let name = bounded(name);
        self.table
            .iter()
            .position(|e| e.in_use() && e.name_bytes() == name)
    }

    /// Sector of the header of `name`.
    pub fn find(&self, name: &str) -> Option<SectorId> {
        self.entry(name).map(DirEntry::sector)
    }

    pub fn entry(&self, name: &str) -> Option<&DirEntry> {
        self.find_index(name).map(|i| &self.table[i])
    }

    pub fn is_dir(&self, name: &str) -> Option<bool> {
        self.entry(name).map(DirEntry::is_dir)
    }

    /// Add a name to the directory.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the name is taken, `DirectoryFull` if no slot is
    /// free and `InvalidArgument` for empty names or names containing `/`.
    /// The table is untouched on error.
    pub fn add(&mut self, name: &str, sector: SectorId, is_dir: bool) -> Result<(), FsError> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidArgument(format!("bad file name {:?}", name)));
        }
        if self.find_index(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        let slot = self
            .table
            .iter_mut()
            .find(|e| !e.in_use())
            .ok_or(FsError::DirectoryFull)?;

        let stored = bounded(name);
        *slot = DirEntry::EMPTY;
        slot.in_use = 1;
        slot.is_dir = is_dir as u8;
        slot.name[..stored.len()].copy_from_slice(stored);
        slot.sector = sector;
        Ok(())
    }

    /// Remove a name from the directory. The file's own sectors are left alone.
    pub fn remove(&mut self, name: &str) -> Result<(), FsError> {
        let i = self
            .find_index(name)
            .ok_or_else(|| FsError::DoesNotExist(name.to_string()))?;
        self.table[i].in_use = 0;
        Ok(())
    }

    /// Names in the directory, in table order.
    pub fn list(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries().map(DirEntry::name)
    }

    /// Entries in use, in table order.
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> + '_ {
        self.table.iter().filter(|e| e.in_use())
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Lists the whole tree below this directory, four spaces of indent per
    /// `level`, tagging entries `[D]` or `[F]`.
    ///
    /// # Errors
    ///
    /// `Corrupted` if a subdirectory refers back to one of its ancestors.
    pub fn recursive_list<T: SectorStorage>(
        &self,
        dev: &mut T,
        level: usize,
        out: &mut dyn Write,
    ) -> Result<(), FsError> {
        self.list_tree(dev, level, out, &mut Vec::new())
    }

    fn list_tree<T: SectorStorage>(
        &self,
        dev: &mut T,
        level: usize,
        out: &mut dyn Write,
        ancestors: &mut Vec<SectorId>,
    ) -> Result<(), FsError> {
        for entry in self.entries() {
            writeln!(
                out,
                "{}[{}] {}",
                "    ".repeat(level),
                if entry.is_dir() { 'D' } else { 'F' },
                entry.name()
            )?;
            if !entry.is_dir() {
                continue;
            }
            if ancestors.contains(&entry.sector()) {
                return Err(FsError::Corrupted(format!(
                    "directory {} at sector {} contains itself",
                    entry.name(),
                    entry.sector()
                )));
            }
            let sub = self.load_child(dev, entry.sector())?;
            ancestors.push(entry.sector());
            sub.list_tree(dev, level + 1, out, ancestors)?;
            ancestors.pop();
        }
        Ok(())
    }

    /// Resolve an absolute path, starting from this directory, to the sector
    /// of the header it names. `"/"` is always the root directory.
    ///
    /// Returns `None` when a component is missing, or when a component other
    /// than the last one is not a directory.
    pub fn get_dir_sector<T: SectorStorage>(
        &self,
        dev: &mut T,
        path: &str,
    ) -> Result<Option<SectorId>, FsError> {
        if path == "/" {
            return Ok(Some(DIRECTORY_SECTOR));
        }
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| FsError::InvalidArgument(format!("path {:?} is not absolute", path)))?;
        let (component, remainder) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };

        let entry = match self.entry(component) {
            Some(entry) => *entry,
            None => {
                debug!("{:?} not found while resolving {:?}", component, path);
                return Ok(None);
            }
        };
        // A trailing slash names the component itself.
        if remainder.is_empty() || remainder == "/" {
            return Ok(Some(entry.sector()));
        }
        if !entry.is_dir() {
            return Ok(None);
        }
        let sub = self.load_child(dev, entry.sector())?;
        sub.get_dir_sector(dev, remainder)
    }

    /// Lists every entry together with its header and contents. For debugging.
    pub fn print<T: SectorStorage>(&self, dev: &mut T, out: &mut dyn Write) -> Result<(), FsError> {
        writeln!(out, "Directory contents:")?;
        for entry in self.entries() {
            writeln!(out, "Name: {}, Sector: {}", entry.name(), entry.sector())?;
            FileHeader::fetch_from(dev, entry.sector())?.print(dev, out)?;
        }
        writeln!(out)?;
        Ok(())
    }

    /// Subdirectories share the capacity of their parent.
    fn load_child<T: SectorStorage>(&self, dev: &mut T, sector: SectorId) -> Result<Directory, FsError> {
        let file = OpenFile::open(dev, sector)?;
        let mut sub = Directory::new(self.table.len());
        sub.fetch_from(dev, &file)?;
        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Bitmap, FreeSectorMap};
    use crate::io::{FileSectorEmulator, FileSectorEmulatorBuilder};

    const ENTRIES: usize = 10;

    struct Disk {
        dev: FileSectorEmulator,
        map: Bitmap,
    }

    impl Disk {
        fn new() -> Self {
            let dev = FileSectorEmulatorBuilder::from(tempfile::tempfile().unwrap())
                .with_sector_count(512)
                .build()
                .unwrap();
            let mut map = Bitmap::new(512);
            map.mark(0);
            map.mark(DIRECTORY_SECTOR);
            Disk { dev, map }
        }

        /// Allocates a directory file, at `sector` when given.
        fn dir_file(&mut self, sector: Option<SectorId>) -> OpenFile {
            let sector = sector.unwrap_or_else(|| self.map.find_and_set().unwrap());
            let mut hdr = FileHeader::new();
            hdr.allocate(&mut self.dev, &mut self.map, Directory::file_size(ENTRIES))
                .unwrap();
            hdr.write_back(&mut self.dev, sector).unwrap();
            OpenFile::from_header(sector, hdr)
        }

        /// Creates an empty subdirectory `name` inside `parent`.
        fn mkdir(&mut self, parent: &mut Directory, parent_file: &OpenFile, name: &str) -> (Directory, OpenFile) {
            let file = self.dir_file(None);
            let dir = Directory::new(ENTRIES);
            dir.write_back(&mut self.dev, &file).unwrap();
            parent.add(name, file.sector(), true).unwrap();
            parent.write_back(&mut self.dev, parent_file).unwrap();
            (dir, file)
        }
    }

    #[test]
    fn entries_are_sixteen_bytes() {
        assert_eq!(DIR_ENTRY_SIZE, 16);
        assert_eq!(Directory::file_size(64), 1024);
    }

    #[test]
    fn add_then_find() {
        let mut dir = Directory::new(ENTRIES);
        dir.add("a", 10, false).unwrap();
        dir.add("b", 11, true).unwrap();

        assert_eq!(dir.find("a"), Some(10));
        assert_eq!(dir.find("b"), Some(11));
        assert_eq!(dir.find_index("b"), Some(1));
        assert_eq!(dir.is_dir("b"), Some(true));
        assert_eq!(dir.is_dir("a"), Some(false));
        assert_eq!(dir.find("c"), None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut dir = Directory::new(ENTRIES);
        dir.add("dup", 10, false).unwrap();
        let before = dir.clone();

        let err = dir.add("dup", 99, true).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
        assert_eq!(dir, before);
    }

    #[test]
    fn full_directory_rejects_new_names() {
        let mut dir = Directory::new(ENTRIES);
        for i in 0..ENTRIES {
            dir.add(&format!("f{}", i), i as SectorId + 10, false).unwrap();
        }
        let before = dir.clone();

        let err = dir.add("extra", 50, false).unwrap_err();
        assert!(matches!(err, FsError::DirectoryFull));
        assert_eq!(dir, before);
        for i in 0..ENTRIES {
            assert_eq!(dir.find(&format!("f{}", i)), Some(i as SectorId + 10));
        }
    }

    #[test]
    fn remove_then_find_misses() {
        let mut dir = Directory::new(ENTRIES);
        dir.add("gone", 10, false).unwrap();
        dir.remove("gone").unwrap();

        assert_eq!(dir.find("gone"), None);
        assert!(dir.is_empty());
        assert!(matches!(dir.remove("gone"), Err(FsError::DoesNotExist(_))));
        // The freed slot is reused.
        dir.add("again", 12, false).unwrap();
        assert_eq!(dir.find_index("again"), Some(0));
    }

    #[test]
    fn names_are_bounded() {
        let mut dir = Directory::new(ENTRIES);
        dir.add("abcdefghijkl", 10, false).unwrap();

        assert_eq!(dir.list().collect::<Vec<_>>(), vec!["abcdefghi"]);
        assert_eq!(dir.find("abcdefghi"), Some(10));
        assert_eq!(dir.find("abcdefghiXYZ"), Some(10));
        assert!(matches!(
            dir.add("abcdefghi-other", 11, false),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn bad_names_are_rejected() {
        let mut dir = Directory::new(ENTRIES);
        assert!(matches!(dir.add("", 10, false), Err(FsError::InvalidArgument(_))));
        assert!(matches!(dir.add("a/b", 10, false), Err(FsError::InvalidArgument(_))));
        assert!(dir.is_empty());
    }

    #[test]
    fn list_follows_table_order() {
        let mut dir = Directory::new(ENTRIES);
        dir.add("one", 10, false).unwrap();
        dir.add("two", 11, false).unwrap();
        dir.add("three", 12, false).unwrap();
        dir.remove("one").unwrap();
        dir.add("four", 13, false).unwrap();

        assert_eq!(dir.list().collect::<Vec<_>>(), vec!["four", "two", "three"]);
        // Listing again starts over.
        assert_eq!(dir.list().count(), 3);
    }

    #[test]
    fn directory_round_trips_through_disk() {
        let mut disk = Disk::new();
        let file = disk.dir_file(Some(DIRECTORY_SECTOR));
        let mut dir = Directory::new(ENTRIES);
        dir.add("x", 40, false).unwrap();
        dir.add("y", 41, true).unwrap();
        dir.write_back(&mut disk.dev, &file).unwrap();

        let mut fetched = Directory::new(ENTRIES);
        fetched.fetch_from(&mut disk.dev, &file).unwrap();
        assert_eq!(fetched, dir);
    }

    #[test]
    fn fetching_name_that_is_not_utf8_is_reported() {
        let mut disk = Disk::new();
        let file = disk.dir_file(Some(DIRECTORY_SECTOR));
        let mut dir = Directory::new(ENTRIES);
        dir.add("ok", 40, false).unwrap();
        dir.add("bad", 41, false).unwrap();
        dir.write_back(&mut disk.dev, &file).unwrap();
        // Overwrite the start of the second entry's name.
        file.write_at(&mut disk.dev, &[0xff, 0xfe], DIR_ENTRY_SIZE + 2)
            .unwrap();

        let mut fetched = Directory::new(ENTRIES);
        let err = fetched.fetch_from(&mut disk.dev, &file).unwrap_err();
        assert!(matches!(err, FsError::Corrupted(_)));
    }

    #[test]
    fn nested_paths_resolve() {
        let mut disk = Disk::new();
        let root_file = disk.dir_file(Some(DIRECTORY_SECTOR));
        let mut root = Directory::new(ENTRIES);
        root.write_back(&mut disk.dev, &root_file).unwrap();

        let (mut a, a_file) = disk.mkdir(&mut root, &root_file, "a");
        let (mut b, b_file) = disk.mkdir(&mut a, &a_file, "b");
        let (_, c_file) = disk.mkdir(&mut b, &b_file, "c");
        b.add("file", 77, false).unwrap();
        b.write_back(&mut disk.dev, &b_file).unwrap();

        let dev = &mut disk.dev;
        assert_eq!(root.get_dir_sector(dev, "/").unwrap(), Some(DIRECTORY_SECTOR));
        assert_eq!(root.get_dir_sector(dev, "/a").unwrap(), Some(a_file.sector()));
        assert_eq!(root.get_dir_sector(dev, "/a/b/").unwrap(), Some(b_file.sector()));
        assert_eq!(root.get_dir_sector(dev, "/a/b/c").unwrap(), Some(c_file.sector()));
        assert_eq!(root.get_dir_sector(dev, "/a/b/file").unwrap(), Some(77));

        assert_eq!(root.get_dir_sector(dev, "/x/b/c").unwrap(), None);
        assert_eq!(root.get_dir_sector(dev, "/a/x/c").unwrap(), None);
        assert_eq!(root.get_dir_sector(dev, "/a/b/x").unwrap(), None);
        // A file cannot be walked through.
        assert_eq!(root.get_dir_sector(dev, "/a/b/file/c").unwrap(), None);
        assert!(matches!(
            root.get_dir_sector(dev, "a/b"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn recursive_list_walks_the_tree() {
        let mut disk = Disk::new();
        let root_file = disk.dir_file(Some(DIRECTORY_SECTOR));
        let mut root = Directory::new(ENTRIES);
        root.write_back(&mut disk.dev, &root_file).unwrap();

        let (mut a, a_file) = disk.mkdir(&mut root, &root_file, "a");
        a.add("inner", 70, false).unwrap();
        a.write_back(&mut disk.dev, &a_file).unwrap();
        disk.mkdir(&mut a, &a_file, "sub");
        root.add("top", 71, false).unwrap();

        let mut out = Vec::new();
        root.recursive_list(&mut disk.dev, 0, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[D] a\n    [F] inner\n    [D] sub\n[F] top\n"
        );
    }

    #[test]
    fn recursive_list_reports_cycles() {
        let mut disk = Disk::new();
        let root_file = disk.dir_file(Some(DIRECTORY_SECTOR));
        let mut root = Directory::new(ENTRIES);
        root.write_back(&mut disk.dev, &root_file).unwrap();

        let (mut a, a_file) = disk.mkdir(&mut root, &root_file, "a");
        // A corrupted entry pointing "a" back at itself.
        a.add("loop", a_file.sector(), true).unwrap();
        a.write_back(&mut disk.dev, &a_file).unwrap();

        let mut out = Vec::new();
        let err = root.recursive_list(&mut disk.dev, 0, &mut out).unwrap_err();
        assert!(matches!(err, FsError::Corrupted(_)));
    }
}
