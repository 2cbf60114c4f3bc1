use std::io::Write;

use crate::alloc::FreeSectorMap;
use crate::fs::{FsError, SECTOR_SIZE};
use crate::io::{SectorId, SectorStorage};

use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes};

/// `num_bytes`, `num_sectors` and `level`.
const HEADER_FIELDS_SIZE: usize = 3 * std::mem::size_of::<u32>();

/// Number of sector pointers that fit next to the header fields in one sector.
pub const NUM_DIRECT: usize = (SECTOR_SIZE - HEADER_FIELDS_SIZE) / std::mem::size_of::<SectorId>();
pub const MAX_DIRECT_SIZE: usize = NUM_DIRECT * SECTOR_SIZE;
pub const MAX_SINGLE_INDIRECT_SIZE: usize = NUM_DIRECT * MAX_DIRECT_SIZE;
pub const MAX_DOUBLE_INDIRECT_SIZE: usize = NUM_DIRECT * MAX_SINGLE_INDIRECT_SIZE;
pub const MAX_TRIPLE_INDIRECT_SIZE: usize = NUM_DIRECT * MAX_DOUBLE_INDIRECT_SIZE;

const _: () = assert!(std::mem::size_of::<FileHeader>() == SECTOR_SIZE);

/// How many header hops separate a file header from its data sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indirection {
    /// Pointers name data sectors.
    Direct = 0,
    /// Pointers name direct headers.
    Single = 1,
    /// Pointers name single indirect headers.
    Double = 2,
    /// Pointers name double indirect headers.
    Triple = 3,
}

impl Indirection {
    /// The smallest level able to hold `size` bytes.
    pub fn for_size(size: usize) -> Option<Self> {
        [
            Indirection::Direct,
            Indirection::Single,
            Indirection::Double,
            Indirection::Triple,
        ]
        .into_iter()
        .find(|level| size <= level.max_size())
    }

    pub fn max_size(self) -> usize {
        match self {
            Indirection::Direct => MAX_DIRECT_SIZE,
            Indirection::Single => MAX_SINGLE_INDIRECT_SIZE,
            Indirection::Double => MAX_DOUBLE_INDIRECT_SIZE,
            Indirection::Triple => MAX_TRIPLE_INDIRECT_SIZE,
        }
    }

    /// Bytes covered by a single pointer at this level.
    pub fn span(self) -> usize {
        match self.child() {
            Some(child) => child.max_size(),
            None => SECTOR_SIZE,
        }
    }

    pub fn child(self) -> Option<Self> {
        match self {
            Indirection::Direct => None,
            Indirection::Single => Some(Indirection::Direct),
            Indirection::Double => Some(Indirection::Single),
            Indirection::Triple => Some(Indirection::Double),
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Indirection::Direct),
            1 => Some(Indirection::Single),
            2 => Some(Indirection::Double),
            3 => Some(Indirection::Triple),
            _ => None,
        }
    }
}

/// The on-disk index of a file, exactly one sector long.
///
/// A header maps byte offsets of its file onto sectors. Direct headers point
/// straight at data; indirect headers point at nested headers, each covering
/// a contiguous sub-range of the file no larger than `Indirection::span`.
/// Nested headers pick their own level from the bytes they cover, so the
/// tail of a file may sit under a shallower tree than its head.
///
/// Unlike in a real system, there are no permissions, owners or timestamps.
#[repr(C)]
#[derive(AsBytes, FromBytes, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Size of the file in bytes, -1 until allocated or fetched.
    num_bytes: i32,
    /// Number of entries of `data_sectors` in use.
    num_sectors: u32,
    /// Raw `Indirection` discriminant.
    level: u32,
    data_sectors: [SectorId; NUM_DIRECT],
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

fn div_round_up(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

impl FileHeader {
    /// An uninitialised header. Populate it with `allocate` or use `fetch_from`.
    pub fn new() -> Self {
        Self {
            num_bytes: -1,
            num_sectors: 0,
            level: Indirection::Direct as u32,
            data_sectors: [0; NUM_DIRECT],
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.num_bytes >= 0
    }

    /// The number of bytes in the file, zero while uninitialised.
    pub fn file_length(&self) -> usize {
        self.num_bytes.max(0) as usize
    }

    pub fn level(&self) -> Indirection {
        // Validated by `fetch_from` and only ever set from an `Indirection`.
        Indirection::from_raw(self.level).unwrap_or(Indirection::Direct)
    }

    pub fn num_sectors(&self) -> usize {
        self.num_sectors as usize
    }

    /// The pointers in use, data sectors for direct headers and nested header
    /// sectors otherwise.
    pub fn sectors(&self) -> &[SectorId] {
        &self.data_sectors[..self.num_sectors()]
    }

    /// Initialize a fresh header for a newly created file, claiming every
    /// sector it needs out of `free_map` and writing nested headers to disk.
    ///
    /// Either the whole tree is built or, on any failure, every sector claimed
    /// during the call is returned to `free_map` and the header is reset.
    ///
    /// # Errors
    ///
    /// `FileTooLarge` when `file_size` exceeds the triple indirect limit, in
    /// which case nothing is claimed, and `NoSpace` when the disk runs out.
    pub fn allocate<T, M>(
        &mut self,
        dev: &mut T,
        free_map: &mut M,
        file_size: usize,
    ) -> Result<(), FsError>
    where
        T: SectorStorage,
        M: FreeSectorMap + ?Sized,
    {
        let mut claimed = Vec::new();
        if let Err(err) = self.allocate_tracked(dev, free_map, file_size, &mut claimed) {
            if !claimed.is_empty() {
                warn!(
                    "allocating {} bytes failed ({}), releasing {} claimed sectors",
                    file_size,
                    err,
                    claimed.len()
                );
            }
            for &sector in claimed.iter().rev() {
                free_map.clear(sector);
            }
            *self = FileHeader::new();
            return Err(err);
        }
        debug!(
            "allocated {} bytes at level {:?} over {} pointers",
            file_size, self.level(), self.num_sectors
        );
        Ok(())
    }

    fn allocate_tracked<T, M>(
        &mut self,
        dev: &mut T,
        free_map: &mut M,
        file_size: usize,
        claimed: &mut Vec<SectorId>,
    ) -> Result<(), FsError>
    where
        T: SectorStorage,
        M: FreeSectorMap + ?Sized,
    {
        let level = Indirection::for_size(file_size).ok_or(FsError::FileTooLarge {
            size: file_size,
            max: MAX_TRIPLE_INDIRECT_SIZE,
        })?;
        let span = level.span();
        let num_sectors = div_round_up(file_size, span);
        // Only the pointers of this level are checked, nested headers check
        // for their own sectors.
        if free_map.num_clear() < num_sectors {
            return Err(FsError::NoSpace);
        }

        self.num_bytes = file_size as i32;
        self.level = level as u32;
        self.num_sectors = 0;

        let mut remaining = file_size;
        for slot in 0..num_sectors {
            let sector = free_map.find_and_set().ok_or(FsError::NoSpace)?;
            claimed.push(sector);
            self.data_sectors[slot] = sector;
            self.num_sectors += 1;

            if level == Indirection::Direct {
                continue;
            }
            let child_size = remaining.min(span);
            let mut child = FileHeader::new();
            child.allocate_tracked(dev, free_map, child_size, claimed)?;
            child.write_back(dev, sector)?;
            remaining -= child_size;
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }

    /// De-allocate all the space allocated for this file, nested headers
    /// before the sectors that hold them.
    ///
    /// # Errors
    ///
    /// `Corrupted` if a sector the file owns is already marked free.
    pub fn deallocate<T, M>(&self, dev: &mut T, free_map: &mut M) -> Result<(), FsError>
    where
        T: SectorStorage,
        M: FreeSectorMap + ?Sized,
    {
        for &sector in self.sectors() {
            if self.level() != Indirection::Direct {
                let child = FileHeader::fetch_from(dev, sector)?;
                child.deallocate(dev, free_map)?;
            }
            if !free_map.test(sector) {
                return Err(FsError::Corrupted(format!(
                    "sector {} owned by a file is already free",
                    sector
                )));
            }
            free_map.clear(sector);
        }
        Ok(())
    }

    /// Fetch the contents of a file header from disk.
    pub fn fetch_from<T: SectorStorage>(dev: &mut T, sector: SectorId) -> Result<Self, FsError> {
        let mut buf = [0; SECTOR_SIZE];
        dev.read_sector(sector, &mut buf)?;
        let hdr = FileHeader::read_from(&buf[..])
            .ok_or_else(|| FsError::Corrupted(format!("sector {} is not a file header", sector)))?;
        hdr.validate(dev.sector_count()).map_err(|reason| {
            FsError::Corrupted(format!("file header at sector {}: {}", sector, reason))
        })?;
        Ok(hdr)
    }

    /// Checks that the fields agree with each other and that every pointer in
    /// use names a sector of a `sector_count` sector disk.
    fn validate(&self, sector_count: usize) -> Result<(), String> {
        let level = Indirection::from_raw(self.level)
            .ok_or_else(|| format!("unknown level {}", self.level))?;
        if !self.is_initialized() {
            return match (self.num_bytes, self.num_sectors) {
                (-1, 0) => Ok(()),
                _ => Err(format!("negative size {}", self.num_bytes)),
            };
        }
        if self.file_length() > level.max_size() {
            return Err(format!(
                "{} bytes do not fit in a {:?} header",
                self.num_bytes, level
            ));
        }
        let expected = div_round_up(self.file_length(), level.span());
        if self.num_sectors() != expected {
            return Err(format!(
                "{} pointers for {} bytes, expected {}",
                self.num_sectors, self.num_bytes, expected
            ));
        }
        match self.sectors().iter().find(|&&s| s as usize >= sector_count) {
            Some(s) => Err(format!("pointer {} is past the end of the disk", s)),
            None => Ok(()),
        }
    }

    /// Write the header back to disk.
    pub fn write_back<T: SectorStorage>(&self, dev: &mut T, sector: SectorId) -> Result<(), FsError> {
        dev.write_sector(sector, self.as_bytes())?;
        Ok(())
    }

    /// Translate a byte offset within the file into the sector storing it.
    ///
    /// # Errors
    ///
    /// `OffsetOutOfRange` when `offset` is not below the file length.
    pub fn byte_to_sector<T: SectorStorage>(
        &self,
        dev: &mut T,
        offset: usize,
    ) -> Result<SectorId, FsError> {
        if offset >= self.file_length() {
            return Err(FsError::OffsetOutOfRange {
                offset,
                length: self.file_length(),
            });
        }
        let span = self.level().span();
        let sector = *self.sectors().get(offset / span).ok_or_else(|| {
            FsError::Corrupted(format!(
                "offset {} has no pointer among {}",
                offset, self.num_sectors
            ))
        })?;
        match self.level() {
            Indirection::Direct => Ok(sector),
            _ => FileHeader::fetch_from(dev, sector)?.byte_to_sector(dev, offset % span),
        }
    }

    /// Number of headers in the tree rooted here, this one included.
    pub fn count_headers<T: SectorStorage>(&self, dev: &mut T) -> Result<usize, FsError> {
        let mut count = 1;
        if self.level() != Indirection::Direct {
            for &sector in self.sectors() {
                count += FileHeader::fetch_from(dev, sector)?.count_headers(dev)?;
            }
        }
        Ok(count)
    }

    /// Every data sector of the file in byte order.
    pub fn data_sectors<T: SectorStorage>(&self, dev: &mut T) -> Result<Vec<SectorId>, FsError> {
        if self.level() == Indirection::Direct {
            return Ok(self.sectors().to_vec());
        }
        let mut leaves = Vec::with_capacity(div_round_up(self.file_length(), SECTOR_SIZE));
        for &sector in self.sectors() {
            leaves.extend(FileHeader::fetch_from(dev, sector)?.data_sectors(dev)?);
        }
        Ok(leaves)
    }

    /// Dump the header, the size of its tree and the contents of the file.
    /// Unprintable bytes are written as `\xx`.
    pub fn print<T: SectorStorage>(&self, dev: &mut T, out: &mut dyn Write) -> Result<(), FsError> {
        writeln!(
            out,
            "FileHeader contents.  File size: {}.  File blocks:",
            self.num_bytes
        )?;
        let pointers: Vec<String> = self.sectors().iter().map(|s| s.to_string()).collect();
        writeln!(out, "{}", pointers.join(" "))?;
        writeln!(out, "Total number of headers: {}", self.count_headers(dev)?)?;

        writeln!(out, "File contents:")?;
        let mut data = [0; SECTOR_SIZE];
        let mut remaining = self.file_length();
        for sector in self.data_sectors(dev)? {
            dev.read_sector(sector, &mut data)?;
            for &byte in data.iter().take(remaining) {
                if (0x20..=0x7e).contains(&byte) {
                    write!(out, "{}", byte as char)?;
                } else {
                    write!(out, "\\{:x}", byte)?;
                }
            }
            remaining = remaining.saturating_sub(SECTOR_SIZE);
            writeln!(out)?;
        }
        Ok(())
    }
}
