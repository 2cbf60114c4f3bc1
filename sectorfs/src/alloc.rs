use crate::fs::FsError;
use crate::io::{SectorId, SectorStorage};
use crate::openfile::OpenFile;

use log::debug;
use zerocopy::{AsBytes, FromBytes};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// The allocation view of the disk consumed by file headers. Claims happen one
/// sector at a time; callers check `num_clear` before a run of claims.
pub trait FreeSectorMap {
    /// How many sectors are currently free.
    fn num_clear(&self) -> usize;
    /// Claims the lowest numbered free sector, or `None` when the disk is full.
    fn find_and_set(&mut self) -> Option<SectorId>;
    /// Whether the sector is marked used. Sectors past the end never are.
    fn test(&self, sector: SectorId) -> bool;
    /// Marks a specific sector used.
    fn mark(&mut self, sector: SectorId);
    /// Returns a sector to the free pool.
    fn clear(&mut self, sector: SectorId);
}

/// One bit per sector, set when the sector is in use. Bits are packed into
/// 64-bit words, lowest sector in the least significant bit.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    num_bits: usize,
}

impl Bitmap {
    pub fn new(num_bits: usize) -> Self {
        Self {
            bitmap: vec![0; (num_bits + 63) / 64],
            num_bits,
        }
    }

    pub fn len(&self) -> usize {
        self.num_bits
    }

    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Size of the persisted form, which is always a whole number of words.
    pub fn byte_len(&self) -> usize {
        self.bitmap.len() * 8
    }

    /// Replaces the map with its persisted form.
    ///
    /// # Errors
    ///
    /// `Corrupted` when `buf` is not exactly `byte_len` bytes.
    pub fn parse(&mut self, buf: &[u8]) -> Result<(), FsError> {
        if buf.len() != self.byte_len() {
            return Err(FsError::Corrupted(format!(
                "bitmap of {} bytes, expected {}",
                buf.len(),
                self.byte_len()
            )));
        }
        for (word, chunk) in self.bitmap.iter_mut().zip(buf.chunks_exact(8)) {
            // chunks_exact guarantees the length read_from checks for.
            *word = u64::read_from(chunk).unwrap_or(0);
        }
        Ok(())
    }

    pub fn serialize(&self) -> &[u8] {
        self.bitmap.as_slice().as_bytes()
    }

    pub fn get(&self, sector: usize) -> State {
        assert!(sector < self.num_bits, "sector {} outside bitmap", sector);
        // Grab the u64 containing the significant bit.
        let word = self.bitmap[sector / 64];
        let mask = 0b01_u64 << (sector % 64);
        if word & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn set_reserved(&mut self, sector: usize) {
        assert!(sector < self.num_bits, "sector {} outside bitmap", sector);
        self.bitmap[sector / 64] |= 0b01_u64 << (sector % 64);
    }

    pub fn set_free(&mut self, sector: usize) {
        assert!(sector < self.num_bits, "sector {} outside bitmap", sector);
        self.bitmap[sector / 64] &= !(0b01_u64 << (sector % 64));
    }

    /// Loads the map from the free-map file.
    pub fn fetch_from<T: SectorStorage>(
        &mut self,
        dev: &mut T,
        file: &OpenFile,
    ) -> Result<(), FsError> {
        let mut buf = vec![0; self.byte_len()];
        let read = file.read_at(dev, &mut buf, 0)?;
        if read != buf.len() {
            return Err(FsError::Corrupted(format!(
                "free map file holds {} bytes, expected {}",
                read,
                buf.len()
            )));
        }
        self.parse(&buf)
    }

    /// Persists the map into the free-map file.
    pub fn write_back<T: SectorStorage>(&self, dev: &mut T, file: &OpenFile) -> Result<(), FsError> {
        let written = file.write_at(dev, self.serialize(), 0)?;
        if written != self.byte_len() {
            return Err(FsError::Corrupted(format!(
                "free map file accepted {} bytes, expected {}",
                written,
                self.byte_len()
            )));
        }
        Ok(())
    }
}

impl FreeSectorMap for Bitmap {
    fn num_clear(&self) -> usize {
        let used: usize = self.bitmap.iter().map(|w| w.count_ones() as usize).sum();
        self.num_bits - used
    }

    fn find_and_set(&mut self) -> Option<SectorId> {
        for (i, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let sector = i * 64 + bit;
            if sector >= self.num_bits {
                return None;
            }
            *word |= 0b01_u64 << bit;
            debug!("claimed sector {}", sector);
            return Some(sector as SectorId);
        }
        None
    }

    fn test(&self, sector: SectorId) -> bool {
        (sector as usize) < self.num_bits && self.get(sector as usize) == State::Used
    }

    fn mark(&mut self, sector: SectorId) {
        self.set_reserved(sector as usize);
    }

    fn clear(&mut self, sector: SectorId) {
        debug!("freed sector {}", sector);
        self.set_free(sector as usize);
    }
}
