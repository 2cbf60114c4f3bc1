use crate::fs::{FsError, SECTOR_SIZE};
use crate::io::{SectorId, SectorStorage};
use crate::node::FileHeader;

/// A file whose header has been read into memory. Reads and writes are
/// byte-granular and never change the size of the file.
#[derive(Debug, Clone)]
pub struct OpenFile {
    /// Sector holding the header.
    sector: SectorId,
    hdr: FileHeader,
    seek_position: usize,
}

impl OpenFile {
    pub fn open<T: SectorStorage>(dev: &mut T, sector: SectorId) -> Result<Self, FsError> {
        let hdr = FileHeader::fetch_from(dev, sector)?;
        Ok(Self::from_header(sector, hdr))
    }

    /// Wraps a header that is already in memory, e.g. one just allocated.
    pub fn from_header(sector: SectorId, hdr: FileHeader) -> Self {
        Self {
            sector,
            hdr,
            seek_position: 0,
        }
    }

    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn header(&self) -> &FileHeader {
        &self.hdr
    }

    pub fn length(&self) -> usize {
        self.hdr.file_length()
    }

    pub fn seek(&mut self, position: usize) {
        self.seek_position = position;
    }

    /// Reads from the current position and advances past the bytes read.
    pub fn read<T: SectorStorage>(&mut self, dev: &mut T, buf: &mut [u8]) -> Result<usize, FsError> {
        let n = self.read_at(dev, buf, self.seek_position)?;
        self.seek_position += n;
        Ok(n)
    }

    /// Writes at the current position and advances past the bytes written.
    pub fn write<T: SectorStorage>(&mut self, dev: &mut T, buf: &[u8]) -> Result<usize, FsError> {
        let n = self.write_at(dev, buf, self.seek_position)?;
        self.seek_position += n;
        Ok(n)
    }

    /// Reads up to `buf.len()` bytes starting at `position`, stopping at the end
    /// of the file. Returns the number of bytes read.
    pub fn read_at<T: SectorStorage>(
        &self,
        dev: &mut T,
        buf: &mut [u8],
        position: usize,
    ) -> Result<usize, FsError> {
        let num_bytes = self.clamp(buf.len(), position);
        if num_bytes == 0 {
            return Ok(0);
        }

        let mut sector_buf = [0; SECTOR_SIZE];
        let mut copied = 0;
        for (start, end) in sector_spans(position, num_bytes) {
            let sector = self.hdr.byte_to_sector(dev, start)?;
            dev.read_sector(sector, &mut sector_buf)?;
            let (lo, hi) = (start % SECTOR_SIZE, (end - 1) % SECTOR_SIZE + 1);
            buf[copied..copied + (hi - lo)].copy_from_slice(&sector_buf[lo..hi]);
            copied += hi - lo;
        }
        Ok(copied)
    }

    /// Writes up to `buf.len()` bytes starting at `position`, stopping at the end
    /// of the file. Partially covered sectors keep their other bytes. Returns
    /// the number of bytes written.
    pub fn write_at<T: SectorStorage>(
        &self,
        dev: &mut T,
        buf: &[u8],
        position: usize,
    ) -> Result<usize, FsError> {
        let num_bytes = self.clamp(buf.len(), position);
        if num_bytes == 0 {
            return Ok(0);
        }

        let mut sector_buf = [0; SECTOR_SIZE];
        let mut copied = 0;
        for (start, end) in sector_spans(position, num_bytes) {
            let sector = self.hdr.byte_to_sector(dev, start)?;
            let (lo, hi) = (start % SECTOR_SIZE, (end - 1) % SECTOR_SIZE + 1);
            if hi - lo < SECTOR_SIZE {
                dev.read_sector(sector, &mut sector_buf)?;
            }
            sector_buf[lo..hi].copy_from_slice(&buf[copied..copied + (hi - lo)]);
            dev.write_sector(sector, &sector_buf)?;
            copied += hi - lo;
        }
        Ok(copied)
    }

    fn clamp(&self, requested: usize, position: usize) -> usize {
        requested.min(self.length().saturating_sub(position))
    }
}

/// Splits `[position, position + len)` at sector boundaries.
fn sector_spans(position: usize, len: usize) -> impl Iterator<Item = (usize, usize)> {
    let end = position + len;
    let first = position / SECTOR_SIZE;
    let last = (end - 1) / SECTOR_SIZE;
    (first..=last).map(move |i| {
        let start = (i * SECTOR_SIZE).max(position);
        let stop = ((i + 1) * SECTOR_SIZE).min(end);
        (start, stop)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Bitmap, FreeSectorMap};
    use crate::io::{FileSectorEmulator, FileSectorEmulatorBuilder};
    use crate::node::MAX_DIRECT_SIZE;

    fn create_file(size: usize) -> (FileSectorEmulator, OpenFile) {
        let mut dev = FileSectorEmulatorBuilder::from(tempfile::tempfile().unwrap())
            .with_sector_count(256)
            .build()
            .unwrap();
        let mut map = Bitmap::new(256);
        let sector = map.find_and_set().unwrap();
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut dev, &mut map, size).unwrap();
        hdr.write_back(&mut dev, sector).unwrap();
        let file = OpenFile::open(&mut dev, sector).unwrap();
        (dev, file)
    }

    #[test]
    fn spans_split_at_sector_boundaries() {
        let spans: Vec<_> = sector_spans(100, 200).collect();
        assert_eq!(spans, vec![(100, 128), (128, 256), (256, 300)]);
        let spans: Vec<_> = sector_spans(128, 128).collect();
        assert_eq!(spans, vec![(128, 256)]);
    }

    #[test]
    fn unaligned_write_reads_back() {
        let (mut dev, file) = create_file(1000);
        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();

        assert_eq!(file.write_at(&mut dev, &data, 77).unwrap(), 300);
        let mut back = vec![0; 300];
        assert_eq!(file.read_at(&mut dev, &mut back, 77).unwrap(), 300);
        assert_eq!(back, data);

        // Bytes around the write are still zero.
        let mut around = vec![0xaa; 10];
        file.read_at(&mut dev, &mut around, 67).unwrap();
        assert_eq!(around, vec![0; 10]);
    }

    #[test]
    fn io_is_clamped_to_file_length() {
        let (mut dev, file) = create_file(10);

        assert_eq!(file.write_at(&mut dev, b"0123456789abc", 4).unwrap(), 6);
        let mut buf = [0; 32];
        assert_eq!(file.read_at(&mut dev, &mut buf, 0).unwrap(), 10);
        assert_eq!(&buf[..10], b"\0\0\0\0012345");
        assert_eq!(file.read_at(&mut dev, &mut buf, 10).unwrap(), 0);
        assert_eq!(file.write_at(&mut dev, b"x", 50).unwrap(), 0);
    }

    #[test]
    fn sequential_io_advances_position() {
        let (mut dev, mut file) = create_file(2 * MAX_DIRECT_SIZE);
        let chunk = vec![7; MAX_DIRECT_SIZE + 3];

        assert_eq!(file.write(&mut dev, &chunk).unwrap(), chunk.len());
        assert_eq!(file.write(&mut dev, &chunk).unwrap(), MAX_DIRECT_SIZE - 3);

        file.seek(MAX_DIRECT_SIZE - 2);
        let mut buf = vec![0; 4];
        assert_eq!(file.read(&mut dev, &mut buf).unwrap(), 4);
        assert_eq!(buf, vec![7; 4]);
    }
}
