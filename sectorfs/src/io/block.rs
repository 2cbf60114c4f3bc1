use std::path::Path;

/// The sector number to access ranging from 0 (the first sector) to n - 1 (the
/// last sector) where n is the number of sectors on the device.
pub type SectorId = u32;

/// The raw driver seam of the file system. Every call moves exactly one sector
/// between the device and the caller's buffer, synchronously.
///
/// Implementations are not expected to be shared between threads; the file
/// system holds the device exclusively for the lifetime of a session.
pub trait SectorStorage {
    /// Opens a disk at the specified path. This method does not validate the
    /// sectors, it is up for clients to ensure disks are appropriately formatted.
    fn open_disk<P: AsRef<Path>>(path: P, nsectors: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// Reads a disk sector into the provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a sector out of range, or into a buffer shorter than
    /// one sector, will return an error.
    fn read_sector(&mut self, sector: SectorId, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes the provided buffer into the specified sector. Buffers longer than
    /// a sector are truncated, shorter buffers only overwrite a prefix.
    ///
    /// # Errors
    ///
    /// Attempting to write a sector out of range will return an error.
    fn write_sector(&mut self, sector: SectorId, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory.
    fn sync_disk(&mut self) -> std::io::Result<()>;
    /// Total number of addressable sectors.
    fn sector_count(&self) -> usize;
}
