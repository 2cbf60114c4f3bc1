use crate::fs::SECTOR_SIZE;
use crate::io::block::{SectorId, SectorStorage};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

use log::debug;

/// Emulates a sector addressed disk in userspace using a host file as the
/// medium. This is only meant to be used for file system development and
/// testing.
pub struct FileSectorEmulator {
    /// The file must be a fixed-size file some exact multiple of the sector size.
    fd: File,
    /// The total number of sectors available in the file store.
    sector_count: usize,
}

impl FileSectorEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, sector: SectorId) -> std::io::Result<()> {
        if sector as usize >= self.sector_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("sector {} out of range", sector),
            ));
        }
        Ok(())
    }
}

impl SectorStorage for FileSectorEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nsectors: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        let len = file.metadata()?.len();
        if len < (nsectors * SECTOR_SIZE) as u64 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("disk image holds {} bytes, need {}", len, nsectors * SECTOR_SIZE),
            ));
        }
        Ok(FileSectorEmulator {
            fd: file,
            sector_count: nsectors,
        })
    }

    fn read_sector(&mut self, sector: SectorId, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(sector)?;
        if buf.len() < SECTOR_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read sector",
            ));
        }
        self.fd
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        // Limit the read to just the sector specified.
        self.fd.read_exact(&mut buf[..SECTOR_SIZE])?;
        Ok(())
    }

    /// This method truncates writes that exceed the sector size.
    fn write_sector(&mut self, sector: SectorId, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(sector)?;
        self.fd
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;

        let max = SECTOR_SIZE.min(buf.len());
        self.fd.write_all(&buf[..max])?;
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }

    fn sector_count(&self) -> usize {
        self.sector_count
    }
}

pub struct FileSectorEmulatorBuilder {
    fd: File,
    sector_count: usize,
    clear_medium: bool,
}

impl From<File> for FileSectorEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileSectorEmulatorBuilder {
            fd,
            sector_count: crate::fs::NUM_SECTORS,
            clear_medium: true,
        }
    }
}

impl FileSectorEmulatorBuilder {
    /// Sets the number of sectors in the device.
    pub fn with_sector_count(mut self, sectors: usize) -> Self {
        self.sector_count = sectors;
        self
    }

    /// Zero the medium when building (the default). Pass `false` to reattach to
    /// an image that already holds a file system.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and, unless
    /// told otherwise, does destructive things to prepare the file for use.
    pub fn build(mut self) -> std::io::Result<FileSectorEmulator> {
        if self.sector_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "device needs at least one sector",
            ));
        }
        if self.clear_medium {
            self.zero_medium()?;
        }
        Ok(FileSectorEmulator {
            fd: self.fd,
            sector_count: self.sector_count,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        debug!("zeroing {} sectors", self.sector_count);
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Buffer each sector write to prevent excessive syscalls.
        let zeros = [0x00; SECTOR_SIZE];
        for _ in 0..self.sector_count {
            bfd.write_all(&zeros)?;
        }
        bfd.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(sectors: usize) -> FileSectorEmulator {
        FileSectorEmulatorBuilder::from(tempfile::tempfile().unwrap())
            .with_sector_count(sectors)
            .build()
            .expect("failed to allocate sector device")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = device(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(
            disk_emu.into_file().metadata().unwrap().len(),
            4 * SECTOR_SIZE as u64
        );
    }

    #[test]
    fn can_read_and_write_sectors() {
        let mut disk_emu = device(4);

        let block = vec![0x55; SECTOR_SIZE];
        disk_emu.write_sector(2, &block).unwrap();

        let mut read_block = vec![0x00; SECTOR_SIZE];
        // Read a different sector.
        disk_emu.read_sector(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; SECTOR_SIZE]);

        disk_emu.read_sector(2, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x55; SECTOR_SIZE]);
    }

    #[test]
    fn can_read_and_write_start_and_end_sectors() {
        let mut disk_emu = device(2);

        disk_emu.write_sector(0, &[0x11; SECTOR_SIZE]).unwrap();
        disk_emu.write_sector(1, &[0x22; SECTOR_SIZE]).unwrap();

        let mut read_block = vec![0x00; SECTOR_SIZE];
        disk_emu.read_sector(0, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x11; SECTOR_SIZE]);
        disk_emu.read_sector(1, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x22; SECTOR_SIZE]);
    }

    #[test]
    fn access_beyond_range_is_an_error() {
        let mut disk_emu = device(1);

        let block = vec![0x55; SECTOR_SIZE];
        let err = disk_emu.write_sector(1, &block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let mut buf = vec![0; SECTOR_SIZE];
        assert!(disk_emu.read_sector(1, &mut buf).is_err());
    }

    #[test]
    fn short_read_buffer_is_rejected() {
        let mut disk_emu = device(1);
        let mut buf = vec![0; SECTOR_SIZE / 2];
        assert!(disk_emu.read_sector(0, &mut buf).is_err());
    }

    #[test]
    fn short_write_only_touches_prefix() {
        let mut disk_emu = device(1);
        disk_emu.write_sector(0, &[0x55; SECTOR_SIZE]).unwrap();
        disk_emu.write_sector(0, &[0x11; SECTOR_SIZE / 2]).unwrap();

        let mut buf = vec![0; SECTOR_SIZE];
        disk_emu.read_sector(0, &mut buf).unwrap();
        assert!(buf[..SECTOR_SIZE / 2].iter().all(|&b| b == 0x11));
        assert!(buf[SECTOR_SIZE / 2..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn reattach_without_clearing_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut dev = FileSectorEmulatorBuilder::from(disk.reopen().unwrap())
            .with_sector_count(2)
            .build()
            .unwrap();
        dev.write_sector(1, &[0x7f; SECTOR_SIZE]).unwrap();
        dev.sync_disk().unwrap();

        let mut dev = FileSectorEmulatorBuilder::from(disk.reopen().unwrap())
            .with_sector_count(2)
            // Don't reset initialized disk.
            .clear_medium(false)
            .build()
            .unwrap();
        let mut buf = vec![0; SECTOR_SIZE];
        dev.read_sector(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x7f; SECTOR_SIZE]);
    }

    #[test]
    fn open_disk_checks_image_size() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        FileSectorEmulatorBuilder::from(disk.reopen().unwrap())
            .with_sector_count(4)
            .build()
            .unwrap();

        assert!(FileSectorEmulator::open_disk(disk.path(), 4).is_ok());
        assert!(FileSectorEmulator::open_disk(disk.path(), 5).is_err());
    }
}
