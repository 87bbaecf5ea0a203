//! ATR disk-image mounting and sector I/O.
//!
//! An ATR file is a 16-byte header followed by raw sector data. The first
//! three sectors are always 128 bytes; from sector 4 on the header's
//! declared sector size applies, with a page index selecting 128-byte
//! sub-blocks of larger sectors. All transfers to the host are one 128-byte
//! page at a time.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const ATR_HEADER_LEN: usize = 16;
pub const ATR_SIGNATURE: u16 = 0x0296;
pub const PAGE_LEN: usize = 128;

#[derive(Debug)]
pub enum DiskError {
    NoMedia,
    NotFound,
    BadHeader,
    InvalidSector,
    Io(io::Error),
}

impl DiskError {
    /// Status byte for the ACTIVATE response when mounting fails.
    pub fn mount_status(&self) -> u8 {
        match self {
            DiskError::NoMedia => 1,
            DiskError::NotFound => 2,
            _ => 3,
        }
    }

    /// Status byte for the sector read/write responses.
    pub fn sector_status(&self) -> u8 {
        2
    }
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DiskError::NoMedia => "No media",
            DiskError::NotFound => "Can't open ATR file",
            DiskError::BadHeader => "Bad ATR header",
            DiskError::InvalidSector => "Invalid sector",
            DiskError::Io(_) => "Disk I/O error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DiskError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            DiskError::NotFound
        } else {
            DiskError::Io(err)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AtrHeader {
    pub sector_size: u16,
    pub paragraphs: u32,
    raw: [u8; ATR_HEADER_LEN],
}

impl AtrHeader {
    pub fn parse(raw: [u8; ATR_HEADER_LEN]) -> Result<Self, DiskError> {
        let signature = u16::from_le_bytes([raw[0], raw[1]]);
        if signature != ATR_SIGNATURE {
            return Err(DiskError::BadHeader);
        }
        let pars_low = u16::from_le_bytes([raw[2], raw[3]]) as u32;
        let pars_high = u16::from_le_bytes([raw[6], raw[7]]) as u32;
        Ok(AtrHeader {
            sector_size: u16::from_le_bytes([raw[4], raw[5]]),
            paragraphs: pars_high << 16 | pars_low,
            raw,
        })
    }

    /// The header exactly as it appears on disk, for the ATR_HEADER command.
    pub fn raw(&self) -> &[u8; ATR_HEADER_LEN] {
        &self.raw
    }
}

/// Byte offset of a (sector, page) pair within an ATR file. Sectors 1..=3
/// are fixed 128-byte records straight after the header; from sector 4 the
/// declared sector size applies and `page` picks the 128-byte sub-block.
pub fn sector_byte_offset(sector: u16, page: u8, sector_size: u16) -> u32 {
    let mut offset = ATR_HEADER_LEN as u32;
    if sector <= 3 {
        offset += (sector as u32 - 1) * PAGE_LEN as u32;
    } else {
        offset += 3 * PAGE_LEN as u32
            + (sector as u32 - 4) * sector_size as u32
            + page as u32 * PAGE_LEN as u32;
    }
    offset
}

/// An open disk image with its parsed header. Owns the file handle for the
/// lifetime of the mount.
#[derive(Debug)]
pub struct MountedAtr {
    file: File,
    header: AtrHeader,
    size: u64,
}

impl MountedAtr {
    pub fn mount(path: &Path) -> Result<Self, DiskError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut raw = [0u8; ATR_HEADER_LEN];
        file.read_exact(&mut raw).map_err(|_| DiskError::BadHeader)?;
        let header = AtrHeader::parse(raw)?;
        let size = file.metadata()?.len();
        Ok(MountedAtr { file, header, size })
    }

    pub fn header(&self) -> &AtrHeader {
        &self.header
    }

    /// Read one 128-byte page. A page past the end of the file reads as
    /// zeroes rather than an error.
    pub fn read_sector(
        &mut self,
        sector: u16,
        page: u8,
        buf: &mut [u8; PAGE_LEN],
    ) -> Result<(), DiskError> {
        if sector == 0 {
            return Err(DiskError::InvalidSector);
        }
        let offset = sector_byte_offset(sector, page, self.header.sector_size) as u64;
        if offset + PAGE_LEN as u64 > self.size {
            buf.fill(0);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write one 128-byte page. Writes past the end of the file are an
    /// error; the image is never grown.
    pub fn write_sector(
        &mut self,
        sector: u16,
        page: u8,
        buf: &[u8; PAGE_LEN],
    ) -> Result<(), DiskError> {
        if sector == 0 {
            return Err(DiskError::InvalidSector);
        }
        let offset = sector_byte_offset(sector, page, self.header.sector_size) as u64;
        if offset + PAGE_LEN as u64 > self.size {
            return Err(DiskError::InvalidSector);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.sync_data()?;
        Ok(())
    }
}
