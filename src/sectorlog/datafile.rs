//! Encrypted data file layout
//!
//! ```text
//! 0      4        6          8             16
//! | VFSE | version | reserved | size (u64 LE) | sector 0 | sector 1 | ...
//! ```
//!
//! Each sector slot holds exactly [`PHYSICAL_SECTOR_SIZE`] bytes. A slot
//! past the end of the file, or one that is all zeroes (a hole that was
//! never written), reads back as `None`.

use crate::crypto::PHYSICAL_SECTOR_SIZE;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;

const DATA_MAGIC: [u8; 4] = *b"VFSE";
const DATA_VERSION: u16 = 1;

/// Size of the data file header
pub const DATA_HEADER_SIZE: u64 = 16;

/// Backing file of an encrypted open file
#[derive(Debug)]
pub struct EncryptedDataFile {
    file: File,
}

impl EncryptedDataFile {
    /// Open an existing data file, or initialize an empty one
    pub fn open(file: File) -> Result<Self> {
        let data = EncryptedDataFile { file };
        if data.file.metadata()?.len() == 0 {
            data.write_size(0)?;
        } else {
            data.read_size()?;
        }
        Ok(data)
    }

    fn header(size: u64) -> [u8; DATA_HEADER_SIZE as usize] {
        let mut header = [0u8; DATA_HEADER_SIZE as usize];
        header[..4].copy_from_slice(&DATA_MAGIC);
        header[4..6].copy_from_slice(&DATA_VERSION.to_le_bytes());
        header[8..].copy_from_slice(&size.to_le_bytes());
        header
    }

    /// Logical (plaintext) size recorded in the header
    pub fn read_size(&self) -> Result<u64> {
        let mut header = [0u8; DATA_HEADER_SIZE as usize];
        self.file.read_exact_at(&mut header, 0)?;
        if header[..4] != DATA_MAGIC {
            return Err(Error::Decryption(
                "encrypted data file has an invalid header".to_string(),
            ));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != DATA_VERSION {
            return Err(Error::Decryption(format!(
                "unsupported encrypted data file version {}",
                version
            )));
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&header[8..]);
        Ok(u64::from_le_bytes(size))
    }

    pub fn write_size(&self, size: u64) -> Result<()> {
        self.file.write_all_at(&Self::header(size), 0)?;
        Ok(())
    }

    fn position(sector: u64) -> u64 {
        DATA_HEADER_SIZE + sector * PHYSICAL_SECTOR_SIZE as u64
    }

    pub fn read_physical(&self, sector: u64) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; PHYSICAL_SECTOR_SIZE];
        match self.file.read_exact_at(&mut buf, Self::position(sector)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if buf.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    pub fn write_physical(&self, sector: u64, physical: &[u8]) -> Result<()> {
        debug_assert_eq!(physical.len(), PHYSICAL_SECTOR_SIZE);
        self.file.write_all_at(physical, Self::position(sector))?;
        Ok(())
    }

    /// Drop sector slots at and beyond `sectors`
    pub fn truncate_sectors(&self, sectors: u64) -> Result<()> {
        self.file.set_len(Self::position(sectors))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
