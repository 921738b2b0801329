//! Per-sector transform for encrypted files
//!
//! Every logical sector of [`SECTOR_SIZE`] plaintext bytes is stored as a
//! fixed-size physical record `nonce || ciphertext || tag`. The sector index
//! is the AAD, so a sector copied to another position fails to decrypt.

use crate::config::SECTOR_SIZE;
use crate::crypto::encryption::{aead_key, open, seal};
use crate::crypto::{EncryptedData, FileKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use ring::aead::LessSafeKey;

/// On-disk size of one encrypted sector
pub const PHYSICAL_SECTOR_SIZE: usize = NONCE_SIZE + SECTOR_SIZE as usize + TAG_SIZE;

/// Stateless encoder/decoder bound to one file key
pub struct SectorCodec {
    key: LessSafeKey,
}

impl SectorCodec {
    pub fn new(file_key: &FileKey) -> Result<Self> {
        Ok(SectorCodec {
            key: aead_key(&file_key.sector_key()?)?,
        })
    }

    /// Encrypt one sector. Short plaintext is zero padded to a full sector.
    pub fn encode(&self, sector: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > SECTOR_SIZE as usize {
            return Err(Error::Encryption(format!(
                "sector payload of {} bytes exceeds sector size",
                plaintext.len()
            )));
        }

        let mut padded = [0u8; SECTOR_SIZE as usize];
        padded[..plaintext.len()].copy_from_slice(plaintext);

        let sealed = seal(&self.key, &padded, &sector.to_be_bytes())?;
        let bytes = sealed.to_bytes();
        debug_assert_eq!(bytes.len(), PHYSICAL_SECTOR_SIZE);
        Ok(bytes)
    }

    /// Decrypt one physical sector into its full plaintext
    pub fn decode(&self, sector: u64, physical: &[u8]) -> Result<Vec<u8>> {
        if physical.len() != PHYSICAL_SECTOR_SIZE {
            return Err(Error::Decryption(format!(
                "physical sector {} has {} bytes",
                sector,
                physical.len()
            )));
        }

        let encrypted = EncryptedData::from_bytes(physical)?;
        open(&self.key, &encrypted, &sector.to_be_bytes())
            .map_err(|_| Error::SectorAuthentication { sector })
    }
}

/// Index of the sector containing `offset`
pub fn sector_of(offset: u64) -> u64 {
    offset / SECTOR_SIZE
}

/// Number of sectors needed to hold `size` bytes
pub fn sectors_for(size: u64) -> u64 {
    size.div_ceil(SECTOR_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_roundtrip_pads() {
        let codec = SectorCodec::new(&FileKey::generate()).unwrap();
        let physical = codec.encode(3, b"hello").unwrap();
        assert_eq!(physical.len(), PHYSICAL_SECTOR_SIZE);

        let plain = codec.decode(3, &physical).unwrap();
        assert_eq!(plain.len(), SECTOR_SIZE as usize);
        assert_eq!(&plain[..5], b"hello");
        assert!(plain[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_sector_bound_to_position() {
        let codec = SectorCodec::new(&FileKey::generate()).unwrap();
        let physical = codec.encode(3, b"hello").unwrap();
        assert!(matches!(
            codec.decode(4, &physical),
            Err(Error::SectorAuthentication { sector: 4 })
        ));
    }

    #[test]
    fn test_wrong_key_is_authentication_error() {
        let physical = SectorCodec::new(&FileKey::generate())
            .unwrap()
            .encode(0, b"data")
            .unwrap();
        let other = SectorCodec::new(&FileKey::generate()).unwrap();
        assert!(other.decode(0, &physical).is_err());
    }

    #[test]
    fn test_sector_math() {
        assert_eq!(sector_of(0), 0);
        assert_eq!(sector_of(4095), 0);
        assert_eq!(sector_of(4096), 1);
        assert_eq!(sectors_for(0), 0);
        assert_eq!(sectors_for(1), 1);
        assert_eq!(sectors_for(4096), 1);
        assert_eq!(sectors_for(4097), 2);
    }
}
