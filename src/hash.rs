//! Sector identifiers: `BLAKE3_KEYED(salt, merkle_root)`.

use crate::byteutils::to_hex;
use crate::error::SectorStoreError;
use crate::Result;
use rand::RngCore;
use std::convert::TryInto;
use std::fmt;

pub const HASH_SIZE: usize = 32;

/// Merkle root of a sector's content, computed by the caller.
pub type MerkleRoot = [u8; HASH_SIZE];

/// Per-store random key mixed into every sector identifier.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; HASH_SIZE]);

impl Salt {
    pub fn generate() -> Salt {
        let mut salt = [0u8; HASH_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Salt(salt)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Salt> {
        let salt: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| SectorStoreError::InvalidLog(format!("salt of {} bytes", bytes.len())))?;
        Ok(Salt(salt))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    // never print key material
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(..)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SectorID([u8; HASH_SIZE]);

impl SectorID {
    pub fn derive(salt: &Salt, root: &MerkleRoot) -> SectorID {
        let mut hasher = blake3::Hasher::new_keyed(salt.as_bytes());
        hasher.update(root);
        SectorID(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SectorID> {
        let id: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            SectorStoreError::InvalidLog(format!("sector id of {} bytes", bytes.len()))
        })?;
        Ok(SectorID(id))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for SectorID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl fmt::Debug for SectorID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorID({})", to_hex(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use crate::hash::{Salt, SectorID};

    #[test]
    fn test_derive() {
        let salt = Salt::generate();
        let root1 = [1u8; 32];
        let root2 = [2u8; 32];
        assert_eq!(
            SectorID::derive(&salt, &root1),
            SectorID::derive(&salt, &root1)
        );
        assert_ne!(
            SectorID::derive(&salt, &root1),
            SectorID::derive(&salt, &root2)
        );

        // a different store maps the same content elsewhere
        let other = Salt::generate();
        assert_ne!(
            SectorID::derive(&salt, &root1),
            SectorID::derive(&other, &root1)
        );

        let restored = Salt::from_bytes(salt.as_bytes()).unwrap();
        assert_eq!(
            SectorID::derive(&salt, &root2),
            SectorID::derive(&restored, &root2)
        );
        assert!(Salt::from_bytes(&[0u8; 7]).is_err());
    }
}
