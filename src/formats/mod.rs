pub mod bktr;
pub mod cnmt;
pub mod hfs0;
pub mod keys;
pub mod keyset;
pub mod kv;
pub mod nca;
pub mod npdm;
pub mod pfs0;
pub mod romfs;
pub mod ticket;
pub mod xci;

pub use keys::TitleKeys;
pub use keyset::Keyset;

use std::fmt;
use std::str::FromStr;

/// Identifies a single NCA: 16 raw bytes, displayed as lowercase hex.
///
/// ContentIds of NCAs produced by the Package Builder are derived from the
/// first 16 bytes of the running SHA-256 of the written NCA; this is the
/// identity invariant the builder's CNMT patching step relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; 16]);

impl ContentId {
    pub fn from_sha256_prefix(hash: &[u8; 32]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentId {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::error::Error::InvalidData(format!("bad content id: {e}")))?;
        if bytes.len() != 16 {
            return Err(crate::error::Error::InvalidData(format!(
                "content id must be 16 bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

/// 16-byte identifier linking an NCA to the ticket that supplies its title
/// key. Same binary shape as [`ContentId`] but kept distinct to avoid
/// accidentally comparing the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RightsId(pub [u8; 16]);

impl RightsId {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for RightsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_upper())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_roundtrips_through_hex() {
        let id = ContentId([0xAB; 16]);
        let hex = id.to_hex();
        let parsed: ContentId = hex.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn content_id_derives_from_sha256_prefix() {
        let hash = [7u8; 32];
        let id = ContentId::from_sha256_prefix(&hash);
        assert_eq!(&id.0, &hash[..16]);
    }
}