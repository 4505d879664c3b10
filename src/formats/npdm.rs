//! `main.npdm` describes a Program NCA's runtime metadata; embedded inside it
//! is the ACID block naming the program-id range and access control the
//! title is permitted, signed with an RSA-2048 key. The ACID patch replaces
//! that public key with a tool-held one and regenerates the signature, so a
//! dumped title can pass verification under a custom trust root.
//!
//! No donor equivalent; modeled after the `META`/`ACID` structures this
//! format is known to use, simplified to the fields the patch step touches
//! (program-id range, pool-partition, flags, filesystem/service/kernel
//! access control as an opaque trailing region, public key, signature).

use std::io::{Read, Seek};

use binrw::prelude::*;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::{RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Fixed-size `main.npdm` header preceding the ACI0/ACID blobs.
#[binrw]
#[brw(little, magic = b"META")]
#[derive(Debug, Clone)]
pub struct NpdmHeader {
    pub signature_key_generation: u32,
    pub _reserved1: [u8; 4],
    pub mmu_flags: u8,
    pub _reserved2: u8,
    pub main_thread_priority: u8,
    pub main_thread_core_number: u8,
    pub _reserved3: [u8; 4],
    pub system_resource_size: u32,
    pub process_category: u32,
    pub main_thread_stack_size: u32,
    pub title_name: [u8; 0x50],
    pub product_code: [u8; 0x10],
    pub _reserved4: [u8; 0x30],
    pub aci_offset: u32,
    pub aci_size: u32,
    pub acid_offset: u32,
    pub acid_size: u32,
}

impl NpdmHeader {
    pub const SIZE: u64 = 0x80;
}

/// The signed Access Control Info Descriptor. Everything from `magic`
/// onward (i.e. everything but `signature` itself) is the signed region.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct Acid {
    pub signature: [u8; 0x100],
    #[brw(magic = b"ACID")]
    pub size: u32,
    pub version: u32,
    pub flags: u32,
    pub program_id_min: u64,
    pub program_id_max: u64,
    pub fac_offset: u32,
    pub fac_size: u32,
    pub sac_offset: u32,
    pub sac_size: u32,
    pub kac_offset: u32,
    pub kac_size: u32,
    pub pool_partition: u32,
    pub public_key: [u8; 0x100],
    #[br(count = (kac_offset as u64 + kac_size as u64).saturating_sub(0x30))]
    pub access_control_data: Vec<u8>,
}

impl Acid {
    pub const HEADER_SIZE_AFTER_SIGNATURE: u64 = 0x30;

    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut cursor = binrw::io::Cursor::new(&mut out);
        self.write_le(&mut cursor)
            .map_err(|e| Error::InvalidData(format!("failed to serialize ACID: {e}")))?;
        Ok(out)
    }

    /// The bytes covered by the RSA signature: everything after the
    /// signature field itself.
    fn signed_region(&self) -> Result<Vec<u8>, Error> {
        let bytes = self.to_bytes()?;
        Ok(bytes[0x100..].to_vec())
    }

    /// Replaces the embedded public key with `tool_key`'s public half and
    /// regenerates the RSA-2048/SHA-256 signature over the rest of the
    /// block. The signature is nondeterministic across calls: PKCS#1 v1.5
    /// signing is itself deterministic, but nothing here pins the key, so
    /// repeated patches with different tool keys produce different bytes.
    pub fn patch_public_key(&mut self, tool_key: &RsaPrivateKey) -> Result<(), Error> {
        let public_key = RsaPublicKey::from(tool_key);
        let modulus = public_key.n().to_bytes_be();
        if modulus.len() > 0x100 {
            return Err(Error::CryptoError(
                "ACID patch key modulus larger than 0x100 bytes".to_string(),
            ));
        }
        let mut padded = [0u8; 0x100];
        padded[0x100 - modulus.len()..].copy_from_slice(&modulus);
        self.public_key = padded;

        let signed = self.signed_region()?;
        let mut hasher = Sha256::new();
        hasher.update(&signed);
        let digest = hasher.finalize();

        let signature = tool_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| Error::CryptoError(format!("ACID re-sign failed: {e}")))?;
        if signature.len() != 0x100 {
            return Err(Error::CryptoError(format!(
                "ACID signature has wrong length: {}",
                signature.len()
            )));
        }
        self.signature.copy_from_slice(&signature);
        Ok(())
    }

    /// Verifies the embedded signature against the embedded public key.
    pub fn verify_signature(&self) -> Result<bool, Error> {
        use rsa::BigUint;
        let modulus = BigUint::from_bytes_be(&self.public_key);
        let exponent = BigUint::from(65537u32);
        let public_key = RsaPublicKey::new(modulus, exponent)
            .map_err(|e| Error::CryptoError(format!("bad ACID public key: {e}")))?;

        let signed = self.signed_region()?;
        let mut hasher = Sha256::new();
        hasher.update(&signed);
        let digest = hasher.finalize();

        Ok(public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &self.signature)
            .is_ok())
    }
}

/// Full `main.npdm`: header plus its embedded ACID block. The ACI0 section
/// (runtime access control, as opposed to ACID's build-time descriptor) is
/// not modeled since the ACID patch never touches it.
#[derive(Debug, Clone)]
pub struct Npdm {
    pub header: NpdmHeader,
    pub acid: Acid,
}

impl Npdm {
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, Error> {
        let header: NpdmHeader = reader
            .read_le()
            .map_err(|e| Error::InvalidData(format!("bad NPDM header: {e}")))?;
        reader.seek(std::io::SeekFrom::Start(header.acid_offset as u64))?;
        let acid: Acid = reader
            .read_le()
            .map_err(|e| Error::InvalidData(format!("bad ACID block: {e}")))?;
        Ok(Self { header, acid })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = binrw::io::Cursor::new(bytes);
        Self::from_reader(&mut cursor)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = vec![0u8; self.header.acid_offset as usize];
        let mut header_cursor = binrw::io::Cursor::new(&mut out);
        self.header
            .write_le(&mut header_cursor)
            .map_err(|e| Error::InvalidData(format!("failed to serialize NPDM header: {e}")))?;
        out.extend(self.acid.to_bytes()?);
        Ok(out)
    }

    /// Performs the ACID patch: replace the public key with `tool_key`'s and
    /// regenerate the signature.
    pub fn patch_acid(&mut self, tool_key: &RsaPrivateKey) -> Result<(), Error> {
        self.acid.patch_public_key(tool_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn sample_acid(program_id: u64) -> Acid {
        Acid {
            signature: [0u8; 0x100],
            size: 0,
            version: 0,
            flags: 0,
            program_id_min: program_id,
            program_id_max: program_id,
            fac_offset: 0,
            fac_size: 0,
            sac_offset: 0,
            sac_size: 0,
            kac_offset: 0,
            kac_size: 0,
            pool_partition: 0,
            public_key: [0u8; 0x100],
            access_control_data: Vec::new(),
        }
    }

    #[test]
    fn acid_roundtrips_through_bytes() {
        let acid = sample_acid(0x0100_0000_0000_1000);
        let bytes = acid.to_bytes().unwrap();
        let mut cursor = binrw::io::Cursor::new(&bytes);
        let parsed: Acid = cursor.read_le().unwrap();
        assert_eq!(parsed.program_id_min, acid.program_id_min);
    }

    #[test]
    fn patch_public_key_produces_a_verifiable_signature() {
        let mut acid = sample_acid(0x0100_0000_0000_1000);
        let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();

        acid.patch_public_key(&key).unwrap();

        let modulus = RsaPublicKey::from(&key).n().to_bytes_be();
        assert_eq!(&acid.public_key[0x100 - modulus.len()..], &modulus[..]);
        assert!(acid.verify_signature().unwrap());
    }

    #[test]
    fn tampering_with_public_key_breaks_verification() {
        let mut acid = sample_acid(42);
        let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        acid.patch_public_key(&key).unwrap();
        acid.public_key[0] ^= 0xFF;
        assert!(!acid.verify_signature().unwrap());
    }
}
