//! Resumable sequential dumps (§4.7.4): sidecar checkpoint files that let an
//! interrupted XCI or NSP dump resume without re-streaming what's already on
//! disk.
//!
//! No `serde` dependency exists in this crate's stack, so both sidecar
//! formats are encoded by hand as fixed-size little-endian records, the same
//! way `formats/cnmt/mod.rs` and `formats/ticket.rs` lay out their on-disk
//! structures manually via `binrw` rather than reaching for a generic
//! serializer. These sidecars aren't parsed by the console, so there's no
//! `binrw` magic/version to match — plain `Read`/`Write` is enough.
//!
//! Neither sidecar records a live SHA-256 hasher state (not portably
//! serializable); like `streamer::Checkpoint`, they record how many bytes of
//! the in-progress content were already hashed, and resumption re-reads and
//! re-hashes that prefix from the still-available source NCA.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::Error;

/// `<name>.xci.seq`: resumption state for a gamecard dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XciSidecar {
    pub keep_certificate: bool,
    pub trim: bool,
    pub calc_crc: bool,
    pub chunk_index: u8,
    pub partition_index: u8,
    pub partition_offset: u64,
    pub cert_crc32: u32,
    pub certless_crc32: u32,
}

impl XciSidecar {
    /// 3 flag bytes + chunk/partition index bytes + partition_offset (u64) +
    /// two CRC32s (u32 each).
    const ENCODED_SIZE: usize = 3 + 1 + 1 + 8 + 4 + 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_SIZE);
        out.push(self.keep_certificate as u8);
        out.push(self.trim as u8);
        out.push(self.calc_crc as u8);
        out.push(self.chunk_index);
        out.push(self.partition_index);
        out.extend_from_slice(&self.partition_offset.to_le_bytes());
        out.extend_from_slice(&self.cert_crc32.to_le_bytes());
        out.extend_from_slice(&self.certless_crc32.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::ENCODED_SIZE {
            return Err(Error::CheckpointInvalid(format!(
                "XCI sidecar is {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_SIZE
            )));
        }
        Ok(Self {
            keep_certificate: bytes[0] != 0,
            trim: bytes[1] != 0,
            calc_crc: bytes[2] != 0,
            chunk_index: bytes[3],
            partition_index: bytes[4],
            partition_offset: u64::from_le_bytes(bytes[5..13].try_into().unwrap()),
            cert_crc32: u32::from_le_bytes(bytes[13..17].try_into().unwrap()),
            certless_crc32: u32::from_le_bytes(bytes[17..21].try_into().unwrap()),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Deletes the sidecar on successful completion, per §4.7.4: "the
    /// sidecar is deleted" once the dump is done.
    pub fn delete(path: &Path) -> Result<(), Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `<name>.nsp.seq` header, followed by `nca_count` finalized hashes and
/// `program_nca_mod_count` modified Program-NCA headers (see [`NspSidecar`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NspSidecarHeader {
    pub storage_id: u8,
    pub remove_console_data: bool,
    pub tikless: bool,
    pub npdm_patch: bool,
    pub preinstall: bool,
    pub chunk_index: u32,
    pub pfs_file_count: u32,
    pub pfs_file_index: u32,
    pub pfs_file_offset: u64,
    pub nca_count: u32,
    pub program_nca_mod_count: u32,
    /// Bytes of the NCA at `pfs_file_index` already fed to its running
    /// SHA-256 scope, in place of a serialized hasher context.
    pub active_nca_bytes_hashed: u64,
}

impl NspSidecarHeader {
    const ENCODED_SIZE: usize = 1 + 4 + 4 * 5 + 8 + 4 + 8;

    fn write_to<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        out.write_all(&[
            self.storage_id,
            self.remove_console_data as u8,
            self.tikless as u8,
            self.npdm_patch as u8,
            self.preinstall as u8,
        ])?;
        out.write_all(&self.chunk_index.to_le_bytes())?;
        out.write_all(&self.pfs_file_count.to_le_bytes())?;
        out.write_all(&self.pfs_file_index.to_le_bytes())?;
        out.write_all(&self.pfs_file_offset.to_le_bytes())?;
        out.write_all(&self.nca_count.to_le_bytes())?;
        out.write_all(&self.program_nca_mod_count.to_le_bytes())?;
        out.write_all(&self.active_nca_bytes_hashed.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> Result<Self, Error> {
        let mut flags = [0u8; 5];
        input.read_exact(&mut flags)?;
        let mut u32_buf = [0u8; 4];
        let mut read_u32 = |input: &mut R| -> Result<u32, Error> {
            input.read_exact(&mut u32_buf)?;
            Ok(u32::from_le_bytes(u32_buf))
        };
        let chunk_index = read_u32(input)?;
        let pfs_file_count = read_u32(input)?;
        let pfs_file_index = read_u32(input)?;
        let mut u64_buf = [0u8; 8];
        input.read_exact(&mut u64_buf)?;
        let pfs_file_offset = u64::from_le_bytes(u64_buf);
        let nca_count = read_u32(input)?;
        let program_nca_mod_count = read_u32(input)?;
        input.read_exact(&mut u64_buf)?;
        let active_nca_bytes_hashed = u64::from_le_bytes(u64_buf);

        Ok(Self {
            storage_id: flags[0],
            remove_console_data: flags[1] != 0,
            tikless: flags[2] != 0,
            npdm_patch: flags[3] != 0,
            preinstall: flags[4] != 0,
            chunk_index,
            pfs_file_count,
            pfs_file_index,
            pfs_file_offset,
            nca_count,
            program_nca_mod_count,
            active_nca_bytes_hashed,
        })
    }
}

/// Size, in bytes, of a modified Program-NCA header kept byte-stable across
/// sessions because its regeneration depends on a random NPDM signature.
pub const PROGRAM_NCA_HEADER_SIZE: usize = 0xC00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NspSidecar {
    pub header: NspSidecarHeader,
    pub finalized_nca_hashes: Vec<[u8; 32]>,
    pub modified_program_nca_headers: Vec<[u8; PROGRAM_NCA_HEADER_SIZE]>,
}

impl NspSidecar {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(
            NspSidecarHeader::ENCODED_SIZE
                + self.finalized_nca_hashes.len() * 32
                + self.modified_program_nca_headers.len() * PROGRAM_NCA_HEADER_SIZE,
        );
        self.header.write_to(&mut out)?;
        for hash in &self.finalized_nca_hashes {
            out.extend_from_slice(hash);
        }
        for header in &self.modified_program_nca_headers {
            out.extend_from_slice(header);
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = std::io::Cursor::new(bytes);
        let header = NspSidecarHeader::read_from(&mut cursor)?;

        let mut finalized_nca_hashes = Vec::with_capacity(header.nca_count as usize);
        for _ in 0..header.nca_count {
            let mut hash = [0u8; 32];
            cursor.read_exact(&mut hash)?;
            finalized_nca_hashes.push(hash);
        }

        let mut modified_program_nca_headers =
            Vec::with_capacity(header.program_nca_mod_count as usize);
        for _ in 0..header.program_nca_mod_count {
            let mut nca_header = [0u8; PROGRAM_NCA_HEADER_SIZE];
            cursor.read_exact(&mut nca_header)?;
            modified_program_nca_headers.push(nca_header);
        }

        Ok(Self {
            header,
            finalized_nca_hashes,
            modified_program_nca_headers,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::from_bytes(&fs::read(path)?)
    }

    pub fn delete(path: &Path) -> Result<(), Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Checks that every chunk file a checkpoint claims to have already written
/// is still present and at least as large as the checkpoint's own cursor
/// into it. Per §4.7.4: "If the user has removed any already-written chunk,
/// the resume fails with `CheckpointInvalid`."
pub fn validate_resumable(chunk_paths: &[(std::path::PathBuf, u64)]) -> Result<(), Error> {
    for (path, min_len) in chunk_paths {
        let metadata = fs::metadata(path).map_err(|_| {
            Error::CheckpointInvalid(format!("chunk {} is missing", path.display()))
        })?;
        if metadata.len() < *min_len {
            return Err(Error::CheckpointInvalid(format!(
                "chunk {} is {} bytes, checkpoint expects at least {}",
                path.display(),
                metadata.len(),
                min_len
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_xci_sidecar() -> XciSidecar {
        XciSidecar {
            keep_certificate: true,
            trim: false,
            calc_crc: true,
            chunk_index: 3,
            partition_index: 1,
            partition_offset: 0x1234_5678_9abc,
            cert_crc32: 0xDEAD_BEEF,
            certless_crc32: 0x0BAD_F00D,
        }
    }

    #[test]
    fn xci_sidecar_round_trips_through_bytes() {
        let sidecar = sample_xci_sidecar();
        let bytes = sidecar.to_bytes();
        assert_eq!(bytes.len(), XciSidecar::ENCODED_SIZE);
        assert_eq!(XciSidecar::from_bytes(&bytes).unwrap(), sidecar);
    }

    #[test]
    fn xci_sidecar_rejects_truncated_bytes() {
        let sidecar = sample_xci_sidecar();
        let mut bytes = sidecar.to_bytes();
        bytes.pop();
        assert!(XciSidecar::from_bytes(&bytes).is_err());
    }

    #[test]
    fn nsp_sidecar_round_trips_with_hashes_and_headers() {
        let header = NspSidecarHeader {
            storage_id: 1,
            remove_console_data: true,
            tikless: false,
            npdm_patch: true,
            preinstall: false,
            chunk_index: 2,
            pfs_file_count: 5,
            pfs_file_index: 3,
            pfs_file_offset: 0xABCD,
            nca_count: 2,
            program_nca_mod_count: 1,
            active_nca_bytes_hashed: 0x10_0000,
        };
        let sidecar = NspSidecar {
            header,
            finalized_nca_hashes: vec![[0xAA; 32], [0xBB; 32]],
            modified_program_nca_headers: vec![[0x42; PROGRAM_NCA_HEADER_SIZE]],
        };

        let bytes = sidecar.to_bytes().unwrap();
        let reparsed = NspSidecar::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed, sidecar);
    }

    #[test]
    fn nsp_sidecar_save_and_load_round_trip_through_a_file() {
        let dir = std::env::temp_dir().join(format!("nsp-sidecar-test-{:p}", &0u8));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("title.nsp.seq");

        let sidecar = NspSidecar {
            header: NspSidecarHeader {
                storage_id: 0,
                remove_console_data: false,
                tikless: true,
                npdm_patch: false,
                preinstall: true,
                chunk_index: 0,
                pfs_file_count: 1,
                pfs_file_index: 0,
                pfs_file_offset: 0,
                nca_count: 0,
                program_nca_mod_count: 0,
                active_nca_bytes_hashed: 0,
            },
            finalized_nca_hashes: Vec::new(),
            modified_program_nca_headers: Vec::new(),
        };

        sidecar.save(&path).unwrap();
        assert_eq!(NspSidecar::load(&path).unwrap(), sidecar);
        NspSidecar::delete(&path).unwrap();
        assert!(!path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn validate_resumable_rejects_missing_chunk() {
        let missing = std::path::PathBuf::from("/nonexistent/path/for/sequential-test.bin");
        let result = validate_resumable(&[(missing, 10)]);
        assert!(matches!(result, Err(Error::CheckpointInvalid(_))));
    }
}
