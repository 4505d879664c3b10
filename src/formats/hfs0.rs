//! The Nintendo Hashed filesystem (HFS0) is a filesystem used by the Nintendo Switch to store data in a hashed format.
//! This filesystem is used in the Nintendo Switch's game cards (the little bitter carts that you insert physically into the console).
//!
//! This module doesn't allow you to eat the game itself, but lets you dump data
//! from the game card.
//!
//! You still require the XCI module to read the game card image format, which in turn contains this filesystem.
//! For the game card image format, see [xci](crate::formats::xci).
//!
//! HFS0 mirrors PFS0's layout but each entry additionally carries a SHA-256
//! hash over a hashed prefix of its data, letting a gamecard's root and
//! partition filesystems be verified without a full read.

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::Error;

#[derive(BinRead, Debug)]
#[brw(little, magic = b"HFS0")]
pub struct Hfs0Header {
    pub num_files: u32,
    pub str_table_size: u32,
    pub reserved: [u8; 4],
}

impl Hfs0Header {
    pub const MAGIC: [u8; 4] = *b"HFS0";
    /// Size of one on-disk entry record.
    pub const ENTRY_SIZE: u64 = 0x40;
}

#[derive(BinRead, Debug, Clone)]
#[brw(little)]
pub struct Hfs0Entry {
    pub data_offset: u64,
    pub data_size: u64,
    pub string_table_offset: u32,
    pub hash_target_size: u32,
    pub hash_target_offset: u64,
    pub hash: [u8; 0x20],
}

impl Hfs0Entry {
    pub fn get_name(&self, string_table: &[u8]) -> Result<String, Error> {
        let name_start = self.string_table_offset as usize;
        let name_end = string_table[name_start..]
            .iter()
            .position(|&x| x == 0)
            .map(|p| name_start + p)
            .unwrap_or(string_table.len());
        std::str::from_utf8(&string_table[name_start..name_end])
            .map(|s| s.to_string())
            .map_err(|e| Error::InvalidData(format!("bad HFS0 name: {e}")))
    }
}

#[derive(Debug)]
pub struct Hfs0File {
    pub name: String,
    pub entry: Hfs0Entry,
}

/// Reader for an HFS0 partition, as found at a gamecard's root and inside
/// each of its Normal/Logo/Secure/Update partitions.
pub struct Hfs0<R: Read + Seek> {
    pub reader: R,
    pub header: Hfs0Header,
    pub files: Vec<Hfs0File>,
}

impl<R: Read + Seek> Hfs0<R> {
    pub fn from_reader(mut reader: R) -> Result<Self, Error> {
        let header: Hfs0Header = reader
            .read_le()
            .map_err(|e| Error::InvalidData(format!("bad HFS0 header: {e}")))?;

        let entries = (0..header.num_files)
            .map(|_| reader.read_le::<Hfs0Entry>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidData(format!("bad HFS0 entry: {e}")))?;

        let mut string_table = vec![0u8; header.str_table_size as usize];
        reader.read_exact(&mut string_table)?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry.get_name(&string_table)?;
            files.push(Hfs0File { name, entry });
        }

        Ok(Self {
            reader,
            header,
            files,
        })
    }

    fn files_start_offset(&self) -> u64 {
        0x10 + Hfs0Header::ENTRY_SIZE * self.header.num_files as u64
            + self.header.str_table_size as u64
    }

    pub fn list_files(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn find(&self, name: &str) -> Result<&Hfs0File, Error> {
        self.files
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::NotFound(format!("HFS0 entry not found: {name}")))
    }

    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let file = self.find(name)?;
        let offset = self.files_start_offset() + file.entry.data_offset;
        let size = file.entry.data_size as usize;

        self.reader.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; size];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Verify an entry's hashed prefix against its stored SHA-256 hash.
    pub fn verify_entry(&mut self, name: &str) -> Result<bool, Error> {
        let file = self.find(name)?;
        let offset = self.files_start_offset() + file.entry.data_offset;
        let hash_len = file.entry.hash_target_size as usize;
        let expected = file.entry.hash;

        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; hash_len];
        self.reader.read_exact(&mut buf)?;

        let mut hasher = Sha256::new();
        hasher.update(&buf);
        let digest: [u8; 0x20] = hasher.finalize().into();
        Ok(digest == expected)
    }
}

/// One entry queued for an HFS0 being assembled by [`Hfs0Writer`].
pub struct PendingEntry<S> {
    name: String,
    size: u64,
    hash_target_size: u32,
    hash: [u8; 0x20],
    source: S,
}

/// Incrementally serializes an HFS0 partition, the writing counterpart of
/// [`Hfs0`] used when assembling XCI partitions.
#[derive(Default)]
pub struct Hfs0Writer<S> {
    entries: Vec<PendingEntry<S>>,
}

impl<S: Read> Hfs0Writer<S> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register an entry. `hash_prefix` is the data the stored hash covers
    /// (by convention, up to the first 0x200 bytes).
    pub fn push(&mut self, name: impl Into<String>, size: u64, hash_prefix: &[u8], source: S) {
        let mut hasher = Sha256::new();
        hasher.update(hash_prefix);
        let hash: [u8; 0x20] = hasher.finalize().into();
        self.entries.push(PendingEntry {
            name: name.into(),
            size,
            hash_target_size: hash_prefix.len() as u32,
            hash,
            source,
        });
    }

    pub fn write_to<W: Write>(mut self, out: &mut W) -> Result<(), Error> {
        let mut string_table = Vec::new();
        let mut string_offsets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            string_offsets.push(string_table.len() as u32);
            string_table.extend_from_slice(entry.name.as_bytes());
            string_table.push(0);
        }
        while string_table.len() % 0x20 != 0 {
            string_table.push(0);
        }

        out.write_all(&Hfs0Header::MAGIC)?;
        out.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        out.write_all(&(string_table.len() as u32).to_le_bytes())?;
        out.write_all(&[0u8; 4])?;

        let mut data_offset = 0u64;
        for (entry, string_offset) in self.entries.iter().zip(&string_offsets) {
            out.write_all(&data_offset.to_le_bytes())?;
            out.write_all(&entry.size.to_le_bytes())?;
            out.write_all(&string_offset.to_le_bytes())?;
            out.write_all(&entry.hash_target_size.to_le_bytes())?;
            out.write_all(&0u64.to_le_bytes())?; // hash_target_offset, always 0 in practice
            out.write_all(&entry.hash)?;
            data_offset += entry.size;
        }

        out.write_all(&string_table)?;

        const CHUNK: usize = 0x80_0000;
        let mut buffer = vec![0u8; CHUNK];
        for entry in &mut self.entries {
            let mut remaining = entry.size;
            while remaining > 0 {
                let want = remaining.min(CHUNK as u64) as usize;
                entry.source.read_exact(&mut buffer[..want])?;
                out.write_all(&buffer[..want])?;
                remaining -= want as u64;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn synthetic_hfs0() -> Vec<u8> {
        let mut writer = Hfs0Writer::new();
        let data = vec![9u8; 16];
        writer.push("secure", data.len() as u64, &data, Cursor::new(data.clone()));
        let mut out = Vec::new();
        writer.write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn hfs0_roundtrips_and_verifies_hash() {
        let bytes = synthetic_hfs0();
        let mut hfs0 = Hfs0::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(hfs0.list_files(), vec!["secure"]);
        assert_eq!(hfs0.read_file("secure").unwrap(), vec![9u8; 16]);
        assert!(hfs0.verify_entry("secure").unwrap());
    }

    #[test]
    fn hfs0_missing_entry_errors() {
        let bytes = synthetic_hfs0();
        let mut hfs0 = Hfs0::from_reader(Cursor::new(bytes)).unwrap();
        assert!(hfs0.read_file("nope").is_err());
    }
}
