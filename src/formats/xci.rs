//! The XCI (eXtendable Card Image) format is a Nintendo Switch game card image format.
//!
//! This format is the raw data from a Nintendo Switch game card, those little bitter
//! SD card-like things that you insert physically on top of the console.
//!
//! The cards themselves physically have a similar footprint to an SD card, but are slightly thicker
//! and less wide. The data inside is stored in an eMMC chip, which is soldered onto the card.
//! They are also coated with Denatonium Benzoate, a bittering agent, to discourage consumption.
//! Just in case you (or your pet, or your little sibling) get any ideas. No, the game cards taste horrible (by design).
//!
//! An XCI image opens with a 0x200-byte card header (magic `HEAD`) followed
//! by the root HFS0, whose own entries are the `update`/`normal`/`secure`
//! (and, on newer cards, `logo`) partitions, each itself an HFS0.

use binrw::prelude::*;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Error;
use crate::formats::hfs0::{Hfs0, Hfs0Writer};

/// Gamecard size codes as stored in the card header.
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardSize {
    Size1Gb = 0xFA,
    Size2Gb = 0xF8,
    Size4Gb = 0xF0,
    Size8Gb = 0xE0,
    Size16Gb = 0xE1,
    Size32Gb = 0xE2,
}

/// The 0x200-byte card header preceding the root HFS0.
///
/// Only the fields this engine actually uses are modeled; the header also
/// carries an RSA signature and encrypted region the dumper never needs to
/// touch since it works from plaintext HFS0 partitions.
#[binrw]
#[brw(little)]
#[derive(Debug)]
pub struct XciHeader {
    pub signature: [u8; 0x100],
    #[br(magic = b"HEAD")]
    pub _magic: (),
    pub rom_area_start_page: u32,
    pub backup_area_start_page: u32,
    pub key_index: u8,
    pub card_size: CardSize,
    pub card_header_version: u8,
    pub card_flags: u8,
    pub package_id: u64,
    pub valid_data_end_page: u32,
    pub _reserved: [u8; 4],
    pub card_info_offset: u64,
    pub rom_area_start_page_2: u32,
    pub rom_area_end_page: u32,
}

impl XciHeader {
    pub const HEADER_SIZE: u64 = 0x200;

    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; Self::HEADER_SIZE as usize];
        reader.read_exact(&mut raw)?;
        binrw::io::Cursor::new(raw)
            .read_le()
            .map_err(|e| Error::InvalidData(format!("bad XCI header: {e}")))
    }

    /// The size the card image should occupy on disk once trailing padding
    /// is trimmed, derived from the header's own accounting rather than
    /// scanning for trailing `0xFF` bytes.
    pub fn trimmed_size(&self) -> u64 {
        (self.valid_data_end_page as u64 + 1) * PAGE_SIZE
    }
}

pub const PAGE_SIZE: u64 = 0x200;

/// Reader for a complete XCI image: card header plus root HFS0.
pub struct Xci<R: Read + Seek> {
    pub header: XciHeader,
    pub root: Hfs0<R>,
}

impl<R: Read + Seek> Xci<R> {
    pub fn from_reader(mut reader: R) -> Result<Self, Error> {
        let header = XciHeader::from_reader(&mut reader)?;
        reader.seek(SeekFrom::Start(XciHeader::HEADER_SIZE))?;
        let root = Hfs0::from_reader(reader)?;
        Ok(Self { header, root })
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.root.list_files()
    }
}

/// CRC32 checksum used to validate a dumped card image against the value
/// recorded by official tooling (same polynomial as Ethernet/zlib).
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Incrementally serializes an XCI image: a card header followed by a root
/// HFS0 whose entries are themselves HFS0 partitions.
pub struct XciWriter<S> {
    header: XciHeader,
    partitions: Hfs0Writer<S>,
}

impl<S: Read> XciWriter<S> {
    pub fn new(header: XciHeader) -> Self {
        Self {
            header,
            partitions: Hfs0Writer::new(),
        }
    }

    pub fn push_partition(&mut self, name: impl Into<String>, size: u64, source: S) {
        // Partition-level HFS0s are verified by their own internal entry
        // hashes; the root HFS0's hash of each partition covers its header.
        self.partitions.push(name, size, &[], source);
    }

    pub fn write_to<W: Write>(self, out: &mut W) -> Result<(), Error> {
        let mut header_bytes = Vec::new();
        self.header
            .write_le(&mut binrw::io::Cursor::new(&mut header_bytes))
            .map_err(|e| Error::InvalidData(format!("failed to serialize XCI header: {e}")))?;
        header_bytes.resize(XciHeader::HEADER_SIZE as usize, 0);
        out.write_all(&header_bytes)?;
        self.partitions.write_to(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn trimmed_size_derives_from_valid_data_end_page() {
        let header = XciHeader {
            signature: [0u8; 0x100],
            _magic: (),
            rom_area_start_page: 0,
            backup_area_start_page: 0,
            key_index: 0,
            card_size: CardSize::Size4Gb,
            card_header_version: 0,
            card_flags: 0,
            package_id: 0,
            valid_data_end_page: 9,
            _reserved: [0; 4],
            card_info_offset: 0,
            rom_area_start_page_2: 0,
            rom_area_end_page: 0,
        };
        assert_eq!(header.trimmed_size(), 10 * PAGE_SIZE);
    }
}
