//! # Nintendo PFS0 (PartitionFS0) format
//!
//! The Partition File System (PFS0) format is a simple archive format used by Nintendo Switch for packaging files.
//!
//! They are also known as NSP (Nintendo Submission Package) files, which are simply PFS0 images packed
//! for distribution.
//!
//! These files are used to store nested game archives, such as NCA files, which contain the actual game data.
//!
//! They also usually install cryptographic tickets and metadata files, which are used to identify and
//! enforce DRM restrictions on the game.
//!

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::prelude::*;

use crate::io::SubFile;

// Type alias for NSP (Nintendo Submission Package), which are simply just
// PFS0 images
pub type Nsp<R> = Pfs0<R>;
pub type NspHeader = Pfs0Header;
pub type NspEntry = Pfs0Entry;

#[derive(BinRead, Debug)]
#[brw(little, magic = b"PFS0")]
/// Nintendo Switch PFS0 (PartitionFS0) header structure
///
/// # Format Layout
/// - 0x00: Magic "PFS0" (4 bytes)
/// - 0x04: Number of files (4 bytes)
/// - 0x08: String table size (4 bytes)
/// - 0x0C: Reserved (4 bytes, usually zeros)
pub struct Pfs0Header {
    /// Number of files contained in this PFS0 archive
    pub num_files: u32,
    /// Size of the string table in bytes
    pub str_table_size: u32,
    /// Reserved field, typically set to zeros
    pub reserved: [u8; 4],
}

impl Pfs0Header {
    /// Magic identifier for PFS0 files
    pub const MAGIC: [u8; 4] = *b"PFS0";
}

#[derive(BinRead, Debug)]
#[brw(little)]
/// The PFS0 file entry structure describes a single file within the archive
///
/// # Notes
/// - `data_offset` is relative to the start of file data section, not the start of the PFS0 file
/// - String table offset points to a null-terminated filename in the string table
pub struct Pfs0Entry {
    /// Offset to file data, relative to the start of file data section
    pub data_offset: u64,
    /// Size of the file data in bytes
    pub data_size: u64,
    /// Offset into the string table for the null-terminated filename
    pub string_table_offset: u32,
    /// Reserved field, usually zeroes
    pub reserved: [u8; 4],
}

impl Pfs0Entry {
    /// Extract the filename from the string table
    pub fn get_name(&self, string_table: &[u8]) -> Result<String, std::str::Utf8Error> {
        let name_start = self.string_table_offset as usize;
        let name_end = string_table[name_start..]
            .iter()
            .position(|&x| x == 0)
            .map(|p| name_start + p)
            .unwrap_or(string_table.len());

        let name = std::str::from_utf8(&string_table[name_start..name_end])?.to_string();
        Ok(name)
    }
}

#[derive(Debug)]
/// Represents a file within the PFS0 archive with both metadata and name
pub struct Pfs0File {
    /// Filename extracted from the string table
    pub name: String,
    /// File entry metadata including size and offset information
    pub entry: Pfs0Entry,
}

/// Main structure for working with Nintendo Switch PFS0 archives
///
/// PFS0 is a simple archive format used by Nintendo Switch for packaging files.
/// The format consists of:
/// 1. Header (0x10 bytes)
/// 2. File entries (0x18 bytes each)
/// 3. String table (variable size)
/// 4. File data (aligned and sequentially stored)
pub struct Pfs0<R: Read + Seek> {
    /// The underlying reader for the PFS0 archive
    pub reader: R,
    /// Parsed header information
    pub header: Pfs0Header,
    /// List of files contained in the archive with their metadata
    pub files: Vec<Pfs0File>,
}

impl<R: Read + Seek> Pfs0<R> {
    /// Parse a PFS0 archive from a reader.
    ///
    /// The magic "PFS0" is validated by binrw; this reads the header, all
    /// file entries, and the string table.
    pub fn from_reader(mut reader: R) -> Result<Self, crate::error::Error> {
        let header: Pfs0Header = reader
            .read_le()
            .map_err(|e| crate::error::Error::InvalidData(format!("bad PFS0 header: {e}")))?;
        tracing::trace!(?header, "PFS0 header parsed");

        let entries = (0..header.num_files)
            .map(|_| reader.read_le::<Pfs0Entry>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| crate::error::Error::InvalidData(format!("bad PFS0 entry: {e}")))?;

        let mut string_table = vec![0u8; header.str_table_size as usize];
        reader.read_exact(&mut string_table)?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries.into_iter() {
            let name = entry
                .get_name(&string_table)
                .map_err(|e| crate::error::Error::InvalidData(format!("bad PFS0 name: {e}")))?;
            files.push(Pfs0File { name, entry });
        }

        Ok(Self {
            reader,
            header,
            files,
        })
    }

    /// Byte offset of `entry`'s data section start, relative to the PFS0's own start.
    fn files_start_offset(&self) -> u64 {
        0x10 + (0x18 * self.header.num_files as u64) + (self.header.str_table_size as u64)
    }

    fn find(&self, vpath: &str) -> Result<&Pfs0File, crate::error::Error> {
        self.files
            .iter()
            .find(|f| f.name == vpath)
            .ok_or_else(|| crate::error::Error::NotFound(format!("File not found: {}", vpath)))
    }

    /// Extract a file from the PFS0 archive by its path/name, reading in
    /// bounded chunks rather than one large allocation.
    pub fn read_file(&mut self, vpath: &str) -> Result<Vec<u8>, crate::error::Error> {
        let file = self.find(vpath)?;
        let offset = self.files_start_offset() + file.entry.data_offset;
        let size = file.entry.data_size as usize;

        tracing::trace!(?vpath, offset = format!("{:012X}", offset), size, "reading PFS0 entry");

        self.reader.seek(SeekFrom::Start(offset))?;

        let mut data = Vec::with_capacity(size);
        let mut remaining = size;
        const CHUNK: usize = 0x80_0000;
        let mut buffer = vec![0u8; CHUNK.min(size.max(1))];
        while remaining > 0 {
            let sz = remaining.min(CHUNK);
            self.reader.read_exact(&mut buffer[..sz])?;
            data.extend_from_slice(&buffer[..sz]);
            remaining -= sz;
        }

        Ok(data)
    }

    pub fn return_reader_file(&mut self, vpath: &str) -> Result<SubFile<R>, crate::error::Error>
    where
        R: Clone,
    {
        let file = self.find(vpath)?;
        let offset = self.files_start_offset() + file.entry.data_offset;
        let size = file.entry.data_size;

        let reader_clone = self.reader.clone();
        Ok(SubFile::new(reader_clone, offset, offset + size))
    }

    /// Absolute `(offset, size)` of `vpath`'s data within this PFS0's own
    /// byte stream, for callers that need to splice a file's bytes in place
    /// (e.g. an in-place ACID patch of `main.npdm`) rather than extract it.
    pub fn file_data_range(&self, vpath: &str) -> Result<(u64, u64), crate::error::Error> {
        let file = self.find(vpath)?;
        let offset = self.files_start_offset() + file.entry.data_offset;
        Ok((offset, file.entry.data_size))
    }

    pub fn list_files(&self) -> Result<Vec<String>, crate::error::Error> {
        Ok(self.files.iter().map(|f| f.name.clone()).collect())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// One entry queued for a PFS0 being assembled by [`Pfs0Writer`].
pub struct PendingEntry<S> {
    pub name: String,
    pub size: u64,
    pub source: S,
}

/// Incrementally serializes a PFS0/NSP: callers register entries with a
/// size and a source that can be streamed once the header layout (and thus
/// byte offsets) is known, then [`write_to`](Pfs0Writer::write_to) emits the
/// header, string table, and file data in one pass.
///
/// This is the writing counterpart of [`Pfs0`], used by the Package Builder
/// to assemble NSPs without holding the whole archive in memory.
#[derive(Default)]
pub struct Pfs0Writer<S> {
    entries: Vec<PendingEntry<S>>,
}

impl<S: Read> Pfs0Writer<S> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, size: u64, source: S) {
        self.entries.push(PendingEntry {
            name: name.into(),
            size,
            source,
        });
    }

    /// Total archive size once written, including header/entries/string table.
    pub fn total_size(&self) -> u64 {
        let string_table_size: u64 = self.entries.iter().map(|e| e.name.len() as u64 + 1).sum();
        let header_size = 0x10 + 0x18 * self.entries.len() as u64 + string_table_size;
        let data_size: u64 = self.entries.iter().map(|e| e.size).sum();
        header_size + data_size
    }

    /// Write the complete PFS0 image to `out`.
    pub fn write_to<W: Write>(mut self, out: &mut W) -> Result<(), crate::error::Error> {
        let mut string_table = Vec::new();
        let mut string_offsets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            string_offsets.push(string_table.len() as u32);
            string_table.extend_from_slice(entry.name.as_bytes());
            string_table.push(0);
        }
        // Pad so the full header (magic + entry count + string table size +
        // reserved + entries + string table) lands on a multiple of 0x10.
        // When it's already aligned, official tooling still appends one full
        // extra block rather than leaving it bare.
        let preamble_size = 0x10 + 0x18 * self.entries.len() as u64;
        let mut unpadded_size = preamble_size + string_table.len() as u64;
        let already_aligned = unpadded_size % 0x10 == 0;
        while unpadded_size % 0x10 != 0 {
            string_table.push(0);
            unpadded_size += 1;
        }
        if already_aligned {
            string_table.extend_from_slice(&[0u8; 0x10]);
        }

        out.write_all(&Pfs0Header::MAGIC)?;
        out.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        out.write_all(&(string_table.len() as u32).to_le_bytes())?;
        out.write_all(&[0u8; 4])?;

        let mut data_offset = 0u64;
        for (entry, string_offset) in self.entries.iter().zip(&string_offsets) {
            out.write_all(&data_offset.to_le_bytes())?;
            out.write_all(&entry.size.to_le_bytes())?;
            out.write_all(&string_offset.to_le_bytes())?;
            out.write_all(&[0u8; 4])?;
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
    use tracing_test::traced_test;

    fn synthetic_pfs0() -> Vec<u8> {
        let mut writer = Pfs0Writer::new();
        writer.push("a.nca", 4, Cursor::new(vec![1, 2, 3, 4]));
        writer.push("b.nca", 3, Cursor::new(vec![5, 6, 7]));
        let mut out = Vec::new();
        writer.write_to(&mut out).unwrap();
        out
    }

    #[test]
    #[traced_test]
    fn test_pfs0_roundtrip() {
        let bytes = synthetic_pfs0();
        let cursor = Cursor::new(bytes);
        let mut pfs0 = Pfs0::from_reader(cursor).unwrap();

        assert_eq!(pfs0.file_count(), 2);
        assert_eq!(pfs0.list_files().unwrap(), vec!["a.nca", "b.nca"]);
        assert_eq!(pfs0.read_file("a.nca").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(pfs0.read_file("b.nca").unwrap(), vec![5, 6, 7]);
    }

    #[test]
    fn test_pfs0_missing_file() {
        let bytes = synthetic_pfs0();
        let mut pfs0 = Pfs0::from_reader(Cursor::new(bytes)).unwrap();
        assert!(pfs0.read_file("missing.nca").is_err());
    }

    #[test]
    fn file_data_range_points_at_the_bytes_read_file_returns() {
        let bytes = synthetic_pfs0();
        let mut pfs0 = Pfs0::from_reader(Cursor::new(bytes.clone())).unwrap();
        let (offset, size) = pfs0.file_data_range("b.nca").unwrap();
        assert_eq!(size, 3);
        assert_eq!(&bytes[offset as usize..(offset + size) as usize], &[5, 6, 7]);
        assert_eq!(pfs0.read_file("b.nca").unwrap(), vec![5, 6, 7]);
    }
}
