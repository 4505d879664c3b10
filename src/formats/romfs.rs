//! RomFS: the filesystem-shaped view nested inside many NCA sections.
//!
//! Entries are organized as two parallel intrusive trees (directories and
//! files), each node linked to its parent, its next sibling, and its first
//! child. Lookups walk these chains directly; the header also carries a
//! directory/file hash table meant to accelerate lookup by path-hash, but
//! the canonical way to resolve a path is the chain walk below, since the
//! tree itself is authoritative and the hash table is just an index over it.

use binrw::{BinRead, BinReaderExt};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::Error;

/// RomFS header structure
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct RomFsHeader {
    pub header_size: u32,
    pub dir_hash_table_offset: u64,
    pub dir_hash_table_size: u32,
    pub dir_table_offset: u64,
    pub dir_table_size: u32,
    pub file_hash_table_offset: u64,
    pub file_hash_table_size: u32,
    pub file_table_offset: u64,
    pub file_table_size: u32,
    pub file_data_offset: u64,
}

/// Directory entry structure
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub parent_offset: u32,
    pub sibling_offset: u32,
    pub child_dir_offset: u32,
    pub child_file_offset: u32,
    pub hash_sibling_offset: u32,
    pub name_size: u32,
    pub name: String,
}

/// File entry structure
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub parent_offset: u32,
    pub sibling_offset: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub hash_sibling_offset: u32,
    pub name_size: u32,
    pub name: String,
}

/// A RomFS directory iterator
pub struct RomFsDirectoryIterator<R: Read + Seek> {
    romfs: Arc<Mutex<RomFs<R>>>,
    dir_offsets: Vec<u32>,
    file_offsets: Vec<u32>,
    current_dir_index: usize,
    current_file_index: usize,
}

impl<R: Read + Seek> RomFsDirectoryIterator<R> {
    /// Returns the next directory name or None if there are no more directories
    pub fn next_dir(&mut self) -> Option<Result<String, Error>> {
        if self.current_dir_index >= self.dir_offsets.len() {
            return None;
        }

        let mut romfs = self.romfs.lock().unwrap();
        let result = romfs
            .read_dir_entry(self.dir_offsets[self.current_dir_index])
            .map(|dir| dir.name);

        self.current_dir_index += 1;
        Some(result)
    }

    /// Returns the next file name and size or None if there are no more files
    pub fn next_file(&mut self) -> Option<Result<(String, u64), Error>> {
        if self.current_file_index >= self.file_offsets.len() {
            return None;
        }

        let mut romfs = self.romfs.lock().unwrap();
        let result = romfs
            .read_file_entry(self.file_offsets[self.current_file_index])
            .map(|file| (file.name, file.data_size));

        self.current_file_index += 1;
        Some(result)
    }

    /// Reset the directory iterator to the beginning
    pub fn rewind(&mut self) {
        self.current_dir_index = 0;
        self.current_file_index = 0;
    }

    pub fn dir_count(&self) -> usize {
        self.dir_offsets.len()
    }

    pub fn file_count(&self) -> usize {
        self.file_offsets.len()
    }
}

#[derive(Debug)]
/// RomFS representation
pub struct RomFs<R: Read + Seek> {
    reader: R,
    header: RomFsHeader,
    cache_dir_entries: HashMap<u32, DirectoryEntry>,
    cache_file_entries: HashMap<u32, FileEntry>,
}

impl<R: Read + Seek> RomFs<R> {
    /// Magic value for invalid entry offsets
    pub const INVALID_ENTRY: u32 = u32::MAX;
    /// Offset of the root directory
    pub const ROOT_DIR_OFFSET: u32 = 0;
    /// Maximum reasonable header size (to prevent excessive allocations)
    const MAX_REASONABLE_HEADER_SIZE: u32 = 0x1000_0000;
    const MAX_REASONABLE_TABLE_SIZE: u32 = 0x1000_0000;

    /// Parse a RomFS header from a reader. The directory/file hash tables
    /// are not read here; lookups walk the parent/sibling/child chains
    /// directly instead.
    pub fn from_reader(mut reader: R) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(0))?;

        let header: RomFsHeader = reader
            .read_le()
            .map_err(|e| Error::InvalidData(format!("bad RomFS header: {e}")))?;

        tracing::trace!(?header, "RomFS header parsed");

        if header.header_size == 0 || header.header_size > Self::MAX_REASONABLE_HEADER_SIZE {
            return Err(Error::InvalidData(format!(
                "invalid RomFS header size: {}",
                header.header_size
            )));
        }
        if header.dir_hash_table_size > Self::MAX_REASONABLE_TABLE_SIZE
            || header.file_hash_table_size > Self::MAX_REASONABLE_TABLE_SIZE
        {
            return Err(Error::InvalidData("RomFS hash table too large".to_string()));
        }

        Ok(Self {
            reader,
            header,
            cache_dir_entries: HashMap::new(),
            cache_file_entries: HashMap::new(),
        })
    }

    pub fn list_files(&mut self) -> Result<Vec<String>, Error> {
        let mut files = Vec::new();
        let mut stack = vec![Self::ROOT_DIR_OFFSET];
        while let Some(dir_offset) = stack.pop() {
            let dir = self.read_dir_entry(dir_offset)?;

            let mut child_dir = dir.child_dir_offset;
            while child_dir != Self::INVALID_ENTRY {
                stack.push(child_dir);
                child_dir = self.read_dir_entry(child_dir)?.sibling_offset;
            }

            let mut child_file = dir.child_file_offset;
            while child_file != Self::INVALID_ENTRY {
                let file = self.read_file_entry(child_file)?;
                files.push(file.name.clone());
                child_file = file.sibling_offset;
            }
        }
        Ok(files)
    }

    /// Walks the full tree in the same stack-based order as [`list_files`]
    /// (Self::list_files), but accumulates each file's full `/`-separated
    /// virtual path instead of its bare name. Used by the ExeFS/RomFS tree
    /// producers, which need to recreate the directory structure on output.
    pub fn walk_files(&mut self) -> Result<Vec<(String, FileEntry)>, Error> {
        let mut files = Vec::new();
        let mut stack = vec![(Self::ROOT_DIR_OFFSET, String::new())];
        while let Some((dir_offset, prefix)) = stack.pop() {
            let dir = self.read_dir_entry(dir_offset)?;

            let mut child_dir = dir.child_dir_offset;
            while child_dir != Self::INVALID_ENTRY {
                let name = self.read_dir_entry(child_dir)?.name.clone();
                stack.push((child_dir, format!("{prefix}/{name}")));
                child_dir = self.read_dir_entry(child_dir)?.sibling_offset;
            }

            let mut child_file = dir.child_file_offset;
            while child_file != Self::INVALID_ENTRY {
                let file = self.read_file_entry(child_file)?;
                files.push((format!("{prefix}/{}", file.name), file.clone()));
                child_file = file.sibling_offset;
            }
        }
        Ok(files)
    }

    /// Read a directory entry from the directory table
    fn read_dir_entry(&mut self, offset: u32) -> Result<DirectoryEntry, Error> {
        if let Some(entry) = self.cache_dir_entries.get(&offset) {
            return Ok(entry.clone());
        }

        self.reader.seek(SeekFrom::Start(
            self.header.dir_table_offset + offset as u64,
        ))?;

        let parent_offset: u32 = self.reader.read_le()?;
        let sibling_offset: u32 = self.reader.read_le()?;
        let child_dir_offset: u32 = self.reader.read_le()?;
        let child_file_offset: u32 = self.reader.read_le()?;
        let hash_sibling_offset: u32 = self.reader.read_le()?;
        let name_size: u32 = self.reader.read_le()?;

        let mut name_bytes = vec![0u8; name_size as usize];
        self.reader.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|e| Error::InvalidData(format!("bad RomFS dir name: {e}")))?;

        let entry = DirectoryEntry {
            parent_offset,
            sibling_offset,
            child_dir_offset,
            child_file_offset,
            hash_sibling_offset,
            name_size,
            name,
        };
        self.cache_dir_entries.insert(offset, entry.clone());
        Ok(entry)
    }

    /// Read a file entry from the file table
    fn read_file_entry(&mut self, offset: u32) -> Result<FileEntry, Error> {
        if let Some(entry) = self.cache_file_entries.get(&offset) {
            return Ok(entry.clone());
        }

        self.reader.seek(SeekFrom::Start(
            self.header.file_table_offset + offset as u64,
        ))?;

        let parent_offset: u32 = self.reader.read_le()?;
        let sibling_offset: u32 = self.reader.read_le()?;
        let data_offset: u64 = self.reader.read_le()?;
        let data_size: u64 = self.reader.read_le()?;
        let hash_sibling_offset: u32 = self.reader.read_le()?;
        let name_size: u32 = self.reader.read_le()?;

        let mut name_bytes = vec![0u8; name_size as usize];
        self.reader.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|e| Error::InvalidData(format!("bad RomFS file name: {e}")))?;

        let entry = FileEntry {
            parent_offset,
            sibling_offset,
            data_offset,
            data_size,
            hash_sibling_offset,
            name_size,
            name,
        };
        self.cache_file_entries.insert(offset, entry.clone());
        Ok(entry)
    }

    /// Resolve a `/`-separated path to a directory offset by walking the
    /// child-dir chain from the root and scanning siblings at each level.
    pub fn find_dir(&mut self, path: &str) -> Result<u32, Error> {
        let mut current_dir = Self::ROOT_DIR_OFFSET;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current_dir = self.find_dir_in_parent(current_dir, part)?;
        }
        Ok(current_dir)
    }

    fn find_dir_in_parent(&mut self, parent_offset: u32, name: &str) -> Result<u32, Error> {
        let parent = self.read_dir_entry(parent_offset)?;
        let mut current_offset = parent.child_dir_offset;
        while current_offset != Self::INVALID_ENTRY {
            let entry = self.read_dir_entry(current_offset)?;
            if entry.name == name {
                return Ok(current_offset);
            }
            current_offset = entry.sibling_offset;
        }
        Err(Error::NotFound(format!(
            "directory '{name}' not found under offset {parent_offset}"
        )))
    }

    /// Resolve a `/`-separated file path the same way as [`find_dir`](Self::find_dir),
    /// scanning the parent directory's file-sibling chain for the final component.
    pub fn find_file(&mut self, path: &str) -> Result<FileEntry, Error> {
        let mut path_buf = PathBuf::from(path);
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("invalid RomFS path: {path}")))?
            .to_string_lossy()
            .to_string();
        path_buf.pop();
        let parent_offset = self.find_dir(&path_buf.to_string_lossy())?;
        self.find_file_in_dir(parent_offset, &file_name)
    }

    fn find_file_in_dir(&mut self, parent_offset: u32, name: &str) -> Result<FileEntry, Error> {
        let parent = self.read_dir_entry(parent_offset)?;
        let mut current_offset = parent.child_file_offset;
        while current_offset != Self::INVALID_ENTRY {
            let entry = self.read_file_entry(current_offset)?;
            if entry.name == name {
                return Ok(entry);
            }
            current_offset = entry.sibling_offset;
        }
        Err(Error::NotFound(format!(
            "file '{name}' not found under offset {parent_offset}"
        )))
    }

    pub fn file_exists(&mut self, path: &str) -> bool {
        self.find_file(path).is_ok()
    }

    pub fn dir_exists(&mut self, path: &str) -> bool {
        self.find_dir(path).is_ok()
    }

    pub fn get_file_size(&mut self, path: &str) -> Result<u64, Error> {
        Ok(self.find_file(path)?.data_size)
    }

    /// Extract a file from the RomFS, reading in bounded chunks.
    pub fn extract_file(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let file = self.find_file(path)?;
        tracing::trace!(path, size = file.data_size, "extracting RomFS file");
        self.extract_file_entry(&file)
    }

    /// Extract a file already resolved via [`find_file`](Self::find_file) or
    /// [`walk_files`](Self::walk_files), reading in bounded chunks.
    pub fn extract_file_entry(&mut self, file: &FileEntry) -> Result<Vec<u8>, Error> {
        let offset = self.header.file_data_offset + file.data_offset;
        let size = file.data_size as usize;
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

    /// Open a directory iterator for browsing immediate children (directories and files).
    pub fn open_dir(&mut self, path: &str) -> Result<RomFsDirectoryIterator<R>, Error>
    where
        Self: Clone,
    {
        let dir_offset = self.find_dir(path)?;
        let dir_entry = self.read_dir_entry(dir_offset)?;

        let mut dir_offsets = Vec::new();
        let mut current_child = dir_entry.child_dir_offset;
        while current_child != Self::INVALID_ENTRY {
            dir_offsets.push(current_child);
            current_child = self.read_dir_entry(current_child)?.sibling_offset;
        }

        let mut file_offsets = Vec::new();
        let mut current_file = dir_entry.child_file_offset;
        while current_file != Self::INVALID_ENTRY {
            file_offsets.push(current_file);
            current_file = self.read_file_entry(current_file)?.sibling_offset;
        }

        Ok(RomFsDirectoryIterator {
            romfs: Arc::new(Mutex::new(self.clone())),
            dir_offsets,
            file_offsets,
            current_dir_index: 0,
            current_file_index: 0,
        })
    }
}

impl<R: Read + Seek + Clone> Clone for RomFs<R> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            header: self.header.clone(),
            cache_dir_entries: self.cache_dir_entries.clone(),
            cache_file_entries: self.cache_file_entries.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    /// Hand-assembles a minimal two-level RomFS image: root containing a
    /// subdirectory and a file, the subdirectory containing one more file.
    pub(crate) fn synthetic_romfs() -> Vec<u8> {
        // Layout: header (0x50) | dir hash table (skipped, size 0) |
        // dir table | file hash table (skipped, size 0) | file table | data
        const HEADER_SIZE: u32 = 0x50;
        let dir_table_offset = HEADER_SIZE as u64;

        // Directory entries, each: parent(4) sibling(4) child_dir(4) child_file(4) hash_sibling(4) name_size(4) name
        fn dir_entry(
            parent: u32,
            sibling: u32,
            child_dir: u32,
            child_file: u32,
            name: &str,
        ) -> Vec<u8> {
            let mut buf = Vec::new();
            buf.extend_from_slice(&parent.to_le_bytes());
            buf.extend_from_slice(&sibling.to_le_bytes());
            buf.extend_from_slice(&child_dir.to_le_bytes());
            buf.extend_from_slice(&child_file.to_le_bytes());
            buf.extend_from_slice(&u32::MAX.to_le_bytes()); // hash_sibling unused
            buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
            buf
        }

        fn file_entry(parent: u32, sibling: u32, data_offset: u64, data_size: u64, name: &str) -> Vec<u8> {
            let mut buf = Vec::new();
            buf.extend_from_slice(&parent.to_le_bytes());
            buf.extend_from_slice(&sibling.to_le_bytes());
            buf.extend_from_slice(&data_offset.to_le_bytes());
            buf.extend_from_slice(&data_size.to_le_bytes());
            buf.extend_from_slice(&u32::MAX.to_le_bytes());
            buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
            buf
        }

        // root dir at offset 0, child dir "sub" placed right after it, child
        // file "root.txt" at offset 0 in the file table.
        let root_probe = dir_entry(u32::MAX, u32::MAX, u32::MAX, u32::MAX, "");
        let sub_offset = root_probe.len() as u32;
        let root = dir_entry(u32::MAX, u32::MAX, sub_offset, 0x00, "");
        let sub = dir_entry(0, u32::MAX, u32::MAX, u32::MAX, "sub");

        let mut dir_table = root;
        dir_table.extend_from_slice(&sub);

        let root_file = file_entry(0, u32::MAX, 0, 5, "root.txt");
        let file_table = root_file;

        let dir_table_size = dir_table.len() as u32;
        let file_table_offset = dir_table_offset + dir_table_size as u64;
        let file_table_size = file_table.len() as u32;
        let file_data_offset = file_table_offset + file_table_size as u64;

        let mut out = Vec::new();
        out.write_all(&HEADER_SIZE.to_le_bytes()).unwrap();
        out.write_all(&0u64.to_le_bytes()).unwrap(); // dir_hash_table_offset (unused)
        out.write_all(&0u32.to_le_bytes()).unwrap(); // dir_hash_table_size
        out.write_all(&dir_table_offset.to_le_bytes()).unwrap();
        out.write_all(&dir_table_size.to_le_bytes()).unwrap();
        out.write_all(&0u64.to_le_bytes()).unwrap(); // file_hash_table_offset (unused)
        out.write_all(&0u32.to_le_bytes()).unwrap(); // file_hash_table_size
        out.write_all(&file_table_offset.to_le_bytes()).unwrap();
        out.write_all(&file_table_size.to_le_bytes()).unwrap();
        out.write_all(&file_data_offset.to_le_bytes()).unwrap();

        out.extend_from_slice(&dir_table);
        out.extend_from_slice(&file_table);
        out.extend_from_slice(b"hello");
        out
    }

    #[test]
    fn romfs_resolves_directories_and_files_by_chain_walk() {
        let data = synthetic_romfs();
        let mut romfs = RomFs::from_reader(Cursor::new(data)).unwrap();

        assert!(romfs.dir_exists("/sub"));
        assert!(romfs.file_exists("/root.txt"));
        assert_eq!(romfs.get_file_size("/root.txt").unwrap(), 5);
        assert_eq!(romfs.extract_file("/root.txt").unwrap(), b"hello");
    }

    #[test]
    fn romfs_walk_files_reports_full_paths() {
        let data = synthetic_romfs();
        let mut romfs = RomFs::from_reader(Cursor::new(data)).unwrap();
        let mut paths: Vec<String> = romfs
            .walk_files()
            .unwrap()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["/root.txt".to_string()]);
    }

    #[test]
    fn romfs_reports_missing_paths() {
        let data = synthetic_romfs();
        let mut romfs = RomFs::from_reader(Cursor::new(data)).unwrap();
        assert!(!romfs.file_exists("/nope.txt"));
        assert!(romfs.find_file("/nope.txt").is_err());
    }
}
