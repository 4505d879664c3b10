//! Output Streamer (C6): a write-only sink over a logical target that may be
//! a single file or a directory of split chunk files. Every byte the
//! Package Builder (C7) produces flows through here so splitting, scoped
//! hashing, and cancellation are handled in one place instead of at each
//! producer.
//!
//! No donor equivalent. Grounded on `original_source/source/dumper.c`'s
//! FAT32 split-chunk logic (fixed `4 GiB - 1` chunk boundaries, zero-padded
//! two-digit chunk suffixes) and on this crate's existing `cancel.rs`
//! (`CancellationToken`, polled cooperatively rather than preemptively).

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::cancel::CancellationToken;
use crate::error::Error;

/// Chunk size used for the XCI/NSP FAT32-compatible split.
pub const FAT_SPLIT_CHUNK_SIZE: u64 = 0xFFFF_0000;

/// How a logical output stream is laid out on the backing medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// One contiguous file.
    Single,
    /// FAT32-safe split: chunks of `4 GiB - 1` bytes, zero-padded two-digit
    /// suffixes (`00`, `01`, …).
    FatSplit,
    /// A configurable chunk size for sequential/resumable dumps.
    SequentialChunks(u64),
}

impl SplitMode {
    fn chunk_size(&self) -> Option<u64> {
        match self {
            SplitMode::Single => None,
            SplitMode::FatSplit => Some(FAT_SPLIT_CHUNK_SIZE),
            SplitMode::SequentialChunks(size) => Some(*size),
        }
    }
}

/// A chunk's writable backing handle. Implemented by a real-file sink in
/// the builder layer and by an in-memory sink in tests.
pub trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

/// Supplies chunk sinks to the streamer and knows how to name/discard them.
/// The split policy itself (chunk size, naming) lives in [`SplitMode`]; this
/// trait is only about obtaining and cleaning up the underlying storage.
pub trait SplitStrategy {
    /// Opens (creating if necessary) the sink for chunk `index`.
    fn open_chunk(&mut self, index: u64) -> Result<Box<dyn WriteSeek>, Error>;

    /// Deletes every chunk written so far. Called on a non-resumable
    /// cancellation.
    fn delete_all(&mut self) -> Result<(), Error>;
}

/// An in-memory [`SplitStrategy`] backed by growable byte buffers, used by
/// tests and by any caller that wants to build output entirely in memory.
/// Mirrors `io.rs`'s `SharedReader` in spirit: the backing buffer is shared
/// through an `Arc<Mutex<_>>` so a chunk handle can be handed out as an
/// owned `Box<dyn WriteSeek>` while still writing back into the strategy.
#[derive(Default)]
pub struct MemorySplitStrategy {
    chunks: HashMap<u64, Arc<Mutex<Vec<u8>>>>,
}

impl MemorySplitStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a chunk's current contents, for tests.
    pub fn chunk(&self, index: u64) -> Option<Vec<u8>> {
        self.chunks.get(&index).map(|c| c.lock().unwrap().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl SplitStrategy for MemorySplitStrategy {
    fn open_chunk(&mut self, index: u64) -> Result<Box<dyn WriteSeek>, Error> {
        let buf = self.chunks.entry(index).or_default();
        Ok(Box::new(MemoryChunkHandle {
            buf: Arc::clone(buf),
            position: 0,
        }))
    }

    fn delete_all(&mut self) -> Result<(), Error> {
        self.chunks.clear();
        Ok(())
    }
}

struct MemoryChunkHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl Write for MemoryChunkHandle {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        let mut buf = self.buf.lock().unwrap();
        let pos = self.position as usize;
        if pos + bytes.len() > buf.len() {
            buf.resize(pos + bytes.len(), 0);
        }
        buf[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryChunkHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.buf.lock().unwrap().len() as i64;
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(p) => self.position as i64 + p,
            SeekFrom::End(p) => len + p,
        };
        self.position = new_pos.max(0) as u64;
        Ok(self.position)
    }
}

/// A token returned by [`Streamer::write_placeholder`], redeemable exactly
/// once through [`Streamer::write_at`].
pub struct PlaceholderToken {
    start: u64,
    len: u64,
    filled: bool,
}

/// Serializable progress state for a resumable sequential dump. Note on the
/// SHA-256 field: the `sha2` crate exposes no public way to export a
/// hasher's internal compression state, so rather than reach for `unsafe`
/// transmutes this stores how many bytes of the in-progress NCA have
/// already been hashed; `resume` re-reads and re-hashes that prefix from
/// the still-available source NCA instead of restoring raw hasher state.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub chunk_index: u64,
    pub logical_position: u64,
    pub active_nca_bytes_hashed: u64,
    pub finalized_nca_hashes: Vec<[u8; 32]>,
}

/// Write-only sink over a logical output, splitting across chunks and
/// offering scoped hashing per spec.md §4.6.
pub struct Streamer<S: SplitStrategy> {
    strategy: S,
    split_mode: SplitMode,
    chunks: HashMap<u64, Box<dyn WriteSeek>>,
    position: u64,
    sha_scope: Option<Sha256>,
    crc: Option<crc32fast::Hasher>,
    cancelled: bool,
    sequential: bool,
    finalized_nca_hashes: Vec<[u8; 32]>,
}

impl<S: SplitStrategy> Streamer<S> {
    pub fn open(strategy: S, split_mode: SplitMode) -> Self {
        let sequential = matches!(split_mode, SplitMode::SequentialChunks(_));
        Self {
            strategy,
            split_mode,
            chunks: HashMap::new(),
            position: 0,
            sha_scope: None,
            crc: None,
            cancelled: false,
            sequential,
            finalized_nca_hashes: Vec::new(),
        }
    }

    pub fn resume(strategy: S, split_mode: SplitMode, checkpoint: Checkpoint) -> Self {
        let mut streamer = Self::open(strategy, split_mode);
        streamer.position = checkpoint.logical_position;
        streamer.finalized_nca_hashes = checkpoint.finalized_nca_hashes;
        streamer
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// The backing strategy, for callers that need to inspect or hand off
    /// the underlying storage once streaming is done.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    fn chunk_for(&mut self, index: u64) -> Result<&mut Box<dyn WriteSeek>, Error> {
        if !self.chunks.contains_key(&index) {
            let chunk = self.strategy.open_chunk(index)?;
            self.chunks.insert(index, chunk);
        }
        Ok(self.chunks.get_mut(&index).unwrap())
    }

    /// Writes `bytes` at the current logical position, splitting across
    /// chunk boundaries transparently and feeding the active SHA-256 scope.
    pub fn write(&mut self, bytes: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        cancel.check()?;
        if self.cancelled {
            return Err(Error::Cancelled);
        }

        if let Some(hasher) = self.sha_scope.as_mut() {
            hasher.update(bytes);
        }
        if let Some(crc) = self.crc.as_mut() {
            crc.update(bytes);
        }

        let chunk_size = self.split_mode.chunk_size();
        let mut remaining = bytes;
        let mut pos = self.position;

        while !remaining.is_empty() {
            let (chunk_index, offset_in_chunk, take) = match chunk_size {
                None => (0u64, pos, remaining.len()),
                Some(size) => {
                    let chunk_index = pos / size;
                    let offset_in_chunk = pos % size;
                    let room = (size - offset_in_chunk) as usize;
                    (chunk_index, offset_in_chunk, remaining.len().min(room))
                }
            };

            let (head, tail) = remaining.split_at(take);
            let chunk = self.chunk_for(chunk_index)?;
            chunk.seek(SeekFrom::Start(offset_in_chunk))?;
            chunk.write_all(head)?;

            pos += take as u64;
            remaining = tail;
        }

        self.position = pos;
        Ok(())
    }

    /// Reserves `len` zeroed bytes at the current position. The reservation
    /// must fit within a single chunk (true in practice: only the NSP/XCI
    /// header, far smaller than a chunk, is ever reserved this way).
    pub fn write_placeholder(
        &mut self,
        len: u64,
        cancel: &CancellationToken,
    ) -> Result<PlaceholderToken, Error> {
        let start = self.position;
        if let Some(size) = self.split_mode.chunk_size() {
            if start % size + len > size {
                return Err(Error::InvalidState(
                    "placeholder would cross a chunk boundary".to_string(),
                ));
            }
        }
        let zeros = vec![0u8; len as usize];
        self.write(&zeros, cancel)?;
        Ok(PlaceholderToken {
            start,
            len,
            filled: false,
        })
    }

    /// Fills a reserved placeholder. May only be called once per token.
    pub fn write_at(&mut self, token: &mut PlaceholderToken, bytes: &[u8]) -> Result<(), Error> {
        if token.filled {
            return Err(Error::InvalidOperation(
                "placeholder already written".to_string(),
            ));
        }
        if bytes.len() as u64 != token.len {
            return Err(Error::InvalidArgument(format!(
                "placeholder is {} bytes, got {}",
                token.len,
                bytes.len()
            )));
        }
        let chunk_size = self.split_mode.chunk_size();
        let (chunk_index, offset_in_chunk) = match chunk_size {
            None => (0, token.start),
            Some(size) => (token.start / size, token.start % size),
        };
        let chunk = self.chunk_for(chunk_index)?;
        chunk.seek(SeekFrom::Start(offset_in_chunk))?;
        chunk.write_all(bytes)?;
        token.filled = true;
        Ok(())
    }

    /// Begins a scoped SHA-256 over subsequent writes. Only one scope may be
    /// active at a time.
    pub fn sha256_scope_begin(&mut self) {
        self.sha_scope = Some(Sha256::new());
    }

    /// Ends the active scope and returns its digest.
    pub fn sha256_scope_finish(&mut self) -> Result<[u8; 32], Error> {
        let hasher = self
            .sha_scope
            .take()
            .ok_or_else(|| Error::InvalidState("no active SHA-256 scope".to_string()))?;
        let digest: [u8; 32] = hasher.finalize().into();
        self.finalized_nca_hashes.push(digest);
        Ok(digest)
    }

    /// Enables (if not already) the whole-output running CRC32 and feeds it
    /// `bytes`. Used by the XCI producer, independent of SHA-256 scoping.
    pub fn crc32_scope_update(&mut self, bytes: &[u8]) {
        self.crc.get_or_insert_with(crc32fast::Hasher::new).update(bytes);
    }

    pub fn crc32_value(&self) -> Option<u32> {
        self.crc.as_ref().map(|h| h.clone().finalize())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let chunk_size = self.split_mode.chunk_size().unwrap_or(u64::MAX);
        Checkpoint {
            chunk_index: self.position / chunk_size,
            logical_position: self.position,
            active_nca_bytes_hashed: 0,
            finalized_nca_hashes: self.finalized_nca_hashes.clone(),
        }
    }

    /// Marks the streamer cancelled. Idempotent. In non-sequential mode,
    /// every chunk written so far is deleted; in sequential mode, chunks
    /// are preserved for a later `resume`.
    pub fn cancel(&mut self) -> Result<(), Error> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        if !self.sequential {
            self.strategy.delete_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_splits_across_chunk_boundaries() {
        let mut streamer = Streamer::open(MemorySplitStrategy::new(), SplitMode::SequentialChunks(4));
        let cancel = CancellationToken::new();
        streamer.write(b"abcdefgh", &cancel).unwrap();
        assert_eq!(streamer.strategy.chunk(0).unwrap(), b"abcd");
        assert_eq!(streamer.strategy.chunk(1).unwrap(), b"efgh");
    }

    #[test]
    fn placeholder_is_filled_exactly_once() {
        let mut streamer = Streamer::open(MemorySplitStrategy::new(), SplitMode::Single);
        let cancel = CancellationToken::new();
        let mut token = streamer.write_placeholder(4, &cancel).unwrap();
        streamer.write(b"rest", &cancel).unwrap();
        streamer.write_at(&mut token, b"HEAD").unwrap();
        assert_eq!(streamer.strategy.chunk(0).unwrap(), b"HEADrest");
        assert!(streamer.write_at(&mut token, b"AGN!").is_err());
    }

    #[test]
    fn sha256_scope_hashes_only_bytes_written_during_the_scope() {
        let mut streamer = Streamer::open(MemorySplitStrategy::new(), SplitMode::Single);
        let cancel = CancellationToken::new();
        streamer.write(b"prefix-", &cancel).unwrap();
        streamer.sha256_scope_begin();
        streamer.write(b"scoped", &cancel).unwrap();
        let digest = streamer.sha256_scope_finish().unwrap();

        let mut expected = Sha256::new();
        expected.update(b"scoped");
        assert_eq!(digest, <[u8; 32]>::from(expected.finalize()));
    }

    #[test]
    fn cancel_deletes_chunks_in_non_sequential_mode() {
        let mut streamer = Streamer::open(MemorySplitStrategy::new(), SplitMode::Single);
        let cancel = CancellationToken::new();
        streamer.write(b"data", &cancel).unwrap();
        streamer.cancel().unwrap();
        assert!(streamer.strategy.is_empty());
        assert!(matches!(streamer.write(b"x", &cancel), Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_preserves_chunks_in_sequential_mode() {
        let mut streamer =
            Streamer::open(MemorySplitStrategy::new(), SplitMode::SequentialChunks(0x100));
        let cancel = CancellationToken::new();
        streamer.write(b"data", &cancel).unwrap();
        streamer.cancel().unwrap();
        assert!(!streamer.strategy.is_empty());
    }
}
