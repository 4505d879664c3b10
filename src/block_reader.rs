//! Block Reader (C2): sector-aligned encrypted I/O over a backing store.
//!
//! Two concrete backends are modeled: a gamecard partition (sector-aligned,
//! subject to hot-plug removal) and console content storage (NCA-by-id,
//! 16-byte aligned for downstream AES). Both implement [`BlockReader`], so
//! the NCA Section Engine (C3) is backend-agnostic.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::formats::ContentId;

/// Sector size gamecard reads are aligned to.
pub const GC_SECTOR: u64 = 512;

/// A backing store a dump operation reads from. Every reader owns its
/// backing handle exclusively; concurrent use of a single reader is
/// undefined and callers must serialize access.
pub trait BlockReader {
    /// Read `len` bytes starting at `offset`. Fails with
    /// [`Error::ShortRead`], [`Error::MediaRemoved`], or [`Error::Backend`].
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Error>;

    /// Release the backing handle. After close, further reads are undefined;
    /// in practice this just drops the inner file handle.
    fn close(&mut self) {}
}

/// One of the partitions a gamecard exposes as an `IStorage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamecardPartitionId {
    Normal,
    Logo,
    Secure,
}

/// Flips to `true` when the console's hot-plug watcher observes the card
/// being pulled. Shared between the watcher thread and any outstanding
/// [`GamecardPartition`] readers over that card.
#[derive(Clone, Default)]
pub struct PresenceFlag(Arc<AtomicBool>);

impl PresenceFlag {
    pub fn new_present() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn mark_removed(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_present(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reads one partition of a gamecard image.
///
/// Reads must land on [`GC_SECTOR`]-aligned offsets and lengths; unaligned
/// requests are satisfied by over-reading into a bounce buffer and slicing
/// out the requested range.
pub struct GamecardPartition<R: Read + Seek> {
    inner: R,
    partition_id: GamecardPartitionId,
    /// Offset of this partition's start within the underlying image.
    base_offset: u64,
    size: u64,
    presence: PresenceFlag,
}

impl<R: Read + Seek> GamecardPartition<R> {
    pub fn open(
        inner: R,
        partition_id: GamecardPartitionId,
        base_offset: u64,
        size: u64,
        presence: PresenceFlag,
    ) -> Self {
        Self {
            inner,
            partition_id,
            base_offset,
            size,
            presence,
        }
    }

    pub fn partition_id(&self) -> GamecardPartitionId {
        self.partition_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: Read + Seek> BlockReader for GamecardPartition<R> {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        if !self.presence.is_present() {
            return Err(Error::MediaRemoved);
        }

        let aligned_offset = crate::io::align_down(offset, GC_SECTOR);
        let diff = (offset - aligned_offset) as usize;
        let aligned_len = crate::io::align_up(len + diff, GC_SECTOR as usize);

        let mut bounce = vec![0u8; aligned_len];
        self.inner
            .seek(SeekFrom::Start(self.base_offset + aligned_offset))?;

        let read = self.inner.read(&mut bounce)?;
        if !self.presence.is_present() {
            return Err(Error::MediaRemoved);
        }
        if read < diff + len {
            return Err(Error::ShortRead {
                expected: len,
                actual: read.saturating_sub(diff),
            });
        }

        Ok(bounce[diff..diff + len].to_vec())
    }
}

/// Reads NCAs by [`ContentId`] from SD-card or internal console storage.
///
/// Unlike the gamecard backend, reads may start at any offset; the
/// implementation still aligns internally to 16 bytes to satisfy downstream
/// AES-CTR/XTS readers.
pub struct ContentStorage<R: Read + Seek> {
    inner: R,
    content_id: ContentId,
    size: u64,
}

impl<R: Read + Seek> ContentStorage<R> {
    pub fn open(inner: R, content_id: ContentId, size: u64) -> Self {
        Self {
            inner,
            content_id,
            size,
        }
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: Read + Seek> BlockReader for ContentStorage<R> {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let aligned_offset = crate::io::align_down(offset, 0x10);
        let diff = (offset - aligned_offset) as usize;
        let aligned_len = crate::io::align_up(len + diff, 0x10);

        let mut bounce = vec![0u8; aligned_len];
        self.inner.seek(SeekFrom::Start(aligned_offset))?;
        let read = self.inner.read(&mut bounce)?;
        if read < diff + len {
            return Err(Error::ShortRead {
                expected: len,
                actual: read.saturating_sub(diff),
            });
        }

        Ok(bounce[diff..diff + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn gamecard_partition_reads_unaligned_ranges() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        let mut part = GamecardPartition::open(
            Cursor::new(data.clone()),
            GamecardPartitionId::Secure,
            0,
            data.len() as u64,
            PresenceFlag::new_present(),
        );

        let got = part.read_at(513, 10).unwrap();
        assert_eq!(got, &data[513..523]);
    }

    #[test]
    fn gamecard_partition_fails_after_removal() {
        let data = vec![0u8; 512];
        let presence = PresenceFlag::new_present();
        let mut part = GamecardPartition::open(
            Cursor::new(data),
            GamecardPartitionId::Normal,
            0,
            512,
            presence.clone(),
        );
        presence.mark_removed();
        assert!(matches!(part.read_at(0, 16), Err(Error::MediaRemoved)));
    }

    #[test]
    fn content_storage_reads_unaligned_ranges() {
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let id = ContentId([0u8; 16]);
        let mut storage = ContentStorage::open(Cursor::new(data.clone()), id, data.len() as u64);
        let got = storage.read_at(5, 20).unwrap();
        assert_eq!(got, &data[5..25]);
    }
}
