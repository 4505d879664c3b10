//! ExeFS-tree and RomFS-tree producers (§4.7.3): walk a PFS0 (ExeFS) or
//! RomFS view and stream each file out through its own per-file Streamer.
//! No CNMT is involved — these are one-file-per-entry extractions, not
//! packages.
//!
//! RomFS traversal (`RomFs::walk_files`) follows the `first-child`/
//! `next-sibling` chains with an explicit stack rather than recursive calls,
//! so traversal depth is bounded by available memory, not call-stack depth;
//! output paths are still checked against the console's own path-length
//! limit (`FS_MAX_PATH`, referenced in `original_source/source/core/config.c`)
//! since that's what would actually reject a restored file on hardware.

use std::io::{Read, Seek};

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::formats::pfs0::Pfs0;
use crate::formats::romfs::RomFs;
use crate::progress::ProgressObserver;
use crate::streamer::{SplitMode, SplitStrategy, Streamer};

/// The console's maximum path length, per libnx's `FS_MAX_PATH`.
pub const FS_MAX_PATH: usize = 0x301;

pub struct TreeOptions {
    pub fat_split: bool,
}

impl TreeOptions {
    fn split_mode(&self) -> SplitMode {
        if self.fat_split {
            SplitMode::FatSplit
        } else {
            SplitMode::Single
        }
    }
}

pub struct ExeFsTreeProducer;

impl ExeFsTreeProducer {
    /// Extracts every entry of `pfs0` through a fresh per-file output,
    /// obtained from `open_output`. Returns the names written.
    pub fn extract<R: Read + Seek, S: SplitStrategy>(
        pfs0: &mut Pfs0<R>,
        options: &TreeOptions,
        mut open_output: impl FnMut(&str) -> Result<S, Error>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, Error> {
        let split_mode = options.split_mode();
        let mut written = Vec::with_capacity(pfs0.file_count());
        for name in pfs0.list_files()? {
            let bytes = pfs0.read_file(&name)?;
            let strategy = open_output(&name)?;
            let mut streamer = Streamer::open(strategy, split_mode);
            streamer.write(&bytes, cancel)?;
            written.push(name);
        }
        Ok(written)
    }
}

pub struct RomFsTreeProducer;

impl RomFsTreeProducer {
    /// Extracts every file of `romfs` through a fresh per-file output,
    /// preserving the RomFS's directory structure in each returned path.
    /// `romfs` may be a plain section view or one composed over a BKTR
    /// overlay ([`crate::formats::bktr::BktrRomFs`]) — both present the same
    /// `Read + Seek` interface, so this function doesn't need to know which.
    ///
    /// A file whose BKTR range needs a base RomFS that isn't available is
    /// skipped with a warning reported to `observer`, per the per-file BKTR
    /// degradation policy, rather than aborting the whole walk.
    pub fn extract<R: Read + Seek, S: SplitStrategy>(
        romfs: &mut RomFs<R>,
        options: &TreeOptions,
        mut open_output: impl FnMut(&str) -> Result<S, Error>,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, Error> {
        let split_mode = options.split_mode();
        let mut written = Vec::new();
        for (path, entry) in romfs.walk_files()? {
            if path.len() > FS_MAX_PATH {
                observer.on_warning(&format!("skipping {path}: exceeds FS_MAX_PATH"));
                continue;
            }

            let bytes = match romfs.extract_file_entry(&entry) {
                Ok(bytes) => bytes,
                Err(Error::BaseUnavailable(offset)) => {
                    observer.on_warning(&format!(
                        "skipping {path}: base RomFS unavailable for BKTR read at {offset:#x}"
                    ));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let strategy = open_output(&path)?;
            let mut streamer = Streamer::open(strategy, split_mode);
            streamer.write(&bytes, cancel)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::pfs0::Pfs0Writer;
    use crate::formats::romfs::RomFs;
    use crate::progress::NullObserver;
    use crate::streamer::MemorySplitStrategy;
    use std::cell::RefCell;
    use std::io::Cursor;

    #[test]
    fn exefs_tree_extracts_every_entry() {
        let mut writer = Pfs0Writer::new();
        writer.push("main", 3, Cursor::new(vec![1, 2, 3]));
        writer.push("rtld", 2, Cursor::new(vec![9, 9]));
        let mut bytes = Vec::new();
        writer.write_to(&mut bytes).unwrap();

        let mut pfs0 = Pfs0::from_reader(Cursor::new(bytes)).unwrap();
        let cancel = CancellationToken::new();
        let options = TreeOptions { fat_split: false };

        let opened: RefCell<Vec<String>> = RefCell::new(Vec::new());
        let written = ExeFsTreeProducer::extract(
            &mut pfs0,
            &options,
            |name| {
                opened.borrow_mut().push(name.to_string());
                Ok(MemorySplitStrategy::new())
            },
            &cancel,
        )
        .unwrap();

        assert_eq!(written, vec!["main".to_string(), "rtld".to_string()]);
        assert_eq!(*opened.borrow(), written);
    }

    #[test]
    fn romfs_tree_walks_synthetic_fixture() {
        let data = crate::formats::romfs::tests::synthetic_romfs();
        let mut romfs = RomFs::from_reader(Cursor::new(data)).unwrap();
        let cancel = CancellationToken::new();
        let options = TreeOptions { fat_split: false };
        let observer = NullObserver;

        let written = RomFsTreeProducer::extract(
            &mut romfs,
            &options,
            |_path| Ok(MemorySplitStrategy::new()),
            &observer,
            &cancel,
        )
        .unwrap();

        assert_eq!(written, vec!["/root.txt".to_string()]);
    }
}
