//! XCI producer (§4.7.1): streams a gamecard image through the Output
//! Streamer, optionally trimming trailing padding and masking the
//! personalized certificate region.
//!
//! `source` is expected to yield the card's bytes in absolute-offset order
//! starting at 0 (header, gap, then the `normal`/`logo`/`secure` partitions
//! back to back) — the same linear view the Block Reader (C2) already
//! presents over gamecard media, so this producer has no partition-seeking
//! logic of its own.

use std::io::{Read, Seek, SeekFrom};

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::formats::xci::XciHeader;
use crate::streamer::{SplitStrategy, Streamer};

/// Absolute byte offset of the gamecard's personalized certificate region,
/// which `keep_certificate = false` overwrites with `0xFF` before writing.
pub const CERT_OFFSET: u64 = 0x7000;
pub const CERT_SIZE: usize = 0x200;

pub struct XciOptions {
    pub trim: bool,
    pub keep_certificate: bool,
    pub calc_crc: bool,
}

/// CRC32(s) computed while streaming, per §4.7.1: both variants when the
/// certificate is kept, only the certless variant otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XciCrcResult {
    pub with_certificate: Option<u32>,
    pub certless: Option<u32>,
}

pub struct XciProducer;

impl XciProducer {
    /// Streams `source` through `streamer`, masking the certificate region
    /// in the output when requested and capping total output length at
    /// `header.trimmed_size()` when `options.trim` is set, rather than
    /// scanning for a trailing `0xFF` run.
    ///
    /// `resume_from` resumes an interrupted dump at a byte offset a prior
    /// run's sidecar recorded (0 for a fresh dump): `source` is seeked there
    /// and `streamer` is expected to already be positioned there too (via
    /// [`Streamer::resume`]). Resuming mid-stream disables CRC32 computation
    /// — `crc32fast::Hasher` exposes no way to import a partial running
    /// state, so a resumed dump's `XciCrcResult` fields are always `None`
    /// regardless of `options.calc_crc`.
    ///
    /// `on_chunk_written` is called after each chunk reaches `streamer`, with
    /// the new logical position, so a caller can persist its own resume
    /// sidecar without this producer knowing anything about sidecar files.
    pub fn build<R: Read + Seek, S: SplitStrategy>(
        header: &XciHeader,
        mut source: R,
        options: &XciOptions,
        streamer: &mut Streamer<S>,
        cancel: &CancellationToken,
        resume_from: u64,
        mut on_chunk_written: Option<&mut dyn FnMut(u64) -> Result<(), Error>>,
    ) -> Result<XciCrcResult, Error> {
        source.seek(SeekFrom::Start(resume_from))?;
        let cap = options.trim.then(|| header.trimmed_size());
        let calc_crc = options.calc_crc && resume_from == 0;

        let mut crc_with_cert =
            (calc_crc && options.keep_certificate).then(crc32fast::Hasher::new);
        let mut crc_certless = calc_crc.then(crc32fast::Hasher::new);

        const CHUNK: usize = 0x80_0000;
        let mut buffer = vec![0u8; CHUNK];
        let mut position = resume_from;

        loop {
            if let Some(cap) = cap {
                if position >= cap {
                    break;
                }
            }
            let want = match cap {
                Some(cap) => CHUNK.min((cap - position) as usize),
                None => CHUNK,
            };
            let read = read_up_to(&mut source, &mut buffer[..want])?;
            if read == 0 {
                break;
            }

            let chunk_start = position;
            let chunk_end = position + read as u64;
            let mut chunk = buffer[..read].to_vec();

            let cert_start = CERT_OFFSET;
            let cert_end = CERT_OFFSET + CERT_SIZE as u64;
            let overlap_start = chunk_start.max(cert_start);
            let overlap_end = chunk_end.min(cert_end);

            if overlap_start < overlap_end {
                let rel_start = (overlap_start - chunk_start) as usize;
                let rel_end = (overlap_end - chunk_start) as usize;

                if let Some(h) = crc_with_cert.as_mut() {
                    h.update(&chunk);
                }
                if let Some(h) = crc_certless.as_mut() {
                    let mut masked = chunk.clone();
                    masked[rel_start..rel_end].fill(0xFF);
                    h.update(&masked);
                }
                if !options.keep_certificate {
                    chunk[rel_start..rel_end].fill(0xFF);
                }
            } else {
                if let Some(h) = crc_with_cert.as_mut() {
                    h.update(&chunk);
                }
                if let Some(h) = crc_certless.as_mut() {
                    h.update(&chunk);
                }
            }

            streamer.write(&chunk, cancel)?;
            position = chunk_end;
            if let Some(callback) = on_chunk_written.as_mut() {
                callback(position)?;
            }
        }

        Ok(XciCrcResult {
            with_certificate: crc_with_cert.map(|h| h.finalize()),
            certless: crc_certless.map(|h| h.finalize()),
        })
    }
}

/// Fills `buf` from `source`, stopping early (rather than erroring) at EOF
/// since the caller's last chunk is routinely shorter than the buffer.
fn read_up_to<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut total = 0;
    while total < buf.len() {
        let n = source.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::xci::{CardSize, PAGE_SIZE};
    use crate::streamer::{MemorySplitStrategy, SplitMode};
    use std::io::Cursor;

    fn sample_header(valid_data_end_page: u32) -> XciHeader {
        XciHeader {
            signature: [0u8; 0x100],
            _magic: (),
            rom_area_start_page: 0,
            backup_area_start_page: 0,
            key_index: 0,
            card_size: CardSize::Size4Gb,
            card_header_version: 0,
            card_flags: 0,
            package_id: 0,
            valid_data_end_page,
            _reserved: [0; 4],
            card_info_offset: 0,
            rom_area_start_page_2: 0,
            rom_area_end_page: 0,
        }
    }

    fn image_with_cert_pattern(len: usize) -> Vec<u8> {
        let mut image = vec![0x41u8; len];
        let cert_end = (CERT_OFFSET as usize + CERT_SIZE).min(len);
        if (CERT_OFFSET as usize) < cert_end {
            image[CERT_OFFSET as usize..cert_end].fill(0xCC);
        }
        image
    }

    #[test]
    fn masks_certificate_region_when_not_kept() {
        let image = image_with_cert_pattern(CERT_OFFSET as usize + CERT_SIZE + 0x1000);
        let header = sample_header(((image.len() as u64) / PAGE_SIZE - 1) as u32);
        let options = XciOptions { trim: false, keep_certificate: false, calc_crc: true };

        let strategy = MemorySplitStrategy::new();
        let mut streamer = Streamer::open(strategy, SplitMode::Single);
        let cancel = CancellationToken::new();
        let result = XciProducer::build(&header, Cursor::new(image.clone()), &options, &mut streamer, &cancel, 0, None)
            .unwrap();

        let written = streamer_all_bytes(&streamer);
        assert_eq!(written.len(), image.len());
        assert_eq!(
            &written[CERT_OFFSET as usize..CERT_OFFSET as usize + CERT_SIZE],
            &[0xFFu8; CERT_SIZE][..]
        );
        assert!(result.with_certificate.is_none());
        assert_eq!(result.certless, Some(crc32fast::hash(&written)));
    }

    #[test]
    fn keeps_certificate_and_reports_both_crc_variants() {
        let image = image_with_cert_pattern(CERT_OFFSET as usize + CERT_SIZE + 0x1000);
        let header = sample_header(((image.len() as u64) / PAGE_SIZE - 1) as u32);
        let options = XciOptions { trim: false, keep_certificate: true, calc_crc: true };

        let strategy = MemorySplitStrategy::new();
        let mut streamer = Streamer::open(strategy, SplitMode::Single);
        let cancel = CancellationToken::new();
        let result = XciProducer::build(&header, Cursor::new(image.clone()), &options, &mut streamer, &cancel, 0, None)
            .unwrap();

        let written = streamer_all_bytes(&streamer);
        assert_eq!(written, image);
        assert_eq!(result.with_certificate, Some(crc32fast::hash(&image)));

        let mut masked = image.clone();
        masked[CERT_OFFSET as usize..CERT_OFFSET as usize + CERT_SIZE].fill(0xFF);
        assert_eq!(result.certless, Some(crc32fast::hash(&masked)));
        assert_ne!(result.with_certificate, result.certless);
    }

    #[test]
    fn trim_caps_output_at_the_headers_trimmed_size() {
        let full_len = CERT_OFFSET as usize + CERT_SIZE + (4 * PAGE_SIZE as usize);
        let image = image_with_cert_pattern(full_len);
        // Trim to 2 pages short of the full image.
        let trimmed_pages = (full_len as u64 / PAGE_SIZE) - 2;
        let header = sample_header((trimmed_pages - 1) as u32);
        let options = XciOptions { trim: true, keep_certificate: true, calc_crc: false };

        let strategy = MemorySplitStrategy::new();
        let mut streamer = Streamer::open(strategy, SplitMode::Single);
        let cancel = CancellationToken::new();
        XciProducer::build(&header, Cursor::new(image.clone()), &options, &mut streamer, &cancel, 0, None).unwrap();

        let written = streamer_all_bytes(&streamer);
        assert_eq!(written.len(), header.trimmed_size() as usize);
        assert_eq!(&written[..], &image[..written.len()]);
    }

    #[test]
    fn resume_from_an_offset_skips_already_written_bytes_and_drops_crc() {
        let image = image_with_cert_pattern(CERT_OFFSET as usize + CERT_SIZE + 0x2000);
        let header = sample_header(((image.len() as u64) / PAGE_SIZE - 1) as u32);
        let options = XciOptions { trim: false, keep_certificate: true, calc_crc: true };

        let strategy = MemorySplitStrategy::new();
        let mut streamer = Streamer::open(strategy, SplitMode::Single);
        let cancel = CancellationToken::new();

        // Simulate a prior, interrupted run that already wrote the first
        // 0x1000 bytes to the same backing chunks.
        let resume_from = 0x1000u64;
        streamer.write(&image[..resume_from as usize], &cancel).unwrap();
        assert_eq!(streamer.position(), resume_from);

        let result = XciProducer::build(
            &header,
            Cursor::new(image.clone()),
            &options,
            &mut streamer,
            &cancel,
            resume_from,
            None,
        )
        .unwrap();

        let written = streamer_all_bytes(&streamer);
        assert_eq!(written, image);
        assert!(result.with_certificate.is_none());
        assert!(result.certless.is_none());
    }

    fn streamer_all_bytes(streamer: &Streamer<MemorySplitStrategy>) -> Vec<u8> {
        streamer.strategy().chunk(0).unwrap_or_default()
    }
}
