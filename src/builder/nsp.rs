//! NSP producer (§4.7.2): assembles a repacked NSP from a title's CNMT and
//! its content NCAs, streaming the result through the Output Streamer.
//!
//! Content identity rewrite (`ContentId = first 16 bytes of SHA-256(bytes)`)
//! follows the well-known convention every retail/eShop NCA's filename
//! already carries. When tickets aren't bundled, rights-id content is
//! depersonalized in place (header only — see the note on [`NspProducer::build`]
//! about the meta NCA) so the repacked content needs no ticket to decrypt.

use std::io::{Cursor, Read};

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::formats::cnmt::{Cnmt, PackagedContentType};
use crate::formats::keys::TitleKeys;
use crate::formats::keyset::{Keyset, get_nintendo_tweak};
use crate::formats::nca::{Nca, decrypt_with_header_key, encrypt_with_header_key};
use crate::formats::npdm::Npdm;
use crate::formats::pfs0::{Pfs0, Pfs0Writer};
use crate::formats::ticket::Ticket;
use crate::formats::{ContentId, RightsId};
use crate::streamer::{SplitStrategy, Streamer};

/// One content NCA available to the producer: its CNMT-declared type,
/// original content id, and full raw (on-disk) bytes.
pub struct RawContent {
    pub content_type: PackagedContentType,
    pub content_id: ContentId,
    pub bytes: Vec<u8>,
}

pub struct NspOptions {
    pub include_ticket_and_cert: bool,
    pub include_delta_fragments: bool,
    /// Scrub the bundled ticket's personal identifiers (device id, account
    /// id, ticket id) and rewrite it to a common ticket before packaging.
    /// No-op when `include_ticket_and_cert` is false.
    pub remove_console_data: bool,
    /// When set, patches the Program NCA's ExeFS `main.npdm` ACID block to
    /// carry this tool key's public half (and a matching signature) instead
    /// of the title's original one.
    pub acid_patch_key: Option<RsaPrivateKey>,
}

impl Default for NspOptions {
    fn default() -> Self {
        Self {
            include_ticket_and_cert: true,
            include_delta_fragments: false,
            remove_console_data: false,
            acid_patch_key: None,
        }
    }
}

pub struct NspProducer<'a> {
    keyset: &'a Keyset,
    title_keys: Option<&'a TitleKeys>,
    eticket_rsa_key: Option<&'a RsaPrivateKey>,
}

fn content_id_from_bytes(bytes: &[u8]) -> ContentId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    ContentId::from_sha256_prefix(&digest)
}

/// Filesystem index of a Program NCA's ExeFS section, the only section an
/// ACID patch ever touches.
const EXEFS_SECTION_INDEX: usize = 0;

impl<'a> NspProducer<'a> {
    pub fn new(keyset: &'a Keyset, title_keys: Option<&'a TitleKeys>) -> Self {
        Self {
            keyset,
            title_keys,
            eticket_rsa_key: None,
        }
    }

    /// Supplies the console eticket RSA private key needed to decrypt a
    /// personalized ticket's title key, used by `remove_console_data` to
    /// rewrite such a ticket into a common one.
    pub fn with_eticket_rsa_key(mut self, key: &'a RsaPrivateKey) -> Self {
        self.eticket_rsa_key = Some(key);
        self
    }

    /// Depersonalizes `bytes` in place if it's a rights-id NCA and the
    /// package won't carry a ticket, ACID-patches the Program NCA's ExeFS
    /// `main.npdm` when `options.acid_patch_key` is set, then returns the
    /// (possibly rewritten) bytes alongside the content id and full SHA-256
    /// digest derived from their final form.
    fn rewrite_content(
        &self,
        mut bytes: Vec<u8>,
        content_type: PackagedContentType,
        include_ticket: bool,
        options: &NspOptions,
    ) -> Result<(Vec<u8>, ContentId, [u8; 32]), Error> {
        if !include_ticket {
            let mut nca = Nca::from_reader(Cursor::new(bytes.clone()), self.keyset, self.title_keys)?;
            if nca.has_rights_id() {
                let title_key = nca.get_aes_ctr_decrypt_key()?;
                nca.header.depersonalize(self.keyset, &title_key)?;
                let new_header_bytes = nca.header.to_bytes_encrypt(self.keyset);
                bytes[..new_header_bytes.len()].copy_from_slice(&new_header_bytes);
            }
        }

        if content_type == PackagedContentType::Program {
            if let Some(tool_key) = &options.acid_patch_key {
                self.patch_acid(&mut bytes, tool_key)?;
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest: [u8; 32] = hasher.finalize().into();
        let content_id = ContentId::from_sha256_prefix(&digest);
        Ok((bytes, content_id, digest))
    }

    /// Patches the ACID public key embedded in a Program NCA's ExeFS
    /// `main.npdm`, in place over `bytes`: decrypts the ExeFS section,
    /// rewrites `main.npdm`'s ACID block, recomputes the section's master
    /// hash, then re-encrypts only the affected section data and the single
    /// fs header sector that records that hash (never the whole encrypted
    /// header region, which would also clobber the other sections' headers).
    fn patch_acid(&self, bytes: &mut [u8], tool_key: &RsaPrivateKey) -> Result<(), Error> {
        let mut nca = Nca::from_reader(Cursor::new(bytes.to_vec()), self.keyset, self.title_keys)?;
        let (fs_offset_abs, fs_size) = nca.fs_data_range(EXEFS_SECTION_INDEX)?;

        let mut section = {
            let mut reader = nca.open_fs_raw_reader(EXEFS_SECTION_INDEX)?;
            let mut data = Vec::with_capacity(fs_size as usize);
            reader.read_to_end(&mut data)?;
            data
        };

        let pfs0 = Pfs0::from_reader(Cursor::new(section.clone()))?;
        let (npdm_offset, npdm_size) = pfs0.file_data_range("main.npdm")?;
        let npdm_offset = npdm_offset as usize;
        let npdm_size = npdm_size as usize;

        let mut npdm = Npdm::from_bytes(&section[npdm_offset..npdm_offset + npdm_size])?;
        npdm.patch_acid(tool_key)?;
        let patched_npdm = npdm.to_bytes()?;
        if patched_npdm.len() > npdm_size {
            return Err(Error::InvalidData(format!(
                "patched main.npdm grew from {npdm_size} to {} bytes",
                patched_npdm.len()
            )));
        }
        section[npdm_offset..npdm_offset + patched_npdm.len()].copy_from_slice(&patched_npdm);

        let new_master_hash: [u8; 0x20] = Sha256::digest(&section).into();

        if !nca.fs_is_hierarchical_sha256(EXEFS_SECTION_INDEX) {
            return Err(Error::InvalidData(
                "ACID patch only supports a HierarchicalSha256 ExeFS section".to_string(),
            ));
        }

        if nca.fs_is_unencrypted(EXEFS_SECTION_INDEX) {
            bytes[fs_offset_abs as usize..(fs_offset_abs + fs_size) as usize]
                .copy_from_slice(&section);
        } else if nca.fs_is_aes_ctr(EXEFS_SECTION_INDEX) {
            let key = nca.get_aes_ctr_decrypt_key()?;
            let ctr = nca.fs_headers[EXEFS_SECTION_INDEX].ctr;
            let iv = get_nintendo_tweak(((fs_offset_abs as u128) >> 4) | ((ctr as u128) << 64));
            let mut cipher = ctr::Ctr128BE::<aes::Aes128>::new((&key).into(), (&iv).into());
            cipher.apply_keystream(&mut section);
            bytes[fs_offset_abs as usize..(fs_offset_abs + fs_size) as usize]
                .copy_from_slice(&section);
        } else {
            return Err(Error::InvalidData(
                "ACID patch does not support this ExeFS encryption type".to_string(),
            ));
        }

        // The ExeFS fs header's master hash lives at the very start of its
        // HierarchicalSha256 hash data block (raw fs header offset 0x8).
        let fs_header_offset = 0x400 + EXEFS_SECTION_INDEX * 0x200;
        let mut header_region = decrypt_with_header_key(&bytes[..0xC00], self.keyset, 0x200, 0);
        header_region[fs_header_offset + 0x8..fs_header_offset + 0x8 + 0x20]
            .copy_from_slice(&new_master_hash);

        let patched_sector = encrypt_with_header_key(
            &header_region[fs_header_offset..fs_header_offset + 0x200],
            self.keyset,
            0x200,
            (2 + EXEFS_SECTION_INDEX) as u128,
        );
        bytes[fs_header_offset..fs_header_offset + 0x200].copy_from_slice(&patched_sector);

        Ok(())
    }

    /// Rewrites `tik` into a common ticket with personal identifiers
    /// zeroed, per `NspOptions::remove_console_data`: decrypts its title
    /// key (via the eticket key if personalized), re-encrypts it with the
    /// ticket's own titlekek, and hands the result to
    /// [`Ticket::scrub_personalization`].
    fn scrub_ticket(&self, tik: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut ticket = Ticket::from_bytes(&tik)?;
        let title_key = ticket.decrypt_title_key(self.keyset, self.eticket_rsa_key)?;
        let common_title_key = self.keyset.encrypt_title_key(&title_key, ticket.key_revision)?;
        ticket.scrub_personalization(&common_title_key);
        ticket.to_bytes()
    }

    /// Builds the NSP and streams it through `streamer`.
    ///
    /// `cnmt` and `meta_bytes` come from the title's meta NCA. Only the
    /// in-memory `cnmt` value is patched with each rewritten content's new
    /// id, used to name the `<contentid>.nca` entries this function writes;
    /// re-embedding the patched CNMT back into the meta NCA's own PFS0 body
    /// would also require re-sealing that NCA's hierarchical hash tree,
    /// which is out of scope here (see `DESIGN.md`) — the meta NCA is
    /// shipped with its original bytes and identity.
    pub fn build<S: SplitStrategy>(
        &self,
        mut meta_bytes: Vec<u8>,
        mut cnmt: Cnmt,
        mut contents: Vec<RawContent>,
        ticket_and_cert: Option<(Vec<u8>, Vec<u8>, RightsId)>,
        options: &NspOptions,
        streamer: &mut Streamer<S>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let include_ticket = options.include_ticket_and_cert && ticket_and_cert.is_some();

        for content in contents.iter_mut() {
            if content.content_type == PackagedContentType::DeltaFragment
                && !options.include_delta_fragments
            {
                continue;
            }
            let taken = std::mem::take(&mut content.bytes);
            let (rewritten, new_id, new_hash) =
                self.rewrite_content(taken, content.content_type, include_ticket, options)?;
            content.content_id = new_id;
            content.bytes = rewritten;
            cnmt.patch_content_entry(content.content_type, new_id.0, Some(new_hash))?;
        }

        let meta_content_id = content_id_from_bytes(&meta_bytes);

        let mut writer: Pfs0Writer<Cursor<Vec<u8>>> = Pfs0Writer::new();
        for content in &mut contents {
            if content.content_type == PackagedContentType::DeltaFragment
                && !options.include_delta_fragments
            {
                continue;
            }
            let name = format!("{}.nca", content.content_id.to_hex());
            let size = content.bytes.len() as u64;
            writer.push(name, size, Cursor::new(std::mem::take(&mut content.bytes)));
        }

        let meta_name = format!("{}.cnmt.nca", meta_content_id.to_hex());
        writer.push(
            meta_name,
            meta_bytes.len() as u64,
            Cursor::new(std::mem::take(&mut meta_bytes)),
        );

        if include_ticket {
            if let Some((tik, cert, rights_id)) = ticket_and_cert {
                let tik = if options.remove_console_data {
                    self.scrub_ticket(tik)?
                } else {
                    tik
                };
                let rights_hex = rights_id.to_hex_upper();
                writer.push(format!("{rights_hex}.tik"), tik.len() as u64, Cursor::new(tik));
                writer.push(
                    format!("{rights_hex}.cert"),
                    cert.len() as u64,
                    Cursor::new(cert),
                );
            }
        }

        let mut out = Vec::new();
        writer.write_to(&mut out)?;
        streamer.write(&out, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::ticket::TitlekeyType;

    #[test]
    fn content_id_is_first_16_bytes_of_sha256() {
        let bytes = b"hello nsp producer".to_vec();
        let id = content_id_from_bytes(&bytes);
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        assert_eq!(&id.0[..], &digest[..16]);
    }

    fn test_keyset() -> Keyset {
        let raw = "titlekek_00 = 11111111111111111111111111111111\n";
        Keyset::from_reader(std::io::Cursor::new(raw)).unwrap()
    }

    fn common_ticket(keyset: &Keyset, title_key: &[u8; 0x10]) -> Ticket {
        let encrypted = keyset.encrypt_title_key(title_key, 0).unwrap();
        let mut titlekey_block = [0u8; 0x100];
        titlekey_block[..0x10].copy_from_slice(&encrypted);
        Ticket {
            sig_type: 0x10004,
            signature: [0u8; 0x100],
            _sig_padding: [0u8; 0x3C],
            issuer: [0u8; 0x40],
            titlekey_block,
            format_version: 2,
            titlekey_type: TitlekeyType::Common,
            ticket_version: 0,
            license_type: 0,
            key_revision: 0,
            property_mask: 0,
            _reserved: [0u8; 8],
            ticket_id: 0xAAAA_BBBB,
            device_id: 0xCCCC_DDDD,
            rights_id: [7u8; 0x10],
            account_id: 0x1234,
            sect_total_size: 0,
            sect_hdr_offset: 0,
            sect_hdr_count: 0,
            sect_hdr_entry_size: 0,
        }
    }

    #[test]
    fn scrub_ticket_zeroes_identifiers_and_preserves_title_key() {
        let keyset = test_keyset();
        let title_key = [0x42u8; 0x10];
        let ticket = common_ticket(&keyset, &title_key);
        let tik_bytes = ticket.to_bytes().unwrap();

        let producer = NspProducer::new(&keyset, None);
        let scrubbed_bytes = producer.scrub_ticket(tik_bytes).unwrap();
        let scrubbed = Ticket::from_bytes(&scrubbed_bytes).unwrap();

        assert_eq!(scrubbed.device_id, 0);
        assert_eq!(scrubbed.account_id, 0);
        assert_eq!(scrubbed.ticket_id, 0);
        assert_eq!(scrubbed.titlekey_type, TitlekeyType::Common);
        assert_eq!(
            scrubbed.decrypt_title_key(&keyset, None).unwrap(),
            title_key
        );
    }
}
