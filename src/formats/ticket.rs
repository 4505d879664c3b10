//! Tickets grant a title's rights-id access to its title key. A ticket is
//! either common (the title key block holds the AES-ECB-encrypted key
//! directly, decryptable by anyone holding the right titlekek) or
//! personalized (the block is an RSA-OAEP ciphertext readable only by the
//! console that requested it).
//!
//! This module has no donor equivalent; the layout below follows the
//! 0x2C0-byte structure documented across the scene's ticket tooling
//! (signature block, issuer string, title-key block, then the fixed tail of
//! generation/rights-id/device/account/ticket-id fields).

use std::collections::HashMap;
use std::io::{Read, Seek};

use binrw::prelude::*;
use rsa::{Oaep, RsaPrivateKey};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::formats::RightsId;
use crate::formats::hfs0::Hfs0;
use crate::formats::keyset::Keyset;

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitlekeyType {
    Common = 0x00,
    Personalized = 0x01,
}

/// A 0x2C0-byte ticket.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct Ticket {
    pub sig_type: u32,
    pub signature: [u8; 0x100],
    pub _sig_padding: [u8; 0x3C],
    pub issuer: [u8; 0x40],
    pub titlekey_block: [u8; 0x100],
    pub format_version: u8,
    pub titlekey_type: TitlekeyType,
    pub ticket_version: u16,
    pub license_type: u8,
    pub key_revision: u8,
    pub property_mask: u16,
    pub _reserved: [u8; 8],
    pub ticket_id: u64,
    pub device_id: u64,
    pub rights_id: [u8; 0x10],
    pub account_id: u32,
    pub sect_total_size: u32,
    pub sect_hdr_offset: u32,
    pub sect_hdr_count: u16,
    pub sect_hdr_entry_size: u16,
}

impl Ticket {
    pub const SIZE: u64 = 0x2C0;
    pub const ISSUER_NORMALIZED: &'static str = "Root-CA00000003-XS00000020";

    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, Error> {
        reader
            .read_le()
            .map_err(|e| Error::InvalidData(format!("bad ticket: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE as usize {
            return Err(Error::InvalidData(format!(
                "ticket too short: {} bytes, need {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        let mut cursor = binrw::io::Cursor::new(bytes);
        Self::from_reader(&mut cursor)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut cursor = binrw::io::Cursor::new(&mut out);
        self.write_le(&mut cursor)
            .map_err(|e| Error::InvalidData(format!("failed to serialize ticket: {e}")))?;
        Ok(out)
    }

    pub fn rights_id(&self) -> RightsId {
        RightsId(self.rights_id)
    }

    pub fn issuer_str(&self) -> String {
        let end = self
            .issuer
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.issuer.len());
        String::from_utf8_lossy(&self.issuer[..end]).into_owned()
    }

    /// The encrypted 0x10-byte title key for a common ticket, or the leading
    /// 0x10 bytes of the RSA-OAEP ciphertext for a personalized one.
    pub fn title_key_block_prefix(&self) -> [u8; 0x10] {
        let mut out = [0u8; 0x10];
        out.copy_from_slice(&self.titlekey_block[..0x10]);
        out
    }

    /// Decrypts this ticket's title key. Common tickets are unwrapped with
    /// the titlekek for `key_revision`; personalized tickets require the
    /// console's eticket RSA private key.
    pub fn decrypt_title_key(
        &self,
        keyset: &Keyset,
        eticket_rsa_key: Option<&RsaPrivateKey>,
    ) -> Result<[u8; 0x10], Error> {
        match self.titlekey_type {
            TitlekeyType::Common => {
                keyset.decrypt_title_key(&self.title_key_block_prefix(), self.key_revision)
            }
            TitlekeyType::Personalized => {
                let rsa_key = eticket_rsa_key.ok_or_else(|| {
                    Error::KeyMissing("eticket RSA private key (personalized ticket)".to_string())
                })?;
                let padding = Oaep::new::<Sha256>();
                let plaintext = rsa_key
                    .decrypt(padding, &self.titlekey_block)
                    .map_err(|e| Error::CryptoError(format!("RSA-OAEP decrypt failed: {e}")))?;
                if plaintext.len() != 0x10 {
                    return Err(Error::CryptoError(format!(
                        "decrypted personalized title key has wrong length: {}",
                        plaintext.len()
                    )));
                }
                let mut key = [0u8; 0x10];
                key.copy_from_slice(&plaintext);
                Ok(key)
            }
        }
    }

    /// Rewrites this ticket in place so it is byte-identical to what a
    /// common-ticket dump would contain for `common_title_key`: personal
    /// identifiers zeroed, issuer normalized, title-key block replaced with
    /// the plaintext common key, and its type flipped to `Common`.
    ///
    /// A no-op on an already-scrubbed ticket.
    pub fn scrub_personalization(&mut self, common_title_key: &[u8; 0x10]) {
        self.device_id = 0;
        self.account_id = 0;
        self.ticket_id = 0;

        self.issuer = [0u8; 0x40];
        let issuer = Self::ISSUER_NORMALIZED.as_bytes();
        self.issuer[..issuer.len()].copy_from_slice(issuer);

        self.titlekey_block = [0u8; 0x100];
        self.titlekey_block[..0x10].copy_from_slice(common_title_key);

        self.titlekey_type = TitlekeyType::Common;
    }
}

/// SHA-256 over bytes 0x190..0x280 of a ticket (the tail 0xF0 bytes of the
/// title-key block) once it has been zeroed by scrubbing. Builders use this
/// to assert that [`Ticket::scrub_personalization`] actually ran.
pub fn titlekey_block_empty_hash() -> [u8; 0x20] {
    let mut hasher = Sha256::new();
    hasher.update([0u8; 0xF0]);
    hasher.finalize().into()
}

/// One resolved ticket plus its certificate chain, as read from either the
/// gamecard's Normal partition or the console's ticket catalog.
pub struct ResolvedTicket {
    pub ticket: Ticket,
    pub ticket_bytes: Vec<u8>,
    pub cert_bytes: Vec<u8>,
}

/// The console's on-disk collection of tickets (both common and
/// personalized) plus their certificate chains, keyed by rights-id.
#[derive(Default)]
pub struct TicketCatalog {
    entries: HashMap<RightsId, (Vec<u8>, Vec<u8>)>,
}

impl TicketCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ticket_bytes: Vec<u8>, cert_bytes: Vec<u8>) -> Result<(), Error> {
        let ticket = Ticket::from_bytes(&ticket_bytes)?;
        self.entries
            .insert(ticket.rights_id(), (ticket_bytes, cert_bytes));
        Ok(())
    }

    pub fn get(&self, rights_id: RightsId) -> Option<Result<ResolvedTicket, Error>> {
        self.entries.get(&rights_id).map(|(tik, cert)| {
            Ticket::from_bytes(tik).map(|ticket| ResolvedTicket {
                ticket,
                ticket_bytes: tik.clone(),
                cert_bytes: cert.clone(),
            })
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves the ticket for `rights_id` per C5's lookup order: first the
/// gamecard's Normal partition (`<rightsid>.tik`, common tickets only), then
/// the console's ticket catalog.
pub fn resolve_ticket<R: Read + Seek>(
    rights_id: RightsId,
    gamecard_normal: Option<&mut Hfs0<R>>,
    catalog: &TicketCatalog,
) -> Result<ResolvedTicket, Error> {
    if let Some(normal) = gamecard_normal {
        let filename = format!("{}.tik", rights_id.to_hex_upper());
        if let Ok(ticket_bytes) = normal.read_file(&filename) {
            let ticket = Ticket::from_bytes(&ticket_bytes)?;
            if ticket.titlekey_type != TitlekeyType::Common {
                return Err(Error::InvalidState(format!(
                    "gamecard ticket for rights-id {rights_id} is personalized, which is not supported on a card"
                )));
            }
            let cert_name = format!("{}.cert", rights_id.to_hex_upper());
            let cert_bytes = normal.read_file(&cert_name).unwrap_or_default();
            return Ok(ResolvedTicket {
                ticket,
                ticket_bytes,
                cert_bytes,
            });
        }
    }

    catalog
        .get(rights_id)
        .transpose()?
        .ok_or_else(|| Error::TicketNotFound(rights_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_ticket(titlekey_type: TitlekeyType, rights_id: [u8; 0x10]) -> Ticket {
        Ticket {
            sig_type: 0x10004,
            signature: [0u8; 0x100],
            _sig_padding: [0u8; 0x3C],
            issuer: [0u8; 0x40],
            titlekey_block: [0u8; 0x100],
            format_version: 2,
            titlekey_type,
            ticket_version: 0,
            license_type: 0,
            key_revision: 0,
            property_mask: 0,
            _reserved: [0u8; 8],
            ticket_id: 0xAAAA_BBBB,
            device_id: 0xCCCC_DDDD,
            rights_id,
            account_id: 0x1234,
            sect_total_size: 0,
            sect_hdr_offset: 0,
            sect_hdr_count: 0,
            sect_hdr_entry_size: 0,
        }
    }

    #[test]
    fn ticket_roundtrips_through_bytes() {
        let ticket = sample_ticket(TitlekeyType::Common, [7u8; 0x10]);
        let bytes = ticket.to_bytes().unwrap();
        assert_eq!(bytes.len(), Ticket::SIZE as usize);
        let parsed = Ticket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.rights_id(), RightsId([7u8; 0x10]));
        assert_eq!(parsed.titlekey_type, TitlekeyType::Common);
    }

    #[test]
    fn scrub_personalization_zeroes_identifiers_and_normalizes_issuer() {
        let mut ticket = sample_ticket(TitlekeyType::Personalized, [1u8; 0x10]);
        ticket.titlekey_block = [0x55; 0x100];
        let common_key = [0xABu8; 0x10];

        ticket.scrub_personalization(&common_key);

        assert_eq!(ticket.device_id, 0);
        assert_eq!(ticket.account_id, 0);
        assert_eq!(ticket.ticket_id, 0);
        assert_eq!(ticket.issuer_str(), Ticket::ISSUER_NORMALIZED);
        assert_eq!(&ticket.titlekey_block[..0x10], &common_key);
        assert_eq!(ticket.titlekey_type, TitlekeyType::Common);

        let mut hasher = Sha256::new();
        hasher.update(&ticket.titlekey_block[0x10..]);
        let digest: [u8; 0x20] = hasher.finalize().into();
        assert_eq!(digest, titlekey_block_empty_hash());
    }

    #[test]
    fn scrub_personalization_is_idempotent() {
        let mut ticket = sample_ticket(TitlekeyType::Personalized, [1u8; 0x10]);
        let common_key = [0x11u8; 0x10];
        ticket.scrub_personalization(&common_key);
        let once = ticket.to_bytes().unwrap();
        ticket.scrub_personalization(&common_key);
        let twice = ticket.to_bytes().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn catalog_resolves_by_rights_id() {
        let ticket = sample_ticket(TitlekeyType::Common, [9u8; 0x10]);
        let bytes = ticket.to_bytes().unwrap();
        let mut catalog = TicketCatalog::new();
        catalog.insert(bytes, vec![1, 2, 3]).unwrap();

        let resolved =
            resolve_ticket::<Cursor<Vec<u8>>>(RightsId([9u8; 0x10]), None, &catalog).unwrap();
        assert_eq!(resolved.ticket.rights_id(), RightsId([9u8; 0x10]));
        assert_eq!(resolved.cert_bytes, vec![1, 2, 3]);
    }

    #[test]
    fn catalog_miss_is_ticket_not_found() {
        let catalog = TicketCatalog::new();
        let err =
            resolve_ticket::<Cursor<Vec<u8>>>(RightsId([0xFFu8; 0x10]), None, &catalog).unwrap_err();
        assert!(matches!(err, Error::TicketNotFound(_)));
    }
}
