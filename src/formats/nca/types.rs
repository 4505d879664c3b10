use binrw::prelude::*;

#[binrw]
#[brw(little)]
#[derive(Debug, Default)]
pub struct RSASignature {
    pub signature: [[u8; 0x20]; 8],
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The source of the content the NCA is for, either downloaded from
/// the CDN or from a game card (cartridge).
pub enum DistributionType {
    /// The content was downloaded from a CDN, such as the eShop.
    Download = 0x00,
    /// The content is from a game card (cartridge).
    GameCard = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The type of content stored in the NCA.
pub enum ContentType {
    /// Program content (executable code).
    Program = 0x00,
    /// Meta content (information about the title).
    Meta = 0x01,
    /// Control content (icon, screenshots, etc.).
    Control = 0x02,
    /// Manual content (digital manual/documentation).
    Manual = 0x03,
    /// Data content (general game data).
    Data = 0x04,
    /// Public data content.
    PublicData = 0x05,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Older key-generation field, superseded at 3.0.1 by [`KeyGeneration`] but
/// still present; the effective generation is the max of the two.
pub enum KeyGenerationOld {
    Gen1_0_0 = 0x00,
    /// Presumably planned for Horizon 2.0.0, never used.
    Unused = 0x01,
    Gen3_0_0 = 0x02,
}

/// Key generation byte (3.0.1+), superseding [`KeyGenerationOld`]. Not an
/// enum: new generations arrive with every major firmware revision, so only
/// the raw numeric value is modeled here.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyGeneration(pub u8);

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The encryption key index used for the key area in the NCA header.
pub enum KeyAreaEncryptionKeyIndex {
    Application = 0x00,
    Ocean = 0x01,
    System = 0x02,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, PartialEq, Eq)]
/// Filesystem type
pub enum FsType {
    RomFs = 0x00,
    PartitionFs = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, PartialEq, Eq, Default)]
/// Hash type used for filesystem verification
pub enum HashType {
    #[default]
    Auto = 0x00,
    None = 0x01,
    HierarchicalSha256Hash = 0x02,
    HierarchicalIntegrityHash = 0x03,
    /// [14.0.0+]
    AutoSha3 = 0x04,
    /// [14.0.0+]
    HierarchicalSha3256Hash = 0x05,
    /// [14.0.0+]
    HierarchicalIntegritySha3Hash = 0x06,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, PartialEq, Eq)]
/// Encryption type for NCA content
pub enum EncryptionType {
    Auto = 0x00,
    None = 0x01,
    AesXts = 0x02,
    AesCtr = 0x03,
    AesCtrEx = 0x04,
    /// [14.0.0+]
    AesCtrSkipLayerHash = 0x05,
    /// [14.0.0+]
    AesCtrExSkipLayerHash = 0x06,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, PartialEq, Eq)]
/// [14.0.0+] Hash type for metadata
pub enum MetaDataHashType {
    None = 0x00,
    HierarchicalIntegrity = 0x01,
}

/// One region of a hierarchical hash layer: offset and size, in bytes,
/// relative to the start of the filesystem section.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLayerRegion {
    pub offset: u64,
    pub size: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Eq)]
pub struct HierarchicalSha256HashData {
    pub master_hash: [u8; 0x20],
    pub hash_block_size: u32,
    pub layer_count: u32,
    #[br(count = 2)]
    pub layer_regions: Vec<HashLayerRegion>,
    #[br(count = 5)]
    pub _reserved: Vec<[u8; 0x20]>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Eq)]
pub struct HierarchicalIntegrityLevelInfo {
    pub logical_offset: u64,
    pub size: u64,
    pub block_size_log2: u32,
    pub _reserved: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Eq)]
pub struct InfoLevelHash {
    pub max_layers: u32,
    #[br(count = max_layers.saturating_sub(1))]
    pub levels: Vec<HierarchicalIntegrityLevelInfo>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Eq)]
pub struct HierarchicalIntegrityHashData {
    #[br(magic = b"IVFC")]
    pub version: u32,
    pub master_hash_size: u32,
    pub info_level_hash: InfoLevelHash,
    pub master_hash: [u8; 0x20],
}

/// The hash-tree metadata for one filesystem section, reconciled to a single
/// shape downstream offset-resolution code can read regardless of which
/// hash type the section actually uses.
#[derive(Debug, PartialEq, Eq)]
pub enum HashData {
    HierarchicalSha256(HierarchicalSha256HashData),
    HierarchicalIntegrity(HierarchicalIntegrityHashData),
}

impl HashData {
    fn read_from(hash_type: &HashType, raw: &[u8; 0xF8]) -> BinResult<Self> {
        let mut cursor = binrw::io::Cursor::new(&raw[..]);
        match hash_type {
            HashType::HierarchicalSha256Hash | HashType::HierarchicalSha3256Hash => {
                Ok(Self::HierarchicalSha256(cursor.read_le()?))
            }
            _ => Ok(Self::HierarchicalIntegrity(cursor.read_le()?)),
        }
    }

    /// Number of hash layers covering this section's data.
    pub fn get_layer_count(&self) -> u32 {
        match self {
            HashData::HierarchicalSha256(h) => h.layer_count,
            HashData::HierarchicalIntegrity(h) => h.info_level_hash.max_layers,
        }
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug)]
// The FsHeader for each section is at offset + 0x400 + (sectionid * 0x200),
// where sectionid corresponds to the index used with the entry/hash tables.
/// NCA filesystem header
pub struct FsHeader {
    pub version: u16,
    pub fs_type: FsType,
    pub hash_type: HashType,
    pub encryption_type: EncryptionType,
    pub metadata_hash_type: MetaDataHashType,
    pub _reserved: [u8; 0x2],
    #[br(parse_with = parse_hash_data, args(&hash_type))]
    #[bw(ignore)]
    pub hash_data: HashData,
    #[br(count = 0x40)]
    #[bw(ignore)]
    pub patch_info: Vec<u8>,
    pub ctr: u64,
    #[br(count = 0x30)]
    #[bw(ignore)]
    pub sparse_info: Vec<u8>,
    #[br(count = 0x28)]
    #[bw(ignore)]
    pub compression_info: Vec<u8>,
    #[br(count = 0x30)]
    #[bw(ignore)]
    pub metadata_hashdata_info: Vec<u8>,
    #[br(count = 0x30)]
    #[bw(ignore)]
    pub _reserved2: Vec<u8>,
}

#[binrw::parser(reader)]
fn parse_hash_data(hash_type: &HashType) -> BinResult<HashData> {
    let mut raw = [0u8; 0xF8];
    reader.read_exact(&mut raw)?;
    HashData::read_from(hash_type, &raw)
}
