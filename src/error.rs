use cipher::InvalidLength;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Unable to parse binary data: {0}")]
    BinaryParser(#[from] binrw::Error),
    #[error("Unable to parse string: {0}")]
    StringParser(#[from] core::str::Utf8Error),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Other error: {0}")]
    Other(String),
    #[error("Encryption error: {0}")]
    CryptoError(String),
    #[error("Key Lookup error: {0}")]
    KeyLookupError(String),
    #[error("Title key error: {0}")]
    TitleKeyError(#[from] crate::formats::keys::KeyError),

    // --- Domain error kinds named by the content-extraction engine ---
    /// A required key was absent from the loaded key set. Fatal for the
    /// current operation; there is no fallback to defaults.
    #[error("missing key: {0}")]
    KeyMissing(String),
    /// The NCA magic did not match "NCA2"/"NCA3". Fatal for that NCA.
    #[error("bad NCA magic")]
    BadMagic,
    /// NCA version recognized but not supported by this engine.
    #[error("unsupported NCA version: {0}")]
    UnsupportedVersion(u8),
    /// Section entry table is internally inconsistent (overlapping or
    /// out-of-order sections). Fatal for that NCA.
    #[error("bad section table: {0}")]
    BadSectionTable(String),
    /// A section's declared hash tree doesn't match its data. Reported but
    /// non-fatal: the dumper keeps reading.
    #[error("integrity mismatch at {0}")]
    IntegrityMismatch(String),
    /// No ticket could be found for a rights-id.
    #[error("ticket not found for rights id {0}")]
    TicketNotFound(String),
    /// A BKTR read fell into a virtual range with no mapping in either table.
    #[error("unmapped BKTR range at virtual offset {0:#x}")]
    BktrHole(u64),
    /// A BKTR read needed the base RomFS but none is available.
    #[error("base RomFS unavailable for BKTR read at virtual offset {0:#x}")]
    BaseUnavailable(u64),
    /// Backing store returned fewer bytes than requested with no error.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    /// The backing store reported a native error code.
    #[error("backend error: {0}")]
    Backend(String),
    /// A gamecard reader's backing media was removed mid-operation.
    #[error("media removed")]
    MediaRemoved,
    /// Output medium ran out of space.
    #[error("no space left on output medium")]
    NoSpace,
    /// The caller requested cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// A read crossed an NCA section boundary, which is never permitted.
    #[error("read crossed section boundary")]
    CrossSection,
    /// A sequential-dump checkpoint no longer matches the output on disk.
    #[error("checkpoint invalid: {0}")]
    CheckpointInvalid(String),
}

impl From<InvalidLength> for Error {
    fn from(_: InvalidLength) -> Self {
        Error::CryptoError("Invalid key length".to_string())
    }
}

impl From<std::io::Error> for Error {
    /// A plain `io::Error` becomes `Error::Io`, except one tagged with
    /// [`crate::io::CrossSectionMarker`] (raised by
    /// [`crate::io::BoundedSectionReader`] when a read would cross a
    /// section's declared end), which is recovered as `Error::CrossSection`.
    fn from(e: std::io::Error) -> Self {
        let is_cross_section = e
            .get_ref()
            .is_some_and(|inner| inner.is::<crate::io::CrossSectionMarker>());
        if is_cross_section {
            Error::CrossSection
        } else {
            Error::Io(e)
        }
    }
}
