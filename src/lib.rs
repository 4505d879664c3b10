//! Content extraction engine for Nintendo Switch containers (NCA/XCI/NSP).
//!
//! Reads encrypted console content containers, decrypts them using an
//! externally-supplied key set, and re-serializes selected content as a raw
//! card image, an installable package, or extracted pseudo-filesystem trees.

pub mod block_reader;
pub mod builder;
pub mod cancel;
pub mod error;
pub mod formats;
pub mod io;
pub mod progress;
pub mod streamer;

pub use error::Error;
pub use io::ReadSeek;
