//! The archive codec: streaming reads of ZIP entries, streaming writes of
//! tar-zstd archives with per-file SHA-256, and assembly of the outer
//! `.conda` container.

mod conda;
mod tar_zst;
mod zip_stream;

pub use conda::write_conda_container;
pub use tar_zst::{FileMetadata, StreamingTarZstWriter, DEFAULT_COMPRESSION_LEVEL};
pub use zip_stream::{ZipEntry, ZipStreamError, ZipStreamReader};
