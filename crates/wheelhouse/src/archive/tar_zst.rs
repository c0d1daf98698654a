use std::io::{Read, Write};

use data_encoding::HEXLOWER;
use rattler_digest::{HashingReader, Sha256};

/// Per-file record collected while writing: the archive path, the SHA-256 of
/// the file contents (lowercase hex), and the size in bytes. This is exactly
/// what a `paths.json` entry needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Path of the file within the archive.
    pub path: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    /// Size of the file in bytes.
    pub size: u64,
}

/// The default zstd compression level for package archives.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 19;

/// Writes a tar archive wrapped in a single streaming zstd frame, hashing
/// every file as it is copied in.
///
/// The output only needs to implement [`Write`]; nothing is ever seeked,
/// which is what allows the package archive to be produced in one pass while
/// the wheel is still being downloaded.
pub struct StreamingTarZstWriter<W: Write> {
    tar: tar::Builder<zstd::Encoder<'static, W>>,
    files: Vec<FileMetadata>,
}

impl<W: Write> StreamingTarZstWriter<W> {
    /// Creates a writer with the default compression level.
    pub fn new(output: W) -> std::io::Result<Self> {
        Self::with_compression_level(output, DEFAULT_COMPRESSION_LEVEL)
    }

    /// Creates a writer with an explicit zstd compression level.
    pub fn with_compression_level(output: W, level: i32) -> std::io::Result<Self> {
        let encoder = zstd::Encoder::new(output, level)?;
        Ok(Self {
            tar: tar::Builder::new(encoder),
            files: Vec::new(),
        })
    }

    /// Adds a file from an in-memory buffer.
    pub fn add_file(&mut self, path: &str, content: &[u8]) -> std::io::Result<FileMetadata> {
        let digest = rattler_digest::compute_bytes_digest::<Sha256>(content);
        self.tar
            .append_data(&mut file_header(content.len() as u64), path, content)?;

        let meta = FileMetadata {
            path: path.to_owned(),
            sha256: HEXLOWER.encode(&digest),
            size: content.len() as u64,
        };
        self.files.push(meta.clone());
        Ok(meta)
    }

    /// Adds a file by streaming `size` bytes from `reader`, computing the
    /// SHA-256 during the copy. The size must be known up front because the
    /// tar header precedes the data.
    pub fn add_stream(
        &mut self,
        path: &str,
        reader: impl Read,
        size: u64,
    ) -> std::io::Result<FileMetadata> {
        let mut hashing_reader = HashingReader::<_, Sha256>::new(reader);
        self.tar
            .append_data(&mut file_header(size), path, &mut hashing_reader)?;
        let (_, digest) = hashing_reader.finalize();

        let meta = FileMetadata {
            path: path.to_owned(),
            sha256: HEXLOWER.encode(&digest),
            size,
        };
        self.files.push(meta.clone());
        Ok(meta)
    }

    /// Metadata for every file added so far, in insertion order.
    pub fn file_metadata(&self) -> &[FileMetadata] {
        &self.files
    }

    /// Terminates the tar stream and the zstd frame, returning the underlying
    /// writer and the collected file metadata.
    pub fn finish(self) -> std::io::Result<(W, Vec<FileMetadata>)> {
        let encoder = self.tar.into_inner()?;
        let output = encoder.finish()?;
        Ok((output, self.files))
    }
}

/// Tar headers are fully normalized so the same input always produces the
/// same archive bytes.
fn file_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn unpack(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let decompressed = zstd::decode_all(bytes).unwrap();
        let mut archive = tar::Archive::new(Cursor::new(decompressed));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                (path, content)
            })
            .collect()
    }

    #[test]
    fn test_add_file_roundtrip() {
        let mut writer = StreamingTarZstWriter::new(Vec::new()).unwrap();
        writer.add_file("dir/a.txt", b"hello world").unwrap();
        writer.add_file("b.bin", &[0u8, 255, 1]).unwrap();
        let (bytes, files) = writer.finish().unwrap();

        let entries = unpack(&bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "dir/a.txt");
        assert_eq!(entries[0].1, b"hello world");
        assert_eq!(entries[1].1, vec![0u8, 255, 1]);

        assert_eq!(files[0].size, 11);
        // sha256 of "hello world"
        assert_eq!(
            files[0].sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_add_stream_hashes_during_copy() {
        let content = vec![42u8; 200_000];
        let mut writer = StreamingTarZstWriter::new(Vec::new()).unwrap();
        let meta = writer
            .add_stream("big.dat", Cursor::new(content.clone()), content.len() as u64)
            .unwrap();

        let expected = rattler_digest::compute_bytes_digest::<Sha256>(&content);
        assert_eq!(meta.sha256, HEXLOWER.encode(&expected));
        assert_eq!(meta.size, 200_000);

        let (bytes, _) = writer.finish().unwrap();
        let entries = unpack(&bytes);
        assert_eq!(entries[0].1.len(), 200_000);
    }

    #[test]
    fn test_headers_are_reproducible() {
        let build = || {
            let mut writer = StreamingTarZstWriter::new(Vec::new()).unwrap();
            writer.add_file("x", b"contents").unwrap();
            writer.finish().unwrap().0
        };
        assert_eq!(build(), build());
    }
}
