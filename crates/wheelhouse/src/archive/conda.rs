use std::io::{Read, Seek, Write};

use serde::Serialize;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// The outer manifest of a `.conda` file.
#[derive(Debug, Serialize)]
struct ContainerMetadata {
    conda_pkg_format_version: u32,
}

/// Assembles the outer `.conda` container: an uncompressed ZIP holding the
/// format manifest and the two inner tar-zstd archives.
///
/// Member order is fixed: `metadata.json`, `info-<stem>.tar.zst`,
/// `pkg-<stem>.tar.zst`. The inner archives are already compressed, which is
/// why the outer ZIP stores them as-is.
pub fn write_conda_container(
    output: impl Write + Seek,
    stem: &str,
    info_archive: &[u8],
    mut pkg_archive: impl Read,
) -> std::io::Result<()> {
    let mut outer = ZipWriter::new(output);
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    outer.start_file("metadata.json", options)?;
    let manifest = ContainerMetadata {
        conda_pkg_format_version: 2,
    };
    outer.write_all(serde_json::to_string(&manifest)?.as_bytes())?;

    outer.start_file(format!("info-{stem}.tar.zst"), options)?;
    outer.write_all(info_archive)?;

    // The pkg archive can be arbitrarily large; it is copied straight from
    // its scratch file.
    outer.start_file(format!("pkg-{stem}.tar.zst"), options.large_file(true))?;
    std::io::copy(&mut pkg_archive, &mut outer)?;

    outer.finish()?;
    Ok(())
}
