//! The wheel→conda conversion engine.
//!
//! A wheel and a conda package are both zipped archives, but with different
//! layouts, metadata and compression. The engine re-shapes one into the other
//! in a single pass over the wheel bytes: every entry is copied into the
//! streaming pkg archive (hashing as it goes), the three small metadata files
//! are buffered on the side, and once the stream ends the metadata is parsed,
//! dependencies are translated, and the `.conda` container is assembled. The
//! full wheel is never held in memory.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use indexmap::IndexMap;
use miette::Diagnostic;
use pep508_rs::{Requirement, VersionOrUrl};
use serde::Serialize;
use thiserror::Error;

use crate::archive::{
    write_conda_container, FileMetadata, StreamingTarZstWriter, ZipStreamError, ZipStreamReader,
};
use crate::markers::{extract_extra, marker_to_condition, Condition, MarkerError};
use crate::types::{NormalizedPackageName, WheelFilename, WheelMetadata, WheelMetadataError};

/// The input of a conversion: either a wheel on disk or a raw byte stream
/// (e.g. an HTTP body). For a stream the original wheel filename must be
/// supplied separately; it is only used for display and as a fallback when
/// METADATA omits the name or version.
pub enum WheelSource {
    /// A `.whl` file on the local filesystem.
    Path(PathBuf),
    /// An arbitrary byte stream plus the wheel's filename.
    Stream {
        /// The wheel bytes.
        reader: Box<dyn Read + Send>,
        /// The wheel's filename, for display and fallback parsing.
        filename: String,
    },
}

/// Where the produced `.conda` file should land.
#[derive(Debug, Clone)]
pub enum OutputLocation {
    /// Write directly into this directory.
    Directory(PathBuf),
    /// Write into `<root>/<subdir>/`, where the subdir is derived from the
    /// wheel's platform tag.
    Channel(PathBuf),
}

/// The outcome of a successful conversion.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    /// Path of the produced `.conda` file.
    pub path: PathBuf,
    /// Canonical package name.
    pub name: NormalizedPackageName,
    /// Package version.
    pub version: String,
    /// Translated runtime dependencies (`depends` in `index.json`).
    pub dependencies: Vec<String>,
    /// Translated optional dependencies, per extra.
    pub extra_depends: IndexMap<String, Vec<String>>,
    /// Entry points, console scripts first.
    pub entry_points: Vec<String>,
    /// The channel subdirectory the package belongs in.
    pub subdir: String,
    /// The raw `Requires-Dist` strings, verbatim, for audit.
    pub original_requirements: Vec<String>,
}

/// Errors surfaced by the conversion engine.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ConvertError {
    #[error("no .dist-info directory found in wheel")]
    MissingDistInfo,

    #[error("missing required METADATA or WHEEL file")]
    MissingMetadataFiles,

    #[error("failed to read wheel archive: {0}")]
    Archive(#[from] ZipStreamError),

    #[error(transparent)]
    Metadata(#[from] WheelMetadataError),

    #[error("invalid requirement '{requirement}': {message}")]
    InvalidRequirement { requirement: String, message: String },

    #[error("cannot convert dependency '{requirement}': {source}")]
    Marker {
        requirement: String,
        source: MarkerError,
    },

    #[error("failed to write package archive: {0}")]
    ArchiveWrite(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Converts a wheel into a `.conda` package.
///
/// This is a blocking, CPU-bound operation (zstd compression and SHA-256
/// hashing); callers on an async runtime should run it on a blocking worker.
pub fn convert_wheel(
    source: WheelSource,
    output: &OutputLocation,
) -> Result<ConversionResult, ConvertError> {
    let (reader, wheel_filename): (Box<dyn Read + Send>, String) = match source {
        WheelSource::Path(path) => {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (Box::new(fs_err::File::open(&path)?), filename)
        }
        WheelSource::Stream { reader, filename } => (reader, filename),
    };
    let filename_fallback: Option<WheelFilename> = wheel_filename.parse().ok();

    // The pkg archive is written to a scratch file; it can be as large as the
    // wheel itself and is transferred verbatim into the container at the end.
    let pkg_scratch = tempfile::NamedTempFile::new()?;
    let mut pkg_writer = StreamingTarZstWriter::new(pkg_scratch.reopen()?)
        .map_err(ConvertError::ArchiveWrite)?;

    let mut buffered_metadata: HashMap<String, Vec<u8>> = HashMap::new();
    let mut dist_info_prefix: Option<String> = None;

    let mut wheel_zip = ZipStreamReader::new(reader);
    while let Some(mut entry) = wheel_zip.next_entry()? {
        if entry.is_dir() {
            continue;
        }
        let file_name = entry.name().to_owned();

        // The first entry under a .dist-info directory fixes the prefix for
        // the rest of the conversion.
        if dist_info_prefix.is_none() {
            if let Some((prefix, _)) = file_name.split_once(".dist-info/") {
                if !prefix.contains('/') {
                    dist_info_prefix = Some(format!("{prefix}.dist-info"));
                }
            }
        }

        // The wheel's own INSTALLER is replaced with ours; the bytes still
        // have to be drained to keep the stream aligned.
        if file_name.ends_with("/INSTALLER") {
            std::io::copy(&mut entry, &mut std::io::sink())?;
            continue;
        }

        let dest_path = format!("site-packages/{file_name}");
        let is_metadata_file = dist_info_prefix.as_deref().is_some_and(|prefix| {
            file_name == format!("{prefix}/METADATA")
                || file_name == format!("{prefix}/WHEEL")
                || file_name == format!("{prefix}/entry_points.txt")
        });

        if is_metadata_file {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            pkg_writer
                .add_file(&dest_path, &content)
                .map_err(ConvertError::ArchiveWrite)?;
            buffered_metadata.insert(file_name, content);
        } else if let Some(size) = entry.declared_size() {
            pkg_writer
                .add_stream(&dest_path, &mut entry, size)
                .map_err(ConvertError::ArchiveWrite)?;
        } else {
            // No size in the local header (data descriptor); buffer to learn
            // the length before the tar header is written.
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            pkg_writer
                .add_file(&dest_path, &content)
                .map_err(ConvertError::ArchiveWrite)?;
        }
    }

    let dist_info_prefix = dist_info_prefix.ok_or(ConvertError::MissingDistInfo)?;

    pkg_writer
        .add_file(
            &format!("site-packages/{dist_info_prefix}/INSTALLER"),
            b"conda\n",
        )
        .map_err(ConvertError::ArchiveWrite)?;

    let (_, file_metadata) = pkg_writer.finish().map_err(ConvertError::ArchiveWrite)?;

    let metadata_content = buffered_metadata.remove(&format!("{dist_info_prefix}/METADATA"));
    let wheel_content = buffered_metadata.remove(&format!("{dist_info_prefix}/WHEEL"));
    let entry_points_content =
        buffered_metadata.remove(&format!("{dist_info_prefix}/entry_points.txt"));
    let (Some(metadata_content), Some(wheel_content)) = (metadata_content, wheel_content) else {
        return Err(ConvertError::MissingMetadataFiles);
    };

    let metadata = WheelMetadata::parse(
        &metadata_content,
        &wheel_content,
        entry_points_content.as_deref(),
        filename_fallback.as_ref(),
    )?;

    let (dependencies, extra_depends) =
        convert_dependencies(&metadata.requirements, metadata.requires_python.as_deref())?;

    let info_archive = build_info_archive(&metadata, &dependencies, &extra_depends, &file_metadata)
        .map_err(ConvertError::ArchiveWrite)?;

    let name = metadata.conda_name();
    let version = metadata.version.to_string();
    let subdir = metadata.conda_subdir().to_owned();
    let stem = format!("{name}-{version}-py_0");

    let output_dir = match output {
        OutputLocation::Directory(dir) => dir.clone(),
        OutputLocation::Channel(root) => root.join(&subdir),
    };
    fs_err::create_dir_all(&output_dir)?;
    let conda_path = output_dir.join(format!("{stem}.conda"));

    let container = fs_err::File::create(&conda_path)?;
    write_conda_container(container, &stem, &info_archive, pkg_scratch.reopen()?)
        .map_err(ConvertError::ArchiveWrite)?;

    Ok(ConversionResult {
        path: conda_path,
        name,
        version,
        dependencies,
        extra_depends,
        entry_points: metadata.entry_points.all(),
        subdir,
        original_requirements: metadata.requirements.clone(),
    })
}

/// Translates raw `Requires-Dist` strings into conda dependency strings,
/// routing extra-conditional requirements into the per-extra map. The
/// `python` dependency is always first.
pub fn convert_dependencies(
    requirements: &[String],
    requires_python: Option<&str>,
) -> Result<(Vec<String>, IndexMap<String, Vec<String>>), ConvertError> {
    let mut depends = vec![match requires_python {
        Some(specifier) => format!("python {}", specifier.replace(' ', "")),
        None => String::from("python"),
    }];
    let mut extras: IndexMap<String, Vec<String>> = IndexMap::new();

    for requirement_str in requirements {
        let requirement: Requirement =
            requirement_str
                .parse()
                .map_err(|err: pep508_rs::Pep508Error| ConvertError::InvalidRequirement {
                    requirement: requirement_str.clone(),
                    message: err.to_string(),
                })?;

        let Some(marker) = &requirement.marker else {
            depends.push(requirement_to_conda_dep(&requirement, None));
            continue;
        };

        if let Some((extra_name, rest)) = extract_extra(marker) {
            let condition = match rest {
                Some(rest_tree) => {
                    match marker_to_condition(&rest_tree)
                        .map_err(|source| marker_error(requirement_str, source))?
                    {
                        Condition::DropDep => continue,
                        Condition::IncludeAlways => None,
                        Condition::Selector(selector) => Some(selector),
                    }
                }
                None => None,
            };
            extras
                .entry(extra_name)
                .or_default()
                .push(requirement_to_conda_dep(&requirement, condition.as_deref()));
            continue;
        }

        match marker_to_condition(marker).map_err(|source| marker_error(requirement_str, source))? {
            Condition::DropDep => continue,
            Condition::IncludeAlways => depends.push(requirement_to_conda_dep(&requirement, None)),
            Condition::Selector(selector) => {
                depends.push(requirement_to_conda_dep(&requirement, Some(&selector)))
            }
        }
    }

    Ok((depends, extras))
}

fn marker_error(requirement: &str, source: MarkerError) -> ConvertError {
    ConvertError::Marker {
        requirement: requirement.to_owned(),
        source,
    }
}

/// Renders one requirement as a conda dependency string:
/// `name[extras=[a,b]] <specifiers>; if <condition>`.
fn requirement_to_conda_dep(requirement: &Requirement, condition: Option<&str>) -> String {
    let mut dep = requirement.name.to_lowercase().replace('_', "-");

    if let Some(extras) = &requirement.extras {
        if !extras.is_empty() {
            let mut extras = extras.clone();
            extras.sort();
            dep = format!("{dep}[extras=[{}]]", extras.join(","));
        }
    }

    if let Some(VersionOrUrl::VersionSpecifier(specifiers)) = &requirement.version_or_url {
        if !specifiers.is_empty() {
            let rendered = specifiers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            dep = format!("{dep} {rendered}");
        }
    }

    if let Some(condition) = condition {
        dep = format!("{dep}; if {condition}");
    }

    dep
}

#[derive(Serialize)]
struct IndexJson<'a> {
    name: &'a str,
    version: &'a str,
    build: &'a str,
    build_number: u32,
    depends: &'a [String],
    subdir: &'a str,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    extra_depends: &'a IndexMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    license: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    noarch: Option<&'a str>,
}

#[derive(Serialize)]
struct PathsJson<'a> {
    paths: Vec<PathsEntry<'a>>,
    paths_version: u32,
}

#[derive(Serialize)]
struct PathsEntry<'a> {
    _path: &'a str,
    path_type: &'a str,
    sha256: &'a str,
    size_in_bytes: u64,
}

#[derive(Serialize)]
struct AboutJson<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    home: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    doc_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_url: Option<&'a str>,
}

#[derive(Serialize)]
struct LinkJson {
    noarch: NoarchLink,
    package_metadata_version: u32,
}

#[derive(Serialize)]
struct NoarchLink {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    entry_points: Vec<String>,
}

/// Builds the in-memory `info-*.tar.zst` archive from the parsed metadata
/// and the file records collected while writing the pkg archive.
fn build_info_archive(
    metadata: &WheelMetadata,
    dependencies: &[String],
    extra_depends: &IndexMap<String, Vec<String>>,
    files: &[FileMetadata],
) -> std::io::Result<Vec<u8>> {
    let name = metadata.conda_name();
    let version = metadata.version.to_string();
    let mut info = StreamingTarZstWriter::new(Vec::new())?;

    let index_json = IndexJson {
        name: name.as_str(),
        version: version.as_str(),
        build: "py_0",
        build_number: 0,
        depends: dependencies,
        subdir: metadata.conda_subdir(),
        extra_depends,
        license: metadata.license.as_deref(),
        noarch: metadata.is_pure().then_some("python"),
    };
    info.add_file("info/index.json", &serde_json::to_vec_pretty(&index_json)?)?;

    let paths_json = PathsJson {
        paths: files
            .iter()
            .map(|file| PathsEntry {
                _path: &file.path,
                path_type: "hardlink",
                sha256: &file.sha256,
                size_in_bytes: file.size,
            })
            .collect(),
        paths_version: 1,
    };
    info.add_file("info/paths.json", &serde_json::to_vec_pretty(&paths_json)?)?;

    let files_list = files
        .iter()
        .map(|file| file.path.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    info.add_file("info/files", files_list.as_bytes())?;

    let about_json = AboutJson {
        summary: metadata.summary.as_deref(),
        description: metadata.description.as_deref(),
        home: metadata.home_url.as_deref(),
        doc_url: metadata.doc_url.as_deref(),
        dev_url: metadata.dev_url.as_deref(),
        source_url: metadata.source_url.as_deref(),
    };
    info.add_file("info/about.json", &serde_json::to_vec_pretty(&about_json)?)?;

    if metadata.is_pure() {
        let link_json = LinkJson {
            noarch: NoarchLink {
                kind: "python",
                entry_points: metadata.entry_points.all(),
            },
            package_metadata_version: 1,
        };
        info.add_file("info/link.json", &serde_json::to_vec_pretty(&link_json)?)?;
    }

    let (bytes, _) = info.finish()?;
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    fn convert(requirements: &[&str]) -> (Vec<String>, IndexMap<String, Vec<String>>) {
        let requirements: Vec<String> = requirements.iter().map(|s| s.to_string()).collect();
        convert_dependencies(&requirements, Some(">=3.10")).unwrap()
    }

    #[test]
    fn test_python_dependency_is_first() {
        let (depends, _) = convert(&["requests>=2.0"]);
        assert_eq!(depends, vec!["python >=3.10", "requests >=2.0"]);
    }

    #[test]
    fn test_bare_python_without_requires_python() {
        let (depends, _) = convert_dependencies(&[], None).unwrap();
        assert_eq!(depends, vec!["python"]);
    }

    #[test]
    fn test_requires_python_whitespace_is_stripped() {
        let (depends, _) = convert_dependencies(&[], Some(">= 3.8, < 4")).unwrap();
        assert_eq!(depends, vec!["python >=3.8,<4"]);
    }

    #[test]
    fn test_name_normalization() {
        let (depends, _) = convert(&["Typing_Extensions>=4.0"]);
        assert_eq!(depends[1], "typing-extensions >=4.0");
    }

    #[test]
    fn test_extras_rendering() {
        let (depends, _) = convert(&["httpx[socks,http2]>=0.24"]);
        assert_eq!(depends[1], "httpx[extras=[http2,socks]] >=0.24");
    }

    #[test]
    fn test_marker_becomes_condition() {
        let (depends, _) = convert(&["typing-extensions; python_version < '3.11'"]);
        assert_eq!(depends[1], "typing-extensions; if python <3.11");
    }

    #[test]
    fn test_platform_version_fusion() {
        let (depends, _) =
            convert(&["foo; sys_platform == 'win32' and platform_version >= '10.0'"]);
        assert_eq!(depends[1], "foo; if __win >=10.0");
    }

    #[test]
    fn test_extras_are_routed_out_of_depends() {
        let (depends, extras) = convert(&[
            "requests>=2.0",
            "pytest; extra == 'test'",
            "black; extra == 'dev'",
            "isort; extra == 'dev'",
        ]);
        assert_eq!(depends, vec!["python >=3.10", "requests >=2.0"]);
        assert_eq!(extras["test"], vec!["pytest"]);
        assert_eq!(extras["dev"], vec!["black", "isort"]);
    }

    #[test]
    fn test_extra_with_condition() {
        let (_, extras) = convert(&["pywin32; extra == 'dev' and sys_platform == 'win32'"]);
        assert_eq!(extras["dev"], vec!["pywin32; if __win"]);
    }

    #[test]
    fn test_cpython_marker_is_erased() {
        let (depends, _) = convert(&["cffi; implementation_name == 'cpython'"]);
        assert_eq!(depends[1], "cffi");
    }

    #[test]
    fn test_non_cpython_dependency_is_dropped() {
        let (depends, _) = convert(&["cffi; platform_python_implementation != 'CPython'"]);
        assert_eq!(depends, vec!["python >=3.10"]);
    }

    #[test]
    fn test_unsupported_marker_is_an_error() {
        let requirements = vec![String::from("x; platform_machine == 'x86_64'")];
        let err = convert_dependencies(&requirements, None).unwrap_err();
        assert!(err.to_string().contains("platform_machine"));
    }

    #[test]
    fn test_condition_applies_after_specifier() {
        let (depends, _) = convert(&["pywin32>=300; sys_platform == 'win32'"]);
        assert_eq!(depends[1], "pywin32 >=300; if __win");
    }
}
