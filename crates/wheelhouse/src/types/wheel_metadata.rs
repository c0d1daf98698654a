use std::collections::HashMap;
use std::str::FromStr;

use pep440_rs::Version;
use thiserror::Error;

use super::entry_points::{EntryPoints, ParseEntryPointsError};
use super::rfc822ish::{RFC822ish, RFC822ishError};
use super::{NormalizedPackageName, PackageName, ParsePackageNameError, WheelFilename};

/// Everything the conversion needs to know about a wheel, parsed from the
/// `METADATA` and `WHEEL` files (plus `entry_points.txt`) found under its
/// `.dist-info/` directory. The wheel filename serves as a fallback for the
/// name and version only.
#[derive(Debug, Clone)]
pub struct WheelMetadata {
    /// Package name as found in METADATA (canonical form available through
    /// [`WheelMetadata::conda_name`]).
    pub name: PackageName,
    /// Package version.
    pub version: Version,
    /// The `Summary` header.
    pub summary: Option<String>,
    /// The long description (message body of METADATA).
    pub description: Option<String>,
    /// The `License` header.
    pub license: Option<String>,
    /// The raw `Requires-Python` specifier, verbatim.
    pub requires_python: Option<String>,
    /// Raw `Requires-Dist` strings, in declaration order. Kept unparsed here;
    /// translation happens during conversion and the originals are retained
    /// for audit.
    pub requirements: Vec<String>,

    /// The `Home-page` header, or the `homepage` project URL.
    pub home_url: Option<String>,
    /// The `documentation` project URL.
    pub doc_url: Option<String>,
    /// The `repository` project URL.
    pub dev_url: Option<String>,
    /// The `source` project URL.
    pub source_url: Option<String>,

    /// Script entry points.
    pub entry_points: EntryPoints,

    /// Interpreter tag from the first `Tag:` line of WHEEL, e.g. `py3`.
    pub python_tag: String,
    /// ABI tag from the first `Tag:` line of WHEEL, e.g. `none`.
    pub abi_tag: String,
    /// Platform tag from the first `Tag:` line of WHEEL, e.g. `any`.
    pub platform_tag: String,
}

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum WheelMetadataError {
    #[error("failed to parse METADATA: {0}")]
    Metadata(#[source] RFC822ishError),

    #[error("failed to parse WHEEL: {0}")]
    WheelFile(#[source] RFC822ishError),

    #[error(transparent)]
    EntryPoints(#[from] ParseEntryPointsError),

    #[error("invalid package name: {0}")]
    InvalidName(#[from] ParsePackageNameError),

    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error("METADATA has no Name and the wheel filename is unusable")]
    MissingName,

    #[error("METADATA has no Version and the wheel filename is unusable")]
    MissingVersion,

    #[error("WHEEL file has no Tag entry")]
    MissingTag,

    #[error("malformed tag '{0}' in WHEEL file")]
    MalformedTag(String),
}

impl WheelMetadata {
    /// Parses the buffered metadata files of a wheel. `filename` supplies the
    /// name and version when the METADATA headers omit them; it may be absent
    /// when the wheel arrived under an unparsable display name.
    pub fn parse(
        metadata_content: &[u8],
        wheel_content: &[u8],
        entry_points_content: Option<&[u8]>,
        filename: Option<&WheelFilename>,
    ) -> Result<Self, WheelMetadataError> {
        let metadata = String::from_utf8_lossy(metadata_content);
        let mut metadata =
            RFC822ish::from_str(&metadata).map_err(WheelMetadataError::Metadata)?;

        let name = match metadata.take_all("Name").into_iter().next() {
            Some(name) => name.trim().parse()?,
            None => filename
                .map(|f| f.distribution.clone())
                .ok_or(WheelMetadataError::MissingName)?,
        };
        let version = match metadata.take_all("Version").into_iter().next() {
            Some(version) => version
                .trim()
                .parse()
                .map_err(WheelMetadataError::InvalidVersion)?,
            None => filename
                .map(|f| f.version.clone())
                .ok_or(WheelMetadataError::MissingVersion)?,
        };

        let project_urls = parse_project_urls(metadata.take_all("Project-URL"));
        let home_url = metadata
            .take_all("Home-page")
            .into_iter()
            .next()
            .or_else(|| project_urls.get("homepage").cloned());

        let description = metadata
            .body
            .take()
            .filter(|body| !body.trim().is_empty())
            .or_else(|| metadata.take_all("Description").into_iter().next());

        let (python_tag, abi_tag, platform_tag) = parse_first_tag(wheel_content)?;

        let entry_points = match entry_points_content {
            Some(content) => EntryPoints::parse(content)?,
            None => EntryPoints::default(),
        };

        Ok(WheelMetadata {
            name,
            version,
            summary: non_empty(metadata.take_all("Summary").into_iter().next()),
            description,
            license: non_empty(metadata.take_all("License").into_iter().next()),
            requires_python: non_empty(metadata.take_all("Requires-Python").into_iter().next()),
            requirements: metadata.take_all("Requires-Dist"),
            home_url: non_empty(home_url),
            doc_url: project_urls.get("documentation").cloned(),
            dev_url: project_urls.get("repository").cloned(),
            source_url: project_urls.get("source").cloned(),
            entry_points,
            python_tag,
            abi_tag,
            platform_tag,
        })
    }

    /// The canonical name used for the produced conda package.
    pub fn conda_name(&self) -> NormalizedPackageName {
        self.name.clone().into()
    }

    /// A wheel is pure iff it carries no ABI and no platform restriction.
    pub fn is_pure(&self) -> bool {
        self.platform_tag == "any" && self.abi_tag == "none"
    }

    /// The channel subdirectory the produced package belongs in, derived from
    /// the platform tag.
    pub fn conda_subdir(&self) -> &'static str {
        if self.is_pure() {
            return "noarch";
        }

        let platform = self.platform_tag.to_lowercase();
        let has = |token: &str| platform.contains(token);
        if has("win_amd64") || has("win64") {
            "win-64"
        } else if has("win32") {
            "win-32"
        } else if has("linux_x86_64") || (has("manylinux") && has("x86_64")) {
            "linux-64"
        } else if has("linux_aarch64") || (has("manylinux") && has("aarch64")) {
            "linux-aarch64"
        } else if has("macosx") && has("x86_64") {
            "osx-64"
        } else if has("macosx") && has("arm64") {
            "osx-arm64"
        } else {
            "noarch"
        }
    }
}

/// `Project-URL` entries are `Label, https://...`; the label is matched
/// case-insensitively.
fn parse_project_urls(entries: Vec<String>) -> HashMap<String, String> {
    entries
        .into_iter()
        .filter_map(|entry| {
            entry
                .split_once(", ")
                .map(|(label, url)| (label.to_lowercase(), url.to_owned()))
        })
        .collect()
}

/// Extracts `(interpreter, abi, platform)` from the first `Tag:` line of the
/// WHEEL file. Wheels with multiple compatible tags list one per line; the
/// first fixes the classification.
fn parse_first_tag(wheel_content: &[u8]) -> Result<(String, String, String), WheelMetadataError> {
    let wheel = String::from_utf8_lossy(wheel_content);
    let mut wheel = RFC822ish::from_str(&wheel).map_err(WheelMetadataError::WheelFile)?;

    let tag = wheel
        .take_all("Tag")
        .into_iter()
        .next()
        .ok_or(WheelMetadataError::MissingTag)?;

    let mut parts = tag.trim().splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(py), Some(abi), Some(plat)) => {
            Ok((py.to_owned(), abi.to_owned(), plat.to_owned()))
        }
        _ => Err(WheelMetadataError::MalformedTag(tag)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
