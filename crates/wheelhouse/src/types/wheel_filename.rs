use std::fmt::{Display, Formatter};
use std::str::FromStr;

use pep440_rs::Version;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use super::{PackageName, ParsePackageNameError};

/// The components of a wheel filename:
/// `{distribution}-{version}(-{build})?-{python tags}-{abi tags}-{platform tags}.whl`.
///
/// See [PEP 427](https://www.python.org/dev/peps/pep-0427/#file-name-convention).
/// The filename is only a fallback source of truth; the authoritative name,
/// version and tags come from the `METADATA` and `WHEEL` files inside the
/// archive.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct WheelFilename {
    /// Distribution name, e.g. `requests`.
    pub distribution: PackageName,

    /// Distribution version, e.g. `2.31.0`.
    pub version: Version,

    /// Optional build tag, kept verbatim.
    pub build_tag: Option<String>,

    /// Language implementation tags, e.g. `py3` or `py2.py3`.
    pub py_tags: Vec<String>,

    /// ABI tags, e.g. `none` or `cp311`.
    pub abi_tags: Vec<String>,

    /// Platform tags, e.g. `any` or `manylinux_2_17_x86_64`.
    pub arch_tags: Vec<String>,
}

#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ParseWheelFilenameError {
    #[error("'{0}' is not a wheel filename (missing .whl extension)")]
    NotAWheel(String),

    #[error("wheel filename '{0}' does not have the expected number of segments")]
    WrongNumberOfSegments(String),

    #[error("invalid distribution name in wheel filename: {0}")]
    InvalidName(#[from] ParsePackageNameError),

    #[error("invalid version in wheel filename: {0}")]
    InvalidVersion(String),
}

impl FromStr for WheelFilename {
    type Err = ParseWheelFilenameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stem = s
            .strip_suffix(".whl")
            .ok_or_else(|| ParseWheelFilenameError::NotAWheel(s.to_owned()))?;

        let segments: Vec<&str> = stem.split('-').collect();
        let (distribution, version, build_tag, tag_start) = match segments.len() {
            5 => (segments[0], segments[1], None, 2),
            6 => (segments[0], segments[1], Some(segments[2].to_owned()), 3),
            _ => {
                return Err(ParseWheelFilenameError::WrongNumberOfSegments(
                    s.to_owned(),
                ))
            }
        };
        let tags = &segments[tag_start..];

        Ok(WheelFilename {
            distribution: distribution.parse()?,
            version: version
                .parse()
                .map_err(ParseWheelFilenameError::InvalidVersion)?,
            build_tag,
            py_tags: tags[0].split('.').map(str::to_owned).collect(),
            abi_tags: tags[1].split('.').map(str::to_owned).collect(),
            arch_tags: tags[2].split('.').map(str::to_owned).collect(),
        })
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{dist}-{ver}{build}-{py}-{abi}-{arch}.whl",
            dist = self.distribution.as_given(),
            ver = self.version,
            build = self
                .build_tag
                .as_deref()
                .map_or_else(String::new, |tag| format!("-{tag}")),
            py = self.py_tags.join("."),
            abi = self.abi_tags.join("."),
            arch = self.arch_tags.join("."),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_pure_wheel() {
        let name: WheelFilename = "sample_package-2.0.0-py3-none-any.whl".parse().unwrap();
        assert_eq!(name.distribution.as_str(), "sample-package");
        assert_eq!(name.version.to_string(), "2.0.0");
        assert_eq!(name.build_tag, None);
        assert_eq!(name.py_tags, vec!["py3"]);
        assert_eq!(name.abi_tags, vec!["none"]);
        assert_eq!(name.arch_tags, vec!["any"]);
    }

    #[test]
    fn test_parse_platform_wheel_with_build_tag() {
        let name: WheelFilename = "cryptography-41.0.0-1-cp311-abi3-manylinux_2_17_x86_64.whl"
            .parse()
            .unwrap();
        assert_eq!(name.build_tag.as_deref(), Some("1"));
        assert_eq!(name.abi_tags, vec!["abi3"]);
        assert_eq!(name.arch_tags, vec!["manylinux_2_17_x86_64"]);
    }

    #[test]
    fn test_parse_compound_tags() {
        let name: WheelFilename = "six-1.16.0-py2.py3-none-any.whl".parse().unwrap();
        assert_eq!(name.py_tags, vec!["py2", "py3"]);
    }

    #[test]
    fn test_roundtrip_display() {
        let raw = "sample_package-2.0.0-py3-none-any.whl";
        let parsed: WheelFilename = raw.parse().unwrap();
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn test_rejects_non_wheels() {
        assert!("sample-2.0.0.tar.gz".parse::<WheelFilename>().is_err());
        assert!("sample-2.0.0.whl".parse::<WheelFilename>().is_err());
    }
}
