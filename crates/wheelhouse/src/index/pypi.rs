use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use indexmap::IndexMap;
use itertools::Itertools;
use miette::Diagnostic;
use pep440_rs::{Version, VersionSpecifiers};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::types::NormalizedPackageName;

/// The default release-manifest endpoint. A package's releases live at
/// `<base>/<name>/json`.
pub const DEFAULT_INDEX_URL: &str = "https://pypi.org/pypi/";

/// Small metadata requests (release manifests, PEP 658 metadata).
const INDEX_TIMEOUT: Duration = Duration::from_secs(30);
/// Full wheel bodies.
const WHEEL_TIMEOUT: Duration = Duration::from_secs(120);

/// One wheel file published for a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelInfo {
    /// The wheel filename.
    pub filename: String,
    /// Download URL.
    pub url: Url,
    /// The `requires_python` specifier published alongside the file.
    pub python_requires: Option<String>,
    /// Upstream SHA-256 of the file, lowercase hex (may be empty when the
    /// index did not publish one).
    pub sha256: String,
    /// File size in bytes.
    pub size: u64,
}

/// A published release of a package, wheels only.
#[derive(Debug, Clone)]
pub struct PyPiRelease {
    /// The release version.
    pub version: Version,
    /// Upload time of the first wheel file that carried one.
    pub upload_time: Option<DateTime<Utc>>,
    /// The wheel files of this release.
    pub wheels: Vec<WheelInfo>,
    /// True when any wheel file of the release is yanked.
    pub yanked: bool,
}

impl PyPiRelease {
    /// Selects the wheel to convert: a pure wheel when one exists, otherwise
    /// the first file listed.
    pub fn best_wheel(&self) -> Option<&WheelInfo> {
        self.wheels
            .iter()
            .find(|wheel| {
                wheel.filename.contains("py3-none-any")
                    || wheel.filename.contains("py2.py3-none-any")
            })
            .or_else(|| self.wheels.first())
    }
}

/// Errors from the upstream index.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum PyPiError {
    #[error("package '{0}' not found on the index")]
    NotFound(String),

    #[error("unexpected status {status} fetching {url}")]
    Status { status: StatusCode, url: Url },

    #[error(transparent)]
    Middleware(#[from] reqwest_middleware::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Client for the upstream package index.
///
/// The HTTP client is shared and pooled; an HTTP cache, when wanted, is
/// attached as a middleware on the [`ClientWithMiddleware`] — this type only
/// assumes conditional-GET-capable transport.
#[derive(Clone)]
pub struct PyPiClient {
    client: ClientWithMiddleware,
    index_url: Url,
}

impl PyPiClient {
    /// Creates a client against a custom index base URL.
    pub fn new(client: ClientWithMiddleware, index_url: Url) -> Self {
        Self { client, index_url }
    }

    /// Creates a client against the default upstream index.
    pub fn pypi(client: ClientWithMiddleware) -> Self {
        Self::new(
            client,
            Url::parse(DEFAULT_INDEX_URL).expect("the default index url is valid"),
        )
    }

    /// Fetches every release of a package, newest first. Releases without
    /// wheels are dropped; versions that do not parse are skipped with a
    /// warning.
    pub async fn get_package_releases(
        &self,
        package: &NormalizedPackageName,
    ) -> Result<Vec<PyPiRelease>, PyPiError> {
        let url = self.index_url.join(&format!("{package}/json"))?;
        let response = self
            .client
            .get(url.clone())
            .timeout(INDEX_TIMEOUT)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PyPiError::NotFound(package.to_string()));
        }
        if !response.status().is_success() {
            return Err(PyPiError::Status {
                status: response.status(),
                url,
            });
        }
        let body: ProjectResponse = response.json().await?;
        Ok(releases_from_response(package, body))
    }

    /// Fetches releases matching a version constraint, newest first. A `None`
    /// constraint means "any version".
    pub async fn get_matching_releases(
        &self,
        package: &NormalizedPackageName,
        constraint: Option<&VersionSpecifiers>,
        max_versions: Option<usize>,
        include_yanked: bool,
    ) -> Result<Vec<PyPiRelease>, PyPiError> {
        let releases = self.get_package_releases(package).await?;
        let mut matching = Vec::new();
        for release in releases {
            if release.yanked && !include_yanked {
                continue;
            }
            if let Some(constraint) = constraint {
                if !constraint.contains(&release.version) {
                    continue;
                }
            }
            matching.push(release);
            if max_versions.is_some_and(|max| matching.len() >= max) {
                break;
            }
        }
        Ok(matching)
    }

    /// Fetches the pre-published METADATA of a wheel (PEP 658/714: the index
    /// serves it at `<wheel_url>.metadata`). Returns `None` when the index
    /// has not published it.
    pub async fn fetch_wheel_metadata(
        &self,
        wheel_url: &Url,
    ) -> Result<Option<Vec<u8>>, PyPiError> {
        let metadata_url = Url::parse(&format!("{wheel_url}.metadata"))?;
        let response = self
            .client
            .get(metadata_url.clone())
            .timeout(INDEX_TIMEOUT)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PyPiError::Status {
                status: response.status(),
                url: metadata_url,
            });
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    /// Opens a streaming download of a wheel body.
    pub async fn stream_wheel(
        &self,
        url: Url,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, PyPiError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(WHEEL_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PyPiError::Status {
                status: response.status(),
                url,
            });
        }
        Ok(response.bytes_stream())
    }
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    #[serde(default)]
    releases: IndexMap<String, Vec<ReleaseFile>>,
}

#[derive(Debug, Deserialize)]
struct ReleaseFile {
    filename: String,
    url: Url,
    #[serde(default)]
    requires_python: Option<String>,
    #[serde(default)]
    digests: Digests,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    upload_time_iso_8601: Option<DateTime<Utc>>,
    #[serde(default)]
    yanked: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Digests {
    #[serde(default)]
    sha256: String,
}

fn releases_from_response(
    package: &NormalizedPackageName,
    response: ProjectResponse,
) -> Vec<PyPiRelease> {
    let mut invalid_versions = Vec::new();
    let mut releases: Vec<(Version, Vec<ReleaseFile>)> = Vec::new();
    for (version, files) in response.releases {
        match version.parse::<Version>() {
            Ok(parsed) => releases.push((parsed, files)),
            Err(_) => invalid_versions.push(version),
        }
    }
    if !invalid_versions.is_empty() {
        tracing::warn!(
            "skipping {} invalid version(s) for {}: {}",
            invalid_versions.len(),
            package,
            invalid_versions.iter().take(3).join(", ")
        );
    }
    releases.sort_by(|(a, _), (b, _)| b.cmp(a));

    releases
        .into_iter()
        .filter_map(|(version, files)| {
            let mut wheels = Vec::new();
            let mut upload_time = None;
            let mut yanked = false;
            for file in files {
                if !file.filename.ends_with(".whl") {
                    continue;
                }
                if upload_time.is_none() {
                    upload_time = file.upload_time_iso_8601;
                }
                yanked |= file.yanked;
                wheels.push(WheelInfo {
                    filename: file.filename,
                    url: file.url,
                    python_requires: file.requires_python,
                    sha256: file.digests.sha256,
                    size: file.size,
                });
            }
            if wheels.is_empty() {
                return None;
            }
            Some(PyPiRelease {
                version,
                upload_time,
                wheels,
                yanked,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    const RESPONSE: &str = r#"{
        "releases": {
            "2.0.0": [
                {
                    "filename": "sample_package-2.0.0-py3-none-any.whl",
                    "url": "https://files.example/sample_package-2.0.0-py3-none-any.whl",
                    "requires_python": ">=3.10",
                    "digests": {"sha256": "abc123"},
                    "size": 1234,
                    "upload_time_iso_8601": "2024-01-15T12:00:00.000000Z"
                },
                {
                    "filename": "sample_package-2.0.0.tar.gz",
                    "url": "https://files.example/sample_package-2.0.0.tar.gz"
                }
            ],
            "1.0.0": [
                {
                    "filename": "sample_package-1.0.0-py3-none-any.whl",
                    "url": "https://files.example/sample_package-1.0.0-py3-none-any.whl",
                    "yanked": true
                }
            ],
            "0.9.0": [
                {
                    "filename": "sample_package-0.9.0.tar.gz",
                    "url": "https://files.example/sample_package-0.9.0.tar.gz"
                }
            ],
            "not-a-version": [
                {
                    "filename": "sample_package-junk-py3-none-any.whl",
                    "url": "https://files.example/junk.whl"
                }
            ]
        }
    }"#;

    fn parsed_releases() -> Vec<PyPiRelease> {
        let response: ProjectResponse = serde_json::from_str(RESPONSE).unwrap();
        let name = NormalizedPackageName::from_str("sample-package").unwrap();
        releases_from_response(&name, response)
    }

    #[test]
    fn test_releases_are_sorted_and_filtered() {
        let releases = parsed_releases();
        // 0.9.0 has no wheels, not-a-version does not parse.
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].version.to_string(), "2.0.0");
        assert_eq!(releases[1].version.to_string(), "1.0.0");
    }

    #[test]
    fn test_non_wheel_files_are_ignored() {
        let releases = parsed_releases();
        assert_eq!(releases[0].wheels.len(), 1);
        assert_eq!(releases[0].wheels[0].sha256, "abc123");
        assert_eq!(releases[0].wheels[0].size, 1234);
        assert!(releases[0].upload_time.is_some());
    }

    #[test]
    fn test_yanked_propagates_from_files() {
        let releases = parsed_releases();
        assert!(!releases[0].yanked);
        assert!(releases[1].yanked);
    }

    #[test]
    fn test_best_wheel_prefers_pure() {
        let release = PyPiRelease {
            version: Version::from_str("1.0").unwrap(),
            upload_time: None,
            wheels: vec![
                WheelInfo {
                    filename: "pkg-1.0-cp311-cp311-manylinux_2_17_x86_64.whl".into(),
                    url: Url::parse("https://files.example/a.whl").unwrap(),
                    python_requires: None,
                    sha256: String::new(),
                    size: 0,
                },
                WheelInfo {
                    filename: "pkg-1.0-py3-none-any.whl".into(),
                    url: Url::parse("https://files.example/b.whl").unwrap(),
                    python_requires: None,
                    sha256: String::new(),
                    size: 0,
                },
            ],
            yanked: false,
        };
        assert_eq!(
            release.best_wheel().unwrap().filename,
            "pkg-1.0-py3-none-any.whl"
        );
    }

    #[test]
    fn test_best_wheel_falls_back_to_first() {
        let release = PyPiRelease {
            version: Version::from_str("1.0").unwrap(),
            upload_time: None,
            wheels: vec![WheelInfo {
                filename: "pkg-1.0-cp311-cp311-win_amd64.whl".into(),
                url: Url::parse("https://files.example/a.whl").unwrap(),
                python_requires: None,
                sha256: String::new(),
                size: 0,
            }],
            yanked: false,
        };
        assert_eq!(
            release.best_wheel().unwrap().filename,
            "pkg-1.0-cp311-cp311-win_amd64.whl"
        );
    }
}
