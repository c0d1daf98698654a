use std::time::Duration;

use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use url::Url;

use super::pypi::PyPiError;
use crate::types::NormalizedPackageName;

/// The default cross-ecosystem name-mapping service. A package's mapping
/// lives at `<base>/<name>.json`.
pub const DEFAULT_MAPPING_URL: &str =
    "https://conda-mapping.prefix.dev/pypi-to-conda-v1/conda-forge/";

const MAPPING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct MappingEntry {
    conda_name: String,
}

/// Client for the upstream-ecosystem name mapping: given a normalized
/// package name, reports the name the external conda ecosystem publishes it
/// under, if any. A mapped package is deferred to that ecosystem instead of
/// being converted.
#[derive(Clone)]
pub struct MappingClient {
    client: ClientWithMiddleware,
    base_url: Url,
}

impl MappingClient {
    /// Creates a client against a custom mapping base URL.
    pub fn new(client: ClientWithMiddleware, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// Creates a client against the default mapping service.
    pub fn conda_forge(client: ClientWithMiddleware) -> Self {
        Self::new(
            client,
            Url::parse(DEFAULT_MAPPING_URL).expect("the default mapping url is valid"),
        )
    }

    /// Looks up the mapped name. `None` means the ecosystem does not carry
    /// this package.
    pub async fn lookup(
        &self,
        package: &NormalizedPackageName,
    ) -> Result<Option<String>, PyPiError> {
        let url = self.base_url.join(&format!("{package}.json"))?;
        let response = self
            .client
            .get(url.clone())
            .timeout(MAPPING_TIMEOUT)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PyPiError::Status {
                status: response.status(),
                url,
            });
        }
        let entry: MappingEntry = response.json().await?;
        Ok(Some(entry.conda_name))
    }
}
