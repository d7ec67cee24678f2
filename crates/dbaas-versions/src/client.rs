//! HTTP client for the version service

use std::time::Duration;

use dbaas_core::Engine;
use semver::Version;
use url::Url;

use crate::error::{Result, VersionError};
use crate::matrix::{
    OperatorVersions, PLATFORM_PRODUCT, VersionMatrixEntry, VersionResponse, operator_versions,
    recommended,
};

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Public Percona version service
pub const DEFAULT_VERSION_SERVICE_URL: &str = "https://check.percona.com/versions/v1";

/// Version service product name of an engine's operator
pub fn operator_product(engine: Engine) -> &'static str {
    match engine {
        Engine::XtraDb => "pxc-operator",
        Engine::Psmdb => "psmdb-operator",
    }
}

/// Matrix component holding an engine's database server images
pub fn database_component(engine: Engine) -> &'static str {
    match engine {
        Engine::XtraDb => "pxc",
        Engine::Psmdb => "mongod",
    }
}

/// Recommended image of a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommendedImage {
    pub version: Version,
    pub image_path: String,
    pub image_hash: String,
}

/// Client for `GET {base}/{product}/{version}`
pub struct VersionServiceClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl VersionServiceClient {
    /// Create a client for the service at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut parsed = Url::parse(base_url).map_err(|e| VersionError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(VersionError::InvalidUrl {
                url: base_url.to_string(),
                reason: "URL cannot be used as a base".to_string(),
            });
        }
        // Url::join replaces the last segment unless the path ends with '/'
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VersionError::Network {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: parsed,
            timeout,
        })
    }

    /// Base URL, always ending with `/`
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetch the matrices of `product`, optionally narrowed to one release
    pub async fn fetch(&self, product: &str, version: Option<&str>) -> Result<VersionResponse> {
        let path = match version {
            Some(version) => format!("{}/{}", product, version),
            None => product.to_string(),
        };
        let url = self.base_url.join(&path)?;

        tracing::debug!(%url, "Fetching version matrix");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| VersionError::request(e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(VersionError::Http {
                status: status.as_u16(),
                message: format!("Request to {} failed", url),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| VersionError::request(e, self.timeout))?;
        let parsed: VersionResponse = serde_json::from_slice(&body)?;
        tracing::debug!(%url, entries = parsed.versions.len(), "Fetched version matrix");
        Ok(parsed)
    }

    /// Matrix of exactly one product release
    pub async fn fetch_entry(&self, product: &str, version: &str) -> Result<VersionMatrixEntry> {
        let response = self.fetch(product, Some(version)).await?;
        let count = response.versions.len();
        let mut entries = response.versions.into_iter();
        match (entries.next(), count) {
            (Some(entry), 1) => Ok(entry),
            _ => Err(VersionError::resolution(format!(
                "expected one matrix for {} {}, got {}",
                product, version, count
            ))),
        }
    }

    /// Latest operator versions compatible with a platform release
    ///
    /// `None` when the service does not return exactly one matrix.
    pub async fn latest_operator_versions(
        &self,
        platform_version: &str,
    ) -> Result<Option<OperatorVersions>> {
        let response = self.fetch(PLATFORM_PRODUCT, Some(platform_version)).await?;
        let versions = operator_versions(&response)?;
        if versions.is_none() {
            tracing::warn!(
                platform_version,
                entries = response.versions.len(),
                "No operator dependency information for platform version"
            );
        }
        Ok(versions)
    }

    /// Recommended image of `component` for an operator release
    pub async fn recommended_image(
        &self,
        engine: Engine,
        operator_version: &str,
        component: &str,
    ) -> Result<RecommendedImage> {
        let entry = self
            .fetch_entry(operator_product(engine), operator_version)
            .await?;
        let (version, info) = recommended(entry.component(component)?)?;
        Ok(RecommendedImage {
            version,
            image_path: info.image_path.clone(),
            image_hash: info.image_hash.clone(),
        })
    }

    /// Recommended database server image for an operator release
    pub async fn recommended_database_image(
        &self,
        engine: Engine,
        operator_version: &str,
    ) -> Result<RecommendedImage> {
        self.recommended_image(engine, operator_version, database_component(engine))
            .await
    }
}
