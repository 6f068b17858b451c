//! Remote build repository scanning.
//!
//! A build repository is a plain HTTP directory: image artifacts named
//! `<image>.<arch>-<version>-Build<N>.<M>.<ext>` next to a
//! `<image>.packages` metadata file. The scanner enumerates the index,
//! picks the artifact matching the job's image, and pulls the package list
//! for condition evaluation.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use super::conditions::{parse_packages_file, PackageInfo};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("build repository request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("build repository returned {0}")]
    BadStatus(u16),
}

pub type Result<T> = std::result::Result<T, RepoError>;

/// Image artifact suffixes worth publishing downstream.
const IMAGE_SUFFIXES: &[&str] = &[
    ".raw.xz",
    ".tar.gz",
    ".vhdfixed.xz",
    ".qcow2",
    ".vmdk",
    ".oci.tar.gz",
];

/// One matched build artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    /// Full download URL of the image artifact.
    pub image_file: String,
    /// Version parsed from the artifact name, if present.
    pub version: String,
    /// OBS build identifier parsed from the artifact name, if present.
    pub build_number: String,
    pub packages: HashMap<String, PackageInfo>,
}

pub struct RepoScanner {
    download_url: String,
    client: reqwest::Client,
}

impl RepoScanner {
    pub fn new(download_url: impl Into<String>) -> Self {
        let mut download_url = download_url.into();
        while download_url.ends_with('/') {
            download_url.pop();
        }
        Self {
            download_url,
            client: reqwest::Client::new(),
        }
    }

    /// One polling pass: list the repository and look for an artifact of
    /// the given image. `Ok(None)` means no matching build yet.
    pub async fn scan(&self, image: &str) -> Result<Option<BuildResult>> {
        let index = self.fetch_text(&format!("{}/", self.download_url)).await?;

        let Some(artifact) = find_artifact(&index, image) else {
            debug!(image, "no matching artifact in repository");
            return Ok(None);
        };

        let packages = match self
            .fetch_text(&format!("{}/{image}.packages", self.download_url))
            .await
        {
            Ok(content) => parse_packages_file(&content),
            // Not every build publishes package metadata
            Err(_) => HashMap::new(),
        };

        let (version, build_number) = parse_artifact_name(&artifact, image);

        Ok(Some(BuildResult {
            image_file: format!("{}/{artifact}", self.download_url),
            version,
            build_number,
            packages,
        }))
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RepoError::BadStatus(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

/// Pull artifact file names out of an index page or plain listing.
fn find_artifact(index: &str, image: &str) -> Option<String> {
    index
        .split(['"', '\'', '<', '>', ' ', '\n', '\t'])
        .filter(|token| token.starts_with(image))
        .filter(|token| IMAGE_SUFFIXES.iter().any(|suffix| token.ends_with(suffix)))
        .map(str::to_owned)
        .next()
}

/// `<image>.<arch>-<version>-Build<N>.<M>.<ext>` -> (version, build)
fn parse_artifact_name(artifact: &str, image: &str) -> (String, String) {
    let remainder = artifact.strip_prefix(image).unwrap_or(artifact);
    let mut version = String::new();
    let mut build_number = String::new();

    for part in remainder.split('-') {
        if let Some(build) = part.strip_prefix("Build") {
            build_number = build
                .split('.')
                .take(2)
                .collect::<Vec<_>>()
                .join(".");
        } else if part.chars().next().is_some_and(|c| c.is_ascii_digit()) && version.is_empty()
        {
            version = part
                .split('.')
                .take_while(|seg| seg.chars().all(|c| c.is_ascii_digit()))
                .collect::<Vec<_>>()
                .join(".");
        }
    }

    (version, build_number)
}
