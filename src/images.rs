//! Remote rootfs image index
//!
//! The index is plaintext, one record per line, semicolon-delimited:
//!
//! ```text
//! # distro;release;arch;type;timestamp;relative-path
//! ubuntu;jammy;arm64;default;20240101_07:42;/images/ubuntu/jammy/arm64/default/20240101
//! alpine;3.19;amd64;musl;20240102_13:00;/images/alpine/3.19/amd64/musl/20240102
//! ```
//!
//! The download URL is `base-url + relative-path + "/rootfs.tar.xz"`. Host
//! architecture names are translated into the index vocabulary before
//! matching; resolution returns the first matching row and never retries.

use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no image matches {distro} {release} for {arch}")]
    NotFound {
        distro: String,
        release: String,
        arch: String,
    },

    #[error("image index fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// One row of the remote index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub distro: String,
    pub release: String,
    pub arch: String,
    pub build_type: String,
    pub timestamp: String,
    pub path: String,
}

/// A resolved, downloadable image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub distro: String,
    pub release: String,
    pub arch: String,
    pub timestamp: String,
    pub url: String,
}

/// Translate a native architecture name into the index vocabulary.
/// Total and pure; unknown names yield None rather than an error.
pub fn translate_arch(native: &str) -> Option<&'static str> {
    match native {
        "aarch64" => Some("arm64"),
        "armv7a" => Some("armhf"),
        "i686" => Some("i386"),
        "x86_64" => Some("amd64"),
        _ => None,
    }
}

/// Native architecture of this host, normalized to the names
/// `translate_arch` accepts
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "arm" => "armv7a",
        "x86" => "i686",
        other => other,
    }
}

/// Parse the full index text (for testing and offline use)
pub fn parse_index(content: &str) -> Vec<IndexRecord> {
    content.lines().filter_map(parse_index_line).collect()
}

/// Parse a single index record
fn parse_index_line(line: &str) -> Option<IndexRecord> {
    let line = line.trim();

    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split(';').collect();
    if fields.len() < 6 {
        return None;
    }

    Some(IndexRecord {
        distro: fields[0].to_string(),
        release: fields[1].to_string(),
        arch: fields[2].to_string(),
        build_type: fields[3].to_string(),
        timestamp: fields[4].to_string(),
        path: fields[5].to_string(),
    })
}

/// Find the first matching image in index text. Pure counterpart of
/// [`ImageIndex::resolve`].
pub fn find_image(
    content: &str,
    base_url: &str,
    distro: &str,
    release: &str,
    native_arch: &str,
    build_type: &str,
) -> Option<ImageAsset> {
    let remote_arch = translate_arch(native_arch)?;

    parse_index(content)
        .into_iter()
        .find(|r| {
            r.distro == distro
                && r.release == release
                && r.arch == remote_arch
                && r.build_type == build_type
                && !r.path.trim().is_empty()
        })
        .map(|r| {
            let url = format!("{}{}/rootfs.tar.xz", base_url, r.path.trim_end_matches('/'));
            ImageAsset {
                distro: r.distro,
                release: r.release,
                arch: r.arch,
                timestamp: r.timestamp,
                url,
            }
        })
}

/// Client for the remote image index
pub struct ImageIndex {
    client: reqwest::Client,
    index_url: String,
    base_url: String,
    build_type: String,
}

impl ImageIndex {
    pub fn new(config: &Config) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(ImageIndex {
            client,
            index_url: config.index_url.clone(),
            base_url: config.download_base_url.clone(),
            build_type: config.build_type.clone(),
        })
    }

    /// Resolve an image for the given distro/release and native
    /// architecture name
    pub async fn resolve(
        &self,
        distro: &str,
        release: &str,
        native_arch: &str,
    ) -> Result<ImageAsset, ResolveError> {
        log::debug!("fetching image index from {}", self.index_url);

        let content = self
            .client
            .get(&self.index_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        find_image(
            &content,
            &self.base_url,
            distro,
            release,
            native_arch,
            &self.build_type,
        )
        .ok_or_else(|| ResolveError::NotFound {
            distro: distro.to_string(),
            release: release.to_string(),
            arch: native_arch.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INDEX: &str = r#"
# this file is generated daily
ubuntu;focal;arm64;default;2023-12-01;/images/ubuntu/focal/arm64/default/20231201
ubuntu;jammy;arm64;default;2024-01-01;/images/ubuntu/jammy/arm64/default/20240101
ubuntu;jammy;arm64;default;2024-01-02;/images/ubuntu/jammy/arm64/default/20240102
ubuntu;jammy;amd64;default;2024-01-01;/images/ubuntu/jammy/amd64/default/20240101
alpine;3.19;arm64;musl;2024-01-01;/images/alpine/3.19/arm64/musl/20240101
badline;missing;fields
"#;

    const BASE: &str = "https://images.example.org";

    #[test]
    fn test_parse_index() {
        let records = parse_index(SAMPLE_INDEX);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].distro, "ubuntu");
        assert_eq!(records[0].release, "focal");
        assert_eq!(records[4].build_type, "musl");
    }

    #[test]
    fn test_translate_arch_is_total() {
        assert_eq!(translate_arch("aarch64"), Some("arm64"));
        assert_eq!(translate_arch("armv7a"), Some("armhf"));
        assert_eq!(translate_arch("i686"), Some("i386"));
        assert_eq!(translate_arch("x86_64"), Some("amd64"));
        assert_eq!(translate_arch("riscv64"), None);
        assert_eq!(translate_arch(""), None);
    }

    #[test]
    fn test_resolve_jammy_aarch64() {
        let asset = find_image(SAMPLE_INDEX, BASE, "ubuntu", "jammy", "aarch64", "default")
            .expect("image should match");

        assert_eq!(asset.distro, "ubuntu");
        assert_eq!(asset.release, "jammy");
        assert_eq!(asset.arch, "arm64");
        assert_eq!(
            asset.url,
            "https://images.example.org/images/ubuntu/jammy/arm64/default/20240101/rootfs.tar.xz"
        );
    }

    #[test]
    fn test_first_match_wins() {
        // Two jammy/arm64 rows exist; the earlier line is returned
        let asset = find_image(SAMPLE_INDEX, BASE, "ubuntu", "jammy", "aarch64", "default").unwrap();
        assert_eq!(asset.timestamp, "2024-01-01");
    }

    #[test]
    fn test_build_type_filter() {
        assert!(find_image(SAMPLE_INDEX, BASE, "alpine", "3.19", "aarch64", "default").is_none());

        let musl = find_image(SAMPLE_INDEX, BASE, "alpine", "3.19", "aarch64", "musl").unwrap();
        assert!(musl.url.contains("/musl/"));
    }

    #[test]
    fn test_unknown_arch_matches_nothing() {
        assert!(find_image(SAMPLE_INDEX, BASE, "ubuntu", "jammy", "riscv64", "default").is_none());
    }

    #[test]
    fn test_no_match_for_unknown_release() {
        assert!(find_image(SAMPLE_INDEX, BASE, "ubuntu", "noble", "aarch64", "default").is_none());
    }

    #[test]
    fn test_trailing_slash_path() {
        let content = "ubuntu;jammy;arm64;default;2024-01-01;/images/ubuntu/jammy/arm64/default/20240101/";
        let asset = find_image(content, BASE, "ubuntu", "jammy", "aarch64", "default").unwrap();
        assert!(asset.url.ends_with("/20240101/rootfs.tar.xz"));
    }

    #[test]
    fn test_host_arch_is_translatable_shape() {
        // Whatever this host is, the normalizer returns a non-empty name
        assert!(!host_arch().is_empty());
    }
}
