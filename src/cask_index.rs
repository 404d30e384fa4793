//! The Homebrew cask API index.
//!
//! One ~2 MB JSON document from formulae.brew.sh describes every cask:
//! token, version, download URL, sha256, artifacts, homepage. Built into
//! lookup maps keyed by bundle id and normalized app filename, cached with
//! an ETag and a TTL so repeated check cycles stay off the network.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::http::HttpFetcher;
use crate::version;

const CASK_INDEX_URL: &str = "https://formulae.brew.sh/api/cask.json";
const CASK_INDEX_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Version info for a single cask with a real (non-"latest") version.
#[derive(Debug, Clone)]
pub struct CaskRelease {
    pub token: String,
    pub version: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CaskIndex {
    /// bundle id → release (excludes "latest" casks).
    by_bundle_id: HashMap<String, CaskRelease>,
    /// normalized app filename → release (excludes "latest" casks).
    by_app_name: HashMap<String, CaskRelease>,
    /// bundle id → token, every cask including "latest".
    tokens_by_bundle_id: HashMap<String, String>,
    /// normalized app filename → token, every cask including "latest".
    tokens_by_app_name: HashMap<String, String>,
    /// token → download url, every cask.
    pub url_by_token: HashMap<String, String>,
    /// bundle id → "owner/repo", auto-extracted from cask URLs/homepages.
    pub github_repos: HashMap<String, String>,
}

impl CaskIndex {
    /// Release lookup by bundle id, then app filename. Only casks with
    /// comparable versions.
    pub fn lookup(&self, bundle_id: &str, app_path: Option<&Path>) -> Option<&CaskRelease> {
        if let Some(rel) = self.by_bundle_id.get(&bundle_id.to_lowercase()) {
            return Some(rel);
        }
        let filename = app_path?.file_name()?.to_str()?;
        self.by_app_name.get(&normalize_app_name(filename))
    }

    /// Token lookup including "latest" casks, for backfilling so
    /// `brew outdated --greedy` can cover version-less casks.
    pub fn lookup_token(&self, bundle_id: &str, app_path: Option<&Path>) -> Option<&str> {
        if let Some(token) = self.tokens_by_bundle_id.get(&bundle_id.to_lowercase()) {
            return Some(token);
        }
        let filename = app_path?.file_name()?.to_str()?;
        let normalized = normalize_app_name(filename);
        if let Some(token) = self.tokens_by_app_name.get(&normalized) {
            return Some(token);
        }
        self.tokens_by_app_name
            .get(&display_name_to_token(&normalized))
            .map(String::as_str)
    }
}

/// Lowercase, strip a trailing ".app".
fn normalize_app_name(name: &str) -> String {
    let s = name.trim();
    let s = s.strip_suffix(".app").unwrap_or(s);
    s.to_lowercase()
}

/// "Visual Studio Code" → "visual-studio-code".
fn display_name_to_token(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// "owner/repo" from a GitHub release/archive download URL.
fn extract_github_slug(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://github.com/")?;
    let parts: Vec<&str> = rest.splitn(4, '/').collect();
    if parts.len() >= 3
        && (parts[2] == "releases" || parts[2] == "archive")
        && !parts[0].is_empty()
        && !parts[1].is_empty()
    {
        return Some(format!("{}/{}", parts[0], parts[1]));
    }
    None
}

/// "owner/repo" from a bare GitHub homepage URL.
fn extract_github_slug_from_homepage(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://github.com/")?;
    let trimmed = rest.trim_end_matches('/');
    let parts: Vec<&str> = trimmed.splitn(3, '/').collect();
    if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
        return Some(format!("{}/{}", parts[0], parts[1]));
    }
    None
}

pub fn build_index(casks: &[serde_json::Value]) -> CaskIndex {
    let mut index = CaskIndex::default();

    for cask in casks {
        let token = match cask.get("token").and_then(|v| v.as_str()) {
            Some(t) => t,
            None => continue,
        };
        let raw_version = match cask.get("version").and_then(|v| v.as_str()) {
            Some(v) => v,
            None => continue,
        };
        let cask_version = version::strip_brew_token(raw_version);
        let is_latest = cask_version == "latest";

        let url = cask.get("url").and_then(|v| v.as_str()).map(String::from);
        let sha256 = cask
            .get("sha256")
            .and_then(|v| v.as_str())
            .filter(|s| *s != "no_check")
            .map(String::from);

        if let Some(ref u) = url {
            index.url_by_token.insert(token.to_string(), u.clone());
        }

        let github_slug = if is_latest {
            None
        } else {
            url.as_deref().and_then(extract_github_slug).or_else(|| {
                cask.get("homepage")
                    .and_then(|v| v.as_str())
                    .and_then(extract_github_slug_from_homepage)
            })
        };

        let release = if is_latest {
            None
        } else {
            Some(CaskRelease {
                token: token.to_string(),
                version: cask_version.to_string(),
                url: url.clone(),
                sha256,
            })
        };

        let artifacts = match cask.get("artifacts").and_then(|v| v.as_array()) {
            Some(a) => a,
            None => continue,
        };

        let mut cask_bundle_ids: Vec<String> = Vec::new();
        for artifact in artifacts {
            if let Some(apps) = artifact.get("app").and_then(|v| v.as_array()) {
                for app_entry in apps {
                    if let Some(app_name) = app_entry.as_str() {
                        let normalized = normalize_app_name(app_name);
                        if normalized.is_empty() {
                            continue;
                        }
                        index
                            .tokens_by_app_name
                            .entry(normalized.clone())
                            .or_insert_with(|| token.to_string());
                        if let Some(ref rel) = release {
                            index.by_app_name.entry(normalized).or_insert_with(|| rel.clone());
                        }
                    }
                }
            }

            for key in ["uninstall", "zap"] {
                if let Some(stanzas) = artifact.get(key).and_then(|v| v.as_array()) {
                    for stanza in stanzas {
                        let quits: Vec<String> = match stanza.get("quit") {
                            Some(serde_json::Value::Array(arr)) => arr
                                .iter()
                                .filter_map(|q| q.as_str())
                                .map(|s| s.to_lowercase())
                                .collect(),
                            Some(serde_json::Value::String(s)) => vec![s.to_lowercase()],
                            _ => Vec::new(),
                        };
                        for bid in quits {
                            index
                                .tokens_by_bundle_id
                                .entry(bid.clone())
                                .or_insert_with(|| token.to_string());
                            if let Some(ref rel) = release {
                                index
                                    .by_bundle_id
                                    .entry(bid.clone())
                                    .or_insert_with(|| rel.clone());
                            }
                            cask_bundle_ids.push(bid);
                        }
                    }
                }
            }
        }

        if let Some(ref slug) = github_slug {
            for bid in &cask_bundle_ids {
                index
                    .github_repos
                    .entry(bid.clone())
                    .or_insert_with(|| slug.clone());
            }
        }
    }

    log::info!(
        "cask index: {} casks, {} bundle-id releases, {} app-name releases, {} github repos",
        casks.len(),
        index.by_bundle_id.len(),
        index.by_app_name.len(),
        index.github_repos.len(),
    );
    index
}

struct IndexCache {
    etag: Option<String>,
    index: Option<std::sync::Arc<CaskIndex>>,
    fetched_at: Option<Instant>,
}

fn index_cache() -> &'static RwLock<IndexCache> {
    static CACHE: OnceLock<RwLock<IndexCache>> = OnceLock::new();
    CACHE.get_or_init(|| {
        RwLock::new(IndexCache {
            etag: None,
            index: None,
            fetched_at: None,
        })
    })
}

/// Fetch (or reuse) the cask index. Serves the cached copy inside the TTL,
/// revalidates with If-None-Match past it, and degrades to the stale copy
/// on any network failure.
pub async fn fetch(http: &HttpFetcher) -> Option<std::sync::Arc<CaskIndex>> {
    {
        let cache = index_cache().read().await;
        if let (Some(ref index), Some(at)) = (&cache.index, cache.fetched_at) {
            if at.elapsed() < CASK_INDEX_TTL {
                return Some(index.clone());
            }
        }
    }

    let cached_etag = index_cache().read().await.etag.clone();
    let mut headers: Vec<(&str, &str)> = Vec::new();
    if let Some(ref etag) = cached_etag {
        headers.push(("If-None-Match", etag.as_str()));
    }

    let resp = match http.get_conditional(CASK_INDEX_URL, &headers).await {
        Ok(r) => r,
        Err(e) => {
            log::warn!("cask index fetch failed: {e}");
            return index_cache().read().await.index.clone();
        }
    };

    if resp.is_not_modified() {
        let mut cache = index_cache().write().await;
        cache.fetched_at = Some(Instant::now());
        return cache.index.clone();
    }
    if !resp.is_success() {
        log::warn!("cask index returned HTTP {}", resp.status);
        return index_cache().read().await.index.clone();
    }

    let casks: Vec<serde_json::Value> = match serde_json::from_str(&resp.body) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("cask index parse failed: {e}");
            return index_cache().read().await.index.clone();
        }
    };

    let index = std::sync::Arc::new(build_index(&casks));
    let mut cache = index_cache().write().await;
    cache.etag = resp.etag;
    cache.index = Some(index.clone());
    cache.fetched_at = Some(Instant::now());
    Some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> CaskIndex {
        let casks: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
              {
                "token": "bitwarden",
                "version": "2024.10.3",
                "url": "https://github.com/bitwarden/clients/releases/download/v2024.10.3/Bitwarden.dmg",
                "sha256": "abc123",
                "homepage": "https://bitwarden.com",
                "artifacts": [
                  {"app": ["Bitwarden.app"]},
                  {"uninstall": [{"quit": "com.bitwarden.desktop"}]}
                ]
              },
              {
                "token": "figma",
                "version": "latest",
                "url": "https://desktop.figma.com/mac/Figma.zip",
                "sha256": "no_check",
                "artifacts": [
                  {"app": ["Figma.app"]},
                  {"zap": [{"quit": ["com.figma.Desktop"]}]}
                ]
              }
            ]"#,
        )
        .unwrap();
        build_index(&casks)
    }

    #[test]
    fn lookup_by_bundle_id() {
        let index = sample_index();
        let rel = index.lookup("com.bitwarden.desktop", None).unwrap();
        assert_eq!(rel.token, "bitwarden");
        assert_eq!(rel.version, "2024.10.3");
        assert_eq!(rel.sha256.as_deref(), Some("abc123"));
    }

    #[test]
    fn lookup_by_app_filename() {
        let index = sample_index();
        let rel = index
            .lookup("com.unknown.id", Some(Path::new("/Applications/Bitwarden.app")))
            .unwrap();
        assert_eq!(rel.token, "bitwarden");
    }

    #[test]
    fn latest_casks_resolve_tokens_but_not_releases() {
        let index = sample_index();
        assert!(index.lookup("com.figma.Desktop", None).is_none());
        assert_eq!(index.lookup_token("com.figma.Desktop", None), Some("figma"));
    }

    #[test]
    fn github_slugs_extracted_from_release_urls() {
        let index = sample_index();
        assert_eq!(
            index.github_repos.get("com.bitwarden.desktop").map(String::as_str),
            Some("bitwarden/clients")
        );
    }

    #[test]
    fn display_name_tokenization() {
        assert_eq!(display_name_to_token("visual studio code"), "visual-studio-code");
        assert_eq!(display_name_to_token("firefox"), "firefox");
    }

    #[test]
    fn slug_extraction_patterns() {
        assert_eq!(
            extract_github_slug("https://github.com/iina/iina/releases/download/v1.3.5/IINA.dmg"),
            Some("iina/iina".to_string())
        );
        assert_eq!(extract_github_slug("https://example.com/x.dmg"), None);
        assert_eq!(
            extract_github_slug_from_homepage("https://github.com/p0deje/Maccy"),
            Some("p0deje/Maccy".to_string())
        );
        assert_eq!(
            extract_github_slug_from_homepage("https://github.com/p0deje/Maccy/wiki"),
            None
        );
    }
}
