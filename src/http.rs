//! HTTP fetcher.
//!
//! One shared client for every checker and executor: descriptive user agent,
//! bounded concurrency (global cap plus a per-host cap), a short response
//! cache that deduplicates repeated checker queries inside one check cycle,
//! and streaming downloads with byte progress.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};

use crate::cancel::CancelToken;
use crate::errors::{EngineError, EngineResult};

/// User-agent string derived from the crate version at compile time.
pub const USER_AGENT: &str = concat!("macPlus/", env!("CARGO_PKG_VERSION"));

const GLOBAL_CONCURRENCY: usize = 8;
const PER_HOST_CONCURRENCY: usize = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Long enough to cover one check-all; cleared at the start of each cycle.
const CACHE_TTL: Duration = Duration::from_secs(120);
/// Progress callbacks are throttled to this interval.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(150);

/// Response of a conditional GET, with the handful of headers checkers need.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: String,
    pub rate_limit_remaining: Option<u32>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

struct CacheEntry {
    fetched_at: Instant,
    body: Vec<u8>,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

fn read_timeout() -> Duration {
    std::env::var("MACPLUS_HTTP_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_READ_TIMEOUT)
}

impl HttpFetcher {
    pub fn new() -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(read_timeout())
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| EngineError::internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            global: Arc::new(Semaphore::new(GLOBAL_CONCURRENCY)),
            per_host: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Drop all cached responses. Called at the start of each check cycle.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    async fn host_semaphore(&self, url: &str) -> Arc<Semaphore> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let mut map = self.per_host.lock().await;
        map.entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(PER_HOST_CONCURRENCY)))
            .clone()
    }

    /// GET returning raw bytes. `cacheable` responses are served from the
    /// in-memory cache within the TTL.
    pub async fn get_bytes(&self, url: &str, cacheable: bool) -> EngineResult<Vec<u8>> {
        if cacheable {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(url) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(entry.body.clone());
                }
            }
        }

        let host = self.host_semaphore(url).await;
        let _global = self.global.clone().acquire_owned().await;
        let _host = host.acquire_owned().await;

        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::Network {
                message: format!("{url} returned HTTP {}", resp.status()),
                retriable: resp.status().is_server_error(),
            });
        }
        let body = resp.bytes().await?.to_vec();

        if cacheable {
            self.cache.lock().await.insert(
                url.to_string(),
                CacheEntry {
                    fetched_at: Instant::now(),
                    body: body.clone(),
                },
            );
        }
        Ok(body)
    }

    /// GET returning parsed JSON.
    pub async fn get_json(&self, url: &str, cacheable: bool) -> EngineResult<serde_json::Value> {
        let bytes = self.get_bytes(url, cacheable).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// GET returning the body as text (for XML feeds).
    pub async fn get_text(&self, url: &str, cacheable: bool) -> EngineResult<String> {
        let bytes = self.get_bytes(url, cacheable).await?;
        String::from_utf8(bytes)
            .map_err(|e| EngineError::internal(format!("non-utf8 response from {url}: {e}")))
    }

    /// Conditional GET carrying extra headers (If-None-Match and friends).
    /// Returns status + body so callers can implement their own ETag caches.
    pub async fn get_conditional(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> EngineResult<FetchedResponse> {
        let host = self.host_semaphore(url).await;
        let _global = self.global.clone().acquire_owned().await;
        let _host = host.acquire_owned().await;

        let mut req = self.client.get(url);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let resp = req.send().await?;

        let status = resp.status().as_u16();
        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let rate_limit_remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = resp.text().await.unwrap_or_default();

        Ok(FetchedResponse {
            status,
            etag,
            body,
            rate_limit_remaining,
        })
    }

    /// HEAD probe used by the connectivity check.
    pub async fn head_ok(&self, url: &str, timeout: Duration) -> bool {
        self.client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().is_redirection())
            .unwrap_or(false)
    }

    /// Stream a download to `target_path`, reporting byte progress and
    /// honoring cancellation between chunks. Returns bytes written and the
    /// Content-Type the server declared.
    pub async fn download_to(
        &self,
        url: &str,
        target_path: &Path,
        cancel: &CancelToken,
        mut progress: impl FnMut(u64, Option<u64>),
    ) -> EngineResult<(u64, String)> {
        let host = self.host_semaphore(url).await;
        let _global = self.global.clone().acquire_owned().await;
        let _host = host.acquire_owned().await;

        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::Network {
                message: format!("download {url} returned HTTP {}", resp.status()),
                retriable: resp.status().is_server_error(),
            });
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        let total = resp.content_length();

        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(target_path)?;
        let mut downloaded: u64 = 0;
        let mut last_emit = Instant::now();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = std::fs::remove_file(target_path);
                return Err(EngineError::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                last_emit = Instant::now();
                progress(downloaded, total);
            }
        }
        file.flush()?;
        progress(downloaded, total);

        Ok((downloaded, content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_names_the_product() {
        assert!(USER_AGENT.starts_with("macPlus/"));
    }

    #[test]
    fn timeout_env_override_parses() {
        std::env::set_var("MACPLUS_HTTP_TIMEOUT_MS", "1500");
        assert_eq!(read_timeout(), Duration::from_millis(1500));
        std::env::remove_var("MACPLUS_HTTP_TIMEOUT_MS");
        assert_eq!(read_timeout(), DEFAULT_READ_TIMEOUT);
    }

    #[test]
    fn fetched_response_status_helpers() {
        let ok = FetchedResponse {
            status: 200,
            etag: None,
            body: String::new(),
            rate_limit_remaining: None,
        };
        assert!(ok.is_success());
        let nm = FetchedResponse {
            status: 304,
            ..ok.clone()
        };
        assert!(nm.is_not_modified());
        assert!(!nm.is_success());
    }

    #[tokio::test]
    async fn cache_serves_within_ttl() {
        let fetcher = HttpFetcher::new().unwrap();
        fetcher.cache.lock().await.insert(
            "https://example.com/x.json".to_string(),
            CacheEntry {
                fetched_at: Instant::now(),
                body: b"{\"ok\":true}".to_vec(),
            },
        );
        let v = fetcher
            .get_json("https://example.com/x.json", true)
            .await
            .unwrap();
        assert_eq!(v["ok"], true);

        fetcher.clear_cache().await;
        assert!(fetcher.cache.lock().await.is_empty());
    }
}
