//! Update checkers: one pluggable probe per upstream source.
//!
//! A checker answers two questions: does it apply to this app at all
//! (cheap, local), and what does the upstream currently publish (the
//! network probe). Probes never fail siblings; every error is captured
//! into the probe result where the resolver folds it into diagnostics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::brew::{OutdatedCask, OutdatedFormula};
use crate::cask_index::CaskIndex;
use crate::errors::{EngineResult, ErrorKind};
use crate::http::HttpFetcher;
use crate::models::{AppRecord, InstallSource, SourceType};
use crate::{appcast, platform, version};

/// What one probe learned from its upstream.
#[derive(Debug, Clone)]
pub enum ProbeResult {
    Found(FoundUpdate),
    NotFound,
    Skipped { reason: String },
    Error {
        kind: ErrorKind,
        message: String,
        retriable: bool,
    },
}

#[derive(Debug, Clone)]
pub struct FoundUpdate {
    pub version: String,
    pub download_url: Option<String>,
    pub sha256: Option<String>,
    pub release_notes: Option<String>,
    pub release_notes_url: Option<String>,
    pub is_paid_upgrade: bool,
    pub notes: Option<String>,
}

impl FoundUpdate {
    fn version_only(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            download_url: None,
            sha256: None,
            release_notes: None,
            release_notes_url: None,
            is_paid_upgrade: false,
            notes: None,
        }
    }
}

/// Shared state assembled once per check cycle and handed to every probe.
pub struct CheckContext {
    pub http: Arc<HttpFetcher>,
    pub outdated_casks: Arc<HashMap<String, OutdatedCask>>,
    pub outdated_formulae: Arc<HashMap<String, OutdatedFormula>>,
    pub cask_index: Option<Arc<CaskIndex>>,
    pub host_os_version: Option<String>,
    pub xcode_clt_installed: Option<bool>,
}

impl CheckContext {
    /// GitHub "owner/repo" for an app: built-in table first, then slugs
    /// auto-extracted from the cask index.
    pub fn github_repo(&self, bundle_id: &str) -> Option<String> {
        if let Some(slug) = builtin_github_mappings().get(bundle_id) {
            return Some(slug.to_string());
        }
        self.cask_index
            .as_ref()
            .and_then(|idx| idx.github_repos.get(&bundle_id.to_lowercase()).cloned())
    }
}

#[async_trait]
pub trait UpdateChecker: Send + Sync {
    fn source_type(&self) -> SourceType;
    /// Cheap local predicate; no network, no subprocesses.
    fn applicable(&self, app: &AppRecord, ctx: &CheckContext) -> bool;
    /// The network probe. Errors are captured by the resolver; `?` freely.
    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult>;
}

/// The full checker registry, in a stable order. Adding a source type means
/// one enum variant and one entry here.
pub fn all_checkers() -> Vec<Box<dyn UpdateChecker>> {
    vec![
        Box::new(SparkleChecker),
        Box::new(HomebrewCaskChecker),
        Box::new(HomebrewFormulaChecker),
        Box::new(HomebrewApiChecker),
        Box::new(MasChecker),
        Box::new(GithubChecker),
        Box::new(ElectronChecker),
        Box::new(KeystoneChecker),
        Box::new(MicrosoftAutoupdateChecker),
        Box::new(JetbrainsToolboxChecker),
        Box::new(AdobeCcChecker),
        Box::new(MozillaChecker),
    ]
}

fn app_path(app: &AppRecord) -> Option<&Path> {
    app.app_path.as_deref().map(Path::new)
}

fn installed_version(app: &AppRecord) -> Option<&str> {
    app.installed_version.as_deref()
}

/// Browser extension bundle id prefixes. Extensions masquerade as apps in
/// some catalogs and must never match Homebrew casks.
const BROWSER_EXTENSION_PREFIXES: &[&str] = &[
    "com.google.Chrome.app.",
    "com.brave.Browser.app.",
    "com.microsoft.Edge.app.",
    "org.chromium.Chromium.app.",
];

pub fn is_browser_extension(bundle_id: &str) -> bool {
    BROWSER_EXTENSION_PREFIXES
        .iter()
        .any(|p| bundle_id.starts_with(p))
}

/// Host macOS version via `sw_vers`, cached for the process lifetime.
pub fn host_os_version() -> Option<String> {
    static VERSION: OnceLock<Option<String>> = OnceLock::new();
    VERSION
        .get_or_init(|| {
            std::process::Command::new("sw_vers")
                .arg("-productVersion")
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        })
        .clone()
}

// ---------------------------------------------------------------------------
// Sparkle
// ---------------------------------------------------------------------------

pub struct SparkleChecker;

#[async_trait]
impl UpdateChecker for SparkleChecker {
    fn source_type(&self) -> SourceType {
        SourceType::Sparkle
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        if app.install_source == InstallSource::MacAppStore {
            return false;
        }
        if app.sparkle_feed_url.is_some() {
            return true;
        }
        app_path(app).map_or(false, platform::has_sparkle_framework)
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let feed_url = match app.sparkle_feed_url.clone().or_else(|| {
            app_path(app)
                .and_then(platform::parse_bundle)
                .and_then(|b| b.sparkle_feed_url)
        }) {
            Some(url) => url,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no SUFeedURL".to_string(),
                })
            }
        };

        let xml = ctx.http.get_text(&feed_url, true).await?;
        let best = appcast::best_item(
            &xml,
            installed_version(app),
            ctx.host_os_version.as_deref(),
        );

        Ok(match best {
            Some(item) => ProbeResult::Found(FoundUpdate {
                version: item.version,
                download_url: item.download_url,
                sha256: None,
                release_notes: None,
                release_notes_url: item.release_notes_url,
                is_paid_upgrade: false,
                notes: None,
            }),
            None => ProbeResult::NotFound,
        })
    }
}

// ---------------------------------------------------------------------------
// Homebrew (local brew state)
// ---------------------------------------------------------------------------

pub struct HomebrewCaskChecker;

#[async_trait]
impl UpdateChecker for HomebrewCaskChecker {
    fn source_type(&self) -> SourceType {
        SourceType::HomebrewCask
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        app.install_source != InstallSource::MacAppStore && app.homebrew_cask_token.is_some()
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let token = match app.homebrew_cask_token.as_deref() {
            Some(t) => t,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no cask token".to_string(),
                })
            }
        };

        let outdated = match ctx.outdated_casks.get(token) {
            Some(o) => o,
            // Token known to brew but not outdated means up to date.
            None => return Ok(ProbeResult::NotFound),
        };

        let release = ctx
            .cask_index
            .as_ref()
            .and_then(|idx| idx.lookup(&app.bundle_id, app_path(app)));
        let download_url = release
            .and_then(|r| r.url.clone())
            .or_else(|| {
                ctx.cask_index
                    .as_ref()
                    .and_then(|idx| idx.url_by_token.get(token).cloned())
            });

        Ok(ProbeResult::Found(FoundUpdate {
            version: outdated.current_version.clone(),
            download_url,
            sha256: release.and_then(|r| r.sha256.clone()),
            release_notes: None,
            release_notes_url: ctx
                .github_repo(&app.bundle_id)
                .map(|slug| format!("https://github.com/{slug}/releases")),
            is_paid_upgrade: false,
            notes: None,
        }))
    }
}

/// Synthetic formula rows update off the local `brew outdated` map. The
/// candidate reuses the homebrew_cask source type; routing reaches the
/// formula executor through the app's install source.
pub struct HomebrewFormulaChecker;

#[async_trait]
impl UpdateChecker for HomebrewFormulaChecker {
    fn source_type(&self) -> SourceType {
        SourceType::HomebrewCask
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        app.install_source == InstallSource::HomebrewFormula
            && app.homebrew_formula_name.is_some()
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let name = match app.homebrew_formula_name.as_deref() {
            Some(n) => n,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no formula name".to_string(),
                })
            }
        };

        match ctx.outdated_formulae.get(name) {
            Some(outdated) => {
                let notes = if ctx.xcode_clt_installed == Some(false) {
                    Some(
                        "Requires Xcode Command Line Tools (run: xcode-select --install)"
                            .to_string(),
                    )
                } else {
                    None
                };
                Ok(ProbeResult::Found(FoundUpdate {
                    notes,
                    ..FoundUpdate::version_only(outdated.current_version.clone())
                }))
            }
            None => Ok(ProbeResult::NotFound),
        }
    }
}

pub struct HomebrewApiChecker;

#[async_trait]
impl UpdateChecker for HomebrewApiChecker {
    fn source_type(&self) -> SourceType {
        SourceType::HomebrewApi
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        app.install_source != InstallSource::MacAppStore && !is_browser_extension(&app.bundle_id)
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let index = match &ctx.cask_index {
            Some(idx) => idx,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "cask index unavailable".to_string(),
                })
            }
        };
        let release = match index.lookup(&app.bundle_id, app_path(app)) {
            Some(r) => r,
            None => return Ok(ProbeResult::NotFound),
        };
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };

        // A brew-managed app that brew itself does not list as outdated is
        // current; a raw index comparison can false-positive on multi-bundle
        // casks.
        if app.homebrew_cask_token.is_some() && !ctx.outdated_casks.contains_key(&release.token) {
            return Ok(ProbeResult::NotFound);
        }

        if version::is_newer(current, &release.version) {
            return Ok(ProbeResult::Found(FoundUpdate {
                version: release.version.clone(),
                download_url: release.url.clone(),
                sha256: release.sha256.clone(),
                release_notes: None,
                release_notes_url: ctx
                    .github_repo(&app.bundle_id)
                    .map(|slug| format!("https://github.com/{slug}/releases")),
                is_paid_upgrade: false,
                notes: None,
            }));
        }
        Ok(ProbeResult::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Mac App Store
// ---------------------------------------------------------------------------

pub struct MasChecker;

#[derive(Debug, Deserialize)]
struct ItunesResponse {
    #[serde(rename = "resultCount")]
    result_count: u32,
    results: Vec<ItunesResult>,
}

#[derive(Debug, Deserialize)]
struct ItunesResult {
    version: String,
    #[serde(rename = "trackViewUrl")]
    track_view_url: Option<String>,
    #[serde(rename = "releaseNotes")]
    release_notes: Option<String>,
}

#[async_trait]
impl UpdateChecker for MasChecker {
    fn source_type(&self) -> SourceType {
        SourceType::Mas
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        app.install_source == InstallSource::MacAppStore
            || app_path(app).map_or(false, platform::has_mas_receipt)
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };

        let url = format!(
            "https://itunes.apple.com/lookup?bundleId={}&country=US",
            app.bundle_id
        );
        let data: ItunesResponse = serde_json::from_value(ctx.http.get_json(&url, true).await?)?;
        if data.result_count == 0 || data.results.is_empty() {
            return Ok(ProbeResult::NotFound);
        }

        let result = &data.results[0];
        if version::is_newer(current, &result.version) {
            // Version updates to an owned app are free; paid upgrades ship
            // as separate store entries and never show here.
            return Ok(ProbeResult::Found(FoundUpdate {
                version: result.version.clone(),
                download_url: result.track_view_url.clone(),
                sha256: None,
                release_notes: result.release_notes.clone(),
                release_notes_url: result.track_view_url.clone(),
                is_paid_upgrade: false,
                notes: None,
            }));
        }
        Ok(ProbeResult::NotFound)
    }
}

// ---------------------------------------------------------------------------
// GitHub releases (shared by the github, electron, and self-update paths)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    html_url: String,
    prerelease: bool,
    draft: bool,
    body: Option<String>,
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EtagEntry {
    etag: String,
    response_body: String,
}

static GITHUB_RATE_LIMITED: AtomicBool = AtomicBool::new(false);

/// Forget the rate-limit latch at the start of each check cycle.
pub fn reset_github_rate_limit() {
    GITHUB_RATE_LIMITED.store(false, Ordering::Relaxed);
}

fn etag_cache() -> &'static RwLock<HashMap<String, EtagEntry>> {
    static CACHE: OnceLock<RwLock<HashMap<String, EtagEntry>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(load_etag_cache().unwrap_or_default()))
}

fn etag_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("com.macplus.app").join("github_etag_cache.json"))
}

fn load_etag_cache() -> Option<HashMap<String, EtagEntry>> {
    let data = std::fs::read_to_string(etag_cache_path()?).ok()?;
    serde_json::from_str(&data).ok()
}

/// Persist the ETag cache after a check cycle; 304 replays cost no rate
/// limit budget on the next run.
pub async fn save_etag_cache() {
    let cache = etag_cache().read().await;
    if cache.is_empty() {
        return;
    }
    if let Some(path) = etag_cache_path() {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string(&*cache) {
            let _ = std::fs::write(&path, json);
        }
    }
}

/// Prefer universal or host-arch builds, then any mac-flavored dmg/zip/pkg.
fn find_macos_asset(assets: &[GithubAsset]) -> Option<&GithubAsset> {
    let keywords = [
        "macos", "mac", "darwin", "osx", "universal", "arm64", "aarch64", "x86_64",
    ];
    let extensions = [".dmg", ".zip", ".pkg"];

    let flavored = |asset: &&GithubAsset| {
        let name = asset.name.to_lowercase();
        keywords.iter().any(|kw| name.contains(kw))
            && extensions.iter().any(|ext| name.ends_with(ext))
    };

    if let Some(asset) = assets.iter().filter(flavored).find(|a| {
        let name = a.name.to_lowercase();
        name.contains("universal") || name.contains("arm64") || name.contains("aarch64")
    }) {
        return Some(asset);
    }
    if let Some(asset) = assets.iter().find(flavored) {
        return Some(asset);
    }

    assets.iter().find(|a| {
        let name = a.name.to_lowercase();
        (name.ends_with(".dmg") || name.ends_with(".pkg"))
            && !name.contains("linux")
            && !name.contains("windows")
            && !name.contains(".exe")
            && !name.contains(".deb")
            && !name.contains(".rpm")
    })
}

/// Query one repo's latest release, with ETag revalidation and a
/// process-wide rate-limit latch.
pub async fn check_github_release(
    owner: &str,
    repo: &str,
    installed: Option<&str>,
    http: &HttpFetcher,
) -> EngineResult<Option<FoundUpdate>> {
    if GITHUB_RATE_LIMITED.load(Ordering::Relaxed) {
        return Ok(None);
    }

    let cache_key = format!("{owner}/{repo}");
    let url = format!("https://api.github.com/repos/{owner}/{repo}/releases/latest");

    let cached_etag = {
        let cache = etag_cache().read().await;
        cache.get(&cache_key).map(|e| e.etag.clone())
    };

    let mut headers: Vec<(&str, &str)> = vec![("Accept", "application/vnd.github+json")];
    if let Some(ref etag) = cached_etag {
        headers.push(("If-None-Match", etag.as_str()));
    }

    let resp = http.get_conditional(&url, &headers).await?;

    if resp.status == 403 {
        if resp.rate_limit_remaining == Some(0) {
            log::warn!("GitHub API rate limit reached; skipping remaining GitHub probes");
            GITHUB_RATE_LIMITED.store(true, Ordering::Relaxed);
        }
        return Ok(None);
    }

    if resp.is_not_modified() {
        let cache = etag_cache().read().await;
        if let Some(entry) = cache.get(&cache_key) {
            if let Ok(release) = serde_json::from_str::<GithubRelease>(&entry.response_body) {
                return Ok(parse_github_release(release, installed));
            }
        }
        return Ok(None);
    }

    if !resp.is_success() {
        return Ok(None);
    }

    if let Some(etag) = resp.etag.clone() {
        let mut cache = etag_cache().write().await;
        cache.insert(
            cache_key,
            EtagEntry {
                etag,
                response_body: resp.body.clone(),
            },
        );
    }

    let release: GithubRelease = serde_json::from_str(&resp.body)?;
    Ok(parse_github_release(release, installed))
}

fn parse_github_release(release: GithubRelease, installed: Option<&str>) -> Option<FoundUpdate> {
    if release.draft || release.prerelease {
        return None;
    }

    let tag_version = release
        .tag_name
        .strip_prefix('v')
        .unwrap_or(&release.tag_name);

    let newer = match installed {
        Some(current) => version::is_newer(current, tag_version),
        None => false,
    };
    if !newer {
        return None;
    }

    let download_url = find_macos_asset(&release.assets).map(|a| a.browser_download_url.clone());
    Some(FoundUpdate {
        version: tag_version.to_string(),
        download_url,
        sha256: None,
        release_notes: release.body,
        release_notes_url: Some(release.html_url),
        is_paid_upgrade: false,
        notes: None,
    })
}

pub struct GithubChecker;

/// Built-in bundle id → "owner/repo" table for apps that release on GitHub
/// without advertising it anywhere machine-readable.
fn builtin_github_mappings() -> &'static HashMap<&'static str, &'static str> {
    static MAPPINGS: OnceLock<HashMap<&str, &str>> = OnceLock::new();
    MAPPINGS.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("com.googlecode.iterm2", "gnachman/iTerm2");
        m.insert("com.mitchellh.ghostty", "ghostty-org/ghostty");
        m.insert("io.alacritty", "alacritty/alacritty");
        m.insert("com.github.wez.wezterm", "wez/wezterm");
        m.insert("com.knollsoft.Rectangle", "rxhanson/Rectangle");
        m.insert("com.lwouis.alt-tab-macos", "lwouis/alt-tab-macos");
        m.insert("org.pqrs.Karabiner-Elements", "pqrs-org/Karabiner-Elements");
        m.insert("org.keepassxc.keepassxc", "keepassxreboot/keepassxc");
        m.insert("com.bitwarden.desktop", "bitwarden/clients");
        m.insert("md.obsidian", "obsidianmd/obsidian-releases");
        m.insert("org.joplinapp.desktop", "laurent22/joplin");
        m.insert("org.videolan.vlc", "videolan/vlc");
        m.insert("com.colliderli.iina", "iina/iina");
        m.insert("com.obsproject.obs-studio", "obsproject/obs-studio");
        m.insert("org.audacityteam.audacity", "audacity/audacity");
        m.insert("com.p0deje.Maccy", "p0deje/Maccy");
        m.insert("com.jordanbaird.Ice", "jordanbaird/Ice");
        m.insert("com.MonitorControl.MonitorControl", "MonitorControl/MonitorControl");
        m.insert("com.keka.Keka", "aonez/Keka");
        m.insert("dev.zed.Zed", "zed-industries/zed");
        m.insert("com.exelban.stats", "exelban/stats");
        m.insert("org.hammerspoon.Hammerspoon", "Hammerspoon/hammerspoon");
        m.insert("fr.handbrake.HandBrake", "HandBrake/HandBrake");
        m.insert("net.kovidgoyal.calibre", "kovidgoyal/calibre");
        m.insert("im.riot.app", "element-hq/element-desktop");
        m.insert("org.mattermost.desktop", "mattermost/desktop");
        m.insert("org.cryptomator", "cryptomator/cryptomator");
        m.insert("net.mullvad.vpn", "mullvad/mullvadvpn-app");
        m.insert("com.neovide.neovide", "neovide/neovide");
        m.insert("com.helix-editor.Helix", "helix-editor/helix");
        m.insert("net.ankiweb.dtop", "ankitects/anki");
        m.insert("info.eurocomp.MeetingBar", "leits/MeetingBar");
        m.insert("ch.sudo.cyberduck", "iterate-ch/cyberduck");
        m.insert("org.shotcut.Shotcut", "mltframework/shotcut");
        m
    })
}

#[async_trait]
impl UpdateChecker for GithubChecker {
    fn source_type(&self) -> SourceType {
        SourceType::Github
    }

    fn applicable(&self, app: &AppRecord, ctx: &CheckContext) -> bool {
        ctx.github_repo(&app.bundle_id).is_some()
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let slug = match ctx.github_repo(&app.bundle_id) {
            Some(s) => s,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no repo mapping".to_string(),
                })
            }
        };
        let (owner, repo) = match slug.split_once('/') {
            Some(pair) => pair,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: format!("malformed repo slug {slug}"),
                })
            }
        };

        let found =
            check_github_release(owner, repo, installed_version(app), &ctx.http).await?;
        Ok(match found {
            Some(update) => ProbeResult::Found(update),
            None => ProbeResult::NotFound,
        })
    }
}

// ---------------------------------------------------------------------------
// Electron (electron-builder app-update.yml)
// ---------------------------------------------------------------------------

pub struct ElectronChecker;

struct ElectronUpdateConfig {
    provider: String,
    owner: Option<String>,
    repo: Option<String>,
    url: Option<String>,
}

/// electron-builder's app-update.yml is flat key: value YAML.
fn parse_update_yml(content: &str) -> Option<ElectronUpdateConfig> {
    let mut provider = None;
    let mut owner = None;
    let mut repo = None;
    let mut url = None;

    for line in content.lines() {
        if let Some((key, value)) = line.trim().split_once(':') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key.trim() {
                "provider" => provider = Some(value.to_string()),
                "owner" => owner = Some(value.to_string()),
                "repo" => repo = Some(value.to_string()),
                "url" => url = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Some(ElectronUpdateConfig {
        provider: provider?,
        owner,
        repo,
        url,
    })
}

/// `version: 1.2.3` out of a latest-mac.yml document.
fn parse_latest_mac_yml(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "version" {
            let v = value.trim().trim_matches('"').trim_matches('\'');
            (!v.is_empty()).then(|| v.to_string())
        } else {
            None
        }
    })
}

#[async_trait]
impl UpdateChecker for ElectronChecker {
    fn source_type(&self) -> SourceType {
        SourceType::Electron
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        app_path(app).map_or(false, platform::is_electron_app)
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let path = match app_path(app) {
            Some(p) => p,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no bundle path".to_string(),
                })
            }
        };
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };

        let resources = path.join("Contents/Resources");
        let yml_path = [
            resources.join("app-update.yml"),
            resources.join("dev-app-update.yml"),
        ]
        .into_iter()
        .find(|p| p.exists());
        let yml_path = match yml_path {
            Some(p) => p,
            None => return Ok(ProbeResult::NotFound),
        };

        let content = std::fs::read_to_string(&yml_path)?;
        let config = match parse_update_yml(&content) {
            Some(c) => c,
            None => return Ok(ProbeResult::NotFound),
        };

        match config.provider.as_str() {
            "github" => {
                let (owner, repo) = match (config.owner, config.repo) {
                    (Some(o), Some(r)) => (o, r),
                    _ => return Ok(ProbeResult::NotFound),
                };
                let found =
                    check_github_release(&owner, &repo, Some(current), &ctx.http).await?;
                Ok(match found {
                    Some(update) => ProbeResult::Found(update),
                    None => ProbeResult::NotFound,
                })
            }
            "generic" => {
                let base = match config.url {
                    Some(u) => u,
                    None => return Ok(ProbeResult::NotFound),
                };
                let manifest_url = format!("{}/latest-mac.yml", base.trim_end_matches('/'));
                let body = ctx.http.get_text(&manifest_url, true).await?;
                match parse_latest_mac_yml(&body) {
                    Some(latest) if version::is_newer(current, &latest) => {
                        Ok(ProbeResult::Found(FoundUpdate::version_only(latest)))
                    }
                    _ => Ok(ProbeResult::NotFound),
                }
            }
            other => Ok(ProbeResult::Skipped {
                reason: format!("unsupported provider {other}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Keystone (Google updater)
// ---------------------------------------------------------------------------

pub struct KeystoneChecker;

const KEYSTONE_BUNDLE_IDS: &[&str] = &[
    "com.google.Chrome",
    "com.google.Chrome.canary",
    "com.google.drivefs",
    "com.google.GoogleUpdater",
];

#[async_trait]
impl UpdateChecker for KeystoneChecker {
    fn source_type(&self) -> SourceType {
        SourceType::Keystone
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        app.install_source != InstallSource::MacAppStore
            && KEYSTONE_BUNDLE_IDS.contains(&app.bundle_id.as_str())
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };

        if app.bundle_id == "com.google.Chrome" || app.bundle_id == "com.google.Chrome.canary" {
            let channel = if app.bundle_id.ends_with("canary") {
                "Canary"
            } else {
                "Stable"
            };
            let url = format!(
                "https://chromiumdash.appspot.com/fetch_releases?channel={channel}&platform=Mac&num=1"
            );
            let releases = ctx.http.get_json(&url, true).await?;
            if let Some(latest) = releases
                .as_array()
                .and_then(|arr| arr.first())
                .and_then(|r| r.get("version"))
                .and_then(|v| v.as_str())
            {
                if version::is_newer(current, latest) {
                    return Ok(ProbeResult::Found(FoundUpdate {
                        release_notes_url: Some(
                            "https://chromereleases.googleblog.com/".to_string(),
                        ),
                        ..FoundUpdate::version_only(latest)
                    }));
                }
            }
            return Ok(ProbeResult::NotFound);
        }

        // Other Google apps: the cask index knows their versions.
        if let Some(ref index) = ctx.cask_index {
            if let Some(release) = index.lookup(&app.bundle_id, app_path(app)) {
                if version::is_newer(current, &release.version) {
                    return Ok(ProbeResult::Found(FoundUpdate::version_only(
                        release.version.clone(),
                    )));
                }
            }
        }
        Ok(ProbeResult::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Microsoft AutoUpdate
// ---------------------------------------------------------------------------

pub struct MicrosoftAutoupdateChecker;

fn microsoft_cask_tokens() -> &'static HashMap<&'static str, &'static str> {
    static TOKENS: OnceLock<HashMap<&str, &str>> = OnceLock::new();
    TOKENS.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("com.microsoft.Word", "microsoft-word");
        m.insert("com.microsoft.Excel", "microsoft-excel");
        m.insert("com.microsoft.Powerpoint", "microsoft-powerpoint");
        m.insert("com.microsoft.Outlook", "microsoft-outlook");
        m.insert("com.microsoft.onenote.mac", "microsoft-onenote");
        m.insert("com.microsoft.teams2", "microsoft-teams");
        m.insert("com.microsoft.OneDrive", "microsoft-onedrive");
        m.insert("com.microsoft.edgemac", "microsoft-edge");
        m.insert("com.microsoft.VSCode", "visual-studio-code");
        m
    })
}

#[async_trait]
impl UpdateChecker for MicrosoftAutoupdateChecker {
    fn source_type(&self) -> SourceType {
        SourceType::MicrosoftAutoupdate
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        app.install_source != InstallSource::MacAppStore
            && microsoft_cask_tokens().contains_key(app.bundle_id.as_str())
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };

        if let Some(ref index) = ctx.cask_index {
            if let Some(release) = index.lookup(&app.bundle_id, app_path(app)) {
                if version::is_newer(current, &release.version) {
                    return Ok(ProbeResult::Found(FoundUpdate::version_only(
                        release.version.clone(),
                    )));
                }
                return Ok(ProbeResult::NotFound);
            }
        }

        // Fallback: hardcoded token against the brew outdated map.
        if let Some(token) = microsoft_cask_tokens().get(app.bundle_id.as_str()) {
            if let Some(outdated) = ctx.outdated_casks.get(*token) {
                if version::is_newer(current, &outdated.current_version) {
                    return Ok(ProbeResult::Found(FoundUpdate::version_only(
                        outdated.current_version.clone(),
                    )));
                }
            }
        }
        Ok(ProbeResult::NotFound)
    }
}

// ---------------------------------------------------------------------------
// JetBrains Toolbox
// ---------------------------------------------------------------------------

pub struct JetbrainsToolboxChecker;

fn jetbrains_product_codes() -> &'static HashMap<&'static str, &'static str> {
    static CODES: OnceLock<HashMap<&str, &str>> = OnceLock::new();
    CODES.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("com.jetbrains.intellij", "IIU");
        m.insert("com.jetbrains.intellij.ce", "IIC");
        m.insert("com.jetbrains.WebStorm", "WS");
        m.insert("com.jetbrains.PhpStorm", "PS");
        m.insert("com.jetbrains.CLion", "CL");
        m.insert("com.jetbrains.goland", "GO");
        m.insert("com.jetbrains.rider", "RD");
        m.insert("com.jetbrains.pycharm", "PY");
        m.insert("com.jetbrains.pycharm.ce", "PC");
        m.insert("com.jetbrains.rubymine", "RM");
        m.insert("com.jetbrains.datagrip", "DG");
        m.insert("com.jetbrains.fleet", "FL");
        m.insert("com.jetbrains.toolbox", "TBA");
        m
    })
}

#[async_trait]
impl UpdateChecker for JetbrainsToolboxChecker {
    fn source_type(&self) -> SourceType {
        SourceType::JetbrainsToolbox
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        jetbrains_product_codes().contains_key(app.bundle_id.as_str())
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };
        let code = match jetbrains_product_codes().get(app.bundle_id.as_str()) {
            Some(c) => *c,
            None => return Ok(ProbeResult::NotFound),
        };

        let url = format!(
            "https://data.services.jetbrains.com/products/releases?code={code}&latest=true&type=release"
        );
        let json = ctx.http.get_json(&url, true).await?;
        let release = json.get(code).and_then(|arr| arr.as_array()).and_then(|a| a.first());

        let latest = release
            .and_then(|r| r.get("version"))
            .and_then(|v| v.as_str());
        let download_url = release
            .and_then(|r| r.get("downloads"))
            .and_then(|d| d.get("mac"))
            .and_then(|m| m.get("link"))
            .and_then(|v| v.as_str())
            .map(String::from);

        match latest {
            Some(latest) if version::is_newer(current, latest) => {
                Ok(ProbeResult::Found(FoundUpdate {
                    download_url,
                    ..FoundUpdate::version_only(latest)
                }))
            }
            _ => Ok(ProbeResult::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// Adobe Creative Cloud
// ---------------------------------------------------------------------------

pub struct AdobeCcChecker;

const ADOBE_BUNDLE_IDS: &[&str] = &[
    "com.adobe.Photoshop",
    "com.adobe.Illustrator",
    "com.adobe.InDesign",
    "com.adobe.Lightroom",
    "com.adobe.LightroomClassicCC",
    "com.adobe.PremierePro",
    "com.adobe.AfterEffects",
    "com.adobe.Acrobat.Pro",
    "com.adobe.Reader",
    "com.adobe.AdobeMediaEncoder",
    "com.adobe.Audition",
    "com.adobe.Animate",
    "com.adobe.Dreamweaver",
    "com.adobe.bridge",
    "com.adobe.dimension",
    "com.adobe.InCopy",
    "com.adobe.Fresco",
    "com.adobe.XD",
];

#[async_trait]
impl UpdateChecker for AdobeCcChecker {
    fn source_type(&self) -> SourceType {
        SourceType::AdobeCc
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        ADOBE_BUNDLE_IDS
            .iter()
            .any(|id| app.bundle_id.eq_ignore_ascii_case(id))
    }

    /// Purely passive: reports the version the cask index publishes. Never
    /// starts the Creative Cloud helper; that only happens when the user
    /// executes the resulting candidate.
    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };

        if let Some(ref index) = ctx.cask_index {
            if let Some(release) = index.lookup(&app.bundle_id, app_path(app)) {
                if version::is_newer(current, &release.version) {
                    return Ok(ProbeResult::Found(FoundUpdate {
                        notes: Some("Applied through Adobe Creative Cloud".to_string()),
                        ..FoundUpdate::version_only(release.version.clone())
                    }));
                }
            }
        }
        Ok(ProbeResult::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Mozilla
// ---------------------------------------------------------------------------

pub struct MozillaChecker;

struct MozillaProduct {
    api_url: &'static str,
    version_key: &'static str,
}

fn mozilla_products() -> &'static HashMap<&'static str, MozillaProduct> {
    static PRODUCTS: OnceLock<HashMap<&str, MozillaProduct>> = OnceLock::new();
    PRODUCTS.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert(
            "org.mozilla.firefox",
            MozillaProduct {
                api_url: "https://product-details.mozilla.org/1.0/firefox_versions.json",
                version_key: "LATEST_FIREFOX_VERSION",
            },
        );
        m.insert(
            "org.mozilla.nightly",
            MozillaProduct {
                api_url: "https://product-details.mozilla.org/1.0/firefox_versions.json",
                version_key: "LATEST_FIREFOX_NIGHTLY_VERSION",
            },
        );
        m.insert(
            "org.mozilla.firefoxdeveloperedition",
            MozillaProduct {
                api_url: "https://product-details.mozilla.org/1.0/firefox_versions.json",
                version_key: "LATEST_FIREFOX_DEVEL_VERSION",
            },
        );
        m.insert(
            "org.mozilla.thunderbird",
            MozillaProduct {
                api_url: "https://product-details.mozilla.org/1.0/thunderbird_versions.json",
                version_key: "LATEST_THUNDERBIRD_VERSION",
            },
        );
        m
    })
}

#[async_trait]
impl UpdateChecker for MozillaChecker {
    fn source_type(&self) -> SourceType {
        SourceType::Mozilla
    }

    fn applicable(&self, app: &AppRecord, _ctx: &CheckContext) -> bool {
        mozilla_products().contains_key(app.bundle_id.as_str())
    }

    async fn probe(&self, app: &AppRecord, ctx: &CheckContext) -> EngineResult<ProbeResult> {
        let current = match installed_version(app) {
            Some(v) => v,
            None => {
                return Ok(ProbeResult::Skipped {
                    reason: "no installed version".to_string(),
                })
            }
        };
        let product = match mozilla_products().get(app.bundle_id.as_str()) {
            Some(p) => p,
            None => return Ok(ProbeResult::NotFound),
        };

        let versions = ctx.http.get_json(product.api_url, true).await?;
        let available = match versions.get(product.version_key).and_then(|v| v.as_str()) {
            Some(v) => v,
            None => return Ok(ProbeResult::NotFound),
        };

        if version::is_newer(current, available) {
            return Ok(ProbeResult::Found(FoundUpdate {
                release_notes_url: Some(format!(
                    "https://www.mozilla.org/en-US/firefox/{available}/releasenotes/"
                )),
                ..FoundUpdate::version_only(available)
            }));
        }
        Ok(ProbeResult::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(bundle_id: &str) -> AppRecord {
        AppRecord {
            id: 1,
            bundle_id: bundle_id.to_string(),
            display_name: "Test".to_string(),
            app_path: Some(format!("/Applications/{bundle_id}.app")),
            installed_version: Some("1.0.0".to_string()),
            bundle_version: None,
            icon_cache_path: None,
            architectures: None,
            install_source: InstallSource::Direct,
            homebrew_cask_token: None,
            homebrew_formula_name: None,
            mas_app_id: None,
            sparkle_feed_url: None,
            is_ignored: false,
            first_seen_at: None,
            last_seen_at: None,
        }
    }

    fn ctx() -> CheckContext {
        CheckContext {
            http: Arc::new(HttpFetcher::new().unwrap()),
            outdated_casks: Arc::new(HashMap::new()),
            outdated_formulae: Arc::new(HashMap::new()),
            cask_index: None,
            host_os_version: Some("14.2".to_string()),
            xcode_clt_installed: Some(true),
        }
    }

    #[test]
    fn sparkle_applicability_uses_cached_feed_url() {
        let ctx = ctx();
        let mut app = record("com.example.app");
        assert!(!SparkleChecker.applicable(&app, &ctx));
        app.sparkle_feed_url = Some("https://example.com/appcast.xml".to_string());
        assert!(SparkleChecker.applicable(&app, &ctx));

        app.install_source = InstallSource::MacAppStore;
        assert!(!SparkleChecker.applicable(&app, &ctx));
    }

    #[test]
    fn homebrew_cask_applicability_requires_token() {
        let ctx = ctx();
        let mut app = record("com.bitwarden.desktop");
        assert!(!HomebrewCaskChecker.applicable(&app, &ctx));
        app.homebrew_cask_token = Some("bitwarden".to_string());
        assert!(HomebrewCaskChecker.applicable(&app, &ctx));
    }

    #[test]
    fn github_applicability_uses_builtin_table() {
        let ctx = ctx();
        assert!(GithubChecker.applicable(&record("com.bitwarden.desktop"), &ctx));
        assert!(!GithubChecker.applicable(&record("com.example.unknown"), &ctx));
    }

    #[test]
    fn vendor_checkers_match_their_allowlists() {
        let ctx = ctx();
        assert!(KeystoneChecker.applicable(&record("com.google.Chrome"), &ctx));
        assert!(!KeystoneChecker.applicable(&record("com.example.app"), &ctx));
        assert!(MicrosoftAutoupdateChecker.applicable(&record("com.microsoft.Word"), &ctx));
        assert!(JetbrainsToolboxChecker.applicable(&record("com.jetbrains.goland"), &ctx));
        assert!(AdobeCcChecker.applicable(&record("com.adobe.Photoshop"), &ctx));
        assert!(MozillaChecker.applicable(&record("org.mozilla.firefox"), &ctx));
    }

    #[test]
    fn mas_apps_are_excluded_from_non_mas_checkers() {
        let ctx = ctx();
        let mut app = record("com.google.Chrome");
        app.install_source = InstallSource::MacAppStore;
        assert!(!KeystoneChecker.applicable(&app, &ctx));
        assert!(!HomebrewApiChecker.applicable(&app, &ctx));
    }

    #[test]
    fn browser_extensions_never_match_homebrew() {
        let ctx = ctx();
        let app = record("com.google.Chrome.app.abcdef");
        assert!(is_browser_extension(&app.bundle_id));
        assert!(!HomebrewApiChecker.applicable(&app, &ctx));
    }

    #[test]
    fn electron_yml_parsing() {
        let cfg = parse_update_yml(
            "provider: github\nowner: signalapp\nrepo: Signal-Desktop\nupdaterCacheDirName: x\n",
        )
        .unwrap();
        assert_eq!(cfg.provider, "github");
        assert_eq!(cfg.owner.as_deref(), Some("signalapp"));
        assert_eq!(cfg.repo.as_deref(), Some("Signal-Desktop"));

        assert!(parse_update_yml("owner: x\n").is_none());
    }

    #[test]
    fn latest_mac_yml_parsing() {
        let v = parse_latest_mac_yml("version: 5.1.2\nfiles:\n  - url: App.zip\n");
        assert_eq!(v.as_deref(), Some("5.1.2"));
        assert!(parse_latest_mac_yml("files:\n").is_none());
    }

    #[test]
    fn macos_asset_selection_prefers_universal() {
        let assets = vec![
            GithubAsset {
                name: "App-1.0-win.exe".into(),
                browser_download_url: "https://x/win".into(),
            },
            GithubAsset {
                name: "App-1.0-mac-x86_64.dmg".into(),
                browser_download_url: "https://x/intel".into(),
            },
            GithubAsset {
                name: "App-1.0-mac-universal.dmg".into(),
                browser_download_url: "https://x/universal".into(),
            },
        ];
        let best = find_macos_asset(&assets).unwrap();
        assert_eq!(best.browser_download_url, "https://x/universal");
    }

    #[test]
    fn plain_dmg_accepted_when_unflavored() {
        let assets = vec![GithubAsset {
            name: "App-1.0.dmg".into(),
            browser_download_url: "https://x/dmg".into(),
        }];
        assert!(find_macos_asset(&assets).is_some());

        let linux_only = vec![GithubAsset {
            name: "App-1.0-linux.deb".into(),
            browser_download_url: "https://x/deb".into(),
        }];
        assert!(find_macos_asset(&linux_only).is_none());
    }

    #[test]
    fn github_release_parse_skips_prereleases_and_old_tags() {
        let release = GithubRelease {
            tag_name: "v2.0.0".into(),
            html_url: "https://github.com/x/y/releases/tag/v2.0.0".into(),
            prerelease: true,
            draft: false,
            body: None,
            assets: vec![],
        };
        assert!(parse_github_release(release, Some("1.0.0")).is_none());

        let release = GithubRelease {
            tag_name: "v2.0.0".into(),
            html_url: "https://github.com/x/y/releases/tag/v2.0.0".into(),
            prerelease: false,
            draft: false,
            body: Some("notes".into()),
            assets: vec![],
        };
        let found = parse_github_release(release, Some("1.0.0")).unwrap();
        assert_eq!(found.version, "2.0.0");
        assert_eq!(found.release_notes.as_deref(), Some("notes"));

        let release = GithubRelease {
            tag_name: "v0.9.0".into(),
            html_url: "x".into(),
            prerelease: false,
            draft: false,
            body: None,
            assets: vec![],
        };
        assert!(parse_github_release(release, Some("1.0.0")).is_none());
    }
}
