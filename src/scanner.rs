//! App inventory scanner.
//!
//! Walks the configured roots for `.app` bundles, synthesizes rows for
//! CLI-only casks and Homebrew formulae, merges duplicates across
//! discovery paths, persists the catalog, and extracts icons. Unreachable
//! roots degrade to warnings; a scan with one good root is a good scan.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::brew;
use crate::cancel::CancelToken;
use crate::db::{Db, EngineDirs};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::models::{DiscoveredApp, InstallSource};
use crate::platform;
use crate::settings::{expand_tilde, Settings};

/// Per-root walk deadline.
const ROOT_TIMEOUT: Duration = Duration::from_secs(60);
/// Bundles parsed between cooperative yields.
const PARSE_BATCH: usize = 16;
/// Concurrent icon extractions.
const ICON_CONCURRENCY: usize = 16;
const ICON_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Scanner {
    db: Arc<Mutex<Db>>,
    events: EventBus,
    dirs: EngineDirs,
}

impl Scanner {
    pub fn new(db: Arc<Mutex<Db>>, events: EventBus, dirs: EngineDirs) -> Self {
        Self { db, events, dirs }
    }

    /// One full scan. Returns the number of distinct apps observed.
    pub async fn run(&self, settings: &Settings, cancel: &CancelToken) -> EngineResult<usize> {
        let start = std::time::Instant::now();
        let started_at = Utc::now().to_rfc3339();

        self.events.emit(EngineEvent::ScanProgress {
            phase: "Starting".to_string(),
            current: 0,
            total: 4,
            app_name: None,
        });

        let roots = collect_roots(&settings.scan_roots);
        let depth = settings.scan_depth.clamp(1, 3);

        // Phase 1: walk roots for bundles.
        let mut bundle_paths: Vec<PathBuf> = Vec::new();
        for root in &roots {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !root.is_dir() {
                log::warn!("scan root unreachable, skipping: {}", root.display());
                self.events.emit(EngineEvent::ScanProgress {
                    phase: format!("Skipping unreachable {}", root.display()),
                    current: 1,
                    total: 4,
                    app_name: None,
                });
                continue;
            }

            let root_clone = root.clone();
            let walked = tokio::time::timeout(
                ROOT_TIMEOUT,
                tokio::task::spawn_blocking(move || walk_root(&root_clone, depth)),
            )
            .await;
            match walked {
                Ok(Ok(paths)) => bundle_paths.extend(paths),
                Ok(Err(e)) => log::warn!("walk of {} panicked: {e}", root.display()),
                Err(_) => log::warn!("walk of {} timed out", root.display()),
            }
        }

        // Phase 2: parse bundles, yielding between batches.
        self.events.emit(EngineEvent::ScanProgress {
            phase: "Reading bundles".to_string(),
            current: 2,
            total: 4,
            app_name: None,
        });

        let mut discovered: Vec<DiscoveredApp> = Vec::new();
        for (i, path) in bundle_paths.iter().enumerate() {
            if i % PARSE_BATCH == 0 {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                tokio::task::yield_now().await;
            }
            if let Some(app) = parse_bundle_entry(path) {
                self.events.emit(EngineEvent::ScanProgress {
                    phase: "Reading bundles".to_string(),
                    current: 2,
                    total: 4,
                    app_name: Some(app.display_name.clone()),
                });
                discovered.push(app);
            }
        }

        // Phase 3: package-manager and store enrichment.
        self.events.emit(EngineEvent::ScanProgress {
            phase: "Querying package managers".to_string(),
            current: 3,
            total: 4,
            app_name: None,
        });

        let (casks, formulae, mas_ids) = tokio::join!(
            brew::list_installed_casks(),
            brew::list_installed_formulae(),
            mas_app_ids(),
        );
        let synthetic_casks = synthesize_cask_apps(&casks, &discovered);
        discovered.extend(synthetic_casks);
        discovered.extend(synthesize_formula_apps(&formulae));
        apply_cask_tokens(&mut discovered, &casks);
        apply_mas_ids(&mut discovered, &mas_ids);

        let merged = deduplicate(discovered);
        let count = merged.len();
        let seen_ids: Vec<String> = merged.iter().map(|a| a.bundle_id.clone()).collect();

        // Phase 4: persist and finalize.
        self.events.emit(EngineEvent::ScanProgress {
            phase: "Finalizing".to_string(),
            current: 4,
            total: 4,
            app_name: None,
        });

        let finished_at = Utc::now().to_rfc3339();
        {
            let mut db = self.db.lock().await;
            for app in &merged {
                if let Err(e) = db.upsert_app(app) {
                    log::warn!("upsert failed for {}: {e}", app.bundle_id);
                }
            }
            db.mark_scan_complete(&settings.scan_roots, &started_at, &finished_at, &seen_ids)?;

            // Rows whose bundle disappeared keep their identity but lose
            // their installed version.
            let seen: HashSet<&str> = seen_ids.iter().map(String::as_str).collect();
            let all = db.get_all_records()?;
            for record in all {
                if seen.contains(record.bundle_id.as_str()) {
                    continue;
                }
                if let Some(path) = record.app_path.as_deref() {
                    if !Path::new(path).exists() && record.installed_version.is_some() {
                        let _ = db.clear_installed_version(&record.bundle_id);
                        let _ = db.put_candidate(&record.bundle_id, None);
                    }
                }
            }
        }

        self.extract_icons(&merged).await;

        self.events.emit(EngineEvent::ScanComplete {
            app_count: count,
            duration_ms: start.elapsed().as_millis() as u64,
        });
        Ok(count)
    }

    /// Bounded-concurrency icon pass over file-backed apps.
    async fn extract_icons(&self, apps: &[DiscoveredApp]) {
        let icons_dir = Arc::new(self.dirs.icons.clone());
        let targets: Vec<(String, String)> = apps
            .iter()
            .filter_map(|a| {
                a.app_path
                    .as_ref()
                    .map(|p| (a.bundle_id.clone(), p.clone()))
            })
            .collect();

        let results: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        stream::iter(targets)
            .for_each_concurrent(ICON_CONCURRENCY, |(bundle_id, app_path)| {
                let icons_dir = icons_dir.clone();
                let results = results.clone();
                async move {
                    let bid = bundle_id.clone();
                    let task = tokio::task::spawn_blocking(move || {
                        platform::extract_icon(Path::new(&app_path), &bid, &icons_dir)
                    });
                    match tokio::time::timeout(ICON_TIMEOUT, task).await {
                        Ok(Ok(Some(icon_path))) => {
                            results.lock().await.push((bundle_id, icon_path));
                        }
                        Ok(Ok(None)) => log::debug!("no icon for {bundle_id}"),
                        Ok(Err(e)) => log::debug!("icon task failed for {bundle_id}: {e}"),
                        Err(_) => log::debug!("icon extraction timed out for {bundle_id}"),
                    }
                }
            })
            .await;

        let results = results.lock().await;
        if results.is_empty() {
            return;
        }
        let mut db = self.db.lock().await;
        for (bundle_id, icon_path) in results.iter() {
            let _ = db.update_icon_cache_path(bundle_id, icon_path);
        }
    }
}

/// Configured roots (tilde-expanded) plus auto-discovered
/// `/Volumes/*/Applications` directories. Volume roots themselves are never
/// scanned: `/Volumes/Macintosh HD` loops back to `/`.
fn collect_roots(configured: &[String]) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    for loc in configured {
        let expanded = expand_tilde(loc);
        if !roots.contains(&expanded) {
            roots.push(expanded);
        }
    }
    if let Ok(entries) = std::fs::read_dir("/Volumes") {
        for entry in entries.flatten() {
            let apps_dir = entry.path().join("Applications");
            if apps_dir.is_dir() && !roots.contains(&apps_dir) {
                roots.push(apps_dir);
            }
        }
    }
    roots
}

/// Depth-bounded walk: depth 1 is the root's own entries, each extra level
/// descends one directory further. `.app` bundles terminate descent.
fn walk_root(root: &Path, depth: u32) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk_level(root, 1, depth, &mut found);
    found
}

fn walk_level(dir: &Path, level: u32, max_depth: u32, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("unreadable directory {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.ends_with(".app") {
            found.push(path);
        } else if path.is_dir() && level < max_depth && !name.starts_with('.') {
            walk_level(&path, level + 1, max_depth, found);
        }
    }
}

fn parse_bundle_entry(path: &Path) -> Option<DiscoveredApp> {
    let meta = platform::parse_bundle(path)?;
    let source = platform::detect_install_source(path);
    let architectures = platform::read_architectures(path, meta.executable.as_deref());

    Some(DiscoveredApp {
        bundle_id: meta.bundle_id,
        display_name: meta.display_name,
        app_path: Some(meta.app_path),
        installed_version: meta.installed_version,
        bundle_version: meta.bundle_version,
        install_source: source,
        architectures,
        sparkle_feed_url: meta.sparkle_feed_url,
        homebrew_cask_token: None,
        homebrew_formula_name: None,
        mas_app_id: None,
    })
}

/// Synthetic rows for casks with no `.app` artifact (docker and friends),
/// so CLI-only tools flow through the same pipeline.
fn synthesize_cask_apps(
    casks: &[brew::InstalledCask],
    discovered: &[DiscoveredApp],
) -> Vec<DiscoveredApp> {
    let known_paths: HashSet<&str> = discovered
        .iter()
        .filter_map(|a| a.app_path.as_deref())
        .collect();

    casks
        .iter()
        .filter(|cask| match &cask.app_artifact {
            // App-backed casks are merged via token application instead.
            Some(artifact) => {
                let path = format!("/Applications/{artifact}");
                !known_paths.contains(path.as_str()) && !Path::new(&path).exists()
            }
            None => true,
        })
        .map(|cask| DiscoveredApp {
            bundle_id: DiscoveredApp::cask_bundle_id(&cask.token),
            display_name: cask.name.clone(),
            app_path: None,
            installed_version: cask
                .installed_version
                .clone()
                .or_else(|| Some(cask.version.clone())),
            bundle_version: None,
            install_source: InstallSource::Homebrew,
            architectures: None,
            sparkle_feed_url: None,
            homebrew_cask_token: Some(cask.token.clone()),
            homebrew_formula_name: None,
            mas_app_id: None,
        })
        .collect()
}

fn synthesize_formula_apps(formulae: &[brew::InstalledFormula]) -> Vec<DiscoveredApp> {
    formulae
        .iter()
        .map(|f| DiscoveredApp {
            bundle_id: DiscoveredApp::formula_bundle_id(&f.name),
            display_name: f.name.clone(),
            app_path: None,
            installed_version: f.installed_version.clone(),
            bundle_version: None,
            install_source: InstallSource::HomebrewFormula,
            architectures: None,
            sparkle_feed_url: None,
            homebrew_cask_token: None,
            homebrew_formula_name: Some(f.name.clone()),
            mas_app_id: None,
        })
        .collect()
}

/// Cross-reference walked bundles with installed casks: a bundle whose
/// filename matches a cask's app artifact is Homebrew-managed.
fn apply_cask_tokens(discovered: &mut [DiscoveredApp], casks: &[brew::InstalledCask]) {
    let by_artifact: HashMap<&str, &brew::InstalledCask> = casks
        .iter()
        .filter_map(|c| c.app_artifact.as_deref().map(|a| (a, c)))
        .collect();

    for app in discovered.iter_mut() {
        if app.homebrew_cask_token.is_some() {
            continue;
        }
        let filename = app
            .app_path
            .as_deref()
            .and_then(|p| Path::new(p).file_name())
            .and_then(|n| n.to_str());
        if let Some(cask) = filename.and_then(|f| by_artifact.get(f)) {
            app.homebrew_cask_token = Some(cask.token.clone());
            if app.install_source == InstallSource::Direct
                || app.install_source == InstallSource::Unknown
            {
                app.install_source = InstallSource::Homebrew;
            }
            if app.installed_version.is_none() {
                app.installed_version = cask.installed_version.clone();
            }
        }
    }
}

/// `mas list` output → display name → store id.
async fn mas_app_ids() -> HashMap<String, String> {
    if !platform::is_mas_cli_installed() {
        return HashMap::new();
    }
    let output = match platform::run_command_with_timeout("mas", &["list"], 15).await {
        Ok(o) if o.status.success() => o,
        _ => return HashMap::new(),
    };
    parse_mas_list(&String::from_utf8_lossy(&output.stdout))
}

/// Lines look like `497799835  Xcode  (15.2)`.
fn parse_mas_list(stdout: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, rest) = match line.split_once(char::is_whitespace) {
            Some(pair) => pair,
            None => continue,
        };
        if !id.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let rest = rest.trim();
        let name = match rest.rfind('(') {
            Some(pos) => rest[..pos].trim(),
            None => rest,
        };
        if !name.is_empty() {
            map.insert(name.to_string(), id.to_string());
        }
    }
    map
}

fn apply_mas_ids(discovered: &mut [DiscoveredApp], mas_ids: &HashMap<String, String>) {
    if mas_ids.is_empty() {
        return;
    }
    for app in discovered.iter_mut() {
        if app.mas_app_id.is_some() {
            continue;
        }
        if let Some(id) = mas_ids.get(&app.display_name) {
            app.mas_app_id = Some(id.clone());
            if app.install_source == InstallSource::Direct
                || app.install_source == InstallSource::Unknown
            {
                app.install_source = InstallSource::MacAppStore;
            }
        }
    }
}

/// Merge duplicates across discovery paths by bundle id. Store and brew
/// provenance beat plain directory classification; first non-null metadata
/// wins otherwise.
fn deduplicate(apps: Vec<DiscoveredApp>) -> Vec<DiscoveredApp> {
    let mut by_bundle_id: HashMap<String, DiscoveredApp> = HashMap::new();

    for app in apps {
        if app.bundle_id.is_empty() {
            continue;
        }
        match by_bundle_id.get_mut(&app.bundle_id) {
            Some(existing) => merge_into(existing, &app),
            None => {
                by_bundle_id.insert(app.bundle_id.clone(), app);
            }
        }
    }

    let mut result: Vec<DiscoveredApp> = by_bundle_id.into_values().collect();
    result.sort_by(|a, b| {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
    });
    result
}

fn merge_into(existing: &mut DiscoveredApp, new: &DiscoveredApp) {
    if existing.display_name.is_empty() && !new.display_name.is_empty() {
        existing.display_name = new.display_name.clone();
    }
    if existing.app_path.is_none() {
        existing.app_path = new.app_path.clone();
    }
    if existing.installed_version.is_none() {
        existing.installed_version = new.installed_version.clone();
    }
    if existing.bundle_version.is_none() {
        existing.bundle_version = new.bundle_version.clone();
    }

    if existing.install_source == InstallSource::Unknown
        && new.install_source != InstallSource::Unknown
    {
        existing.install_source = new.install_source;
    }
    if new.install_source == InstallSource::Homebrew {
        existing.install_source = InstallSource::Homebrew;
        if new.homebrew_cask_token.is_some() {
            existing.homebrew_cask_token = new.homebrew_cask_token.clone();
        }
    }
    if new.install_source == InstallSource::MacAppStore {
        existing.install_source = InstallSource::MacAppStore;
    }

    if existing.homebrew_cask_token.is_none() {
        existing.homebrew_cask_token = new.homebrew_cask_token.clone();
    }
    if existing.homebrew_formula_name.is_none() {
        existing.homebrew_formula_name = new.homebrew_formula_name.clone();
    }
    if existing.architectures.is_none() {
        existing.architectures = new.architectures.clone();
    }
    if existing.sparkle_feed_url.is_none() {
        existing.sparkle_feed_url = new.sparkle_feed_url.clone();
    }
    if existing.mas_app_id.is_none() {
        existing.mas_app_id = new.mas_app_id.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_bundle(dir: &Path, name: &str) {
        let contents = dir.join(format!("{name}.app")).join("Contents");
        fs::create_dir_all(&contents).unwrap();
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "CFBundleIdentifier".into(),
            plist::Value::String(format!("com.example.{}", name.to_lowercase())),
        );
        dict.insert("CFBundleName".into(), plist::Value::String(name.into()));
        dict.insert(
            "CFBundleShortVersionString".into(),
            plist::Value::String("1.0".into()),
        );
        plist::Value::Dictionary(dict)
            .to_file_xml(contents.join("Info.plist"))
            .unwrap();
    }

    #[test]
    fn depth_one_sees_only_root_entries() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bundle(tmp.path(), "Top");
        let sub = tmp.path().join("Utilities");
        fs::create_dir_all(&sub).unwrap();
        fake_bundle(&sub, "Nested");

        let found = walk_root(tmp.path(), 1);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("Top.app"));
    }

    #[test]
    fn depth_two_descends_one_subfolder() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bundle(tmp.path(), "Top");
        let sub = tmp.path().join("Utilities");
        fs::create_dir_all(&sub).unwrap();
        fake_bundle(&sub, "Nested");
        let subsub = sub.join("Deeper");
        fs::create_dir_all(&subsub).unwrap();
        fake_bundle(&subsub, "TooDeep");

        let mut found = walk_root(tmp.path(), 2);
        found.sort();
        assert_eq!(found.len(), 2);

        let found3 = walk_root(tmp.path(), 3);
        assert_eq!(found3.len(), 3);
    }

    #[test]
    fn bundles_are_not_recursed_into() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bundle(tmp.path(), "Outer");
        // A bundle nested inside another bundle must not be found.
        let inner_dir = tmp.path().join("Outer.app/Contents/Helpers");
        fs::create_dir_all(&inner_dir).unwrap();
        fake_bundle(&inner_dir, "Helper");

        let found = walk_root(tmp.path(), 3);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn hidden_directories_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".hidden");
        fs::create_dir_all(&hidden).unwrap();
        fake_bundle(&hidden, "Sneaky");

        assert!(walk_root(tmp.path(), 3).is_empty());
    }

    #[test]
    fn mas_list_parsing() {
        let out = "497799835  Xcode  (15.2)\n409183694 Keynote (13.1)\n\nnot-a-line\n";
        let map = parse_mas_list(out);
        assert_eq!(map.get("Xcode").map(String::as_str), Some("497799835"));
        assert_eq!(map.get("Keynote").map(String::as_str), Some("409183694"));
        assert_eq!(map.len(), 2);
    }

    fn plain(bundle_id: &str, source: InstallSource) -> DiscoveredApp {
        DiscoveredApp {
            bundle_id: bundle_id.to_string(),
            display_name: "App".to_string(),
            app_path: Some("/Applications/App.app".to_string()),
            installed_version: Some("1.0".to_string()),
            bundle_version: None,
            install_source: source,
            architectures: None,
            sparkle_feed_url: None,
            homebrew_cask_token: None,
            homebrew_formula_name: None,
            mas_app_id: None,
        }
    }

    #[test]
    fn dedup_prefers_store_and_brew_provenance() {
        let direct = plain("com.example.app", InstallSource::Direct);
        let mut brewed = plain("com.example.app", InstallSource::Homebrew);
        brewed.homebrew_cask_token = Some("app".to_string());

        let merged = deduplicate(vec![direct, brewed]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].install_source, InstallSource::Homebrew);
        assert_eq!(merged[0].homebrew_cask_token.as_deref(), Some("app"));
    }

    #[test]
    fn dedup_keeps_first_metadata() {
        let mut a = plain("com.example.app", InstallSource::Direct);
        a.sparkle_feed_url = Some("https://example.com/feed".to_string());
        let b = plain("com.example.app", InstallSource::Direct);

        let merged = deduplicate(vec![a, b]);
        assert_eq!(
            merged[0].sparkle_feed_url.as_deref(),
            Some("https://example.com/feed")
        );
    }

    #[test]
    fn cli_only_casks_become_synthetic_rows() {
        let casks = vec![brew::InstalledCask {
            token: "docker".to_string(),
            name: "Docker CLI".to_string(),
            version: "27.0.1".to_string(),
            installed_version: Some("26.1.0".to_string()),
            app_artifact: None,
        }];
        let synthetic = synthesize_cask_apps(&casks, &[]);
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].bundle_id, "homebrew.cask.docker");
        assert!(synthetic[0].app_path.is_none());
        assert_eq!(synthetic[0].installed_version.as_deref(), Some("26.1.0"));
    }

    #[test]
    fn cask_tokens_attach_to_walked_bundles() {
        let casks = vec![brew::InstalledCask {
            token: "bitwarden".to_string(),
            name: "Bitwarden".to_string(),
            version: "2024.10.3".to_string(),
            installed_version: Some("2024.9.0".to_string()),
            app_artifact: Some("Bitwarden.app".to_string()),
        }];
        let mut discovered = vec![DiscoveredApp {
            bundle_id: "com.bitwarden.desktop".to_string(),
            display_name: "Bitwarden".to_string(),
            app_path: Some("/Applications/Bitwarden.app".to_string()),
            installed_version: Some("2024.9.0".to_string()),
            bundle_version: None,
            install_source: InstallSource::Direct,
            architectures: None,
            sparkle_feed_url: None,
            homebrew_cask_token: None,
            homebrew_formula_name: None,
            mas_app_id: None,
        }];

        apply_cask_tokens(&mut discovered, &casks);
        assert_eq!(discovered[0].homebrew_cask_token.as_deref(), Some("bitwarden"));
        assert_eq!(discovered[0].install_source, InstallSource::Homebrew);
    }
}
