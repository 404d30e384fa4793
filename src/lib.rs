//! macPlus update engine.
//!
//! A long-lived backend that inventories installed macOS applications,
//! resolves newer versions across several upstream sources, and executes
//! updates with granular progress. The GUI host consumes this crate's
//! command surface (methods on [`Engine`]) and event stream
//! ([`Engine::subscribe`]); transport between them is the host's concern.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

pub mod appcast;
pub mod brew;
pub mod cancel;
pub mod cask_index;
pub mod checkers;
pub mod db;
pub mod elevate;
pub mod errors;
pub mod events;
pub mod executors;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod platform;
pub mod resolver;
pub mod scanner;
pub mod selfupdate;
pub mod settings;
pub mod uninstall;
pub mod version;

use cancel::CancelToken;
use db::{Db, EngineDirs};
use errors::{EngineError, EngineResult};
use events::{EngineEvent, EventBus};
use http::HttpFetcher;
use models::{
    AppDetail, AppSummary, ConnectivityStatus, HistoryEntry, PermissionsStatus, SelfUpdateInfo,
    SetupStatus, UpdateCandidate, UpdateCheckDiagnostic, UpdateOutcome,
};
use orchestrator::Orchestrator;
use selfupdate::SelfUpdater;
use settings::Settings;
use uninstall::UninstallReport;

/// The engine's own bundle identifier; also names the data directory.
pub const BUNDLE_ID: &str = "com.macplus.app";

/// Startup behavior knobs. The GUI host wants the full treatment; the
/// one-shot CLI path wants neither.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Run the scan/check launch policy after startup.
    pub launch_policy: bool,
    /// Start the periodic check loop.
    pub periodic_checks: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            launch_policy: true,
            periodic_checks: true,
        }
    }
}

/// The engine handle. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Engine {
    dirs: EngineDirs,
    db: Arc<Mutex<Db>>,
    events: EventBus,
    orchestrator: Arc<Orchestrator>,
    self_updater: Arc<SelfUpdater>,
}

impl Engine {
    /// Bring the engine up: directory layout, store migrations, settings
    /// validation, the askpass helper, stale artifact cleanup, and the
    /// background loops requested by `options`.
    pub async fn start(options: EngineOptions) -> EngineResult<Self> {
        let dirs = db::ensure_engine_dirs()?;
        elevate::init_askpass(&dirs);

        // Leftover staging from a self-update that never relaunched.
        let stale = dirs.downloads.join("self-update");
        if stale.exists() {
            let _ = std::fs::remove_dir_all(&stale);
        }

        let mut store = Db::open(&dirs)?;
        settings::prune_stale_roots(&mut store)?;
        let current = settings::load(&store);
        let db = Arc::new(Mutex::new(store));

        let http = Arc::new(HttpFetcher::new()?);
        let events = EventBus::new();
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            events.clone(),
            dirs.clone(),
            http.clone(),
        ));
        let self_updater = Arc::new(SelfUpdater::new(http, events.clone(), dirs.clone()));

        if options.periodic_checks {
            orchestrator
                .clone()
                .start_periodic_checks(current.check_interval_minutes as u64);
        }
        if options.launch_policy {
            orchestrator.clone().run_launch_policy().await;
        }

        Ok(Self {
            dirs,
            db,
            events,
            orchestrator,
            self_updater,
        })
    }

    pub fn version(&self) -> &'static str {
        selfupdate::CURRENT_VERSION
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.dirs.data
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Scans and checks
    // ------------------------------------------------------------------

    /// Kick off a full scan. Returns the job id; a scan already in flight
    /// returns its id instead of starting another.
    pub async fn trigger_full_scan(&self) -> Uuid {
        self.orchestrator.clone().trigger_full_scan().await
    }

    /// Kick off a check of every non-ignored app, coalesced engine-wide.
    pub async fn check_all_updates(&self) -> Uuid {
        self.orchestrator.clone().check_all_updates().await
    }

    pub async fn check_single_update(
        &self,
        bundle_id: &str,
    ) -> EngineResult<Option<UpdateCandidate>> {
        self.orchestrator.check_single_update(bundle_id).await
    }

    /// One synchronous scan + check pass; used by `--check-now`. Returns
    /// the live update count.
    pub async fn run_check_now(&self) -> EngineResult<usize> {
        self.orchestrator.scan_now().await?;
        self.orchestrator.check_now().await
    }

    /// Per-checker diagnostics for one app, without touching candidates.
    pub async fn debug_update_check(
        &self,
        bundle_id: &str,
    ) -> EngineResult<UpdateCheckDiagnostic> {
        self.orchestrator.debug_update_check(bundle_id).await
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    pub async fn execute_update(&self, bundle_id: &str) -> EngineResult<UpdateOutcome> {
        self.orchestrator.execute_update(bundle_id).await
    }

    pub async fn execute_bulk_update(&self, bundle_ids: Vec<String>) -> Vec<UpdateOutcome> {
        self.orchestrator
            .clone()
            .execute_bulk_update(bundle_ids)
            .await
    }

    pub async fn cancel_update(&self, bundle_id: &str) {
        self.orchestrator.cancel_execution(bundle_id).await
    }

    /// Quit an updated app and launch its new version in the background.
    pub async fn relaunch_app(&self, bundle_id: &str, app_path: &str) -> EngineResult<()> {
        let bundle_id = bundle_id.to_string();
        let app_path = app_path.to_string();
        tokio::task::spawn_blocking(move || {
            platform::request_quit(&bundle_id, std::time::Duration::from_millis(1500));
            platform::relaunch_app(&app_path);
        })
        .await
        .map_err(|e| EngineError::internal(format!("task join: {e}")))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Catalog reads
    // ------------------------------------------------------------------

    pub async fn get_all_apps(&self) -> EngineResult<Vec<AppSummary>> {
        let db = self.db.lock().await;
        db.get_all_apps()
    }

    pub async fn get_app_detail(&self, bundle_id: &str) -> EngineResult<AppDetail> {
        let db = self.db.lock().await;
        db.get_app_detail(bundle_id)
    }

    pub async fn get_update_count(&self) -> EngineResult<usize> {
        let db = self.db.lock().await;
        db.get_update_count()
    }

    pub async fn get_update_history(&self, limit: i64) -> EngineResult<Vec<HistoryEntry>> {
        let db = self.db.lock().await;
        db.get_update_history(limit)
    }

    pub async fn set_app_ignored(&self, bundle_id: &str, ignored: bool) -> EngineResult<()> {
        let mut db = self.db.lock().await;
        db.set_app_ignored(bundle_id, ignored)?;

        // Keep the settings list in sync so the flag survives a wiped
        // catalog.
        let mut current = settings::load(&db);
        let listed = current.ignored_bundle_ids.iter().any(|b| b == bundle_id);
        if ignored && !listed {
            current.ignored_bundle_ids.push(bundle_id.to_string());
            settings::save(&mut db, &current)?;
        } else if !ignored && listed {
            current.ignored_bundle_ids.retain(|b| b != bundle_id);
            settings::save(&mut db, &current)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Uninstall
    // ------------------------------------------------------------------

    pub async fn scan_associated_files(&self, bundle_id: &str) -> EngineResult<Vec<String>> {
        let record = {
            let db = self.db.lock().await;
            db.get_app_record(bundle_id)?
        };
        Ok(uninstall::scan_associated_files(&record.bundle_id))
    }

    /// Remove an app (and optionally its associated files), then drop it
    /// from the catalog.
    pub async fn uninstall_app(
        &self,
        bundle_id: &str,
        cleanup_associated: bool,
    ) -> EngineResult<UninstallReport> {
        let record = {
            let db = self.db.lock().await;
            db.get_app_record(bundle_id)?
        };

        let report = tokio::task::spawn_blocking(move || {
            uninstall::uninstall_app(&record, cleanup_associated)
        })
        .await
        .map_err(|e| EngineError::internal(format!("task join: {e}")))??;

        let mut db = self.db.lock().await;
        db.delete_app(bundle_id)?;
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_settings(&self) -> Settings {
        let db = self.db.lock().await;
        settings::load(&db)
    }

    pub async fn update_settings(&self, new: Settings) -> EngineResult<Settings> {
        let normalized = new.normalized();
        let mut db = self.db.lock().await;
        settings::save(&mut db, &normalized)?;
        Ok(normalized)
    }

    // ------------------------------------------------------------------
    // System probes
    // ------------------------------------------------------------------

    pub async fn check_setup_status(&self) -> SetupStatus {
        let askpass = elevate::is_askpass_installed();
        tokio::task::spawn_blocking(move || platform::setup_status(askpass))
            .await
            .unwrap_or(SetupStatus {
                homebrew_installed: false,
                homebrew_version: None,
                xcode_clt_installed: false,
                askpass_installed: askpass,
                mas_cli_installed: false,
            })
    }

    pub async fn get_permissions_status(&self) -> PermissionsStatus {
        tokio::task::spawn_blocking(|| platform::permissions_status(BUNDLE_ID))
            .await
            .unwrap_or(PermissionsStatus {
                app_management: false,
                automation: false,
                automation_state: "unknown".to_string(),
                full_disk_access: false,
                notifications: false,
            })
    }

    /// Trigger the macOS Automation consent dialog. Only called on an
    /// explicit user action.
    pub async fn request_automation_permission(&self) -> bool {
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            tokio::task::spawn_blocking(platform::request_automation_permission),
        )
        .await
        .map(|r| r.unwrap_or(false))
        .unwrap_or(false)
    }

    pub async fn check_connectivity(&self) -> ConnectivityStatus {
        let timeout = std::time::Duration::from_secs(4);
        let http = HttpFetcher::new();
        let http = match http {
            Ok(h) => h,
            Err(_) => {
                return ConnectivityStatus {
                    github: false,
                    homebrew: false,
                    itunes: false,
                    overall: "offline".to_string(),
                }
            }
        };

        let (github, homebrew, itunes) = tokio::join!(
            http.head_ok("https://api.github.com", timeout),
            http.head_ok("https://formulae.brew.sh", timeout),
            http.head_ok("https://itunes.apple.com", timeout),
        );
        let up = [github, homebrew, itunes].iter().filter(|b| **b).count();
        ConnectivityStatus {
            github,
            homebrew,
            itunes,
            overall: match up {
                3 => "ok",
                0 => "offline",
                _ => "degraded",
            }
            .to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Self-update
    // ------------------------------------------------------------------

    pub async fn check_self_update(&self) -> EngineResult<Option<SelfUpdateInfo>> {
        self.self_updater.check().await
    }

    pub async fn execute_self_update(&self) -> EngineResult<()> {
        self.self_updater.execute(&CancelToken::new()).await
    }

    /// Swap in the staged engine bundle and restart. Does not return on
    /// success.
    pub async fn relaunch_self(&self) -> EngineResult<()> {
        self.self_updater.relaunch().await
    }
}
