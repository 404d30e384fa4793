//! Job orchestration: coalescing, per-app execution locks, bulk queues,
//! history bookkeeping, and the periodic check loop.
//!
//! At-most-one rules: one scan engine-wide, one check-all engine-wide, one
//! execution per bundle id. Re-triggering a running scan or check returns
//! the in-flight job id instead of starting another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::db::{Db, EngineDirs};
use crate::elevate;
use crate::errors::{EngineError, EngineResult, ErrorKind};
use crate::events::{EngineEvent, EventBus};
use crate::executors::Executors;
use crate::models::{AppDetail, HistoryStatus, InstallSource, SourceType, UpdateOutcome};
use crate::platform;
use crate::resolver::Resolver;
use crate::scanner::Scanner;
use crate::settings;

/// Overall deadline for one update execution.
const EXECUTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Bulk updates drained concurrently.
const BULK_CONCURRENCY: usize = 2;
/// Sudo timestamp refresh cadence during bulk runs.
const SUDO_KEEPALIVE: Duration = Duration::from_secs(240);

struct Job {
    id: Uuid,
    cancel: CancelToken,
}

pub struct Orchestrator {
    db: Arc<Mutex<Db>>,
    events: EventBus,
    scanner: Scanner,
    resolver: Resolver,
    executors: Executors,
    active_scan: Mutex<Option<Job>>,
    active_check: Mutex<Option<Job>>,
    executions: Mutex<HashMap<String, CancelToken>>,
    bulk_slots: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Mutex<Db>>,
        events: EventBus,
        dirs: EngineDirs,
        http: Arc<crate::http::HttpFetcher>,
    ) -> Self {
        Self {
            scanner: Scanner::new(db.clone(), events.clone(), dirs.clone()),
            resolver: Resolver::new(db.clone(), http.clone(), events.clone()),
            executors: Executors::new(http, dirs),
            db,
            events,
            active_scan: Mutex::new(None),
            active_check: Mutex::new(None),
            executions: Mutex::new(HashMap::new()),
            bulk_slots: Arc::new(Semaphore::new(BULK_CONCURRENCY)),
        }
    }

    // ------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------

    /// Start a scan in the background, or return the in-flight job id.
    pub async fn trigger_full_scan(self: Arc<Self>) -> Uuid {
        let mut slot = self.active_scan.lock().await;
        if let Some(job) = slot.as_ref() {
            return job.id;
        }

        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        *slot = Some(Job {
            id,
            cancel: cancel.clone(),
        });
        drop(slot);

        let this = self.clone();
        tokio::spawn(async move {
            let current = settings::load(&*this.db.lock().await);
            match this.scanner.run(&current, &cancel).await {
                Ok(count) => log::info!("scan {id} complete: {count} apps"),
                Err(e) => log::warn!("scan {id} failed: {e}"),
            }
            *this.active_scan.lock().await = None;
        });
        id
    }

    /// Cancel the running scan, if any.
    pub async fn cancel_scan(&self) {
        if let Some(job) = self.active_scan.lock().await.as_ref() {
            job.cancel.cancel();
        }
    }

    /// Run a scan inline (used by the CLI single-shot path). Fails if a scan
    /// is already active.
    pub async fn scan_now(&self) -> EngineResult<usize> {
        let cancel = CancelToken::new();
        {
            let mut slot = self.active_scan.lock().await;
            if slot.is_some() {
                return Err(EngineError::internal("a scan is already running"));
            }
            *slot = Some(Job {
                id: Uuid::new_v4(),
                cancel: cancel.clone(),
            });
        }
        let current = settings::load(&*self.db.lock().await);
        let result = self.scanner.run(&current, &cancel).await;
        *self.active_scan.lock().await = None;
        result
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    /// Start a check-all in the background, or return the in-flight id.
    pub async fn check_all_updates(self: Arc<Self>) -> Uuid {
        let mut slot = self.active_check.lock().await;
        if let Some(job) = slot.as_ref() {
            return job.id;
        }

        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        *slot = Some(Job {
            id,
            cancel: cancel.clone(),
        });
        drop(slot);

        let this = self.clone();
        tokio::spawn(async move {
            match this.resolver.check_all(&cancel).await {
                Ok(count) => log::info!("check {id} complete: {count} updates"),
                Err(e) => log::warn!("check {id} failed: {e}"),
            }
            *this.active_check.lock().await = None;
        });
        id
    }

    pub async fn cancel_check(&self) {
        if let Some(job) = self.active_check.lock().await.as_ref() {
            job.cancel.cancel();
        }
    }

    /// Run a check-all inline. Fails if one is already active.
    pub async fn check_now(&self) -> EngineResult<usize> {
        let cancel = CancelToken::new();
        {
            let mut slot = self.active_check.lock().await;
            if slot.is_some() {
                return Err(EngineError::internal("a check is already running"));
            }
            *slot = Some(Job {
                id: Uuid::new_v4(),
                cancel: cancel.clone(),
            });
        }
        let result = self.resolver.check_all(&cancel).await;
        *self.active_check.lock().await = None;
        result
    }

    /// Check one app immediately. Independent of the check-all coalescing.
    pub async fn check_single_update(
        &self,
        bundle_id: &str,
    ) -> EngineResult<Option<crate::models::UpdateCandidate>> {
        self.resolver.check_single(bundle_id).await
    }

    pub async fn debug_update_check(
        &self,
        bundle_id: &str,
    ) -> EngineResult<crate::models::UpdateCheckDiagnostic> {
        self.resolver.debug_check(bundle_id).await
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Apply the pending update for one app. Holds the per-bundle execution
    /// lock for the duration; a second call for the same id is rejected.
    pub async fn execute_update(&self, bundle_id: &str) -> EngineResult<UpdateOutcome> {
        let cancel = CancelToken::new();
        {
            let mut executions = self.executions.lock().await;
            if executions.contains_key(bundle_id) {
                return Err(EngineError::internal(format!(
                    "an update is already running for {bundle_id}"
                )));
            }
            executions.insert(bundle_id.to_string(), cancel.clone());
        }

        let result = self.run_execution(bundle_id, &cancel).await;
        self.executions.lock().await.remove(bundle_id);
        result
    }

    /// Cancel an in-flight execution. The Install critical section of the
    /// direct path finishes or rolls back before the cancel lands.
    pub async fn cancel_execution(&self, bundle_id: &str) {
        if let Some(cancel) = self.executions.lock().await.get(bundle_id) {
            cancel.cancel();
        }
    }

    async fn run_execution(
        &self,
        bundle_id: &str,
        cancel: &CancelToken,
    ) -> EngineResult<UpdateOutcome> {
        let detail = {
            let db = self.db.lock().await;
            db.get_app_detail(bundle_id)?
        };

        let from_version = detail
            .record
            .installed_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let to_version = detail
            .candidate
            .as_ref()
            .map(|c| truncate_version(&c.available_version).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let source_label = detail
            .candidate
            .as_ref()
            .map(|c| c.source_type.as_str().to_string())
            .unwrap_or_else(|| detail.record.install_source.as_str().to_string());

        let history_id = {
            let mut db = self.db.lock().await;
            db.begin_history(bundle_id, &from_version, &to_version, &source_label)
                .ok()
        };

        let events = self.events.clone();
        let bid = bundle_id.to_string();
        let progress = move |percent: u8, phase: &str, bytes: Option<(u64, Option<u64>)>| {
            events.execute_progress(&bid, phase, percent, bytes);
        };

        let outcome = tokio::time::timeout(
            EXECUTION_TIMEOUT,
            self.executors.execute(&detail, &progress, cancel),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EngineError::ExecutorFailed {
                stderr_tail: "execution exceeded the overall timeout".to_string(),
            })
        });

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => UpdateOutcome::failure(bundle_id, &source_label, failure_message(&e)),
        };

        // History reaches exactly one terminal state.
        if let Some(hid) = history_id {
            let status = if outcome.delegated && outcome.success {
                HistoryStatus::Delegated
            } else if outcome.success {
                HistoryStatus::Completed
            } else {
                HistoryStatus::Failed
            };
            let error = if outcome.success {
                None
            } else {
                outcome.message.clone()
            };
            let mut db = self.db.lock().await;
            let _ = db.finish_history(hid, status, error.as_deref());
        }

        // Homebrew paths replace the bundle under a still-running app.
        let needs_relaunch = outcome.needs_relaunch
            || (outcome.success
                && !outcome.delegated
                && (outcome.source_type == "homebrew_cask"
                    || outcome.source_type == "homebrew_formula")
                && platform::is_app_running(bundle_id));

        self.events.emit(EngineEvent::UpdateExecuteComplete {
            bundle_id: bundle_id.to_string(),
            display_name: detail.record.display_name.clone(),
            success: outcome.success,
            message: outcome.message.clone(),
            needs_relaunch,
            app_path: if needs_relaunch {
                detail.record.app_path.clone()
            } else {
                None
            },
            delegated: outcome.delegated,
        });

        // A delegated update stays pending until a later check confirms the
        // version moved; a completed one refreshes the row immediately.
        if outcome.success && !outcome.delegated {
            let new_version = detail
                .record
                .app_path
                .as_deref()
                .and_then(|p| platform::parse_bundle(std::path::Path::new(p)))
                .and_then(|b| b.installed_version)
                .or_else(|| outcome.to_version.clone());

            let mut db = self.db.lock().await;
            if let Some(ref version) = new_version {
                let _ = db.update_installed_version(bundle_id, version);
            }
            let _ = db.put_candidate(bundle_id, None);
        }

        Ok(UpdateOutcome {
            needs_relaunch,
            ..outcome
        })
    }

    /// Queue several updates and drain with bounded parallelism. One sudo
    /// prompt up front when two or more targets may need elevation.
    pub async fn execute_bulk_update(
        self: Arc<Self>,
        bundle_ids: Vec<String>,
    ) -> Vec<UpdateOutcome> {
        let elevation_candidates = {
            let db = self.db.lock().await;
            bundle_ids
                .iter()
                .filter(|bid| {
                    db.get_app_detail(bid)
                        .map(|d| may_need_elevation(&d))
                        .unwrap_or(false)
                })
                .count()
        };

        let keepalive = if elevation_candidates >= 2 {
            let authed = tokio::task::spawn_blocking(elevate::pre_authenticate)
                .await
                .unwrap_or(false);
            if authed {
                let stop = Arc::new(AtomicBool::new(false));
                let stop_clone = stop.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(SUDO_KEEPALIVE).await;
                        if stop_clone.load(Ordering::Relaxed) {
                            break;
                        }
                        let _ = tokio::task::spawn_blocking(elevate::refresh_timestamp).await;
                    }
                });
                Some((handle, stop))
            } else {
                None
            }
        } else {
            None
        };

        let mut handles = Vec::new();
        for bundle_id in bundle_ids {
            let this = self.clone();
            let slots = self.bulk_slots.clone();
            handles.push(tokio::spawn(async move {
                let _permit = slots.acquire_owned().await;
                match this.execute_update(&bundle_id).await {
                    Ok(outcome) => outcome,
                    Err(e) => UpdateOutcome::failure(&bundle_id, "unknown", e.to_string()),
                }
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            if let Ok(outcome) = handle.await {
                results.push(outcome);
            }
        }

        if let Some((handle, stop)) = keepalive {
            stop.store(true, Ordering::Relaxed);
            handle.abort();
        }

        results
    }

    // ------------------------------------------------------------------
    // Periodic scheduling
    // ------------------------------------------------------------------

    /// Periodic check loop. The interval is re-read from settings after
    /// every cycle so changes apply without a restart.
    pub fn start_periodic_checks(self: Arc<Self>, initial_interval_minutes: u64) {
        let this = self;
        tokio::spawn(async move {
            let mut interval_mins = initial_interval_minutes.max(1);
            loop {
                tokio::time::sleep(Duration::from_secs(interval_mins * 60)).await;

                log::info!("running periodic update check");
                let _ = this.clone().check_all_updates().await;

                let new_interval = {
                    let db = this.db.lock().await;
                    settings::load(&db).check_interval_minutes as u64
                };
                let new_interval = new_interval.max(1);
                if new_interval != interval_mins {
                    log::info!(
                        "check interval changed: {interval_mins} min -> {new_interval} min"
                    );
                    interval_mins = new_interval;
                }
            }
        });
    }

    /// Launch policy: an empty catalog forces a scan regardless of the
    /// auto-check setting.
    pub async fn run_launch_policy(self: Arc<Self>) {
        let (empty, auto_check) = {
            let db = self.db.lock().await;
            let empty = db.app_count().unwrap_or(0) == 0;
            let auto = settings::load(&db).auto_check_on_launch;
            (empty, auto)
        };

        if empty || auto_check {
            let this = self.clone();
            tokio::spawn(async move {
                // Scan first so the check sees a fresh catalog.
                let current = settings::load(&*this.db.lock().await);
                let cancel = CancelToken::new();
                {
                    let mut slot = this.active_scan.lock().await;
                    if slot.is_some() {
                        return;
                    }
                    *slot = Some(Job {
                        id: Uuid::new_v4(),
                        cancel: cancel.clone(),
                    });
                }
                let scan = this.scanner.run(&current, &cancel).await;
                *this.active_scan.lock().await = None;
                if scan.is_ok() {
                    let _ = this.check_all_updates().await;
                }
            });
        }
    }
}

/// Long hex-only versions (commit hashes) get truncated for history rows.
fn truncate_version(version: &str) -> &str {
    if version.len() > 20 && version.chars().all(|c| c.is_ascii_hexdigit()) {
        version.get(..12).unwrap_or(version)
    } else {
        version
    }
}

fn failure_message(e: &EngineError) -> String {
    match e.kind() {
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::IntegrityFailed => "IntegrityFailed".to_string(),
        _ => e.to_string(),
    }
}

/// Whether an update path is likely to prompt for elevation.
fn may_need_elevation(detail: &AppDetail) -> bool {
    if let Some(candidate) = &detail.candidate {
        match candidate.source_type {
            SourceType::HomebrewCask
            | SourceType::Sparkle
            | SourceType::Github
            | SourceType::HomebrewApi
            | SourceType::MicrosoftAutoupdate
            | SourceType::Mas => return true,
            SourceType::AdobeCc => return false,
            _ => {}
        }
    }
    matches!(
        detail.record.install_source,
        InstallSource::Homebrew | InstallSource::HomebrewFormula
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppRecord, UpdateCandidate};

    #[test]
    fn hex_versions_truncate() {
        let hash = "0123456789abcdef0123456789abcdef";
        assert_eq!(truncate_version(hash), "0123456789ab");
        assert_eq!(truncate_version("2024.10.3"), "2024.10.3");
        assert_eq!(truncate_version("1.2.3-beta"), "1.2.3-beta");
    }

    #[test]
    fn failure_messages_keep_stable_labels() {
        assert_eq!(failure_message(&EngineError::Cancelled), "cancelled");
        assert_eq!(
            failure_message(&EngineError::IntegrityFailed("sha mismatch".to_string())),
            "IntegrityFailed"
        );
    }

    fn detail_with(source: SourceType) -> AppDetail {
        AppDetail {
            record: AppRecord {
                id: 1,
                bundle_id: "com.example.app".to_string(),
                display_name: "App".to_string(),
                app_path: None,
                installed_version: None,
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
            },
            update_sources: Vec::new(),
            candidate: Some(UpdateCandidate {
                bundle_id: "com.example.app".to_string(),
                available_version: "2.0".to_string(),
                source_type: source,
                download_url: None,
                sha256: None,
                release_notes: None,
                release_notes_url: None,
                is_paid_upgrade: false,
                detected_at: None,
                notes: None,
            }),
        }
    }

    #[test]
    fn adobe_never_needs_elevation() {
        assert!(!may_need_elevation(&detail_with(SourceType::AdobeCc)));
        assert!(may_need_elevation(&detail_with(SourceType::Sparkle)));
        assert!(may_need_elevation(&detail_with(SourceType::Mas)));
    }
}
