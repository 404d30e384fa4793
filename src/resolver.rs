//! Update resolver.
//!
//! Runs every applicable checker for an app with bounded parallelism and
//! reconciles their probe results into at most one candidate. A checker
//! failure never fails its siblings; errors stay visible in diagnostics and
//! never masquerade as "no update".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::brew;
use crate::cancel::CancelToken;
use crate::cask_index;
use crate::checkers::{
    self, CheckContext, FoundUpdate, ProbeResult, UpdateChecker,
};
use crate::db::Db;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::http::HttpFetcher;
use crate::models::{
    AppRecord, CheckerDiagnostic, SourceBinding, SourceType, UpdateCandidate,
    UpdateCheckDiagnostic,
};
use crate::{platform, version};

/// Apps probed concurrently during a check-all.
const CHECK_CONCURRENCY: usize = 10;
/// Overall deadline for one checker probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Resolver {
    db: Arc<Mutex<Db>>,
    http: Arc<HttpFetcher>,
    events: EventBus,
    checkers: Vec<Box<dyn UpdateChecker>>,
}

impl Resolver {
    pub fn new(db: Arc<Mutex<Db>>, http: Arc<HttpFetcher>, events: EventBus) -> Self {
        Self {
            db,
            http,
            events,
            checkers: checkers::all_checkers(),
        }
    }

    /// Assemble the shared per-cycle context: local brew state, the cask
    /// index, and host facts, fetched concurrently.
    pub async fn build_context(&self) -> CheckContext {
        self.http.clear_cache().await;
        checkers::reset_github_rate_limit();

        let (outdated_casks, outdated_formulae, index) = tokio::join!(
            tokio::task::spawn_blocking(brew::fetch_outdated_casks),
            tokio::task::spawn_blocking(brew::fetch_outdated_formulae),
            cask_index::fetch(&self.http),
        );

        let outdated_casks = Arc::new(outdated_casks.unwrap_or_default());
        let outdated_formulae = Arc::new(outdated_formulae.unwrap_or_default());
        log::info!(
            "brew outdated: {} casks, {} formulae",
            outdated_casks.len(),
            outdated_formulae.len()
        );

        let xcode_clt_installed = if outdated_formulae.is_empty() {
            None
        } else {
            Some(
                tokio::task::spawn_blocking(platform::is_xcode_clt_installed)
                    .await
                    .unwrap_or(true),
            )
        };

        CheckContext {
            http: self.http.clone(),
            outdated_casks,
            outdated_formulae,
            cask_index: index,
            host_os_version: checkers::host_os_version(),
            xcode_clt_installed,
        }
    }

    /// Check every non-ignored app. Returns the catalog-wide live update
    /// count after the cycle.
    pub async fn check_all(&self, cancel: &CancelToken) -> EngineResult<usize> {
        let start = std::time::Instant::now();

        let records = {
            let db = self.db.lock().await;
            db.get_all_records()?
        };
        let check_records: Vec<AppRecord> =
            records.into_iter().filter(|r| !r.is_ignored).collect();
        let total = check_records.len();

        self.events.emit(EngineEvent::UpdateCheckProgress {
            checked: 0,
            total,
            current_app: Some("Fetching Homebrew data...".to_string()),
        });

        let ctx = Arc::new(self.build_context().await);
        self.backfill_cask_tokens(&ctx).await;

        let checked = Arc::new(AtomicUsize::new(0));
        let found = Arc::new(AtomicUsize::new(0));

        stream::iter(check_records)
            .for_each_concurrent(CHECK_CONCURRENCY, |record| {
                let ctx = ctx.clone();
                let checked = checked.clone();
                let found = found.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }

                    let count = checked.fetch_add(1, Ordering::Relaxed) + 1;
                    self.events.emit(EngineEvent::UpdateCheckProgress {
                        checked: count,
                        total,
                        current_app: Some(record.display_name.clone()),
                    });

                    match self.check_one(&record, &ctx).await {
                        Ok(Some(candidate)) => {
                            self.events.emit(EngineEvent::UpdateFound {
                                bundle_id: record.bundle_id.clone(),
                                current_version: record.installed_version.clone(),
                                available_version: candidate.available_version.clone(),
                                source: candidate.source_type.as_str().to_string(),
                            });
                            found.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::debug!("check failed for {}: {e}", record.bundle_id);
                        }
                    }
                }
            })
            .await;

        let _ = tokio::time::timeout(Duration::from_secs(5), checkers::save_etag_cache()).await;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let db_count = {
            let db = self.db.lock().await;
            db.get_update_count().unwrap_or_else(|_| found.load(Ordering::Relaxed))
        };

        self.events.emit(EngineEvent::UpdateCheckComplete {
            updates_found: db_count,
            duration_ms: start.elapsed().as_millis() as u64,
        });

        Ok(db_count)
    }

    /// Check one app and persist the outcome. Returns the new candidate,
    /// if any.
    pub async fn check_single(&self, bundle_id: &str) -> EngineResult<Option<UpdateCandidate>> {
        let record = {
            let db = self.db.lock().await;
            db.get_app_record(bundle_id)?
        };
        let ctx = Arc::new(self.build_context().await);
        self.check_one(&record, &ctx).await
    }

    async fn check_one(
        &self,
        record: &AppRecord,
        ctx: &CheckContext,
    ) -> EngineResult<Option<UpdateCandidate>> {
        // Re-read the on-disk version so a stale catalog row cannot produce
        // a no-op candidate.
        let mut record = record.clone();
        if let Some(path) = record.app_path.as_deref() {
            if let Some(bundle) = platform::parse_bundle(std::path::Path::new(path)) {
                if bundle.installed_version.is_some() {
                    record.installed_version = bundle.installed_version;
                }
            } else if !std::path::Path::new(path).exists() {
                // The bundle vanished outside the engine: keep the row, drop
                // the version, skip checking.
                let mut db = self.db.lock().await;
                let _ = db.clear_installed_version(&record.bundle_id);
                let _ = db.put_candidate(&record.bundle_id, None);
                return Ok(None);
            }
        }

        let results = self.run_applicable(&record, ctx).await;
        let (winner, bindings, had_success) = reconcile(&record, &results);

        {
            let mut db = self.db.lock().await;
            db.replace_bindings(&record.bundle_id, &bindings)?;
            match &winner {
                Some(candidate) => db.put_candidate(&record.bundle_id, Some(candidate))?,
                // Only clear on a cycle where at least one probe answered;
                // a network blackout must not wipe a valid pending update.
                None if had_success => db.put_candidate(&record.bundle_id, None)?,
                None => {}
            }
        }

        Ok(winner)
    }

    /// Run every applicable checker, isolating failures into per-checker
    /// results.
    async fn run_applicable(
        &self,
        record: &AppRecord,
        ctx: &CheckContext,
    ) -> Vec<(SourceType, ProbeResult)> {
        let applicable: Vec<&Box<dyn UpdateChecker>> = self
            .checkers
            .iter()
            .filter(|c| c.applicable(record, ctx))
            .collect();

        let futures: Vec<_> = applicable
            .iter()
            .map(|checker| async move {
                let st = checker.source_type();
                (st, probe_with_retry(checker.as_ref(), record, ctx).await)
            })
            .collect();

        futures::future::join_all(futures).await
    }

    /// Fill in cask tokens for apps the index can identify. This is what
    /// lets `brew upgrade --cask` service apps originally installed by hand.
    async fn backfill_cask_tokens(&self, ctx: &CheckContext) {
        let index = match &ctx.cask_index {
            Some(idx) => idx.clone(),
            None => return,
        };

        let records = {
            let db = self.db.lock().await;
            match db.get_all_records() {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("cask token backfill: {e}");
                    return;
                }
            }
        };

        let mut backfilled = 0usize;
        let mut db = self.db.lock().await;
        for record in &records {
            if record.homebrew_cask_token.is_some()
                || checkers::is_browser_extension(&record.bundle_id)
            {
                continue;
            }
            let path = record.app_path.as_deref().map(std::path::Path::new);
            if let Some(token) = index.lookup_token(&record.bundle_id, path) {
                if db.update_cask_token(&record.bundle_id, token).is_ok() {
                    backfilled += 1;
                }
            }
        }
        if backfilled > 0 {
            log::info!("backfilled cask tokens for {backfilled} apps");
        }
    }

    /// Run every checker for one app and report per-checker outcomes.
    /// Purely diagnostic: candidate state is untouched.
    pub async fn debug_check(&self, bundle_id: &str) -> EngineResult<UpdateCheckDiagnostic> {
        let record = {
            let db = self.db.lock().await;
            db.get_app_record(bundle_id)?
        };
        let ctx = self.build_context().await;

        let mut diagnostics = Vec::new();
        for checker in &self.checkers {
            let applicable = checker.applicable(&record, &ctx);
            let result = if applicable {
                match probe_with_retry(checker.as_ref(), &record, &ctx).await {
                    ProbeResult::Found(update) => format!("found: {}", update.version),
                    ProbeResult::NotFound => "not_found".to_string(),
                    ProbeResult::Skipped { reason } => format!("skipped: {reason}"),
                    ProbeResult::Error { kind, message, .. } => {
                        format!("error ({kind:?}): {message}")
                    }
                }
            } else {
                "not_applicable".to_string()
            };
            diagnostics.push(CheckerDiagnostic {
                source: checker.source_type().as_str().to_string(),
                applicable,
                result,
            });
        }

        Ok(UpdateCheckDiagnostic {
            bundle_id: record.bundle_id,
            app_path: record.app_path,
            installed_version: record.installed_version,
            install_source: record.install_source.as_str().to_string(),
            homebrew_cask_token: record.homebrew_cask_token,
            checkers: diagnostics,
        })
    }
}

/// One probe with the overall deadline and a single retry for retriable
/// network failures.
async fn probe_with_retry(
    checker: &dyn UpdateChecker,
    record: &AppRecord,
    ctx: &CheckContext,
) -> ProbeResult {
    let first = probe_once(checker, record, ctx).await;
    if let ProbeResult::Error {
        retriable: true, ..
    } = first
    {
        tokio::time::sleep(retry_jitter()).await;
        return probe_once(checker, record, ctx).await;
    }
    first
}

async fn probe_once(
    checker: &dyn UpdateChecker,
    record: &AppRecord,
    ctx: &CheckContext,
) -> ProbeResult {
    match tokio::time::timeout(PROBE_TIMEOUT, checker.probe(record, ctx)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => ProbeResult::Error {
            kind: e.kind(),
            message: e.to_string(),
            retriable: e.is_retriable(),
        },
        Err(_) => ProbeResult::Error {
            kind: crate::errors::ErrorKind::Network,
            message: format!(
                "{} probe exceeded {}s",
                checker.source_type().as_str(),
                PROBE_TIMEOUT.as_secs()
            ),
            retriable: false,
        },
    }
}

/// ~250-750 ms, seeded from the clock. Enough to decorrelate retries.
fn retry_jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(250 + (nanos % 500) as u64)
}

/// Fold probe results into at most one candidate plus the bindings row set.
///
/// The highest strictly-newer version wins; ties break on the fixed source
/// precedence. Returns `(winner, bindings, had_success)` where
/// `had_success` is true when at least one probe answered authoritatively
/// (Found or NotFound).
fn reconcile(
    record: &AppRecord,
    results: &[(SourceType, ProbeResult)],
) -> (Option<UpdateCandidate>, Vec<SourceBinding>, bool) {
    let now = Utc::now().to_rfc3339();
    let installed = record.installed_version.as_deref();

    let mut best: Option<(SourceType, &FoundUpdate)> = None;
    let mut had_success = false;

    for (source, result) in results {
        match result {
            ProbeResult::Found(update) => {
                had_success = true;
                let newer = match installed {
                    Some(current) => version::is_newer(current, &update.version),
                    None => false,
                };
                if !newer {
                    continue;
                }
                best = match best {
                    None => Some((*source, update)),
                    Some((best_source, best_update)) => {
                        if version::is_newer(&best_update.version, &update.version) {
                            Some((*source, update))
                        } else if best_update.version == update.version
                            && source.precedence() < best_source.precedence()
                        {
                            Some((*source, update))
                        } else {
                            Some((best_source, best_update))
                        }
                    }
                };
            }
            ProbeResult::NotFound => had_success = true,
            ProbeResult::Skipped { .. } => {}
            ProbeResult::Error { kind, message, .. } => {
                log::info!(
                    "checker {} for {}: {:?}: {}",
                    source.as_str(),
                    record.bundle_id,
                    kind,
                    message
                );
            }
        }
    }

    let winner_source = best.map(|(source, _)| source);
    let bindings: Vec<SourceBinding> = results
        .iter()
        .map(|(source, _)| SourceBinding {
            source_type: *source,
            source_url: match source {
                SourceType::Sparkle => record.sparkle_feed_url.clone(),
                _ => None,
            },
            is_primary: winner_source == Some(*source),
            last_checked_at: Some(now.clone()),
        })
        .collect();

    let candidate = best.map(|(source, update)| UpdateCandidate {
        bundle_id: record.bundle_id.clone(),
        available_version: update.version.clone(),
        source_type: source,
        download_url: update.download_url.clone(),
        sha256: update.sha256.clone(),
        release_notes: update.release_notes.clone(),
        release_notes_url: update.release_notes_url.clone(),
        is_paid_upgrade: update.is_paid_upgrade,
        detected_at: Some(now),
        notes: update.notes.clone(),
    });

    (candidate, bindings, had_success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::models::InstallSource;

    fn record(installed: &str) -> AppRecord {
        AppRecord {
            id: 1,
            bundle_id: "com.example.app".to_string(),
            display_name: "Example".to_string(),
            app_path: Some("/Applications/Example.app".to_string()),
            installed_version: Some(installed.to_string()),
            bundle_version: None,
            icon_cache_path: None,
            architectures: None,
            install_source: InstallSource::Direct,
            homebrew_cask_token: None,
            homebrew_formula_name: None,
            mas_app_id: None,
            sparkle_feed_url: Some("https://example.com/appcast.xml".to_string()),
            is_ignored: false,
            first_seen_at: None,
            last_seen_at: None,
        }
    }

    fn found(version: &str) -> ProbeResult {
        ProbeResult::Found(FoundUpdate {
            version: version.to_string(),
            download_url: None,
            sha256: None,
            release_notes: None,
            release_notes_url: None,
            is_paid_upgrade: false,
            notes: None,
        })
    }

    #[test]
    fn highest_version_wins_across_checkers() {
        let record = record("2.9");
        let results = vec![
            (SourceType::Sparkle, found("3.1")),
            (SourceType::Github, found("3.0")),
        ];
        let (winner, bindings, _) = reconcile(&record, &results);
        let winner = winner.unwrap();
        assert_eq!(winner.available_version, "3.1");
        assert_eq!(winner.source_type, SourceType::Sparkle);

        let primary: Vec<_> = bindings.iter().filter(|b| b.is_primary).collect();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].source_type, SourceType::Sparkle);
        assert_eq!(
            primary[0].source_url.as_deref(),
            Some("https://example.com/appcast.xml")
        );
    }

    #[test]
    fn ties_break_on_source_precedence() {
        let record = record("1.0");
        let results = vec![
            (SourceType::HomebrewApi, found("2.0")),
            (SourceType::HomebrewCask, found("2.0")),
            (SourceType::Github, found("2.0")),
        ];
        let (winner, _, _) = reconcile(&record, &results);
        assert_eq!(winner.unwrap().source_type, SourceType::HomebrewCask);
    }

    #[test]
    fn stale_versions_are_discarded() {
        let record = record("3.1");
        let results = vec![(SourceType::Sparkle, found("3.1")), (SourceType::Github, found("3.0"))];
        let (winner, _, had_success) = reconcile(&record, &results);
        assert!(winner.is_none());
        assert!(had_success);
    }

    #[test]
    fn errors_do_not_count_as_success() {
        let record = record("1.0");
        let results = vec![(
            SourceType::Sparkle,
            ProbeResult::Error {
                kind: ErrorKind::Network,
                message: "timeout".to_string(),
                retriable: true,
            },
        )];
        let (winner, bindings, had_success) = reconcile(&record, &results);
        assert!(winner.is_none());
        assert!(!had_success);
        assert_eq!(bindings.len(), 1);
        assert!(!bindings[0].is_primary);
    }

    #[test]
    fn skipped_probes_do_not_clear_candidates() {
        let record = record("1.0");
        let results = vec![(
            SourceType::Sparkle,
            ProbeResult::Skipped {
                reason: "no feed".to_string(),
            },
        )];
        let (_, _, had_success) = reconcile(&record, &results);
        assert!(!had_success);
    }

    #[test]
    fn retry_jitter_is_bounded() {
        let j = retry_jitter();
        assert!(j >= Duration::from_millis(250));
        assert!(j < Duration::from_millis(750));
    }
}
