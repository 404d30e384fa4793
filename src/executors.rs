//! Update executors.
//!
//! Routing a candidate to a strategy is a fixed two-phase decision: first
//! by the candidate's source type, then by how the app was installed. Four
//! strategies exist: Direct (download, verify, stage, swap), Homebrew and
//! HomebrewFormula (drive the brew CLI), AppStore (drive mas, degrade to
//! the store page), and Delegated (open the app so its own updater runs).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::brew;
use crate::cancel::CancelToken;
use crate::db::EngineDirs;
use crate::elevate;
use crate::errors::{EngineError, EngineResult};
use crate::http::HttpFetcher;
use crate::models::{AppDetail, InstallSource, SourceType, UpdateOutcome};
use crate::platform;

/// Grace period for a polite quit before the swap is abandoned.
const QUIT_WAIT: Duration = Duration::from_secs(5);
/// Deadline for any staging subprocess (hdiutil, ditto).
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(300);
/// Deadline for `mas upgrade`.
const MAS_TIMEOUT: Duration = Duration::from_secs(120);
/// Minimum free space demanded before a direct download starts.
const MIN_FREE_BYTES: u64 = 512 * 1024 * 1024;

pub type ProgressFn<'a> = &'a (dyn Fn(u8, &str, Option<(u64, Option<u64>)>) + Send + Sync);

/// The strategy chosen for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Homebrew,
    HomebrewFormula,
    AppStore,
    Delegated,
}

/// Phase 1 routes on the candidate's source type; anything unresolved falls
/// through to phase 2, which routes on the install source.
pub fn route(detail: &AppDetail) -> Route {
    if let Some(candidate) = &detail.candidate {
        match candidate.source_type {
            SourceType::AdobeCc => return Route::Delegated,
            SourceType::Mas => return Route::AppStore,
            SourceType::Sparkle => return Route::Direct,
            SourceType::HomebrewCask | SourceType::Github | SourceType::HomebrewApi => {
                if detail.record.homebrew_cask_token.is_some() {
                    return Route::Homebrew;
                }
            }
            _ => {}
        }
    }

    match detail.record.install_source {
        InstallSource::HomebrewFormula if detail.record.homebrew_formula_name.is_some() => {
            Route::HomebrewFormula
        }
        InstallSource::Homebrew if detail.record.homebrew_cask_token.is_some() => Route::Homebrew,
        InstallSource::MacAppStore => Route::AppStore,
        _ => Route::Delegated,
    }
}

pub struct Executors {
    http: Arc<HttpFetcher>,
    dirs: EngineDirs,
}

impl Executors {
    pub fn new(http: Arc<HttpFetcher>, dirs: EngineDirs) -> Self {
        Self { http, dirs }
    }

    /// Run the routed strategy to completion.
    pub async fn execute(
        &self,
        detail: &AppDetail,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> EngineResult<UpdateOutcome> {
        match route(detail) {
            Route::Direct => self.execute_direct(detail, progress, cancel).await,
            Route::Homebrew => self.execute_homebrew(detail, false, progress, cancel).await,
            Route::HomebrewFormula => self.execute_homebrew(detail, true, progress, cancel).await,
            Route::AppStore => self.execute_app_store(detail, progress).await,
            Route::Delegated => execute_delegated(detail, progress),
        }
    }

    // ------------------------------------------------------------------
    // Direct (download → verify → stage → quit → swap → finalize)
    // ------------------------------------------------------------------

    async fn execute_direct(
        &self,
        detail: &AppDetail,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> EngineResult<UpdateOutcome> {
        let record = &detail.record;
        let candidate = detail
            .candidate
            .as_ref()
            .ok_or_else(|| EngineError::NotFound("no update candidate".to_string()))?;

        // Preflight
        progress(2, "Preflight", None);
        let download_url = candidate
            .download_url
            .as_deref()
            .ok_or_else(|| EngineError::NotFound("candidate has no download url".to_string()))?;
        let app_path = record
            .app_path
            .as_deref()
            .ok_or_else(|| EngineError::Unsupported("app has no bundle path".to_string()))?;

        let download_dir = self
            .dirs
            .download_dir(&record.bundle_id, &candidate.available_version);
        std::fs::create_dir_all(&download_dir)?;
        if let Some(free) = platform::available_disk_space(&download_dir) {
            if free < MIN_FREE_BYTES {
                return Err(EngineError::ExecutorFailed {
                    stderr_tail: "insufficient free disk space for download".to_string(),
                });
            }
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Download
        let filename = filename_from_url(download_url);
        let artifact_path = download_dir.join(&filename);
        let display_name = record.display_name.clone();
        let (_, content_type) = {
            let progress = &progress;
            let result = self
                .http
                .download_to(download_url, &artifact_path, cancel, move |downloaded, total| {
                    let pct = total
                        .map(|t| ((downloaded as f64 / t as f64) * 100.0) as u16)
                        .unwrap_or(0);
                    let mapped = 5 + (pct * 45 / 100) as u8;
                    progress(
                        mapped,
                        &format!("Download: {display_name}"),
                        Some((downloaded, total)),
                    );
                })
                .await;
            match result {
                Ok(v) => v,
                Err(e) => {
                    let _ = std::fs::remove_dir_all(&download_dir);
                    return Err(e);
                }
            }
        };

        // Verify
        progress(50, "Verify", None);
        if let Some(expected) = candidate.sha256.as_deref() {
            let actual = sha256_file(&artifact_path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = std::fs::remove_dir_all(&download_dir);
                return Err(EngineError::IntegrityFailed(format!(
                    "sha256 mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        if cancel.is_cancelled() {
            let _ = std::fs::remove_dir_all(&download_dir);
            return Err(EngineError::Cancelled);
        }

        // Stage
        progress(55, "Stage", None);
        let file_type = {
            let magic = read_magic_bytes(&artifact_path)?;
            detect_file_type(&content_type, &filename, &magic)
        };
        let stage_dir = download_dir.join("stage");
        std::fs::create_dir_all(&stage_dir)?;

        let staged_app = match file_type {
            FileType::Dmg => self.stage_from_dmg(&artifact_path, &stage_dir).await?,
            FileType::Zip => self.stage_from_zip(&artifact_path, &stage_dir).await?,
            FileType::Pkg => {
                // Packages install themselves; there is no bundle swap.
                return self
                    .install_pkg(detail, &artifact_path, &download_dir, progress)
                    .await;
            }
            FileType::Unknown => {
                let _ = std::fs::remove_dir_all(&download_dir);
                return Err(EngineError::Unsupported(format!(
                    "unsupported artifact format: {filename}"
                )));
            }
        };

        // Quit
        progress(65, "Quit", None);
        let was_running = platform::is_app_running(&record.bundle_id);
        if was_running {
            let bundle_id = record.bundle_id.clone();
            let exited =
                tokio::task::spawn_blocking(move || platform::request_quit(&bundle_id, QUIT_WAIT))
                    .await
                    .unwrap_or(false);
            if !exited {
                let _ = std::fs::remove_dir_all(&download_dir);
                return Err(EngineError::AppRunning(record.display_name.clone()));
            }
        }
        if cancel.is_cancelled() {
            let _ = std::fs::remove_dir_all(&download_dir);
            return Err(EngineError::Cancelled);
        }

        // Install is the critical section: cancellation is deferred from
        // here until the swap either completes or rolls back.
        progress(75, "Install", None);
        let quarantine_dir = self.dirs.quarantine_dir(&record.bundle_id);
        std::fs::create_dir_all(&quarantine_dir)?;
        let parked = quarantine_dir.join(
            Path::new(app_path)
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("app.app")),
        );

        let target = Path::new(app_path);
        if target.exists() {
            move_bundle(target, &parked)?;
        }
        if let Err(e) = move_bundle(&staged_app, target) {
            // Roll the old bundle back into place.
            if parked.exists() {
                let _ = move_bundle(&parked, target);
            }
            let _ = std::fs::remove_dir_all(&download_dir);
            return Err(e);
        }

        // Finalize
        progress(95, "Finalize", None);
        let _ = std::fs::remove_dir_all(&quarantine_dir);
        platform::clear_quarantine_xattr(app_path);
        let _ = std::fs::remove_dir_all(&download_dir);

        progress(100, "Finalize", None);
        Ok(UpdateOutcome {
            bundle_id: record.bundle_id.clone(),
            success: true,
            message: Some(format!(
                "{} updated to {}",
                record.display_name, candidate.available_version
            )),
            source_type: candidate.source_type.as_str().to_string(),
            from_version: record.installed_version.clone(),
            to_version: Some(candidate.available_version.clone()),
            needs_relaunch: true,
            delegated: false,
        })
    }

    async fn install_pkg(
        &self,
        detail: &AppDetail,
        pkg_path: &Path,
        download_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> EngineResult<UpdateOutcome> {
        progress(60, "Install", None);
        let pkg = pkg_path.to_string_lossy().to_string();
        let result = tokio::task::spawn_blocking(move || {
            elevate::run_elevated("/usr/sbin/installer", &["-pkg", &pkg, "-target", "/"])
        })
        .await
        .map_err(|e| EngineError::internal(format!("task join: {e}")))?;

        let _ = std::fs::remove_dir_all(download_dir);
        let record = &detail.record;
        match result {
            Ok(output) if output.status.success() => {
                progress(100, "Finalize", None);
                Ok(UpdateOutcome {
                    bundle_id: record.bundle_id.clone(),
                    success: true,
                    message: Some(format!("{} installed via package", record.display_name)),
                    source_type: detail
                        .candidate
                        .as_ref()
                        .map(|c| c.source_type.as_str().to_string())
                        .unwrap_or_else(|| "sparkle".to_string()),
                    from_version: record.installed_version.clone(),
                    to_version: detail
                        .candidate
                        .as_ref()
                        .map(|c| c.available_version.clone()),
                    needs_relaunch: false,
                    delegated: false,
                })
            }
            Ok(output) => Err(EngineError::ExecutorFailed {
                stderr_tail: stderr_tail(&output.stderr),
            }),
            Err(elevate::ElevatedError::UserCancelled) => Err(EngineError::PermissionDenied(
                "administrator approval is required to install this package".to_string(),
            )),
            Err(e) => Err(EngineError::ExecutorFailed {
                stderr_tail: e.to_string(),
            }),
        }
    }

    async fn stage_from_dmg(&self, dmg_path: &Path, stage_dir: &Path) -> EngineResult<PathBuf> {
        let mount_point = stage_dir.join("dmg_mount");
        std::fs::create_dir_all(&mount_point)?;

        // Spawn with a stdin pipe so an embedded license prompt gets an
        // automatic acceptance instead of wedging the attach.
        let mut child = Command::new("hdiutil")
            .args([
                "attach",
                "-nobrowse",
                "-noverify",
                "-noautoopen",
                "-mountpoint",
            ])
            .arg(&mount_point)
            .arg(dmg_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"Y\n").await;
        }

        let output = tokio::time::timeout(SUBPROCESS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| EngineError::ExecutorFailed {
                stderr_tail: "hdiutil attach timed out".to_string(),
            })??;
        if !output.status.success() {
            return Err(EngineError::ExecutorFailed {
                stderr_tail: stderr_tail(&output.stderr),
            });
        }

        let result = async {
            let payload = find_app_in_dir(&mount_point)?;
            let dest = stage_dir.join(
                payload
                    .file_name()
                    .ok_or_else(|| EngineError::internal("payload bundle has no name"))?,
            );
            let copy = Command::new("cp")
                .arg("-R")
                .arg(&payload)
                .arg(&dest)
                .output()
                .await?;
            if !copy.status.success() {
                return Err(EngineError::ExecutorFailed {
                    stderr_tail: stderr_tail(&copy.stderr),
                });
            }
            Ok(dest)
        }
        .await;

        let _ = Command::new("hdiutil")
            .args(["detach", "-quiet"])
            .arg(&mount_point)
            .output()
            .await;

        result
    }

    async fn stage_from_zip(&self, zip_path: &Path, stage_dir: &Path) -> EngineResult<PathBuf> {
        let extract_dir = stage_dir.join("zip_extract");
        std::fs::create_dir_all(&extract_dir)?;

        let output = tokio::time::timeout(
            SUBPROCESS_TIMEOUT,
            Command::new("ditto")
                .arg("-xk")
                .arg(zip_path)
                .arg(&extract_dir)
                .output(),
        )
        .await
        .map_err(|_| EngineError::ExecutorFailed {
            stderr_tail: "ditto extract timed out".to_string(),
        })??;

        if !output.status.success() {
            return Err(EngineError::ExecutorFailed {
                stderr_tail: stderr_tail(&output.stderr),
            });
        }
        find_app_in_dir(&extract_dir)
    }

    // ------------------------------------------------------------------
    // Homebrew (cask + formula)
    // ------------------------------------------------------------------

    async fn execute_homebrew(
        &self,
        detail: &AppDetail,
        formula: bool,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> EngineResult<UpdateOutcome> {
        let record = &detail.record;
        let brew_path = brew::brew_path()
            .ok_or_else(|| EngineError::NotFound("Homebrew not found".to_string()))?;

        let (unit, source_type) = if formula {
            (
                record
                    .homebrew_formula_name
                    .clone()
                    .ok_or_else(|| EngineError::NotFound("no formula name".to_string()))?,
                "homebrew_formula",
            )
        } else {
            (
                record
                    .homebrew_cask_token
                    .clone()
                    .ok_or_else(|| EngineError::NotFound("no cask token".to_string()))?,
                "homebrew_cask",
            )
        };

        let pre_version = record.installed_version.clone().or_else(|| {
            record
                .app_path
                .as_deref()
                .and_then(|p| platform::parse_bundle(Path::new(p)))
                .and_then(|b| b.installed_version)
        });

        progress(5, "Preparing", None);
        let mut args: Vec<String> = vec!["upgrade".to_string()];
        if !formula {
            // An app the user installed by hand may not be registered with
            // brew yet; install --force adopts it.
            let unit_clone = unit.clone();
            let installed =
                tokio::task::spawn_blocking(move || brew::is_cask_installed(&unit_clone))
                    .await
                    .unwrap_or(true);
            if !installed {
                args = vec!["install".to_string(), "--force".to_string()];
            }
            args.push("--cask".to_string());
        }
        args.push(unit.clone());

        let mut cmd = Command::new(brew_path);
        cmd.current_dir("/tmp")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ap) = elevate::askpass_path() {
            cmd.env("SUDO_ASKPASS", ap);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::ExecutorFailed {
            stderr_tail: format!("failed to start brew: {e}"),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::internal("brew stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::internal("brew stderr unavailable"))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stderr_buf: Vec<String> = Vec::new();
        let mut cancel_rx = cancel.subscribe();

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    let _ = child.kill().await;
                    return Err(EngineError::Cancelled);
                }
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => {
                            log::debug!("brew: {l}");
                            if let Some((phase, pct)) = brew_milestone(&l) {
                                progress(pct, phase, None);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("error reading brew stdout: {e}");
                            break;
                        }
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Ok(Some(l)) = line {
                        stderr_buf.push(l);
                    }
                }
            }
        }

        let status = child.wait().await?;
        // Drain whatever stderr arrived after stdout closed.
        while let Ok(Some(l)) = stderr_lines.next_line().await {
            stderr_buf.push(l);
        }
        if !status.success() {
            let stderr_text = stderr_buf.join("\n");
            if needs_elevation(&stderr_text) && elevate::askpass_path().is_some() {
                progress(30, "Retrying with administrator privileges", None);
                let brew_str = brew_path.to_string_lossy().to_string();
                let args_clone = args.clone();
                let retry = tokio::task::spawn_blocking(move || {
                    let arg_refs: Vec<&str> = args_clone.iter().map(String::as_str).collect();
                    elevate::run_elevated(&brew_str, &arg_refs)
                })
                .await
                .map_err(|e| EngineError::internal(format!("task join: {e}")))?;

                match retry {
                    Ok(output) if output.status.success() => {}
                    Err(elevate::ElevatedError::UserCancelled) => {
                        return Err(EngineError::PermissionDenied(
                            "administrator approval is required for this update".to_string(),
                        ));
                    }
                    Ok(output) => {
                        return Err(EngineError::ExecutorFailed {
                            stderr_tail: stderr_tail(&output.stderr),
                        });
                    }
                    Err(e) => {
                        return Err(EngineError::ExecutorFailed {
                            stderr_tail: e.to_string(),
                        });
                    }
                }
            } else if stderr_text.contains("Operation not permitted")
                || stderr_text.contains("cannot access parent directories")
            {
                return Err(EngineError::PermissionDenied(
                    "macOS blocked Homebrew from modifying /Applications. Grant macPlus \
                     'App Management' in System Settings > Privacy & Security, then retry."
                        .to_string(),
                ));
            } else {
                return Err(EngineError::ExecutorFailed {
                    stderr_tail: tail_of(&stderr_text),
                });
            }
        }

        progress(95, "Done", None);

        // Trust the exit code only if the on-disk version moved.
        let new_version = record
            .app_path
            .as_deref()
            .and_then(|p| platform::parse_bundle(Path::new(p)))
            .and_then(|b| b.installed_version)
            .or_else(|| {
                detail
                    .candidate
                    .as_ref()
                    .map(|c| c.available_version.clone())
            });
        if let (Some(old), Some(new), Some(_)) =
            (&pre_version, &new_version, record.app_path.as_deref())
        {
            if old == new {
                return Err(EngineError::ExecutorFailed {
                    stderr_tail: format!(
                        "brew reported success but {unit} is still at {old}; \
                         run 'brew upgrade {}{unit}' in a terminal",
                        if formula { "" } else { "--cask " }
                    ),
                });
            }
        }

        progress(100, "Done", None);
        Ok(UpdateOutcome {
            bundle_id: record.bundle_id.clone(),
            success: true,
            message: Some(format!("Successfully upgraded '{unit}'")),
            source_type: source_type.to_string(),
            from_version: pre_version,
            to_version: new_version,
            needs_relaunch: false,
            delegated: false,
        })
    }

    // ------------------------------------------------------------------
    // Mac App Store
    // ------------------------------------------------------------------

    async fn execute_app_store(
        &self,
        detail: &AppDetail,
        progress: ProgressFn<'_>,
    ) -> EngineResult<UpdateOutcome> {
        let record = &detail.record;

        // SIP-protected apps cannot be replaced by mas.
        let system_app = record
            .app_path
            .as_deref()
            .map(|p| p.starts_with("/System/"))
            .unwrap_or(false);

        let app_id = record.mas_app_id.clone();
        if system_app || app_id.is_none() || !platform::is_mas_cli_installed() {
            return delegate_to_store(detail, app_id.as_deref(), progress);
        }
        let app_id = app_id.unwrap();

        progress(5, "Starting Mac App Store upgrade", None);
        let output = tokio::time::timeout(
            MAS_TIMEOUT,
            Command::new("mas")
                .current_dir("/tmp")
                .args(["upgrade", &app_id])
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => {
                progress(60, "Verifying installation", None);
                let new_version = record
                    .app_path
                    .as_deref()
                    .and_then(|p| platform::parse_bundle(Path::new(p)))
                    .and_then(|b| b.installed_version);
                let changed = match (&record.installed_version, &new_version) {
                    (Some(old), Some(new)) => old != new,
                    _ => true,
                };
                if changed {
                    progress(100, "Mac App Store upgrade completed", None);
                    return Ok(UpdateOutcome {
                        bundle_id: record.bundle_id.clone(),
                        success: true,
                        message: Some("Upgraded via Mac App Store".to_string()),
                        source_type: "mas".to_string(),
                        from_version: record.installed_version.clone(),
                        to_version: new_version,
                        needs_relaunch: false,
                        delegated: false,
                    });
                }
                log::info!(
                    "mas upgrade left {} unchanged, delegating to the store",
                    record.bundle_id
                );
            }
            Ok(Ok(output)) => {
                log::info!(
                    "mas upgrade failed for {} (exit {:?}): {}",
                    record.bundle_id,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(Err(e)) => log::info!("failed to run mas for {}: {e}", record.bundle_id),
            Err(_) => log::info!("mas upgrade timed out for {}", record.bundle_id),
        }

        delegate_to_store(detail, Some(&app_id), progress)
    }
}

/// Open the App Store (to the app's page when the id is known) and report a
/// delegated outcome.
fn delegate_to_store(
    detail: &AppDetail,
    app_id: Option<&str>,
    progress: ProgressFn<'_>,
) -> EngineResult<UpdateOutcome> {
    let record = &detail.record;
    progress(80, "Opening Mac App Store", None);

    let target = match app_id {
        Some(id) => format!("macappstore://apps.apple.com/app/id{id}"),
        None => "macappstore://apps.apple.com".to_string(),
    };
    let output = std::process::Command::new("open").arg(&target).output()?;
    if !output.status.success() {
        return Err(EngineError::ExecutorFailed {
            stderr_tail: stderr_tail(&output.stderr),
        });
    }

    progress(100, "Opened Mac App Store", None);
    Ok(UpdateOutcome {
        bundle_id: record.bundle_id.clone(),
        success: true,
        message: Some("Opened the Mac App Store to apply this update".to_string()),
        source_type: "mas".to_string(),
        from_version: record.installed_version.clone(),
        to_version: detail
            .candidate
            .as_ref()
            .map(|c| c.available_version.clone()),
        needs_relaunch: false,
        delegated: true,
    })
}

/// Open the app itself so its built-in updater takes over. A later scan and
/// check confirm whether the update actually landed.
fn execute_delegated(detail: &AppDetail, progress: ProgressFn<'_>) -> EngineResult<UpdateOutcome> {
    let record = &detail.record;

    // Adobe apps update through the Creative Cloud helper, not themselves.
    let target = if detail
        .candidate
        .as_ref()
        .map(|c| c.source_type == SourceType::AdobeCc)
        .unwrap_or(false)
    {
        progress(10, "Opening Adobe Creative Cloud", None);
        let output = std::process::Command::new("open")
            .args(["-b", "com.adobe.acc.AdobeCreativeCloud"])
            .output()?;
        if !output.status.success() {
            return Err(EngineError::ExecutorFailed {
                stderr_tail: stderr_tail(&output.stderr),
            });
        }
        "Adobe Creative Cloud".to_string()
    } else {
        let app_path = record
            .app_path
            .as_deref()
            .ok_or_else(|| EngineError::Unsupported("app has no bundle path".to_string()))?;
        progress(10, &format!("Opening {}", record.display_name), None);
        platform::open_app(Path::new(app_path))?;
        record.display_name.clone()
    };

    progress(100, "Opened for self-update", None);
    Ok(UpdateOutcome {
        bundle_id: record.bundle_id.clone(),
        success: true,
        message: Some(format!("Opened {target} to apply the update")),
        source_type: detail
            .candidate
            .as_ref()
            .map(|c| c.source_type.as_str().to_string())
            .unwrap_or_else(|| record.install_source.as_str().to_string()),
        from_version: record.installed_version.clone(),
        to_version: detail
            .candidate
            .as_ref()
            .map(|c| c.available_version.clone()),
        needs_relaunch: false,
        delegated: true,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a brew stdout line to a coarse progress milestone.
fn brew_milestone(line: &str) -> Option<(&'static str, u8)> {
    if line.contains("Downloading") {
        Some(("Downloading", 30))
    } else if line.contains("Verifying") {
        Some(("Verifying", 50))
    } else if line.contains("Installing") || line.contains("Purging") {
        Some(("Installing", 70))
    } else if line.contains("Moving") || line.contains("Linking") {
        Some(("Moving", 85))
    } else if line.contains("successfully") {
        Some(("Done", 95))
    } else {
        None
    }
}

fn needs_elevation(stderr: &str) -> bool {
    (stderr.contains("sudo") && stderr.contains("password"))
        || stderr.contains("terminal is required")
        || stderr.contains("tty")
        || stderr.contains("Operation not permitted")
        || stderr.contains("Permission denied")
}

fn filename_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or("update")
        .split('?')
        .next()
        .unwrap_or("update")
        .to_string()
}

fn stderr_tail(stderr: &[u8]) -> String {
    tail_of(&String::from_utf8_lossy(stderr))
}

/// Last ~400 chars; brew errors end with the part that matters.
fn tail_of(text: &str) -> String {
    let text = text.trim();
    if text.len() <= 400 {
        text.to_string()
    } else {
        let start = text.len() - 400;
        let boundary = text
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= start)
            .unwrap_or(start);
        text[boundary..].to_string()
    }
}

async fn sha256_file(path: &Path) -> EngineResult<String> {
    let data = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn read_magic_bytes(path: &Path) -> EngineResult<Vec<u8>> {
    use std::io::Read;
    let mut buf = [0u8; 16];
    let mut f = std::fs::File::open(path)?;
    let n = f.read(&mut buf)?;
    Ok(buf[..n].to_vec())
}

/// Move a bundle, falling back to `mv` for cross-device targets.
fn move_bundle(from: &Path, to: &Path) -> EngineResult<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let output = std::process::Command::new("mv")
        .arg(from)
        .arg(to)
        .output()?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if needs_elevation(&stderr) {
        let from_str = from.to_string_lossy().to_string();
        let to_str = to.to_string_lossy().to_string();
        match elevate::run_elevated("mv", &[&from_str, &to_str]) {
            Ok(out) if out.status.success() => return Ok(()),
            Err(elevate::ElevatedError::UserCancelled) => {
                return Err(EngineError::PermissionDenied(
                    "administrator approval is required to replace this app".to_string(),
                ))
            }
            _ => {}
        }
    }
    Err(EngineError::ExecutorFailed {
        stderr_tail: tail_of(&stderr),
    })
}

fn find_app_in_dir(dir: &Path) -> EngineResult<PathBuf> {
    let is_app = |p: &Path| p.extension().and_then(|e| e.to_str()) == Some("app");

    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if is_app(&path) {
                return Ok(path);
            }
        }
    }
    // One level deeper covers archives that wrap the bundle in a folder.
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let sub = entry.path();
            if sub.is_dir() {
                if let Ok(sub_entries) = std::fs::read_dir(&sub) {
                    for sub_entry in sub_entries.flatten() {
                        let path = sub_entry.path();
                        if is_app(&path) {
                            return Ok(path);
                        }
                    }
                }
            }
        }
    }
    Err(EngineError::NotFound(
        "no .app bundle found in archive".to_string(),
    ))
}

#[derive(Debug, PartialEq)]
enum FileType {
    Dmg,
    Zip,
    Pkg,
    Unknown,
}

/// Content-Type first, then extension, then magic bytes.
fn detect_file_type(content_type: &str, filename: &str, bytes: &[u8]) -> FileType {
    if !content_type.is_empty() && content_type != "application/octet-stream" {
        if content_type.contains("apple-diskimage") || content_type.contains("x-diskcopy") {
            return FileType::Dmg;
        }
        if content_type.contains("zip") {
            return FileType::Zip;
        }
        if content_type.contains("apple.installer") {
            return FileType::Pkg;
        }
    }

    let lower = filename.to_lowercase();
    if lower.ends_with(".dmg") {
        return FileType::Dmg;
    }
    if lower.ends_with(".zip") {
        return FileType::Zip;
    }
    if lower.ends_with(".pkg") {
        return FileType::Pkg;
    }

    if bytes.len() >= 4 {
        if bytes[0..4] == [0x50, 0x4B, 0x03, 0x04] {
            return FileType::Zip;
        }
        // Compressed DMGs commonly lead with a bzip2 stream.
        if bytes[0..2] == [0x42, 0x5A] {
            return FileType::Dmg;
        }
        // PKG files are XAR archives.
        if bytes[0..4] == [0x78, 0x61, 0x72, 0x21] {
            return FileType::Pkg;
        }
    }

    FileType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppRecord, UpdateCandidate};

    fn detail(
        source: InstallSource,
        candidate_source: Option<SourceType>,
        cask_token: Option<&str>,
        formula_name: Option<&str>,
    ) -> AppDetail {
        AppDetail {
            record: AppRecord {
                id: 1,
                bundle_id: "com.example.app".to_string(),
                display_name: "Example".to_string(),
                app_path: Some("/Applications/Example.app".to_string()),
                installed_version: Some("1.0".to_string()),
                bundle_version: None,
                icon_cache_path: None,
                architectures: None,
                install_source: source,
                homebrew_cask_token: cask_token.map(String::from),
                homebrew_formula_name: formula_name.map(String::from),
                mas_app_id: None,
                sparkle_feed_url: None,
                is_ignored: false,
                first_seen_at: None,
                last_seen_at: None,
            },
            update_sources: Vec::new(),
            candidate: candidate_source.map(|st| UpdateCandidate {
                bundle_id: "com.example.app".to_string(),
                available_version: "2.0".to_string(),
                source_type: st,
                download_url: Some("https://example.com/app-2.0.dmg".to_string()),
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
    fn phase_one_routes_by_candidate_source() {
        assert_eq!(
            route(&detail(InstallSource::Direct, Some(SourceType::AdobeCc), None, None)),
            Route::Delegated
        );
        assert_eq!(
            route(&detail(InstallSource::Direct, Some(SourceType::Mas), None, None)),
            Route::AppStore
        );
        assert_eq!(
            route(&detail(InstallSource::Direct, Some(SourceType::Sparkle), None, None)),
            Route::Direct
        );
        assert_eq!(
            route(&detail(
                InstallSource::Homebrew,
                Some(SourceType::HomebrewCask),
                Some("bitwarden"),
                None
            )),
            Route::Homebrew
        );
        assert_eq!(
            route(&detail(
                InstallSource::Direct,
                Some(SourceType::Github),
                Some("iina"),
                None
            )),
            Route::Homebrew
        );
    }

    #[test]
    fn tokenless_brew_candidates_fall_through() {
        // homebrew_api candidate without a cask token: phase 2 decides.
        assert_eq!(
            route(&detail(
                InstallSource::Direct,
                Some(SourceType::HomebrewApi),
                None,
                None
            )),
            Route::Delegated
        );
        assert_eq!(
            route(&detail(
                InstallSource::MacAppStore,
                Some(SourceType::HomebrewApi),
                None,
                None
            )),
            Route::AppStore
        );
    }

    #[test]
    fn vendor_candidates_route_by_install_source() {
        assert_eq!(
            route(&detail(
                InstallSource::Direct,
                Some(SourceType::Keystone),
                None,
                None
            )),
            Route::Delegated
        );
        assert_eq!(
            route(&detail(
                InstallSource::Homebrew,
                Some(SourceType::MicrosoftAutoupdate),
                Some("microsoft-word"),
                None
            )),
            Route::Homebrew
        );
    }

    #[test]
    fn phase_two_routes_by_install_source() {
        assert_eq!(
            route(&detail(
                InstallSource::HomebrewFormula,
                None,
                None,
                Some("ripgrep")
            )),
            Route::HomebrewFormula
        );
        assert_eq!(
            route(&detail(InstallSource::Homebrew, None, Some("token"), None)),
            Route::Homebrew
        );
        assert_eq!(
            route(&detail(InstallSource::MacAppStore, None, None, None)),
            Route::AppStore
        );
        assert_eq!(
            route(&detail(InstallSource::Direct, None, None, None)),
            Route::Delegated
        );
    }

    #[test]
    fn file_type_detection_order() {
        assert_eq!(
            detect_file_type("application/x-apple-diskimage", "x.bin", &[]),
            FileType::Dmg
        );
        assert_eq!(detect_file_type("", "App-1.0.zip", &[]), FileType::Zip);
        assert_eq!(detect_file_type("", "App.pkg", &[]), FileType::Pkg);
        assert_eq!(
            detect_file_type("application/octet-stream", "unknown", &[0x50, 0x4B, 0x03, 0x04]),
            FileType::Zip
        );
        assert_eq!(
            detect_file_type("", "unknown", &[0x78, 0x61, 0x72, 0x21]),
            FileType::Pkg
        );
        assert_eq!(
            detect_file_type("", "unknown", &[0x42, 0x5A, 0x68, 0x39]),
            FileType::Dmg
        );
        assert_eq!(detect_file_type("", "unknown", &[0x00]), FileType::Unknown);
    }

    #[test]
    fn brew_milestones_map_to_percentages() {
        assert_eq!(
            brew_milestone("==> Downloading https://example.com/x.dmg"),
            Some(("Downloading", 30))
        );
        assert_eq!(brew_milestone("==> Verifying checksum"), Some(("Verifying", 50)));
        assert_eq!(
            brew_milestone("==> Installing Cask bitwarden"),
            Some(("Installing", 70))
        );
        assert_eq!(
            brew_milestone("==> Moving App 'Bitwarden.app'"),
            Some(("Moving", 85))
        );
        assert_eq!(
            brew_milestone("🍺  bitwarden was successfully upgraded!"),
            Some(("Done", 95))
        );
        assert_eq!(brew_milestone("random output"), None);
    }

    #[test]
    fn filename_extraction_strips_query() {
        assert_eq!(
            filename_from_url("https://example.com/dl/App-1.2.dmg?token=x"),
            "App-1.2.dmg"
        );
        assert_eq!(filename_from_url("weird"), "weird");
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(1000) + "the actual error";
        let tail = tail_of(&long);
        assert!(tail.len() <= 400);
        assert!(tail.ends_with("the actual error"));
    }

    #[test]
    fn find_app_in_dir_checks_two_levels() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("wrapper");
        std::fs::create_dir_all(nested.join("Payload.app")).unwrap();
        let found = find_app_in_dir(tmp.path()).unwrap();
        assert!(found.ends_with("Payload.app"));
    }
}
