//! Self-update: the engine upgrading its own bundle.
//!
//! Same pipeline as a direct app update, different target: check the
//! project's release feed, stream the artifact with progress, verify the
//! published sha256 digest, stage the new bundle, and wait for an explicit
//! relaunch. The swap never happens behind the user's back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::db::EngineDirs;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::http::HttpFetcher;
use crate::models::SelfUpdateInfo;
use crate::{platform, version};

const SELF_REPO_OWNER: &str = "macplus-app";
const SELF_REPO_NAME: &str = "macplus";

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct SelfUpdater {
    http: Arc<HttpFetcher>,
    events: EventBus,
    dirs: EngineDirs,
    staged: Mutex<Option<PathBuf>>,
}

struct ReleaseAsset {
    name: String,
    url: String,
    sha256: Option<String>,
}

impl SelfUpdater {
    pub fn new(http: Arc<HttpFetcher>, events: EventBus, dirs: EngineDirs) -> Self {
        Self {
            http,
            events,
            dirs,
            staged: Mutex::new(None),
        }
    }

    /// Whether a newer engine release exists. Emits `self-update-available`
    /// when it does.
    pub async fn check(&self) -> EngineResult<Option<SelfUpdateInfo>> {
        let (release_version, asset, notes_url) = match self.latest_release().await? {
            Some(r) => r,
            None => return Ok(None),
        };

        if !version::is_newer(CURRENT_VERSION, &release_version) {
            return Ok(None);
        }

        let info = SelfUpdateInfo {
            current_version: CURRENT_VERSION.to_string(),
            available_version: release_version,
            download_url: asset.as_ref().map(|a| a.url.clone()),
            release_notes_url: notes_url,
        };
        self.events.emit(EngineEvent::SelfUpdateAvailable {
            info: info.clone(),
        });
        Ok(Some(info))
    }

    /// Download, verify, and stage the new engine bundle. Ends with
    /// `self-update-complete { relaunch_required: true }` on success.
    pub async fn execute(&self, cancel: &CancelToken) -> EngineResult<()> {
        let result = self.execute_inner(cancel).await;
        match &result {
            Ok(()) => self.events.emit(EngineEvent::SelfUpdateComplete {
                success: true,
                message: None,
                relaunch_required: true,
            }),
            Err(e) => self.events.emit(EngineEvent::SelfUpdateComplete {
                success: false,
                message: Some(e.to_string()),
                relaunch_required: false,
            }),
        }
        result
    }

    async fn execute_inner(&self, cancel: &CancelToken) -> EngineResult<()> {
        let (release_version, asset, _) = self
            .latest_release()
            .await?
            .ok_or_else(|| EngineError::NotFound("no release found".to_string()))?;
        if !version::is_newer(CURRENT_VERSION, &release_version) {
            return Err(EngineError::NotFound("already up to date".to_string()));
        }
        let asset =
            asset.ok_or_else(|| EngineError::NotFound("release has no macOS asset".to_string()))?;

        self.events.emit(EngineEvent::SelfUpdateProgress {
            phase: "Download".to_string(),
            percent: 5,
            downloaded_bytes: None,
            total_bytes: None,
        });

        let stage_root = self.dirs.downloads.join("self-update").join(&release_version);
        std::fs::create_dir_all(&stage_root)?;
        let artifact = stage_root.join(&asset.name);

        let events = self.events.clone();
        let (_, content_type) = self
            .http
            .download_to(&asset.url, &artifact, cancel, move |downloaded, total| {
                let pct = total
                    .map(|t| 5 + ((downloaded as f64 / t as f64) * 70.0) as u8)
                    .unwrap_or(5);
                events.emit(EngineEvent::SelfUpdateProgress {
                    phase: "Download".to_string(),
                    percent: pct.min(75),
                    downloaded_bytes: Some(downloaded),
                    total_bytes: total,
                });
            })
            .await?;

        // The release's published digest is the integrity anchor; a release
        // without one is rejected rather than trusted blindly.
        self.events.emit(EngineEvent::SelfUpdateProgress {
            phase: "Verify".to_string(),
            percent: 80,
            downloaded_bytes: None,
            total_bytes: None,
        });
        match asset.sha256.as_deref() {
            Some(expected) => {
                let actual = sha256_of(&artifact).await?;
                if !actual.eq_ignore_ascii_case(expected) {
                    let _ = std::fs::remove_dir_all(&stage_root);
                    return Err(EngineError::IntegrityFailed(format!(
                        "self-update digest mismatch: expected {expected}, got {actual}"
                    )));
                }
            }
            None => {
                let _ = std::fs::remove_dir_all(&stage_root);
                return Err(EngineError::IntegrityFailed(
                    "release publishes no digest for its macOS asset".to_string(),
                ));
            }
        }

        self.events.emit(EngineEvent::SelfUpdateProgress {
            phase: "Stage".to_string(),
            percent: 90,
            downloaded_bytes: None,
            total_bytes: None,
        });

        let staged_app = stage_artifact(&artifact, &stage_root, &content_type).await?;
        *self.staged.lock().await = Some(staged_app);
        Ok(())
    }

    /// Swap the staged bundle into place and relaunch. Only meaningful
    /// after a successful `execute`.
    pub async fn relaunch(&self) -> EngineResult<()> {
        let staged = self
            .staged
            .lock()
            .await
            .clone()
            .ok_or_else(|| EngineError::NotFound("no staged self-update".to_string()))?;

        let current_exe = std::env::current_exe()?;
        let bundle = current_bundle_path(&current_exe)
            .ok_or_else(|| EngineError::Unsupported("engine is not running from a bundle".to_string()))?;

        let parked = self.dirs.quarantine_dir("com.macplus.app");
        std::fs::create_dir_all(&parked)?;
        let parked_app = parked.join(bundle.file_name().unwrap_or_default());

        std::fs::rename(&bundle, &parked_app)?;
        if let Err(e) = std::fs::rename(&staged, &bundle) {
            let _ = std::fs::rename(&parked_app, &bundle);
            return Err(e.into());
        }

        platform::clear_quarantine_xattr(&bundle.to_string_lossy());
        let _ = std::fs::remove_dir_all(&parked);
        platform::relaunch_app(&bundle.to_string_lossy());
        std::process::exit(0);
    }

    /// Latest release: version, best macOS asset (with its digest when the
    /// release publishes one), and the notes URL.
    async fn latest_release(
        &self,
    ) -> EngineResult<Option<(String, Option<ReleaseAsset>, Option<String>)>> {
        let url = format!(
            "https://api.github.com/repos/{SELF_REPO_OWNER}/{SELF_REPO_NAME}/releases/latest"
        );
        let resp = self
            .http
            .get_conditional(&url, &[("Accept", "application/vnd.github+json")])
            .await?;
        if !resp.is_success() {
            return Ok(None);
        }

        let json: serde_json::Value = serde_json::from_str(&resp.body)?;
        if json.get("draft").and_then(|v| v.as_bool()).unwrap_or(false)
            || json
                .get("prerelease")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        {
            return Ok(None);
        }

        let tag = match json.get("tag_name").and_then(|v| v.as_str()) {
            Some(t) => t.strip_prefix('v').unwrap_or(t).to_string(),
            None => return Ok(None),
        };
        let notes_url = json
            .get("html_url")
            .and_then(|v| v.as_str())
            .map(String::from);

        let asset = json
            .get("assets")
            .and_then(|v| v.as_array())
            .and_then(|assets| {
                assets.iter().find(|a| {
                    let name = a
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_lowercase();
                    (name.ends_with(".dmg") || name.ends_with(".zip"))
                        && !name.contains("linux")
                        && !name.contains("windows")
                })
            })
            .and_then(|a| {
                Some(ReleaseAsset {
                    name: a.get("name")?.as_str()?.to_string(),
                    url: a.get("browser_download_url")?.as_str()?.to_string(),
                    sha256: a
                        .get("digest")
                        .and_then(|d| d.as_str())
                        .and_then(|d| d.strip_prefix("sha256:"))
                        .map(String::from),
                })
            });

        Ok(Some((tag, asset, notes_url)))
    }
}

async fn sha256_of(path: &Path) -> EngineResult<String> {
    use sha2::{Digest, Sha256};
    let data = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

/// Unpack the artifact and return the staged `.app` path.
async fn stage_artifact(
    artifact: &Path,
    stage_root: &Path,
    content_type: &str,
) -> EngineResult<PathBuf> {
    let name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();

    if name.ends_with(".zip") || content_type.contains("zip") {
        let extract = stage_root.join("extract");
        std::fs::create_dir_all(&extract)?;
        let output = tokio::process::Command::new("ditto")
            .arg("-xk")
            .arg(artifact)
            .arg(&extract)
            .output()
            .await?;
        if !output.status.success() {
            return Err(EngineError::ExecutorFailed {
                stderr_tail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        find_staged_app(&extract)
    } else if name.ends_with(".dmg") || content_type.contains("diskimage") {
        let mount = stage_root.join("mount");
        std::fs::create_dir_all(&mount)?;
        let attach = tokio::process::Command::new("hdiutil")
            .args(["attach", "-nobrowse", "-noverify", "-noautoopen", "-mountpoint"])
            .arg(&mount)
            .arg(artifact)
            .output()
            .await?;
        if !attach.status.success() {
            return Err(EngineError::ExecutorFailed {
                stderr_tail: String::from_utf8_lossy(&attach.stderr).trim().to_string(),
            });
        }

        let result = async {
            let payload = find_staged_app(&mount)?;
            let dest = stage_root.join(payload.file_name().unwrap_or_default());
            let copy = tokio::process::Command::new("cp")
                .arg("-R")
                .arg(&payload)
                .arg(&dest)
                .output()
                .await?;
            if !copy.status.success() {
                return Err(EngineError::ExecutorFailed {
                    stderr_tail: String::from_utf8_lossy(&copy.stderr).trim().to_string(),
                });
            }
            Ok(dest)
        }
        .await;

        let _ = tokio::process::Command::new("hdiutil")
            .args(["detach", "-quiet"])
            .arg(&mount)
            .output()
            .await;
        result
    } else {
        Err(EngineError::Unsupported(format!(
            "unsupported self-update artifact: {name}"
        )))
    }
}

fn find_staged_app(dir: &Path) -> EngineResult<PathBuf> {
    std::fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.extension().and_then(|e| e.to_str()) == Some("app"))
        .ok_or_else(|| EngineError::NotFound("no .app in self-update artifact".to_string()))
}

/// `.../macPlus.app/Contents/MacOS/macplus` → `.../macPlus.app`.
fn current_bundle_path(exe: &Path) -> Option<PathBuf> {
    let mut current = exe.parent()?;
    while let Some(parent) = current.parent() {
        if current.extension().and_then(|e| e.to_str()) == Some("app") {
            return Some(current.to_path_buf());
        }
        current = parent;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_path_resolution() {
        let exe = Path::new("/Applications/macPlus.app/Contents/MacOS/macplus");
        assert_eq!(
            current_bundle_path(exe),
            Some(PathBuf::from("/Applications/macPlus.app"))
        );
        assert_eq!(current_bundle_path(Path::new("/usr/local/bin/macplus")), None);
    }

    #[test]
    fn current_version_is_crate_version() {
        assert_eq!(CURRENT_VERSION, env!("CARGO_PKG_VERSION"));
    }
}
