//! App removal: quit, trash the bundle, sweep associated files on request,
//! then drop the catalog row.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::Serialize;

use crate::elevate;
use crate::errors::{EngineError, EngineResult};
use crate::models::AppRecord;
use crate::platform;

#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub bundle_id: String,
    pub removed_app: bool,
    pub removed_paths: Vec<String>,
}

/// Well-known per-app data locations, keyed by bundle id.
pub fn associated_paths(bundle_id: &str) -> Vec<PathBuf> {
    let home = match dirs::home_dir() {
        Some(h) => h,
        None => return Vec::new(),
    };
    let lib = home.join("Library");
    vec![
        lib.join("Application Support").join(bundle_id),
        lib.join("Caches").join(bundle_id),
        lib.join("Preferences").join(format!("{bundle_id}.plist")),
        lib.join("Logs").join(bundle_id),
        lib.join("Saved Application State")
            .join(format!("{bundle_id}.savedState")),
        lib.join("HTTPStorages").join(bundle_id),
    ]
}

/// Associated files that actually exist on disk, for a pre-flight listing.
pub fn scan_associated_files(bundle_id: &str) -> Vec<String> {
    associated_paths(bundle_id)
        .into_iter()
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().to_string())
        .collect()
}

/// Remove an app from disk. The bundle goes to the Trash via Finder
/// scripting; an elevated removal is the fallback for protected locations.
pub fn uninstall_app(record: &AppRecord, cleanup_associated: bool) -> EngineResult<UninstallReport> {
    let mut removed_paths = Vec::new();
    let mut removed_app = false;

    if let Some(app_path) = record.app_path.as_deref() {
        platform::request_quit(&record.bundle_id, Duration::from_secs(5));

        let path = std::path::Path::new(app_path);
        if path.exists() {
            let trashed = Command::new("osascript")
                .current_dir("/tmp")
                .args([
                    "-e",
                    &format!(
                        "tell application \"Finder\" to move POSIX file \"{app_path}\" to trash"
                    ),
                ])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);

            if trashed {
                removed_app = true;
            } else {
                match elevate::run_elevated("rm", &["-rf", app_path]) {
                    Ok(output) if output.status.success() => removed_app = true,
                    Err(elevate::ElevatedError::UserCancelled) => {
                        return Err(EngineError::PermissionDenied(
                            "administrator approval is required to remove this app".to_string(),
                        ));
                    }
                    Ok(output) => {
                        return Err(EngineError::ExecutorFailed {
                            stderr_tail: String::from_utf8_lossy(&output.stderr)
                                .trim()
                                .to_string(),
                        });
                    }
                    Err(e) => {
                        return Err(EngineError::ExecutorFailed {
                            stderr_tail: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    if cleanup_associated {
        for path in associated_paths(&record.bundle_id) {
            if !path.exists() {
                continue;
            }
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed_paths.push(path.to_string_lossy().to_string()),
                Err(e) => log::warn!("failed to remove {}: {e}", path.display()),
            }
        }
    }

    Ok(UninstallReport {
        bundle_id: record.bundle_id.clone(),
        removed_app,
        removed_paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn associated_paths_are_keyed_by_bundle_id() {
        let paths = associated_paths("com.example.app");
        assert!(!paths.is_empty());
        assert!(paths
            .iter()
            .all(|p| p.to_string_lossy().contains("com.example.app")));
        assert!(paths
            .iter()
            .any(|p| p.to_string_lossy().ends_with("com.example.app.plist")));
    }

    #[test]
    fn scan_reports_only_existing_paths() {
        // Nothing for a made-up bundle id should exist.
        assert!(scan_associated_files("com.macplus.test.nonexistent").is_empty());
    }
}
