//! Homebrew CLI plumbing: path resolution, pre-configured command builder,
//! and the JSON surfaces the scanner and checkers consume.
//!
//! Output parsing stays on lenient `serde_json::Value` access so a Homebrew
//! format change degrades to "no data" instead of an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use crate::elevate;
use crate::platform::run_command_with_timeout;
use crate::version;

/// Cask tokens Homebrew tracks but cannot actually update (macOS system
/// components). Filtered from every surface.
const SYSTEM_CASK_BLOCKLIST: &[&str] = &["toolreleases"];

const BREW_TIMEOUT_SECS: u64 = 60;

static BREW_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Absolute path to `brew`, resolved once. Well-known locations first
/// (GUI processes have a minimal PATH), then a `which` fallback.
pub fn brew_path() -> Option<&'static PathBuf> {
    BREW_PATH
        .get_or_init(|| {
            for candidate in ["/opt/homebrew/bin/brew", "/usr/local/bin/brew"] {
                let p = PathBuf::from(candidate);
                if p.exists() {
                    log::info!("found brew at {}", p.display());
                    return Some(p);
                }
            }
            if let Ok(p) = which::which("brew") {
                log::info!("found brew via which: {}", p.display());
                return Some(p);
            }
            log::warn!("Homebrew not found on this system");
            None
        })
        .as_ref()
}

/// A `Command` pre-configured for brew: cwd pinned to /tmp and, when the
/// askpass helper exists, SUDO_ASKPASS injected so nested sudo calls can
/// prompt natively instead of needing a TTY.
pub fn brew_command(brew: &Path) -> Command {
    let mut cmd = Command::new(brew);
    cmd.current_dir("/tmp");
    if let Some(ap) = elevate::askpass_path() {
        cmd.env("SUDO_ASKPASS", ap);
        cmd.env(
            "SUDO_PROMPT",
            "macPlus needs your password to install this update:",
        );
    }
    cmd
}

/// One entry of `brew outdated --cask --greedy --json=v2`.
#[derive(Debug, Clone)]
pub struct OutdatedCask {
    pub current_version: String,
    pub installed_versions: String,
}

/// One entry of `brew outdated --formula --json=v2`.
#[derive(Debug, Clone)]
pub struct OutdatedFormula {
    pub current_version: String,
    pub installed_version: String,
}

/// An installed cask from `brew info --json=v2 --cask`.
#[derive(Debug, Clone)]
pub struct InstalledCask {
    pub token: String,
    pub name: String,
    pub version: String,
    pub installed_version: Option<String>,
    /// First `.app` artifact name, when the cask ships one.
    pub app_artifact: Option<String>,
}

/// An installed formula from `brew info --json=v2 --formula`.
#[derive(Debug, Clone)]
pub struct InstalledFormula {
    pub name: String,
    pub installed_version: Option<String>,
}

/// Runs `brew outdated --cask --greedy --json=v2` and maps token → info.
/// Blocking; call from the blocking pool once per check cycle.
pub fn fetch_outdated_casks() -> HashMap<String, OutdatedCask> {
    let brew = match brew_path() {
        Some(p) => p,
        None => return HashMap::new(),
    };

    let output = match brew_command(brew)
        .args(["outdated", "--cask", "--greedy", "--json=v2"])
        .output()
    {
        Ok(o) if o.status.success() => o,
        Ok(o) => {
            log::warn!(
                "brew outdated --cask failed: {}",
                String::from_utf8_lossy(&o.stderr)
            );
            return HashMap::new();
        }
        Err(e) => {
            log::warn!("failed to run brew outdated: {e}");
            return HashMap::new();
        }
    };

    let json: serde_json::Value = match serde_json::from_slice(&output.stdout) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("failed to parse brew outdated JSON: {e}");
            return HashMap::new();
        }
    };

    let mut map = HashMap::new();
    for c in json.get("casks").and_then(|v| v.as_array()).unwrap_or(&Vec::new()) {
        let token = c
            .get("token")
            .and_then(|v| v.as_str())
            .or_else(|| c.get("name").and_then(|v| v.as_str()));
        let token = match token {
            Some(t) if !SYSTEM_CASK_BLOCKLIST.contains(&t) => t.to_string(),
            _ => continue,
        };

        let current_version = version::strip_brew_token(
            c.get("current_version").and_then(|v| v.as_str()).unwrap_or_default(),
        )
        .to_string();
        let installed_versions = c
            .get("installed_versions")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        map.insert(
            token,
            OutdatedCask {
                current_version,
                installed_versions,
            },
        );
    }
    map
}

/// Runs `brew outdated --formula --json=v2` and maps name → info. Blocking.
pub fn fetch_outdated_formulae() -> HashMap<String, OutdatedFormula> {
    let brew = match brew_path() {
        Some(p) => p,
        None => return HashMap::new(),
    };

    let output = match brew_command(brew)
        .args(["outdated", "--formula", "--json=v2"])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return HashMap::new(),
    };

    let json: serde_json::Value = match serde_json::from_slice(&output.stdout) {
        Ok(v) => v,
        Err(_) => return HashMap::new(),
    };

    let mut map = HashMap::new();
    for f in json
        .get("formulae")
        .and_then(|v| v.as_array())
        .unwrap_or(&Vec::new())
    {
        let name = match f.get("name").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let current_version = f
            .get("current_version")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let installed_version = f
            .get("installed_versions")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        map.insert(
            name,
            OutdatedFormula {
                current_version,
                installed_version,
            },
        );
    }
    map
}

/// Installed casks with their metadata, for scan-time synthesis.
pub async fn list_installed_casks() -> Vec<InstalledCask> {
    let brew = match brew_path() {
        Some(p) => p.to_string_lossy().to_string(),
        None => return Vec::new(),
    };

    let list = match run_command_with_timeout(&brew, &["list", "--cask"], BREW_TIMEOUT_SECS).await {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    let tokens: Vec<String> = String::from_utf8_lossy(&list.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut args: Vec<&str> = vec!["info", "--json=v2", "--cask"];
    let token_refs: Vec<&str> = tokens.iter().map(|s| s.as_str()).collect();
    args.extend(&token_refs);

    let info = match run_command_with_timeout(&brew, &args, BREW_TIMEOUT_SECS).await {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    let json: serde_json::Value = match serde_json::from_slice(&info.stdout) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("failed to parse brew info JSON: {e}");
            return Vec::new();
        }
    };

    parse_cask_info(&json)
}

fn parse_cask_info(json: &serde_json::Value) -> Vec<InstalledCask> {
    let mut out = Vec::new();
    for cask in json.get("casks").and_then(|v| v.as_array()).unwrap_or(&Vec::new()) {
        let token = cask.get("token").and_then(|v| v.as_str()).unwrap_or_default();
        if token.is_empty() || SYSTEM_CASK_BLOCKLIST.contains(&token) {
            continue;
        }
        let name = cask
            .get("name")
            .and_then(|a| a.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .unwrap_or(token);
        let version = cask.get("version").and_then(|v| v.as_str()).unwrap_or_default();

        let installed_version = cask
            .get("installed")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| {
                cask.get("installed_versions")
                    .and_then(|v| v.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|v| v.as_str())
                    .map(String::from)
            });

        let app_artifact = cask
            .get("artifacts")
            .and_then(|v| v.as_array())
            .and_then(|artifacts| {
                artifacts.iter().find_map(|a| {
                    a.get("app")
                        .and_then(|app| app.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|v| v.as_str())
                        .map(String::from)
                })
            });

        out.push(InstalledCask {
            token: token.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            installed_version,
            app_artifact,
        });
    }
    out
}

/// Installed formulae with versions, for synthetic rows.
pub async fn list_installed_formulae() -> Vec<InstalledFormula> {
    let brew = match brew_path() {
        Some(p) => p.to_string_lossy().to_string(),
        None => return Vec::new(),
    };

    let list =
        match run_command_with_timeout(&brew, &["list", "--formula"], BREW_TIMEOUT_SECS).await {
            Ok(o) if o.status.success() => o,
            _ => return Vec::new(),
        };
    let names: Vec<String> = String::from_utf8_lossy(&list.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if names.is_empty() {
        return Vec::new();
    }

    let mut args: Vec<&str> = vec!["info", "--json=v2", "--formula"];
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    args.extend(&name_refs);

    let info = match run_command_with_timeout(&brew, &args, BREW_TIMEOUT_SECS).await {
        Ok(o) if o.status.success() => o,
        // Version info is an enrichment; the names alone still make rows.
        _ => {
            return names
                .into_iter()
                .map(|name| InstalledFormula {
                    name,
                    installed_version: None,
                })
                .collect()
        }
    };

    let json: serde_json::Value = match serde_json::from_slice(&info.stdout) {
        Ok(v) => v,
        Err(_) => {
            return names
                .into_iter()
                .map(|name| InstalledFormula {
                    name,
                    installed_version: None,
                })
                .collect()
        }
    };

    let mut out = Vec::new();
    for formula in json
        .get("formulae")
        .and_then(|v| v.as_array())
        .unwrap_or(&Vec::new())
    {
        let name = formula
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        let installed_version = formula
            .get("installed")
            .and_then(|i| i.as_array())
            .and_then(|arr| arr.first())
            .and_then(|i| i.get("version"))
            .and_then(|v| v.as_str())
            .map(String::from);
        out.push(InstalledFormula {
            name: name.to_string(),
            installed_version,
        });
    }
    out
}

/// Whether a cask is installed through Homebrew right now. Blocking.
pub fn is_cask_installed(token: &str) -> bool {
    let brew = match brew_path() {
        Some(p) => p,
        None => return false,
    };
    brew_command(brew)
        .args(["list", "--cask", token])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cask_info_parsing_extracts_app_artifacts() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
              "casks": [
                {
                  "token": "bitwarden",
                  "name": ["Bitwarden"],
                  "version": "2024.10.3",
                  "installed": "2024.9.0",
                  "artifacts": [
                    {"app": ["Bitwarden.app"]},
                    {"zap": [{"trash": ["~/Library/Logs/Bitwarden"]}]}
                  ]
                },
                {
                  "token": "docker",
                  "name": ["Docker CLI"],
                  "version": "27.0.1",
                  "installed_versions": ["26.1.0"],
                  "artifacts": [{"binary": ["docker"]}]
                },
                {
                  "token": "toolreleases",
                  "name": ["System"],
                  "version": "1",
                  "artifacts": []
                }
              ]
            }"#,
        )
        .unwrap();

        let casks = parse_cask_info(&json);
        assert_eq!(casks.len(), 2);

        let bw = &casks[0];
        assert_eq!(bw.token, "bitwarden");
        assert_eq!(bw.app_artifact.as_deref(), Some("Bitwarden.app"));
        assert_eq!(bw.installed_version.as_deref(), Some("2024.9.0"));

        let docker = &casks[1];
        assert_eq!(docker.app_artifact, None);
        assert_eq!(docker.installed_version.as_deref(), Some("26.1.0"));
    }
}
