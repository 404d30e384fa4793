//! Platform probes: bundle parsing, icon extraction, permission checks, and
//! app lifecycle plumbing. Everything here shells out to macOS tooling or
//! reads platform files; all subprocess calls are bounded by timeouts and
//! run on the blocking pool.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use tokio::time::timeout;

use crate::errors::{EngineError, EngineResult};
use crate::models::{InstallSource, PermissionsStatus, SetupStatus};

/// Known Caskroom prefixes; a bundle under one of these was laid down by
/// Homebrew.
const CASKROOM_PREFIXES: &[&str] = &["/opt/homebrew/Caskroom/", "/usr/local/Caskroom/"];

// ---------------------------------------------------------------------------
// Subprocess helper
// ---------------------------------------------------------------------------

/// Run a system command with a timeout, isolated on the blocking pool so a
/// hung subprocess can never freeze a scan or check.
pub async fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    timeout_secs: u64,
) -> EngineResult<Output> {
    let program = program.to_string();
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();

    let program_for_err = program.clone();
    let result = timeout(
        Duration::from_secs(timeout_secs),
        tokio::task::spawn_blocking(move || {
            Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .output()
        }),
    )
    .await;

    match result {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(e))) => Err(EngineError::internal(format!("{program_for_err}: {e}"))),
        Ok(Err(e)) => Err(EngineError::internal(format!("task join: {e}"))),
        Err(_) => Err(EngineError::internal(format!(
            "{program_for_err} timed out after {timeout_secs}s"
        ))),
    }
}

/// Spawn + poll + kill with a deadline, for commands that can hang
/// indefinitely waiting on a system dialog.
fn run_with_deadline(program: &str, args: &[&str], deadline: Duration) -> bool {
    let mut child = match Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(c) => c,
        Err(_) => return false,
    };

    let end = std::time::Instant::now() + deadline;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) => {
                if std::time::Instant::now() >= end {
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(_) => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle parsing
// ---------------------------------------------------------------------------

/// Fields read from a bundle's Contents/Info.plist.
#[derive(Debug, Clone)]
pub struct BundleMeta {
    pub bundle_id: String,
    pub display_name: String,
    pub app_path: String,
    pub installed_version: Option<String>,
    pub bundle_version: Option<String>,
    pub icon_file: Option<String>,
    pub sparkle_feed_url: Option<String>,
    pub min_system_version: Option<String>,
    pub executable: Option<String>,
}

pub fn read_info_plist(app_path: &Path) -> EngineResult<plist::Dictionary> {
    let plist_path = app_path.join("Contents/Info.plist");
    let val = plist::Value::from_file(&plist_path)?;
    val.into_dictionary()
        .ok_or_else(|| EngineError::internal("Info.plist is not a dictionary"))
}

pub fn plist_string(dict: &plist::Dictionary, key: &str) -> Option<String> {
    dict.get(key)?.as_string().map(String::from)
}

/// Parse a `.app` directory into bundle metadata. Returns `None` for
/// directories that merely look like bundles but have no readable plist.
pub fn parse_bundle(app_path: &Path) -> Option<BundleMeta> {
    let dict = read_info_plist(app_path).ok()?;

    let bundle_id = plist_string(&dict, "CFBundleIdentifier")?;
    let display_name = plist_string(&dict, "CFBundleDisplayName")
        .or_else(|| plist_string(&dict, "CFBundleName"))
        .unwrap_or_else(|| {
            app_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("Unknown")
                .to_string()
        });

    Some(BundleMeta {
        bundle_id,
        display_name,
        app_path: app_path.to_string_lossy().to_string(),
        installed_version: plist_string(&dict, "CFBundleShortVersionString"),
        bundle_version: plist_string(&dict, "CFBundleVersion"),
        icon_file: plist_string(&dict, "CFBundleIconFile"),
        sparkle_feed_url: plist_string(&dict, "SUFeedURL"),
        min_system_version: plist_string(&dict, "LSMinimumSystemVersion"),
        executable: plist_string(&dict, "CFBundleExecutable"),
    })
}

pub fn has_sparkle_framework(app_path: &Path) -> bool {
    app_path
        .join("Contents/Frameworks/Sparkle.framework")
        .exists()
}

pub fn has_mas_receipt(app_path: &Path) -> bool {
    app_path.join("Contents/_MASReceipt/receipt").exists()
        || app_path.join("Contents/_MASReceipt").is_dir()
}

pub fn is_electron_app(app_path: &Path) -> bool {
    app_path
        .join("Contents/Frameworks/Electron Framework.framework")
        .exists()
}

/// Classify how a bundle at this path was installed.
pub fn detect_install_source(app_path: &Path) -> InstallSource {
    if has_mas_receipt(app_path) {
        return InstallSource::MacAppStore;
    }
    let path_str = app_path.to_string_lossy();
    if CASKROOM_PREFIXES.iter().any(|p| path_str.starts_with(p)) {
        return InstallSource::Homebrew;
    }
    InstallSource::Direct
}

/// Architectures of the bundle's main executable via `lipo -archs`,
/// returned sorted for a stable ordered set.
pub fn read_architectures(app_path: &Path, executable: Option<&str>) -> Option<Vec<String>> {
    let exe_name = executable?;
    let exe_path = app_path.join("Contents/MacOS").join(exe_name);
    if !exe_path.exists() {
        return None;
    }

    let output = Command::new("lipo")
        .args(["-archs"])
        .arg(&exe_path)
        .stdin(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let mut archs: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter(|a| *a == "arm64" || *a == "x86_64")
        .map(String::from)
        .collect();
    if archs.is_empty() {
        return None;
    }
    archs.sort();
    archs.dedup();
    Some(archs)
}

// ---------------------------------------------------------------------------
// Icon extraction
// ---------------------------------------------------------------------------

/// Extract an app icon as a 128px PNG into `icons_dir`, named by bundle id.
///
/// Strategy chain: CFBundleIconFile via sips, then any .icns in Resources,
/// then a qlmanage thumbnail (covers asset-catalog-only apps).
pub fn extract_icon(app_path: &Path, bundle_id: &str, icons_dir: &Path) -> Option<String> {
    let output_path = icons_dir.join(format!("{bundle_id}.png"));
    if output_path.exists() {
        return Some(output_path.to_string_lossy().to_string());
    }

    if let Ok(dict) = read_info_plist(app_path) {
        if let Some(icon_name) = plist_string(&dict, "CFBundleIconFile") {
            let mut icns = app_path.join("Contents/Resources").join(&icon_name);
            if icns.extension().is_none() {
                icns.set_extension("icns");
            }
            if icns.exists() {
                if let Some(p) = sips_to_png(&icns, &output_path) {
                    return Some(p);
                }
            }
        }
    }

    let resources = app_path.join("Contents/Resources");
    if resources.is_dir() {
        if let Ok(entries) = std::fs::read_dir(&resources) {
            let icns_files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .map(|ext| ext.eq_ignore_ascii_case("icns"))
                        .unwrap_or(false)
                })
                .collect();
            let preferred = icns_files
                .iter()
                .find(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().eq_ignore_ascii_case("AppIcon.icns"))
                        .unwrap_or(false)
                })
                .or_else(|| icns_files.first());
            if let Some(icns) = preferred {
                if let Some(p) = sips_to_png(icns, &output_path) {
                    return Some(p);
                }
            }
        }
    }

    qlmanage_thumbnail(app_path, &output_path)
}

fn sips_to_png(icns_path: &Path, output_path: &Path) -> Option<String> {
    let output = Command::new("sips")
        .args(["-s", "format", "png", "-z", "128", "128"])
        .arg(icns_path)
        .arg("--out")
        .arg(output_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if output.status.success() {
        Some(output_path.to_string_lossy().to_string())
    } else {
        None
    }
}

fn qlmanage_thumbnail(app_path: &Path, output_path: &Path) -> Option<String> {
    let tmp = tempfile::tempdir().ok()?;
    let output = Command::new("qlmanage")
        .args(["-t", "-s", "128", "-o"])
        .arg(tmp.path())
        .arg(app_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let png = std::fs::read_dir(tmp.path())
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().map(|e| e == "png").unwrap_or(false))?;
    std::fs::copy(&png, output_path).ok()?;
    Some(output_path.to_string_lossy().to_string())
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Unknown,
}

impl PermissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Unknown => "unknown",
        }
    }
}

/// App Management permission, probed with a POSIX access() check on
/// /Applications. Never triggers a dialog.
pub fn has_app_management() -> bool {
    let path = match CString::new("/Applications") {
        Ok(p) => p,
        Err(_) => return false,
    };
    unsafe { libc::access(path.as_ptr(), libc::W_OK) == 0 }
}

pub fn has_full_disk_access() -> bool {
    let tcc = Path::new("/Library/Application Support/com.apple.TCC/TCC.db");
    tcc.exists() && std::fs::metadata(tcc).is_ok()
}

/// Passive Automation (Apple Events) check via the user TCC database.
pub fn check_automation_passive(client_bundle_id: &str) -> PermissionState {
    let db_path = match dirs::home_dir() {
        Some(h) => h.join("Library/Application Support/com.apple.TCC/TCC.db"),
        None => return PermissionState::Unknown,
    };
    if !db_path.exists() {
        return PermissionState::Unknown;
    }

    let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
        | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = match rusqlite::Connection::open_with_flags(&db_path, flags) {
        Ok(c) => c,
        Err(_) => return PermissionState::Unknown,
    };

    let result = conn.query_row(
        "SELECT auth_value FROM access WHERE service = 'kTCCServiceAppleEvents'
         AND client = ?1
         AND indirect_object_identifier = 'com.apple.systemevents'",
        [client_bundle_id],
        |row| row.get::<_, i64>(0),
    );

    match result {
        Ok(2) => PermissionState::Granted,
        Ok(_) => PermissionState::Denied,
        Err(_) => PermissionState::Unknown,
    }
}

pub fn has_notification_permission(bundle_id: &str) -> bool {
    let prefs = match dirs::home_dir() {
        Some(h) => h.join("Library/Preferences/com.apple.ncprefs.plist"),
        None => return false,
    };
    let output = match Command::new("plutil")
        .args(["-convert", "json", "-o", "-"])
        .arg(&prefs)
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return false,
    };

    let val: serde_json::Value = match serde_json::from_slice(&output.stdout) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if let Some(apps) = val.get("apps").and_then(|a| a.as_array()) {
        for app in apps {
            if app.get("bundle-id").and_then(|b| b.as_str()) == Some(bundle_id) {
                let flags = app.get("flags").and_then(|f| f.as_u64()).unwrap_or(0);
                return flags & 4 != 0;
            }
        }
    }
    false
}

/// Deliberately trigger the Automation permission dialog via an osascript
/// probe. Only called on explicit user request; killed after 3 s so a
/// dismissed dialog cannot leak a hung thread.
pub fn request_automation_permission() -> bool {
    run_with_deadline(
        "osascript",
        &[
            "-e",
            "tell application \"System Events\" to return name of first process",
        ],
        Duration::from_secs(3),
    )
}

pub fn permissions_status(client_bundle_id: &str) -> PermissionsStatus {
    let automation_state = check_automation_passive(client_bundle_id);
    PermissionsStatus {
        app_management: has_app_management(),
        automation: automation_state == PermissionState::Granted,
        automation_state: automation_state.as_str().to_string(),
        full_disk_access: has_full_disk_access(),
        notifications: has_notification_permission(client_bundle_id),
    }
}

// ---------------------------------------------------------------------------
// Setup status
// ---------------------------------------------------------------------------

/// Xcode Command Line Tools presence, with a deadline because xcode-select
/// can block behind an install prompt.
pub fn is_xcode_clt_installed() -> bool {
    run_with_deadline("xcode-select", &["-p"], Duration::from_secs(3))
}

pub fn is_mas_cli_installed() -> bool {
    which::which("mas").is_ok()
}

pub fn setup_status(askpass_installed: bool) -> SetupStatus {
    let brew = crate::brew::brew_path();
    let homebrew_version = brew.and_then(|b| {
        let output = Command::new(b).arg("--version").output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.trim_start_matches("Homebrew ").to_string())
    });

    SetupStatus {
        homebrew_installed: brew.is_some(),
        homebrew_version,
        xcode_clt_installed: is_xcode_clt_installed(),
        askpass_installed,
        mas_cli_installed: is_mas_cli_installed(),
    }
}

// ---------------------------------------------------------------------------
// Disk space
// ---------------------------------------------------------------------------

/// Free bytes available to this user on the filesystem containing `path`.
pub fn available_disk_space(path: &Path) -> Option<u64> {
    let c_path = CString::new(path.to_string_lossy().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

// ---------------------------------------------------------------------------
// App lifecycle
// ---------------------------------------------------------------------------

/// Whether a GUI app with this bundle id is currently running.
pub fn is_app_running(bundle_id: &str) -> bool {
    let output = match Command::new("lsappinfo").arg("list").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    String::from_utf8_lossy(&output.stdout).contains(bundle_id)
}

/// Politely ask an app to quit, then wait up to `wait` for it to exit.
/// Returns true once the app is gone. No force-kill here: callers decide
/// whether a still-running app is fatal.
pub fn request_quit(bundle_id: &str, wait: Duration) -> bool {
    if !is_app_running(bundle_id) {
        return true;
    }
    let _ = Command::new("osascript")
        .args(["-e", &format!("tell application id \"{bundle_id}\" to quit")])
        .output();

    let end = std::time::Instant::now() + wait;
    while std::time::Instant::now() < end {
        std::thread::sleep(Duration::from_millis(250));
        if !is_app_running(bundle_id) {
            return true;
        }
    }
    !is_app_running(bundle_id)
}

/// Launch an app in the background (no focus steal).
pub fn relaunch_app(app_path: &str) {
    let _ = Command::new("open").args(["-g", app_path]).output();
}

pub fn open_app(path: &Path) -> EngineResult<()> {
    let output = Command::new("open").arg(path).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(EngineError::ExecutorFailed {
            stderr_tail: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub fn reveal_in_finder(path: &Path) -> EngineResult<()> {
    let output = Command::new("open").arg("-R").arg(path).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(EngineError::ExecutorFailed {
            stderr_tail: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Clear the macOS quarantine extended attribute from a freshly installed
/// bundle. Best effort.
pub fn clear_quarantine_xattr(app_path: &str) {
    let _ = Command::new("xattr")
        .args(["-rd", "com.apple.quarantine", app_path])
        .output();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Writes a minimal valid bundle under `dir` and returns its path.
    pub(crate) fn write_fake_bundle(
        dir: &Path,
        name: &str,
        bundle_id: &str,
        version: &str,
    ) -> PathBuf {
        let app = dir.join(format!("{name}.app"));
        let contents = app.join("Contents");
        fs::create_dir_all(&contents).unwrap();

        let mut dict = plist::Dictionary::new();
        dict.insert(
            "CFBundleIdentifier".into(),
            plist::Value::String(bundle_id.into()),
        );
        dict.insert("CFBundleName".into(), plist::Value::String(name.into()));
        dict.insert(
            "CFBundleShortVersionString".into(),
            plist::Value::String(version.into()),
        );
        dict.insert("CFBundleVersion".into(), plist::Value::String("1".into()));
        plist::Value::Dictionary(dict)
            .to_file_xml(contents.join("Info.plist"))
            .unwrap();
        app
    }

    #[test]
    fn parses_a_minimal_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let app = write_fake_bundle(tmp.path(), "Fake", "com.example.fake", "1.2.3");

        let meta = parse_bundle(&app).unwrap();
        assert_eq!(meta.bundle_id, "com.example.fake");
        assert_eq!(meta.display_name, "Fake");
        assert_eq!(meta.installed_version.as_deref(), Some("1.2.3"));
        assert!(meta.sparkle_feed_url.is_none());
    }

    #[test]
    fn non_bundle_directory_yields_none() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = tmp.path().join("NotAnApp.app");
        fs::create_dir_all(&fake).unwrap();
        assert!(parse_bundle(&fake).is_none());
    }

    #[test]
    fn mas_receipt_classifies_as_app_store() {
        let tmp = tempfile::tempdir().unwrap();
        let app = write_fake_bundle(tmp.path(), "StoreApp", "com.example.store", "1.0");
        fs::create_dir_all(app.join("Contents/_MASReceipt")).unwrap();
        fs::write(app.join("Contents/_MASReceipt/receipt"), b"r").unwrap();

        assert!(has_mas_receipt(&app));
        assert_eq!(detect_install_source(&app), InstallSource::MacAppStore);
    }

    #[test]
    fn caskroom_prefix_classifies_as_homebrew() {
        assert_eq!(
            detect_install_source(Path::new("/opt/homebrew/Caskroom/foo/1.0/Foo.app")),
            InstallSource::Homebrew
        );
    }

    #[test]
    fn plain_bundle_classifies_as_direct() {
        let tmp = tempfile::tempdir().unwrap();
        let app = write_fake_bundle(tmp.path(), "Plain", "com.example.plain", "1.0");
        assert_eq!(detect_install_source(&app), InstallSource::Direct);
    }

    #[test]
    fn sparkle_detection_reads_feed_url() {
        let tmp = tempfile::tempdir().unwrap();
        let app = tmp.path().join("Sparkly.app");
        let contents = app.join("Contents");
        fs::create_dir_all(&contents).unwrap();
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "CFBundleIdentifier".into(),
            plist::Value::String("com.example.sparkly".into()),
        );
        dict.insert(
            "SUFeedURL".into(),
            plist::Value::String("https://example.com/appcast.xml".into()),
        );
        plist::Value::Dictionary(dict)
            .to_file_xml(contents.join("Info.plist"))
            .unwrap();

        let meta = parse_bundle(&app).unwrap();
        assert_eq!(
            meta.sparkle_feed_url.as_deref(),
            Some("https://example.com/appcast.xml")
        );
    }
}
