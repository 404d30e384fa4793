//! Privileged command execution.
//!
//! Elevation goes through a small askpass helper materialized into the data
//! directory: `sudo -A` invokes it, the helper shows a single native
//! password dialog, and sudo's timestamp keeps follow-up commands silent.
//! The password itself never passes through this process.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;

use crate::db::EngineDirs;

/// The helper script installed at `<data>/askpass`, mode 0755.
const ASKPASS_SCRIPT: &str = r#"#!/bin/sh
exec osascript -e 'text returned of (display dialog "macPlus needs your administrator password to install this update:" default answer "" with hidden answer with title "macPlus" buttons {"Cancel", "OK"} default button "OK")'
"#;

static ASKPASS_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

#[derive(Debug)]
pub enum ElevatedError {
    UserCancelled,
    IoError(std::io::Error),
    CommandFailed(String),
}

impl std::fmt::Display for ElevatedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElevatedError::UserCancelled => write!(f, "user cancelled the password dialog"),
            ElevatedError::IoError(e) => write!(f, "io error: {e}"),
            ElevatedError::CommandFailed(msg) => write!(f, "command failed: {msg}"),
        }
    }
}

impl From<std::io::Error> for ElevatedError {
    fn from(e: std::io::Error) -> Self {
        ElevatedError::IoError(e)
    }
}

/// Write the askpass helper into the data directory if missing, ensure it is
/// executable, and cache its path. Called once at engine startup.
pub fn init_askpass(dirs: &EngineDirs) {
    let target = dirs.askpass_path();
    ASKPASS_PATH.get_or_init(|| {
        if !target.exists() {
            if let Err(e) = std::fs::write(&target, ASKPASS_SCRIPT) {
                log::warn!("failed to install askpass helper: {e}");
                return None;
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            match std::fs::metadata(&target) {
                Ok(meta) => {
                    let mut perms = meta.permissions();
                    if perms.mode() & 0o111 == 0 || perms.mode() & 0o777 != 0o755 {
                        perms.set_mode(0o755);
                        let _ = std::fs::set_permissions(&target, perms);
                    }
                }
                Err(e) => {
                    log::warn!("askpass helper unreadable: {e}");
                    return None;
                }
            }
        }

        log::info!("askpass helper ready at {}", target.display());
        Some(target)
    });
}

/// Cached path to the askpass helper, if installed.
pub fn askpass_path() -> Option<&'static PathBuf> {
    ASKPASS_PATH.get().and_then(|p| p.as_ref())
}

pub fn is_askpass_installed() -> bool {
    askpass_path().map_or(false, |p| {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::metadata(p)
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            p.exists()
        }
    })
}

/// Establish a sudo timestamp with a single password dialog so subsequent
/// `sudo -A` calls succeed silently. Returns false on cancel or when the
/// helper is unavailable.
pub fn pre_authenticate() -> bool {
    let ap = match askpass_path() {
        Some(p) => p,
        None => return false,
    };
    Command::new("sudo")
        .current_dir("/tmp")
        .env("SUDO_ASKPASS", ap)
        .args(["-A", "-v"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Extend the sudo timestamp non-interactively.
pub fn refresh_timestamp() -> bool {
    Command::new("sudo")
        .current_dir("/tmp")
        .args(["-n", "-v"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn cancelled(stderr: &str) -> bool {
    stderr.contains("cancelled")
        || stderr.contains("dialog was dismissed")
        || stderr.contains("User canceled")
        || stderr.contains("-128")
}

/// Run one command with elevated privileges through `sudo -A`, falling back
/// to osascript administrator elevation if the helper route fails for a
/// reason other than user cancellation.
pub fn run_elevated(program: &str, args: &[&str]) -> Result<Output, ElevatedError> {
    if let Some(ap) = askpass_path() {
        let output = Command::new("sudo")
            .current_dir("/tmp")
            .env("SUDO_ASKPASS", ap)
            .arg("-A")
            .arg(program)
            .args(args)
            .output()?;

        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if cancelled(&stderr) {
            return Err(ElevatedError::UserCancelled);
        }
    }

    let shell_cmd = build_shell_command(program, args);
    run_osascript_elevated(&shell_cmd)
}

/// Elevated variant for compound shell expressions.
pub fn run_elevated_shell(shell_cmd: &str) -> Result<Output, ElevatedError> {
    if let Some(ap) = askpass_path() {
        let output = Command::new("sudo")
            .current_dir("/tmp")
            .env("SUDO_ASKPASS", ap)
            .args(["-A", "sh", "-c", shell_cmd])
            .output()?;

        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if cancelled(&stderr) {
            return Err(ElevatedError::UserCancelled);
        }
    }

    run_osascript_elevated(shell_cmd)
}

fn build_shell_command(program: &str, args: &[&str]) -> String {
    let mut parts = vec![shell_escape(program)];
    for arg in args {
        parts.push(shell_escape(arg));
    }
    parts.join(" ")
}

fn shell_escape(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

fn run_osascript_elevated(shell_cmd: &str) -> Result<Output, ElevatedError> {
    let output = Command::new("osascript")
        .current_dir("/tmp")
        .args([
            "-e",
            &format!(
                "do shell script \"{}\" with administrator privileges",
                shell_cmd.replace('\\', "\\\\").replace('"', "\\\"")
            ),
        ])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if cancelled(&stderr) {
            return Err(ElevatedError::UserCancelled);
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escaping_quotes_only_when_needed() {
        assert_eq!(shell_escape("/usr/sbin/installer"), "/usr/sbin/installer");
        assert_eq!(shell_escape("simple-arg_1.0"), "simple-arg_1.0");
        assert_eq!(shell_escape("has space"), "'has space'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn build_shell_command_joins_escaped_parts() {
        let cmd = build_shell_command("/usr/sbin/installer", &["-pkg", "/tmp/My App.pkg"]);
        assert_eq!(cmd, "/usr/sbin/installer -pkg '/tmp/My App.pkg'");
    }

    #[test]
    fn cancellation_strings_detected() {
        assert!(cancelled("User canceled the operation"));
        assert!(cancelled("execution error: ... (-128)"));
        assert!(!cancelled("permission denied"));
    }
}
