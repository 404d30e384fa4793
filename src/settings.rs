//! Engine settings.
//!
//! A single JSON row in the store. Every field carries a serde default so
//! settings written by older engine versions deserialize cleanly.

use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::errors::EngineResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeMode {
    System,
    Light,
    Dark,
}

impl Default for ThemeMode {
    fn default() -> Self {
        ThemeMode::System
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Ordered scan roots. Tilde-prefixed paths are expanded at scan time.
    pub scan_roots: Vec<String>,
    /// Bundle search depth below each root, 1..=3.
    pub scan_depth: u32,
    pub check_interval_minutes: u32,
    pub auto_check_on_launch: bool,
    pub launch_at_login: bool,
    pub notify_on_updates: bool,
    pub notification_sound: bool,
    pub theme: ThemeMode,
    pub ignored_bundle_ids: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_roots: vec!["/Applications".to_string(), "~/Applications".to_string()],
            scan_depth: 2,
            check_interval_minutes: 60,
            auto_check_on_launch: true,
            launch_at_login: false,
            notify_on_updates: true,
            notification_sound: true,
            theme: ThemeMode::System,
            ignored_bundle_ids: Vec::new(),
        }
    }
}

impl Settings {
    /// Clamp out-of-range values instead of rejecting them.
    pub fn normalized(mut self) -> Self {
        self.scan_depth = self.scan_depth.clamp(1, 3);
        if self.check_interval_minutes == 0 {
            self.check_interval_minutes = Settings::default().check_interval_minutes;
        }
        if self.scan_roots.is_empty() {
            self.scan_roots = Settings::default().scan_roots;
        }
        self
    }
}

pub fn load(db: &Db) -> Settings {
    match db.get_settings_json() {
        Ok(Some(json)) => serde_json::from_str::<Settings>(&json)
            .map(Settings::normalized)
            .unwrap_or_default(),
        _ => Settings::default(),
    }
}

pub fn save(db: &mut Db, settings: &Settings) -> EngineResult<()> {
    let json = serde_json::to_string(settings)?;
    db.put_settings_json(&json)
}

/// Drop scan roots that no longer exist. `/Volumes/...` paths are kept
/// since the drive may just be unplugged. If everything was stale, fall
/// back to the defaults.
pub fn prune_stale_roots(db: &mut Db) -> EngineResult<()> {
    let settings = load(db);
    let mut kept = Vec::new();
    let mut removed = Vec::new();

    for root in &settings.scan_roots {
        let expanded = expand_tilde(root);
        if expanded.exists() || root.starts_with("/Volumes/") {
            kept.push(root.clone());
        } else {
            log::warn!("settings: removing stale scan root '{root}'");
            removed.push(root.clone());
        }
    }

    if removed.is_empty() {
        return Ok(());
    }

    let mut updated = settings;
    updated.scan_roots = if kept.is_empty() {
        log::info!("settings: all scan roots were stale, resetting to defaults");
        Settings::default().scan_roots
    } else {
        kept
    };
    save(db, &updated)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scan_roots_and_depth() {
        let s = Settings::default();
        assert_eq!(s.scan_roots, vec!["/Applications", "~/Applications"]);
        assert_eq!(s.scan_depth, 2);
        assert!(s.auto_check_on_launch);
    }

    #[test]
    fn settings_round_trip_bitwise() {
        let mut db = Db::open_in_memory().unwrap();
        let mut s = Settings::default();
        s.scan_depth = 3;
        s.check_interval_minutes = 15;
        s.ignored_bundle_ids = vec!["com.example.noisy".to_string()];
        s.theme = ThemeMode::Dark;

        save(&mut db, &s).unwrap();
        let loaded = load(&db);
        assert_eq!(loaded, s);
    }

    #[test]
    fn depth_is_clamped() {
        let s = Settings {
            scan_depth: 9,
            ..Settings::default()
        }
        .normalized();
        assert_eq!(s.scan_depth, 3);

        let s = Settings {
            scan_depth: 0,
            ..Settings::default()
        }
        .normalized();
        assert_eq!(s.scan_depth, 1);
    }

    #[test]
    fn unknown_fields_do_not_break_load() {
        let mut db = Db::open_in_memory().unwrap();
        db.put_settings_json(r#"{"scan_depth": 1, "some_future_field": true}"#)
            .unwrap();
        let s = load(&db);
        assert_eq!(s.scan_depth, 1);
        assert_eq!(s.check_interval_minutes, 60);
    }

    #[test]
    fn tilde_expansion() {
        let p = expand_tilde("~/Applications");
        assert!(!p.to_string_lossy().starts_with('~'));
        assert_eq!(expand_tilde("/Applications").to_str(), Some("/Applications"));
    }

    #[test]
    fn pruning_keeps_volumes_and_resets_when_empty() {
        let mut db = Db::open_in_memory().unwrap();
        let s = Settings {
            scan_roots: vec![
                "/definitely/not/a/path".to_string(),
                "/Volumes/Backup/Applications".to_string(),
            ],
            ..Settings::default()
        };
        save(&mut db, &s).unwrap();
        prune_stale_roots(&mut db).unwrap();

        let loaded = load(&db);
        assert_eq!(loaded.scan_roots, vec!["/Volumes/Backup/Applications"]);
    }
}
