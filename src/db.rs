//! Persistence layer.
//!
//! One embedded SQLite store holds the app catalog, live update candidates,
//! source bindings, scan runs, history, and settings. The connection lives
//! behind a single async mutex owned by the engine: one writer, and readers
//! tolerate transient locking via a bounded busy timeout.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::errors::{EngineError, EngineResult};
use crate::models::{
    AppDetail, AppRecord, AppSummary, DiscoveredApp, HistoryEntry, HistoryStatus, InstallSource,
    SourceBinding, SourceType, UpdateCandidate,
};
use crate::version;

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

/// Per-user directory layout for engine state.
#[derive(Debug, Clone)]
pub struct EngineDirs {
    pub data: PathBuf,
    pub icons: PathBuf,
    pub downloads: PathBuf,
    pub quarantine: PathBuf,
    pub logs: PathBuf,
}

impl EngineDirs {
    pub fn db_path(&self) -> PathBuf {
        self.data.join("catalog.db")
    }

    pub fn askpass_path(&self) -> PathBuf {
        self.data.join("askpass")
    }

    pub fn icon_path(&self, bundle_id: &str) -> PathBuf {
        self.icons.join(format!("{bundle_id}.png"))
    }

    pub fn download_dir(&self, bundle_id: &str, version: &str) -> PathBuf {
        self.downloads.join(bundle_id).join(version)
    }

    pub fn quarantine_dir(&self, bundle_id: &str) -> PathBuf {
        self.quarantine
            .join(bundle_id)
            .join(Utc::now().timestamp().to_string())
    }
}

/// Resolve the per-user data directory for product id `com.macplus.app`.
/// `MACPLUS_DATA_DIR` overrides it (used by tests and headless deployments).
pub fn data_dir() -> EngineResult<PathBuf> {
    if let Ok(dir) = std::env::var("MACPLUS_DATA_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    ProjectDirs::from("com", "macplus", "app")
        .map(|d| d.data_dir().to_path_buf())
        .ok_or_else(|| EngineError::internal("failed to resolve per-user data directory"))
}

/// Create the on-disk layout and return it.
pub fn ensure_engine_dirs() -> EngineResult<EngineDirs> {
    let data = data_dir()?;
    ensure_engine_dirs_at(data)
}

pub fn ensure_engine_dirs_at(data: PathBuf) -> EngineResult<EngineDirs> {
    let dirs = EngineDirs {
        icons: data.join("icons"),
        downloads: data.join("downloads"),
        quarantine: data.join("quarantine"),
        logs: data.join("logs"),
        data,
    };
    for d in [
        &dirs.data,
        &dirs.icons,
        &dirs.downloads,
        &dirs.quarantine,
        &dirs.logs,
    ] {
        fs::create_dir_all(d)?;
    }
    Ok(dirs)
}

/// Database handle wrapper. Owned by the engine behind a mutex.
pub struct Db {
    conn: Connection,
    path: PathBuf,
}

impl Db {
    /// Open the store at the per-user location and apply migrations.
    pub fn open(dirs: &EngineDirs) -> EngineResult<Self> {
        Self::open_at(&dirs.db_path())
    }

    pub fn open_at(path: &Path) -> EngineResult<Self> {
        let mut conn = Connection::open(path)?;
        configure(&conn)?;
        migrate(&mut conn)?;
        purge_noop_candidates(&conn);
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> EngineResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        configure(&conn)?;
        migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------
    // App catalog
    // ------------------------------------------------------------------

    /// Insert or refresh one discovered app. Returns the row id.
    ///
    /// `app_path` is unique among file-backed rows; if a stale row still
    /// claims the path (the bundle id changed on disk), its path is cleared
    /// first.
    pub fn upsert_app(&mut self, app: &DiscoveredApp) -> EngineResult<i64> {
        let now = Utc::now().to_rfc3339();

        if let Some(ref path) = app.app_path {
            self.conn.execute(
                "UPDATE apps SET app_path = NULL, installed_version = NULL
                 WHERE app_path = ?1 AND bundle_id != ?2",
                params![path, app.bundle_id],
            )?;
        }

        self.conn.execute(
            r#"
            INSERT INTO apps (
              bundle_id, display_name, app_path, installed_version, bundle_version,
              architectures, install_source, homebrew_cask_token, homebrew_formula_name,
              mas_app_id, sparkle_feed_url, first_seen_at, last_seen_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
            ON CONFLICT(bundle_id) DO UPDATE SET
              display_name = excluded.display_name,
              app_path = excluded.app_path,
              installed_version = COALESCE(excluded.installed_version, apps.installed_version),
              bundle_version = COALESCE(excluded.bundle_version, apps.bundle_version),
              architectures = COALESCE(excluded.architectures, apps.architectures),
              install_source = CASE WHEN excluded.install_source != 'unknown'
                                    THEN excluded.install_source ELSE apps.install_source END,
              homebrew_cask_token = COALESCE(excluded.homebrew_cask_token, apps.homebrew_cask_token),
              homebrew_formula_name = COALESCE(excluded.homebrew_formula_name, apps.homebrew_formula_name),
              mas_app_id = COALESCE(excluded.mas_app_id, apps.mas_app_id),
              sparkle_feed_url = COALESCE(excluded.sparkle_feed_url, apps.sparkle_feed_url),
              last_seen_at = excluded.last_seen_at
            "#,
            params![
                app.bundle_id,
                app.display_name,
                app.app_path,
                app.installed_version,
                app.bundle_version,
                app.architectures
                    .as_ref()
                    .map(|a| serde_json::to_string(a).unwrap_or_default()),
                app.install_source.as_str(),
                app.homebrew_cask_token,
                app.homebrew_formula_name,
                app.mas_app_id,
                app.sparkle_feed_url,
                now,
            ],
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM apps WHERE bundle_id = ?1",
            [&app.bundle_id],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Record a finished scan run and bump `last_seen_at` for every id the
    /// scan observed. Rows are never deleted here; an app that vanished
    /// simply stops being seen.
    pub fn mark_scan_complete(
        &mut self,
        roots: &[String],
        started_at: &str,
        finished_at: &str,
        seen_ids: &[String],
    ) -> EngineResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO scan_runs (roots, started_at, finished_at, app_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                serde_json::to_string(roots).unwrap_or_default(),
                started_at,
                finished_at,
                seen_ids.len() as i64
            ],
        )?;
        {
            let mut stmt =
                tx.prepare("UPDATE apps SET last_seen_at = ?1 WHERE bundle_id = ?2")?;
            for id in seen_ids {
                stmt.execute(params![finished_at, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// An app whose bundle disappeared keeps its row; only the installed
    /// version is nulled so it drops out of update math.
    pub fn clear_installed_version(&mut self, bundle_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE apps SET installed_version = NULL WHERE bundle_id = ?1",
            [bundle_id],
        )?;
        Ok(())
    }

    pub fn update_installed_version(
        &mut self,
        bundle_id: &str,
        version: &str,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE apps SET installed_version = ?1 WHERE bundle_id = ?2",
            params![version, bundle_id],
        )?;
        Ok(())
    }

    pub fn update_icon_cache_path(&mut self, bundle_id: &str, path: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE apps SET icon_cache_path = ?1 WHERE bundle_id = ?2",
            params![path, bundle_id],
        )?;
        Ok(())
    }

    /// Backfill a cask token discovered after the fact; never overwrites.
    pub fn update_cask_token(&mut self, bundle_id: &str, token: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE apps SET homebrew_cask_token = ?1
             WHERE bundle_id = ?2 AND homebrew_cask_token IS NULL",
            params![token, bundle_id],
        )?;
        Ok(())
    }

    pub fn set_app_ignored(&mut self, bundle_id: &str, ignored: bool) -> EngineResult<()> {
        let n = self.conn.execute(
            "UPDATE apps SET is_ignored = ?1 WHERE bundle_id = ?2",
            params![ignored as i64, bundle_id],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("no app {bundle_id}")));
        }
        Ok(())
    }

    pub fn delete_app(&mut self, bundle_id: &str) -> EngineResult<()> {
        self.conn
            .execute("DELETE FROM apps WHERE bundle_id = ?1", [bundle_id])?;
        Ok(())
    }

    pub fn app_count(&self) -> EngineResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM apps", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn get_app_record(&self, bundle_id: &str) -> EngineResult<AppRecord> {
        self.conn
            .query_row(
                &format!("{APP_RECORD_SELECT} WHERE bundle_id = ?1"),
                [bundle_id],
                row_to_app_record,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("no app {bundle_id}")))
    }

    pub fn get_all_records(&self) -> EngineResult<Vec<AppRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{APP_RECORD_SELECT} ORDER BY display_name COLLATE NOCASE"))?;
        let rows = stmt.query_map([], row_to_app_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_all_apps(&self) -> EngineResult<Vec<AppSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT a.bundle_id, a.display_name, a.app_path, a.installed_version,
                   a.install_source, a.is_ignored, a.icon_cache_path,
                   c.available_version, c.source_type, c.release_notes, c.release_notes_url
            FROM apps a
            LEFT JOIN update_candidates c ON c.app_id = a.id
            ORDER BY a.display_name COLLATE NOCASE
            "#,
        )?;
        let rows = stmt.query_map([], |r| {
            let available: Option<String> = r.get(7)?;
            Ok(AppSummary {
                bundle_id: r.get(0)?,
                display_name: r.get(1)?,
                app_path: r.get(2)?,
                installed_version: r.get(3)?,
                install_source: InstallSource::parse(&r.get::<_, String>(4)?),
                is_ignored: r.get::<_, i64>(5)? != 0,
                icon_cache_path: r.get(6)?,
                has_update: available.is_some(),
                available_version: available,
                update_source: r.get(8)?,
                release_notes: r.get(9)?,
                release_notes_url: r.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_app_detail(&self, bundle_id: &str) -> EngineResult<AppDetail> {
        let record = self.get_app_record(bundle_id)?;
        let update_sources = self.get_bindings(bundle_id)?;
        let candidate = self.get_candidate(bundle_id)?;
        Ok(AppDetail {
            record,
            update_sources,
            candidate,
        })
    }

    // ------------------------------------------------------------------
    // Update candidates + bindings
    // ------------------------------------------------------------------

    /// Replace the candidate for an app. `None` clears it. A candidate whose
    /// version is not strictly newer than the installed version is treated
    /// as `None`.
    pub fn put_candidate(
        &mut self,
        bundle_id: &str,
        candidate: Option<&UpdateCandidate>,
    ) -> EngineResult<()> {
        let (app_id, installed): (i64, Option<String>) = self
            .conn
            .query_row(
                "SELECT id, installed_version FROM apps WHERE bundle_id = ?1",
                [bundle_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("no app {bundle_id}")))?;

        let candidate = candidate.filter(|c| match installed.as_deref() {
            Some(installed) => version::is_newer(installed, &c.available_version),
            None => true,
        });

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM update_candidates WHERE app_id = ?1", [app_id])?;
        if let Some(c) = candidate {
            tx.execute(
                r#"
                INSERT INTO update_candidates (
                  app_id, available_version, source_type, download_url, sha256,
                  release_notes, release_notes_url, is_paid_upgrade, detected_at, notes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    app_id,
                    c.available_version,
                    c.source_type.as_str(),
                    c.download_url,
                    c.sha256,
                    c.release_notes,
                    c.release_notes_url,
                    c.is_paid_upgrade as i64,
                    Utc::now().to_rfc3339(),
                    c.notes,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_candidate(&self, bundle_id: &str) -> EngineResult<Option<UpdateCandidate>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT a.bundle_id, c.available_version, c.source_type, c.download_url,
                       c.sha256, c.release_notes, c.release_notes_url, c.is_paid_upgrade,
                       c.detected_at, c.notes
                FROM update_candidates c
                JOIN apps a ON a.id = c.app_id
                WHERE a.bundle_id = ?1
                "#,
                [bundle_id],
                |r| {
                    let st: String = r.get(2)?;
                    Ok(UpdateCandidate {
                        bundle_id: r.get(0)?,
                        available_version: r.get(1)?,
                        source_type: SourceType::parse(&st).unwrap_or(SourceType::Sparkle),
                        download_url: r.get(3)?,
                        sha256: r.get(4)?,
                        release_notes: r.get(5)?,
                        release_notes_url: r.get(6)?,
                        is_paid_upgrade: r.get::<_, i64>(7)? != 0,
                        detected_at: r.get(8)?,
                        notes: r.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Live candidates across the catalog, excluding ignored apps.
    pub fn get_update_count(&self) -> EngineResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM update_candidates c
             JOIN apps a ON a.id = c.app_id
             WHERE a.is_ignored = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Overwrite the source bindings recorded for an app.
    pub fn replace_bindings(
        &mut self,
        bundle_id: &str,
        bindings: &[SourceBinding],
    ) -> EngineResult<()> {
        let app_id: i64 = self.conn.query_row(
            "SELECT id FROM apps WHERE bundle_id = ?1",
            [bundle_id],
            |r| r.get(0),
        )?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM update_sources WHERE app_id = ?1", [app_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO update_sources
                   (app_id, source_type, source_url, is_primary, last_checked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for b in bindings {
                stmt.execute(params![
                    app_id,
                    b.source_type.as_str(),
                    b.source_url,
                    b.is_primary as i64,
                    b.last_checked_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_bindings(&self, bundle_id: &str) -> EngineResult<Vec<SourceBinding>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.source_type, s.source_url, s.is_primary, s.last_checked_at
             FROM update_sources s
             JOIN apps a ON a.id = s.app_id
             WHERE a.bundle_id = ?1",
        )?;
        let rows = stmt.query_map([bundle_id], |r| {
            let st: String = r.get(0)?;
            Ok(SourceBinding {
                source_type: SourceType::parse(&st).unwrap_or(SourceType::Sparkle),
                source_url: r.get(1)?,
                is_primary: r.get::<_, i64>(2)? != 0,
                last_checked_at: r.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Open a history row in `started` state. Returns its id.
    pub fn begin_history(
        &mut self,
        bundle_id: &str,
        from_version: &str,
        to_version: &str,
        source_type: &str,
    ) -> EngineResult<i64> {
        let app_id: i64 = self.conn.query_row(
            "SELECT id FROM apps WHERE bundle_id = ?1",
            [bundle_id],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO update_history (app_id, from_version, to_version, source_type, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'started', ?5)",
            params![app_id, from_version, to_version, source_type, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Move a history row to its terminal status. A row that already reached
    /// a terminal status is never touched again.
    pub fn finish_history(
        &mut self,
        history_id: i64,
        status: HistoryStatus,
        error: Option<&str>,
    ) -> EngineResult<()> {
        if !status.is_terminal() {
            return Err(EngineError::internal("finish_history requires a terminal status"));
        }
        let n = self.conn.execute(
            "UPDATE update_history
             SET status = ?1, error_message = ?2, completed_at = ?3
             WHERE id = ?4 AND status = 'started'",
            params![status.as_str(), error, Utc::now().to_rfc3339(), history_id],
        )?;
        if n == 0 {
            log::warn!("history row {history_id} already terminal; transition ignored");
        }
        Ok(())
    }

    pub fn get_update_history(&self, limit: i64) -> EngineResult<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT h.id, a.bundle_id, a.display_name, a.icon_cache_path,
                   h.from_version, h.to_version, h.source_type,
                   h.status, h.error_message, h.started_at, h.completed_at
            FROM update_history h
            JOIN apps a ON a.id = h.app_id
            ORDER BY h.started_at DESC, h.id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit], |r| {
            let status: String = r.get(7)?;
            Ok(HistoryEntry {
                id: r.get(0)?,
                bundle_id: r.get(1)?,
                display_name: r.get(2)?,
                icon_cache_path: r.get(3)?,
                from_version: r.get(4)?,
                to_version: r.get(5)?,
                source_type: r.get(6)?,
                status: match status.as_str() {
                    "completed" => HistoryStatus::Completed,
                    "failed" => HistoryStatus::Failed,
                    "delegated" => HistoryStatus::Delegated,
                    _ => HistoryStatus::Started,
                },
                error_message: r.get(8)?,
                started_at: r.get(9)?,
                completed_at: r.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Settings (raw JSON row; typed access lives in settings.rs)
    // ------------------------------------------------------------------

    pub fn get_settings_json(&self) -> EngineResult<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'engine_settings'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn put_settings_json(&mut self, json: &str) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value_json) VALUES ('engine_settings', ?1)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
            [json],
        )?;
        Ok(())
    }
}

const APP_RECORD_SELECT: &str = r#"
    SELECT id, bundle_id, display_name, app_path, installed_version, bundle_version,
           icon_cache_path, architectures, install_source, homebrew_cask_token,
           homebrew_formula_name, mas_app_id, sparkle_feed_url, is_ignored,
           first_seen_at, last_seen_at
    FROM apps
"#;

fn row_to_app_record(r: &Row) -> rusqlite::Result<AppRecord> {
    let arch_json: Option<String> = r.get(7)?;
    Ok(AppRecord {
        id: r.get(0)?,
        bundle_id: r.get(1)?,
        display_name: r.get(2)?,
        app_path: r.get(3)?,
        installed_version: r.get(4)?,
        bundle_version: r.get(5)?,
        icon_cache_path: r.get(6)?,
        architectures: arch_json.and_then(|j| serde_json::from_str(&j).ok()),
        install_source: InstallSource::parse(&r.get::<_, String>(8)?),
        homebrew_cask_token: r.get(9)?,
        homebrew_formula_name: r.get(10)?,
        mas_app_id: r.get(11)?,
        sparkle_feed_url: r.get(12)?,
        is_ignored: r.get::<_, i64>(13)? != 0,
        first_seen_at: r.get(14)?,
        last_seen_at: r.get(15)?,
    })
}

fn configure(conn: &Connection) -> EngineResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    // Bounded backoff for readers racing the writer.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

/// Candidates whose version no longer beats the installed version are
/// meaningless leftovers from an older run.
fn purge_noop_candidates(conn: &Connection) {
    let purged = conn
        .execute(
            "DELETE FROM update_candidates WHERE id IN (
                SELECT c.id FROM update_candidates c
                JOIN apps a ON a.id = c.app_id
                WHERE c.available_version = a.installed_version
             )",
            [],
        )
        .unwrap_or(0);
    if purged > 0 {
        log::info!("purged {purged} stale update candidates at startup");
    }
}

/// Apply migrations to bring the store to the current schema.
fn migrate(conn: &mut Connection) -> EngineResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(EngineError::internal(format!(
            "db schema version {current_version} is newer than engine supports {SCHEMA_VERSION}"
        )));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    // Future:
    // if current_version < 2 { migration_v2(conn)?; set_schema_version(conn, 2)?; }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> EngineResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS apps (
          id                    INTEGER PRIMARY KEY AUTOINCREMENT,
          bundle_id             TEXT NOT NULL UNIQUE,
          display_name          TEXT NOT NULL,
          app_path              TEXT NULL UNIQUE,
          installed_version     TEXT NULL,
          bundle_version        TEXT NULL,
          icon_cache_path       TEXT NULL,
          architectures         TEXT NULL,
          install_source        TEXT NOT NULL DEFAULT 'unknown',
          homebrew_cask_token   TEXT NULL,
          homebrew_formula_name TEXT NULL,
          mas_app_id            TEXT NULL,
          sparkle_feed_url      TEXT NULL,
          is_ignored            INTEGER NOT NULL DEFAULT 0,
          first_seen_at         TEXT NULL,
          last_seen_at          TEXT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_apps_cask_token ON apps(homebrew_cask_token);
        CREATE INDEX IF NOT EXISTS idx_apps_install_source ON apps(install_source);

        CREATE TABLE IF NOT EXISTS update_candidates (
          id                INTEGER PRIMARY KEY AUTOINCREMENT,
          app_id            INTEGER NOT NULL UNIQUE REFERENCES apps(id) ON DELETE CASCADE,
          available_version TEXT NOT NULL,
          source_type       TEXT NOT NULL,
          download_url      TEXT NULL,
          sha256            TEXT NULL,
          release_notes     TEXT NULL,
          release_notes_url TEXT NULL,
          is_paid_upgrade   INTEGER NOT NULL DEFAULT 0,
          detected_at       TEXT NULL,
          notes             TEXT NULL
        );

        CREATE TABLE IF NOT EXISTS update_sources (
          id              INTEGER PRIMARY KEY AUTOINCREMENT,
          app_id          INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
          source_type     TEXT NOT NULL,
          source_url      TEXT NULL,
          is_primary      INTEGER NOT NULL DEFAULT 0,
          last_checked_at TEXT NULL,
          UNIQUE(app_id, source_type)
        );

        CREATE TABLE IF NOT EXISTS update_history (
          id            INTEGER PRIMARY KEY AUTOINCREMENT,
          app_id        INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
          from_version  TEXT NOT NULL,
          to_version    TEXT NOT NULL,
          source_type   TEXT NOT NULL,
          status        TEXT NOT NULL DEFAULT 'started',
          error_message TEXT NULL,
          started_at    TEXT NULL,
          completed_at  TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_app ON update_history(app_id);

        CREATE TABLE IF NOT EXISTS scan_runs (
          id          INTEGER PRIMARY KEY AUTOINCREMENT,
          roots       TEXT NOT NULL,
          started_at  TEXT NOT NULL,
          finished_at TEXT NOT NULL,
          app_count   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
          key        TEXT PRIMARY KEY,
          value_json TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app(bundle_id: &str) -> DiscoveredApp {
        DiscoveredApp {
            bundle_id: bundle_id.to_string(),
            display_name: "Sample".to_string(),
            app_path: Some(format!("/Applications/{bundle_id}.app")),
            installed_version: Some("1.0.0".to_string()),
            bundle_version: Some("100".to_string()),
            install_source: InstallSource::Direct,
            architectures: Some(vec!["arm64".to_string(), "x86_64".to_string()]),
            sparkle_feed_url: None,
            homebrew_cask_token: None,
            homebrew_formula_name: None,
            mas_app_id: None,
        }
    }

    fn candidate(bundle_id: &str, version: &str) -> UpdateCandidate {
        UpdateCandidate {
            bundle_id: bundle_id.to_string(),
            available_version: version.to_string(),
            source_type: SourceType::Sparkle,
            download_url: Some("https://example.com/a.dmg".to_string()),
            sha256: None,
            release_notes: None,
            release_notes_url: None,
            is_paid_upgrade: false,
            detected_at: None,
            notes: None,
        }
    }

    #[test]
    fn app_row_round_trips_with_ordered_architectures() {
        let mut db = Db::open_in_memory().unwrap();
        db.upsert_app(&sample_app("com.example.sample")).unwrap();

        let rec = db.get_app_record("com.example.sample").unwrap();
        assert_eq!(rec.bundle_id, "com.example.sample");
        assert_eq!(rec.installed_version.as_deref(), Some("1.0.0"));
        assert_eq!(
            rec.architectures,
            Some(vec!["arm64".to_string(), "x86_64".to_string()])
        );
        assert!(rec.first_seen_at.is_some());
    }

    #[test]
    fn upsert_refreshes_without_duplicating() {
        let mut db = Db::open_in_memory().unwrap();
        db.upsert_app(&sample_app("com.example.sample")).unwrap();
        let mut again = sample_app("com.example.sample");
        again.installed_version = Some("1.1.0".to_string());
        db.upsert_app(&again).unwrap();

        assert_eq!(db.app_count().unwrap(), 1);
        let rec = db.get_app_record("com.example.sample").unwrap();
        assert_eq!(rec.installed_version.as_deref(), Some("1.1.0"));
    }

    #[test]
    fn path_conflicts_clear_the_stale_row() {
        let mut db = Db::open_in_memory().unwrap();
        let mut a = sample_app("com.example.old");
        a.app_path = Some("/Applications/Thing.app".to_string());
        db.upsert_app(&a).unwrap();

        let mut b = sample_app("com.example.new");
        b.app_path = Some("/Applications/Thing.app".to_string());
        db.upsert_app(&b).unwrap();

        let old = db.get_app_record("com.example.old").unwrap();
        assert!(old.app_path.is_none());
        let new = db.get_app_record("com.example.new").unwrap();
        assert_eq!(new.app_path.as_deref(), Some("/Applications/Thing.app"));
    }

    #[test]
    fn candidate_must_beat_installed_version() {
        let mut db = Db::open_in_memory().unwrap();
        db.upsert_app(&sample_app("com.example.sample")).unwrap();

        db.put_candidate("com.example.sample", Some(&candidate("com.example.sample", "1.0.0")))
            .unwrap();
        assert!(db.get_candidate("com.example.sample").unwrap().is_none());

        db.put_candidate("com.example.sample", Some(&candidate("com.example.sample", "2.0.0")))
            .unwrap();
        let c = db.get_candidate("com.example.sample").unwrap().unwrap();
        assert_eq!(c.available_version, "2.0.0");

        db.put_candidate("com.example.sample", None).unwrap();
        assert!(db.get_candidate("com.example.sample").unwrap().is_none());
    }

    #[test]
    fn update_count_skips_ignored_apps() {
        let mut db = Db::open_in_memory().unwrap();
        db.upsert_app(&sample_app("com.example.a")).unwrap();
        db.upsert_app(&sample_app("com.example.b")).unwrap();
        db.put_candidate("com.example.a", Some(&candidate("com.example.a", "9.9")))
            .unwrap();
        db.put_candidate("com.example.b", Some(&candidate("com.example.b", "9.9")))
            .unwrap();
        assert_eq!(db.get_update_count().unwrap(), 2);

        db.set_app_ignored("com.example.b", true).unwrap();
        assert_eq!(db.get_update_count().unwrap(), 1);
    }

    #[test]
    fn history_allows_exactly_one_terminal_transition() {
        let mut db = Db::open_in_memory().unwrap();
        db.upsert_app(&sample_app("com.example.sample")).unwrap();

        let id = db
            .begin_history("com.example.sample", "1.0.0", "2.0.0", "sparkle")
            .unwrap();
        db.finish_history(id, HistoryStatus::Completed, None).unwrap();
        // Second transition is a no-op.
        db.finish_history(id, HistoryStatus::Failed, Some("late")).unwrap();

        let rows = db.get_update_history(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, HistoryStatus::Completed);
        assert!(rows[0].error_message.is_none());
        assert!(rows[0].started_at.as_deref() <= rows[0].completed_at.as_deref());
    }

    #[test]
    fn mark_scan_complete_bumps_last_seen() {
        let mut db = Db::open_in_memory().unwrap();
        db.upsert_app(&sample_app("com.example.sample")).unwrap();

        let finished = "2099-01-01T00:00:00+00:00";
        db.mark_scan_complete(
            &["/Applications".to_string()],
            "2099-01-01T00:00:00+00:00",
            finished,
            &["com.example.sample".to_string()],
        )
        .unwrap();

        let rec = db.get_app_record("com.example.sample").unwrap();
        assert_eq!(rec.last_seen_at.as_deref(), Some(finished));
    }

    #[test]
    fn bindings_replace_wholesale() {
        let mut db = Db::open_in_memory().unwrap();
        db.upsert_app(&sample_app("com.example.sample")).unwrap();

        db.replace_bindings(
            "com.example.sample",
            &[
                SourceBinding {
                    source_type: SourceType::Sparkle,
                    source_url: Some("https://example.com/appcast.xml".to_string()),
                    is_primary: true,
                    last_checked_at: None,
                },
                SourceBinding {
                    source_type: SourceType::Github,
                    source_url: None,
                    is_primary: false,
                    last_checked_at: None,
                },
            ],
        )
        .unwrap();

        let bindings = db.get_bindings("com.example.sample").unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.iter().filter(|b| b.is_primary).count(), 1);

        db.replace_bindings("com.example.sample", &[]).unwrap();
        assert!(db.get_bindings("com.example.sample").unwrap().is_empty());
    }

    #[test]
    fn synthetic_rows_have_null_path() {
        let mut db = Db::open_in_memory().unwrap();
        let mut app = sample_app("homebrew.formula.ripgrep");
        app.app_path = None;
        app.install_source = InstallSource::HomebrewFormula;
        app.homebrew_formula_name = Some("ripgrep".to_string());
        db.upsert_app(&app).unwrap();

        let rec = db.get_app_record("homebrew.formula.ripgrep").unwrap();
        assert!(rec.app_path.is_none());
        assert_eq!(rec.homebrew_formula_name.as_deref(), Some("ripgrep"));
    }
}
