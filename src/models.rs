use serde::{Deserialize, Serialize};

/// How an app got onto the machine. Drives the phase-2 executor routing
/// and which checkers consider themselves applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSource {
    Direct,
    MacAppStore,
    Homebrew,
    HomebrewFormula,
    Unknown,
}

impl InstallSource {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallSource::Direct => "direct",
            InstallSource::MacAppStore => "mac_app_store",
            InstallSource::Homebrew => "homebrew",
            InstallSource::HomebrewFormula => "homebrew_formula",
            InstallSource::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "direct" => InstallSource::Direct,
            "mac_app_store" | "mas" => InstallSource::MacAppStore,
            "homebrew" => InstallSource::Homebrew,
            "homebrew_formula" => InstallSource::HomebrewFormula,
            _ => InstallSource::Unknown,
        }
    }
}

/// Upstream source a checker probes (and a candidate carries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Sparkle,
    HomebrewCask,
    HomebrewApi,
    Mas,
    Github,
    Electron,
    Keystone,
    MicrosoftAutoupdate,
    JetbrainsToolbox,
    AdobeCc,
    Mozilla,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Sparkle => "sparkle",
            SourceType::HomebrewCask => "homebrew_cask",
            SourceType::HomebrewApi => "homebrew_api",
            SourceType::Mas => "mas",
            SourceType::Github => "github",
            SourceType::Electron => "electron",
            SourceType::Keystone => "keystone",
            SourceType::MicrosoftAutoupdate => "microsoft_autoupdate",
            SourceType::JetbrainsToolbox => "jetbrains_toolbox",
            SourceType::AdobeCc => "adobe_cc",
            SourceType::Mozilla => "mozilla",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sparkle" => SourceType::Sparkle,
            "homebrew_cask" => SourceType::HomebrewCask,
            "homebrew_api" => SourceType::HomebrewApi,
            "mas" => SourceType::Mas,
            "github" => SourceType::Github,
            "electron" => SourceType::Electron,
            "keystone" => SourceType::Keystone,
            "microsoft_autoupdate" => SourceType::MicrosoftAutoupdate,
            "jetbrains_toolbox" => SourceType::JetbrainsToolbox,
            "adobe_cc" => SourceType::AdobeCc,
            "mozilla" => SourceType::Mozilla,
            _ => return None,
        })
    }

    /// Deterministic tie-break order when multiple checkers agree on the
    /// highest version. Lower rank wins.
    pub fn precedence(self) -> u8 {
        match self {
            SourceType::Sparkle => 0,
            SourceType::HomebrewCask => 1,
            SourceType::Github => 2,
            SourceType::HomebrewApi => 3,
            SourceType::Mas => 4,
            // Vendor-specific sources share the lowest precedence tier.
            SourceType::Electron
            | SourceType::Keystone
            | SourceType::MicrosoftAutoupdate
            | SourceType::JetbrainsToolbox
            | SourceType::AdobeCc
            | SourceType::Mozilla => 5,
        }
    }
}

/// Terminal + initial states of a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Started,
    Completed,
    Failed,
    Delegated,
}

impl HistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryStatus::Started => "started",
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Delegated => "delegated",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, HistoryStatus::Started)
    }
}

/// An installed app as produced by one scan pass, before persistence.
/// Synthetic entries (CLI-only casks, formulae) carry `app_path: None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredApp {
    pub bundle_id: String,
    pub display_name: String,
    pub app_path: Option<String>,
    pub installed_version: Option<String>,
    pub bundle_version: Option<String>,
    pub install_source: InstallSource,
    pub architectures: Option<Vec<String>>,
    pub sparkle_feed_url: Option<String>,
    pub homebrew_cask_token: Option<String>,
    pub homebrew_formula_name: Option<String>,
    pub mas_app_id: Option<String>,
}

impl DiscoveredApp {
    /// Synthetic id for a cask with no `.app` artifact.
    pub fn cask_bundle_id(token: &str) -> String {
        format!("homebrew.cask.{token}")
    }

    /// Synthetic id for a Homebrew formula.
    pub fn formula_bundle_id(name: &str) -> String {
        format!("homebrew.formula.{name}")
    }
}

/// One row of the app catalog, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: i64,
    pub bundle_id: String,
    pub display_name: String,
    pub app_path: Option<String>,
    pub installed_version: Option<String>,
    pub bundle_version: Option<String>,
    pub icon_cache_path: Option<String>,
    pub architectures: Option<Vec<String>>,
    pub install_source: InstallSource,
    pub homebrew_cask_token: Option<String>,
    pub homebrew_formula_name: Option<String>,
    pub mas_app_id: Option<String>,
    pub sparkle_feed_url: Option<String>,
    pub is_ignored: bool,
    pub first_seen_at: Option<String>,
    pub last_seen_at: Option<String>,
}

/// Catalog row shaped for the host's list view: the app plus its live
/// candidate, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSummary {
    pub bundle_id: String,
    pub display_name: String,
    pub app_path: Option<String>,
    pub installed_version: Option<String>,
    pub install_source: InstallSource,
    pub is_ignored: bool,
    pub icon_cache_path: Option<String>,
    pub has_update: bool,
    pub available_version: Option<String>,
    pub update_source: Option<String>,
    pub release_notes: Option<String>,
    pub release_notes_url: Option<String>,
}

/// Full detail for one app, including bindings and the live candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDetail {
    #[serde(flatten)]
    pub record: AppRecord,
    pub update_sources: Vec<SourceBinding>,
    pub candidate: Option<UpdateCandidate>,
}

/// A detected newer-version record attached to an app. At most one live
/// candidate exists per app; it is overwritten on every check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCandidate {
    pub bundle_id: String,
    pub available_version: String,
    pub source_type: SourceType,
    pub download_url: Option<String>,
    pub sha256: Option<String>,
    pub release_notes: Option<String>,
    pub release_notes_url: Option<String>,
    pub is_paid_upgrade: bool,
    pub detected_at: Option<String>,
    pub notes: Option<String>,
}

/// Which checkers apply to an app and when each was last consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBinding {
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub is_primary: bool,
    pub last_checked_at: Option<String>,
}

/// One append-only history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub bundle_id: String,
    pub display_name: String,
    pub icon_cache_path: Option<String>,
    pub from_version: String,
    pub to_version: String,
    pub source_type: String,
    pub status: HistoryStatus,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Outcome of one executor run, before it is folded into events + history.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub bundle_id: String,
    pub success: bool,
    pub message: Option<String>,
    pub source_type: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub needs_relaunch: bool,
    pub delegated: bool,
}

impl UpdateOutcome {
    pub fn failure(bundle_id: &str, source_type: &str, message: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.to_string(),
            success: false,
            message: Some(message.into()),
            source_type: source_type.to_string(),
            from_version: None,
            to_version: None,
            needs_relaunch: false,
            delegated: false,
        }
    }
}

/// Per-checker outcome for `debug_update_check`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckerDiagnostic {
    pub source: String,
    pub applicable: bool,
    pub result: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheckDiagnostic {
    pub bundle_id: String,
    pub app_path: Option<String>,
    pub installed_version: Option<String>,
    pub install_source: String,
    pub homebrew_cask_token: Option<String>,
    pub checkers: Vec<CheckerDiagnostic>,
}

/// What the host needs to decide whether setup is complete.
#[derive(Debug, Clone, Serialize)]
pub struct SetupStatus {
    pub homebrew_installed: bool,
    pub homebrew_version: Option<String>,
    pub xcode_clt_installed: bool,
    pub askpass_installed: bool,
    pub mas_cli_installed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionsStatus {
    pub app_management: bool,
    pub automation: bool,
    pub automation_state: String,
    pub full_disk_access: bool,
    pub notifications: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityStatus {
    pub github: bool,
    pub homebrew: bool,
    pub itunes: bool,
    pub overall: String,
}

/// A newer release of the engine itself.
#[derive(Debug, Clone, Serialize)]
pub struct SelfUpdateInfo {
    pub current_version: String,
    pub available_version: String,
    pub download_url: Option<String>,
    pub release_notes_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips() {
        for st in [
            SourceType::Sparkle,
            SourceType::HomebrewCask,
            SourceType::HomebrewApi,
            SourceType::Mas,
            SourceType::Github,
            SourceType::Electron,
            SourceType::Keystone,
            SourceType::MicrosoftAutoupdate,
            SourceType::JetbrainsToolbox,
            SourceType::AdobeCc,
            SourceType::Mozilla,
        ] {
            assert_eq!(SourceType::parse(st.as_str()), Some(st));
        }
        assert_eq!(SourceType::parse("nope"), None);
    }

    #[test]
    fn precedence_orders_conflicting_sources() {
        assert!(SourceType::Sparkle.precedence() < SourceType::HomebrewCask.precedence());
        assert!(SourceType::HomebrewCask.precedence() < SourceType::Github.precedence());
        assert!(SourceType::Github.precedence() < SourceType::HomebrewApi.precedence());
        assert!(SourceType::HomebrewApi.precedence() < SourceType::Mas.precedence());
        assert!(SourceType::Mas.precedence() < SourceType::AdobeCc.precedence());
    }

    #[test]
    fn synthetic_ids_follow_convention() {
        assert_eq!(DiscoveredApp::cask_bundle_id("docker"), "homebrew.cask.docker");
        assert_eq!(
            DiscoveredApp::formula_bundle_id("ripgrep"),
            "homebrew.formula.ripgrep"
        );
    }

    #[test]
    fn history_terminality() {
        assert!(!HistoryStatus::Started.is_terminal());
        assert!(HistoryStatus::Completed.is_terminal());
        assert!(HistoryStatus::Failed.is_terminal());
        assert!(HistoryStatus::Delegated.is_terminal());
    }
}
