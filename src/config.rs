use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Careflow";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tab holding the intake form responses.
pub const DEFAULT_SHEET_TAB: &str = "Form Responses 1";

/// Default bound on every external source call, in seconds.
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 30;

/// Database file name inside the data directory.
const DATABASE_FILE: &str = "careflow.db";

/// Get the application data directory.
/// `CAREFLOW_DATA_DIR` wins; otherwise ~/Careflow/ (falls back to the
/// working directory when no home directory can be resolved).
pub fn app_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CAREFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Path of the SQLite store.
pub fn database_path() -> PathBuf {
    app_data_dir().join(DATABASE_FILE)
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "careflow_lib=info,careflow=info,warn"
}

/// Connection settings for the spreadsheet holding the intake responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// API base, e.g. `https://sheets.googleapis.com`.
    pub base_url: String,
    pub spreadsheet_id: String,
    pub tab: String,
    /// Bearer token. Credential acquisition happens outside this crate.
    pub token: Option<String>,
    pub timeout_secs: u64,
    /// Leading rows that are column titles, not responses.
    pub header_rows: usize,
}

impl SourceConfig {
    /// Read settings from the environment. Returns `None` when the
    /// spreadsheet is not configured, in which case the app runs offline.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let base_url = lookup("CAREFLOW_SHEET_URL").filter(|v| !v.trim().is_empty())?;
        let spreadsheet_id = lookup("CAREFLOW_SHEET_ID").filter(|v| !v.trim().is_empty())?;
        let tab = lookup("CAREFLOW_SHEET_TAB")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SHEET_TAB.to_string());
        let timeout_secs = match lookup("CAREFLOW_SOURCE_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    tracing::warn!(value = %raw, "Invalid source timeout, using default");
                    DEFAULT_SOURCE_TIMEOUT_SECS
                }
            },
            None => DEFAULT_SOURCE_TIMEOUT_SECS,
        };

        Some(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.trim().to_string(),
            tab,
            token: lookup("CAREFLOW_SHEET_TOKEN").filter(|v| !v.trim().is_empty()),
            timeout_secs,
            header_rows: 1,
        })
    }
}
