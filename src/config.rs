use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::sync::ConflictPolicy;

pub const DEFAULT_API_BASE_URL: &str = "https://api.dreamlog.app";
pub const APP_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

const CONFIG_FILE: &str = "config.toml";
const TOKEN_FILE: &str = "token.json";

/// `$DREAMLOG_API_URL` if set, else the configured base URL.
pub fn get_api_base_url(remote: &RemoteConfig) -> String {
    std::env::var("DREAMLOG_API_URL").unwrap_or_else(|_| remote.base_url.clone())
}

fn token_claims(token: &str) -> anyhow::Result<serde_json::Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(anyhow::anyhow!("Invalid token format"));
    }

    let decoded = URL_SAFE_NO_PAD.decode(parts[1])?;
    Ok(serde_json::from_slice(&decoded)?)
}

pub fn get_user_id_from_token(token: &str) -> anyhow::Result<String> {
    let claims = token_claims(token)?;
    let sub = claims["sub"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("No sub in token"))?;
    Ok(sub.to_string())
}

pub fn get_user_email_from_token(token: &str) -> anyhow::Result<String> {
    let claims = token_claims(token)?;
    let email = claims["email"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("No email in token"))?;
    Ok(email.to_string())
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct TokenData {
    pub id_token: String,
    #[serde(default)]
    pub refresh_token: String,
}

/// Which storage backend to run on.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlatformSetting {
    /// Embedded relational store on native targets, blob store on wasm.
    #[default]
    Auto,
    Native,
    Browser,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct GeneralConfig {
    #[serde(default)]
    pub platform: PlatformSetting,
    #[serde(default)]
    pub offline_mode: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_interval_secs() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// `$DREAMLOG_HOME`, or `~/.dreamlog`.
pub fn get_config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("DREAMLOG_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".dreamlog");
    path
}

fn private_file_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    options
}

pub fn load_config() -> AppConfig {
    load_config_from(&get_config_dir())
}

/// Read `config.toml` in `dir`, writing defaults if it does not exist.
/// A file that fails to parse is moved to `config.toml.bak`.
pub fn load_config_from(dir: &Path) -> AppConfig {
    fs::create_dir_all(dir).ok();
    let path = dir.join(CONFIG_FILE);

    if !path.exists() {
        let default_config = AppConfig::default();
        if let Err(e) = save_config_to(dir, &default_config) {
            tracing::warn!(error = %e, "could not write default config");
        }
        return default_config;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to parse config.toml");
                let backup_path = path.with_extension("toml.bak");
                if let Err(backup_err) = fs::rename(&path, &backup_path) {
                    tracing::error!(error = %backup_err, "failed to back up corrupted config");
                } else {
                    tracing::warn!(backup = %backup_path.display(), "corrupted config backed up, using defaults");
                }
                AppConfig::default()
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "failed to read config file, using defaults");
            AppConfig::default()
        }
    }
}

pub fn save_config_to(dir: &Path, config: &AppConfig) -> anyhow::Result<()> {
    fs::create_dir_all(dir)?;
    let toml_str = toml::to_string_pretty(config)?;
    let mut file = private_file_options().open(dir.join(CONFIG_FILE))?;
    file.write_all(toml_str.as_bytes())?;
    Ok(())
}

pub fn set_offline_mode(offline: bool) -> anyhow::Result<()> {
    let dir = get_config_dir();
    let mut config = load_config_from(&dir);
    config.general.offline_mode = offline;
    save_config_to(&dir, &config)
}

pub fn get_token_data() -> TokenData {
    let path = get_config_dir().join(TOKEN_FILE);

    match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<TokenData>(&content) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "token.json is unreadable");
                TokenData::default()
            }
        },
        Err(_) => TokenData::default(),
    }
}

pub fn get_token() -> String {
    get_token_data().id_token
}

pub fn save_token_data(id_token: &str, refresh_token: &str) -> anyhow::Result<()> {
    let data = TokenData {
        id_token: id_token.to_string(),
        refresh_token: refresh_token.to_string(),
    };
    let json = serde_json::to_string(&data)?;

    let config_dir = get_config_dir();
    fs::create_dir_all(&config_dir)?;
    let mut file = private_file_options().open(config_dir.join(TOKEN_FILE))?;
    file.write_all(json.as_bytes())?;
    tracing::info!("token saved");
    Ok(())
}

pub fn delete_token_data() -> anyhow::Result<()> {
    let path = get_config_dir().join(TOKEN_FILE);
    if path.exists() {
        fs::remove_file(path)?;
        tracing::info!("token deleted");
    }
    Ok(())
}
