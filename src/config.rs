use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Drive requires resumable chunks to be multiples of 256 KiB.
pub const CHUNK_ALIGNMENT: u64 = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where archives are written on backup and downloaded to on restore.
    pub destination: PathBuf,
    /// Name of the remote folder holding the archives.
    pub remote_folder: String,
    /// Path or name of the 7z binary.
    pub archiver: PathBuf,
    pub chunk_size: u64,
    pub chunk_timeout_secs: u64,
    /// Per-transfer resume attempts after a failed chunk.
    pub chunk_retries: u32,
    /// Whole-step retries offered by the orchestrator on network errors.
    pub retry_attempts: u32,
    pub simulation: bool,
    pub simulation_root: PathBuf,
    pub credentials_path: PathBuf,
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    pub drive_api_base: String,
    pub drive_upload_base: String,
    pub token_url: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let (config_dir, data_dir) = match project_dirs() {
            Some(dirs) => (
                dirs.config_dir().to_path_buf(),
                dirs.data_dir().to_path_buf(),
            ),
            None => (PathBuf::from(".bkdrive"), PathBuf::from(".bkdrive")),
        };

        Self {
            destination: PathBuf::from("."),
            remote_folder: "Backups".to_string(),
            archiver: PathBuf::from("7z"),
            chunk_size: 32 * CHUNK_ALIGNMENT,
            chunk_timeout_secs: 120,
            chunk_retries: 3,
            retry_attempts: 1,
            simulation: false,
            simulation_root: data_dir.join("simulated-remote"),
            credentials_path: config_dir.join("token.json"),
            client_id: None,
            client_secret: None,
            drive_api_base: "https://www.googleapis.com/drive/v3".to_string(),
            drive_upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            password: None,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML config file, `BKDRIVE_*` environment
    /// variables and finally any CLI overrides.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_file_path()))
            .merge(Env::prefixed("BKDRIVE_"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment.extract().context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % CHUNK_ALIGNMENT != 0 {
            bail!(
                "chunk_size must be a positive multiple of {} bytes, got {}",
                CHUNK_ALIGNMENT,
                self.chunk_size
            );
        }
        if self.chunk_timeout_secs == 0 {
            bail!("chunk_timeout_secs must be greater than zero");
        }
        if self.remote_folder.trim().is_empty() {
            bail!("remote_folder must not be empty");
        }
        Ok(())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Effective configuration as TOML. Secrets are never serialized.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "bkdrive")
}

/// `$BKDRIVE_CONFIG`, falling back to the platform config directory.
pub fn config_file_path() -> PathBuf {
    if let Some(path) = std::env::var_os("BKDRIVE_CONFIG") {
        return PathBuf::from(path);
    }
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("bkdrive.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size % CHUNK_ALIGNMENT, 0);
    }

    #[test]
    fn test_unaligned_chunk_size_is_rejected() {
        let config = AppConfig {
            chunk_size: CHUNK_ALIGNMENT + 1,
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("chunk_size"));
    }

    #[test]
    fn test_cli_overrides_win() {
        #[derive(Serialize)]
        struct Overrides {
            remote_folder: String,
            simulation: bool,
        }

        let overrides = Overrides {
            remote_folder: "PhoneBackups".to_string(),
            simulation: true,
        };
        let config = AppConfig::new(Some(&overrides)).unwrap();
        assert_eq!(config.remote_folder, "PhoneBackups");
        assert!(config.simulation);
    }

    #[test]
    fn test_toml_output_omits_secrets() {
        let config = AppConfig {
            password: Some("hunter2".to_string()),
            client_secret: Some("s3cret".to_string()),
            ..AppConfig::default()
        };
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("remote_folder"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
    }
}
