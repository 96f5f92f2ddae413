// fleetbackup/src/config/mod.rs
use anyhow::{Context, Result, bail};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::models::{BackupConfiguration, Credential};
use crate::retention::MAX_RETENTION_DAYS;
use crate::schedule::CronSchedule;
use crate::utils::identifier::validate_database_name;

pub const ENGINE_URL_VAR: &str = "ENGINE_DATABASE_URL";
pub const BACKUP_ROOT_VAR: &str = "BACKUP_ROOT";

const DEFAULT_RESTORE_DELAY_SECS: u64 = 2;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_RETENTION_DAYS: u32 = 30;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonSchedule {
    pub id: String,
    pub name: Option<String>,
    pub schedule: String,
    #[serde(default)]
    pub databases: Vec<String>,
    pub retention_days: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub engine_url: Option<String>,
    pub backup_root: Option<PathBuf>,
    pub restore_delay_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub default_retention_days: Option<u32>,
    #[serde(default)]
    pub schedules: Vec<JsonSchedule>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub id: String,
    pub name: String,
    pub schedule: String,
    /// Empty means every database on the instance.
    pub databases: Vec<String>,
    pub retention_days: u32,
    pub enabled: bool,
}

impl ScheduleConfig {
    pub fn into_configuration(self, created_at: chrono::DateTime<chrono::Utc>) -> BackupConfiguration {
        BackupConfiguration {
            id: self.id,
            name: self.name,
            enabled: self.enabled,
            schedule: self.schedule,
            databases: self.databases,
            retention_days: self.retention_days,
            created_at,
            last_run_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine_url: Url,
    pub backup_root: PathBuf,
    pub restore_delay: Duration,
    pub command_timeout: Duration,
    pub default_retention_days: u32,
    pub schedules: Vec<ScheduleConfig>,
}

impl AppConfig {
    /// Reads `config.json`, then lets `ENGINE_DATABASE_URL` and `BACKUP_ROOT` override it.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        Self::from_raw(raw_json_config, |key| std::env::var(key).ok())
    }

    /// Builds the configuration from environment variables alone.
    pub fn from_env() -> Result<Self> {
        Self::from_raw(RawJsonConfig::default(), |key| std::env::var(key).ok())
    }

    pub fn from_raw(raw: RawJsonConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let engine_url = env(ENGINE_URL_VAR)
            .filter(|v| !v.trim().is_empty())
            .or(raw.engine_url)
            .context("engine_url must be set in config.json or ENGINE_DATABASE_URL")?;
        let engine_url = parse_engine_url(&engine_url)?;

        let backup_root = env(BACKUP_ROOT_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or(raw.backup_root)
            .context("backup_root must be set in config.json or BACKUP_ROOT")?;
        if backup_root.as_os_str().is_empty() {
            bail!("backup_root cannot be empty.");
        }

        let command_timeout_secs = raw.command_timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        if command_timeout_secs == 0 {
            bail!("command_timeout_secs must be greater than zero.");
        }
        let default_retention_days = raw.default_retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        if default_retention_days == 0 || default_retention_days > MAX_RETENTION_DAYS {
            bail!("default_retention_days must be between 1 and {}.", MAX_RETENTION_DAYS);
        }

        let mut seen = HashSet::new();
        let mut schedules = Vec::with_capacity(raw.schedules.len());
        for entry in raw.schedules {
            if !seen.insert(entry.id.clone()) {
                bail!("schedule id '{}' appears more than once", entry.id);
            }
            schedules.push(
                parse_schedule(entry, default_retention_days)
                    .context("Invalid entry in schedules")?,
            );
        }

        Ok(AppConfig {
            engine_url,
            backup_root,
            restore_delay: Duration::from_secs(raw.restore_delay_secs.unwrap_or(DEFAULT_RESTORE_DELAY_SECS)),
            command_timeout: Duration::from_secs(command_timeout_secs),
            default_retention_days,
            schedules,
        })
    }

    /// The login embedded in the engine URL, used for administrator and system work.
    pub fn admin_credential(&self) -> Result<Credential> {
        let username = match self.engine_url.username() {
            "" => "postgres".to_string(),
            user => decode(user)?,
        };
        let password = self.engine_url.password().map(decode).transpose()?;
        Ok(Credential { username, password })
    }
}

fn decode(component: &str) -> Result<String> {
    Ok(percent_decode_str(component)
        .decode_utf8()
        .context("engine_url credentials are not valid UTF-8")?
        .into_owned())
}

fn parse_engine_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).context("engine_url is not a valid URL")?;
    match url.scheme() {
        "postgres" | "postgresql" => {}
        other => bail!("engine_url must use the postgres:// scheme, got '{}'", other),
    }
    if url.host_str().is_none_or(str::is_empty) {
        bail!("engine_url must name a host");
    }
    Ok(url)
}

fn parse_schedule(entry: JsonSchedule, default_retention_days: u32) -> Result<ScheduleConfig> {
    if entry.id.trim().is_empty() {
        bail!("schedule id cannot be empty");
    }
    CronSchedule::parse(&entry.schedule)
        .with_context(|| format!("schedule '{}' has an invalid cron expression", entry.id))?;
    for database in &entry.databases {
        validate_database_name(database)
            .with_context(|| format!("schedule '{}' lists an invalid database", entry.id))?;
    }
    let retention_days = entry.retention_days.unwrap_or(default_retention_days);
    if retention_days == 0 || retention_days > MAX_RETENTION_DAYS {
        bail!(
            "schedule '{}' must keep backups between 1 and {} days",
            entry.id,
            MAX_RETENTION_DAYS
        );
    }
    Ok(ScheduleConfig {
        name: entry.name.unwrap_or_else(|| entry.id.clone()),
        id: entry.id,
        schedule: entry.schedule,
        databases: entry.databases,
        retention_days,
        enabled: entry.enabled.unwrap_or(true),
    })
}
