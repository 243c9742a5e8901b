use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::sync::ignore::{DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_IGNORE_LIST, IgnoreClassifier};
use crate::sync::local_watcher::WatchOptions;

const DEFAULT_POLL_MS: u64 = 100;
const DEFAULT_STABILITY_MS: u64 = 2000;
const DEFAULT_WORKERS: u64 = 2;
const DATA_DIR_NAME: &str = "projmirror";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub api_url: String,
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub stability_threshold: Duration,
    pub workers: usize,
    pub ignore_list: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub organization_id: Option<String>,
    pub session_key: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_url: projmirror_core::DEFAULT_BASE_URL.to_string(),
            data_dir: default_data_dir(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            stability_threshold: Duration::from_millis(DEFAULT_STABILITY_MS),
            workers: DEFAULT_WORKERS as usize,
            ignore_list: to_owned_list(DEFAULT_IGNORE_LIST),
            allowed_extensions: to_owned_list(DEFAULT_ALLOWED_EXTENSIONS),
            organization_id: None,
            session_key: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let defaults = Self::default();

        let api_url = read_string_env("PROJMIRROR_API_URL").unwrap_or(defaults.api_url);
        let data_dir = read_string_env("PROJMIRROR_DATA_DIR")
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or(defaults.data_dir);
        let poll_interval =
            Duration::from_millis(read_u64_env("PROJMIRROR_POLL_MS", DEFAULT_POLL_MS));
        let stability_threshold = Duration::from_millis(read_u64_env(
            "PROJMIRROR_STABILITY_MS",
            DEFAULT_STABILITY_MS,
        ));
        let workers = usize::try_from(read_u64_env("PROJMIRROR_WORKERS", DEFAULT_WORKERS))
            .context("PROJMIRROR_WORKERS is out of range")?;
        let ignore_list = std::env::var("PROJMIRROR_IGNORE")
            .map(|value| parse_list(&value))
            .unwrap_or(defaults.ignore_list);
        let allowed_extensions = std::env::var("PROJMIRROR_EXTENSIONS")
            .map(|value| parse_list(&value))
            .unwrap_or(defaults.allowed_extensions);

        Ok(Self {
            api_url,
            data_dir,
            poll_interval,
            stability_threshold,
            workers,
            ignore_list,
            allowed_extensions,
            organization_id: read_string_env("PROJMIRROR_ORG_ID"),
            session_key: read_string_env("PROJMIRROR_SESSION_KEY"),
        })
    }

    pub fn classifier(&self) -> IgnoreClassifier {
        IgnoreClassifier::new(&self.ignore_list, &self.allowed_extensions)
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            poll_interval: self.poll_interval,
            stability_threshold: self.stability_threshold,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
}

fn to_owned_list(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Splits a comma separated list, dropping blank entries. An empty string
/// yields an empty list.
pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
