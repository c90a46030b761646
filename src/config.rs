#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIN_DIR: &str = "bin";
pub const DEFAULT_TEMP_DIR: &str = "temp";
pub const DEFAULT_WWW_ROOT: &str = "public";
pub const DEFAULT_RETENTION_SECS: u64 = 5 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const MAX_RESULTS_CEILING: usize = 50;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Everything the server needs at runtime, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: IpAddr,
    pub port: u16,
    pub bin_dir: PathBuf,
    pub extractor_path: Option<PathBuf>,
    pub transcoder_path: Option<PathBuf>,
    pub temp_dir: PathBuf,
    pub www_root: PathBuf,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub max_search_results: usize,
    pub tool_timeout: Duration,
    pub download_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Settings {
    /// Settings rooted at `base`, used by tests and the dependency checker.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            host: DEFAULT_HOST.parse().unwrap_or(IpAddr::from([127, 0, 0, 1])),
            port: DEFAULT_PORT,
            bin_dir: base.join(DEFAULT_BIN_DIR),
            extractor_path: None,
            transcoder_path: None,
            temp_dir: base.join(DEFAULT_TEMP_DIR),
            www_root: base.join(DEFAULT_WWW_ROOT),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            max_search_results: DEFAULT_MAX_RESULTS,
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

/// Values passed on the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub bin_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let host_raw = overrides
        .host
        .and_then(|value| non_blank(&value))
        .or_else(|| lookup("TUBEGRAB_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let host = host_raw
        .parse::<IpAddr>()
        .with_context(|| format!("expected an IPv4 or IPv6 address, got {host_raw:?}"))?;

    let port = overrides
        .port
        .or_else(|| lookup("TUBEGRAB_PORT").and_then(|value| value.parse().ok()))
        .or_else(|| lookup("PORT").and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_PORT);

    let path_or = |over: Option<PathBuf>, key: &str, default: &str| {
        over.or_else(|| lookup(key).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };
    let bin_dir = path_or(overrides.bin_dir, "TUBEGRAB_BIN_DIR", DEFAULT_BIN_DIR);
    let temp_dir = path_or(overrides.temp_dir, "TUBEGRAB_TEMP_DIR", DEFAULT_TEMP_DIR);
    let www_root = path_or(overrides.www_root, "TUBEGRAB_WWW_ROOT", DEFAULT_WWW_ROOT);

    let secs = |key: &str, default: u64| {
        let value = lookup(key)
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(default);
        Duration::from_secs(value)
    };

    let max_search_results = lookup("TUBEGRAB_MAX_RESULTS")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_RESULTS)
        .clamp(1, MAX_RESULTS_CEILING);

    if temp_dir.as_os_str().is_empty() {
        return Err(anyhow!("TUBEGRAB_TEMP_DIR must not be empty"));
    }

    Ok(Settings {
        host,
        port,
        bin_dir,
        extractor_path: lookup("TUBEGRAB_YTDLP_PATH").map(PathBuf::from),
        transcoder_path: lookup("TUBEGRAB_FFMPEG_PATH").map(PathBuf::from),
        temp_dir,
        www_root,
        retention: secs("TUBEGRAB_RETENTION_SECS", DEFAULT_RETENTION_SECS),
        sweep_interval: secs("TUBEGRAB_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
        max_search_results,
        tool_timeout: secs("TUBEGRAB_TOOL_TIMEOUT_SECS", DEFAULT_TOOL_TIMEOUT_SECS),
        download_timeout: secs(
            "TUBEGRAB_DOWNLOAD_TIMEOUT_SECS",
            DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        ),
        probe_timeout: secs("TUBEGRAB_PROBE_TIMEOUT_SECS", DEFAULT_PROBE_TIMEOUT_SECS),
    })
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_blank(&value))
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Reads `KEY=value` pairs from a dotenv-style file. A missing file is empty.
/// Blank values are left out, so they fall through to the defaults like an
/// unset variable.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

/// `export KEY="value"`, `KEY='value'` or `KEY=value`; comments and lines
/// without `=` yield nothing.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let raw = raw.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|quote| raw.strip_prefix(*quote)?.strip_suffix(*quote))
        .unwrap_or(raw);
    let value = non_blank(unquoted)?;
    Some((key.to_string(), value))
}
