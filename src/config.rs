use anyhow::{Context, Result, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubeclip-env";
pub const DEFAULT_STORAGE_DIR: &str = "./downloads";
pub const DEFAULT_TUBECLIP_PORT: u16 = 3000;
pub const DEFAULT_TUBECLIP_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";
pub const DEFAULT_MAX_FILESIZE: &str = "50M";
pub const DEFAULT_INVOKE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_FILE_TTL_SECS: u64 = 900;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub storage_dir: Option<PathBuf>,
    pub tubeclip_host: Option<String>,
    pub tubeclip_port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub max_filesize: Option<String>,
    pub invoke_timeout_secs: Option<u64>,
    pub file_ttl_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub storage_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_path: PathBuf,
    pub max_filesize: String,
    pub invoke_timeout: Duration,
    pub file_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            host: DEFAULT_TUBECLIP_HOST.to_string(),
            port: DEFAULT_TUBECLIP_PORT,
            ytdlp_path: PathBuf::from(DEFAULT_YTDLP_PATH),
            max_filesize: DEFAULT_MAX_FILESIZE.to_string(),
            invoke_timeout: Duration::from_secs(DEFAULT_INVOKE_TIMEOUT_SECS),
            file_ttl: Duration::from_secs(DEFAULT_FILE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value_raw)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value_raw.trim().trim_matches('"');
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "STORAGE_DIR" => cfg.storage_dir = Some(PathBuf::from(value)),
            "TUBECLIP_HOST" => cfg.tubeclip_host = Some(value.to_string()),
            "TUBECLIP_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing TUBECLIP_PORT from {}", path.display()))?;
                cfg.tubeclip_port = Some(port);
            }
            "YTDLP_PATH" => cfg.ytdlp_path = Some(PathBuf::from(value)),
            "MAX_FILESIZE" => {
                validate_filesize(value)
                    .with_context(|| format!("Parsing MAX_FILESIZE from {}", path.display()))?;
                cfg.max_filesize = Some(value.to_string());
            }
            "INVOKE_TIMEOUT_SECS" => {
                cfg.invoke_timeout_secs = Some(parse_secs(value, "INVOKE_TIMEOUT_SECS", path)?)
            }
            "FILE_TTL_SECS" => cfg.file_ttl_secs = Some(parse_secs(value, "FILE_TTL_SECS", path)?),
            "SWEEP_INTERVAL_SECS" => {
                cfg.sweep_interval_secs = Some(parse_secs(value, "SWEEP_INTERVAL_SECS", path)?)
            }
            _ => {}
        }
    }
    Ok(Some(cfg))
}

fn parse_secs(value: &str, key: &str, path: &Path) -> Result<u64> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("Parsing {key} from {}", path.display()))?;
    if secs == 0 {
        bail!("{key} in {} must be greater than zero", path.display());
    }
    Ok(secs)
}

/// Accepts the yt-dlp size syntax used here: digits with an optional
/// `K`, `M` or `G` suffix.
pub fn validate_filesize(value: &str) -> Result<()> {
    let digits = value.trim_end_matches(['K', 'M', 'G', 'k', 'm', 'g']);
    if digits.is_empty()
        || value.len() - digits.len() > 1
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        bail!("invalid size `{value}`, expected e.g. 50M");
    }
    Ok(())
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// Loads the config file at `path`. A missing file yields the defaults.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let defaults = RuntimeConfig::default();
    let Some(cfg) = read_env_config(path)? else {
        return Ok(defaults);
    };
    let runtime = RuntimeConfig {
        storage_dir: cfg.storage_dir.unwrap_or(defaults.storage_dir),
        host: cfg.tubeclip_host.unwrap_or(defaults.host),
        port: cfg.tubeclip_port.unwrap_or(defaults.port),
        ytdlp_path: cfg.ytdlp_path.unwrap_or(defaults.ytdlp_path),
        max_filesize: cfg.max_filesize.unwrap_or(defaults.max_filesize),
        invoke_timeout: cfg
            .invoke_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.invoke_timeout),
        file_ttl: cfg
            .file_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.file_ttl),
        sweep_interval: cfg
            .sweep_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval),
    };
    // Clips must outlive the longest run that can produce them.
    if runtime.file_ttl <= runtime.invoke_timeout {
        bail!(
            "FILE_TTL_SECS ({}) in {} must be larger than INVOKE_TIMEOUT_SECS ({})",
            runtime.file_ttl.as_secs(),
            path.display(),
            runtime.invoke_timeout.as_secs()
        );
    }
    Ok(runtime)
}
