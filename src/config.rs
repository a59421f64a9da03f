use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::control::DEFAULT_MAX_CONTROL_LINE_BYTES;
use crate::protocol::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::session::SessionLimits;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:65432";
const DEFAULT_IMAGE_DIR: &str = "images";
const DEFAULT_LOG_PATH: &str = "controls.csv";
const MIN_CONTROL_LINE_BYTES: usize = 8;

/// What to do with a client that connects while a session is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Accept and immediately close the extra connection.
    #[default]
    Reject,
    /// Leave it in the listen backlog until the active session ends.
    Queue,
}

impl FromStr for BusyPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(BusyPolicy::Reject),
            "queue" => Ok(BusyPolicy::Queue),
            other => Err(anyhow!(
                "unknown busy policy '{}'; expected reject or queue",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct IngestdConfigFile {
    server: Option<ServerConfigFile>,
    dataset: Option<DatasetConfigFile>,
    limits: Option<LimitsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    read_timeout_secs: Option<u64>,
    busy_policy: Option<BusyPolicy>,
    max_sessions: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DatasetConfigFile {
    image_dir: Option<PathBuf>,
    log_path: Option<PathBuf>,
    session_subdirs: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsConfigFile {
    max_frame_bytes: Option<usize>,
    max_control_line_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct IngestdConfig {
    pub listen_addr: String,
    pub image_dir: PathBuf,
    pub log_path: PathBuf,
    /// `None` blocks forever on a stalled sender.
    pub read_timeout: Option<Duration>,
    pub busy_policy: BusyPolicy,
    /// Stop accepting after this many sessions.
    pub max_sessions: Option<u64>,
    pub session_subdirs: bool,
    pub limits: SessionLimits,
}

impl Default for IngestdConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            read_timeout: None,
            busy_policy: BusyPolicy::default(),
            max_sessions: None,
            session_subdirs: false,
            limits: SessionLimits::default(),
        }
    }
}

impl IngestdConfig {
    /// File named by `INGEST_CONFIG` (if set), then `INGEST_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("INGEST_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: IngestdConfigFile) -> Self {
        let defaults = Self::default();
        let server = file.server.unwrap_or_default();
        let dataset = file.dataset.unwrap_or_default();
        let limits = file.limits.unwrap_or_default();
        Self {
            listen_addr: server.addr.unwrap_or(defaults.listen_addr),
            image_dir: dataset.image_dir.unwrap_or(defaults.image_dir),
            log_path: dataset.log_path.unwrap_or(defaults.log_path),
            read_timeout: server
                .read_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            busy_policy: server.busy_policy.unwrap_or(defaults.busy_policy),
            max_sessions: server.max_sessions,
            session_subdirs: dataset.session_subdirs.unwrap_or(false),
            limits: SessionLimits {
                max_frame_bytes: limits.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
                max_control_line_bytes: limits
                    .max_control_line_bytes
                    .unwrap_or(DEFAULT_MAX_CONTROL_LINE_BYTES),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("INGEST_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("INGEST_IMAGE_DIR") {
            if !dir.trim().is_empty() {
                self.image_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("INGEST_LOG_PATH") {
            if !path.trim().is_empty() {
                self.log_path = PathBuf::from(path);
            }
        }
        if let Ok(timeout) = std::env::var("INGEST_READ_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("INGEST_READ_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.read_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        }
        if let Ok(policy) = std::env::var("INGEST_BUSY_POLICY") {
            self.busy_policy = policy.parse()?;
        }
        if let Ok(flag) = std::env::var("INGEST_SESSION_SUBDIRS") {
            self.session_subdirs = parse_bool(&flag)
                .ok_or_else(|| anyhow!("INGEST_SESSION_SUBDIRS must be true or false"))?;
        }
        Ok(())
    }

    /// Checked again after command-line overrides are applied.
    pub fn validate(&self) -> Result<()> {
        let mut addrs = self
            .listen_addr
            .to_socket_addrs()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen_addr, e))?;
        if addrs.next().is_none() {
            return Err(anyhow!(
                "listen address '{}' resolves to nothing",
                self.listen_addr
            ));
        }
        if self.image_dir.as_os_str().is_empty() {
            return Err(anyhow!("image directory must not be empty"));
        }
        if self.log_path.file_name().is_none() {
            return Err(anyhow!(
                "log path '{}' must name a file",
                self.log_path.display()
            ));
        }
        if self.log_path.is_dir() {
            return Err(anyhow!(
                "log path '{}' is a directory",
                self.log_path.display()
            ));
        }
        if self.limits.max_frame_bytes == 0 || self.limits.max_frame_bytes > u32::MAX as usize {
            return Err(anyhow!("max_frame_bytes must be between 1 and {}", u32::MAX));
        }
        if self.limits.max_control_line_bytes < MIN_CONTROL_LINE_BYTES {
            return Err(anyhow!(
                "max_control_line_bytes must be at least {}",
                MIN_CONTROL_LINE_BYTES
            ));
        }
        if self.max_sessions == Some(0) {
            return Err(anyhow!("max_sessions must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<IngestdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
