use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use dbvisor_instance::EngineKind;

pub const DEFAULT_BASE_GRAPH_PORT: u16 = 7400;
pub const DEFAULT_BASE_TIMESERIES_PORT: u16 = 8400;

const DEFAULT_START_TIMEOUT_SECS: u64 = 120;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

const INSTANCES_DIR: &str = "instances";
const REGISTRY_DIR: &str = "registry";
const LOCKS_DIR: &str = "locks";
const LOGS_DIR: &str = "logs";

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse::<u16>().ok())
}

/// Where a distribution archive comes from and what it is called in the cache.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct DistributionConfig {
    pub url: String,
    pub file_name: String,
    #[serde(default)]
    pub sha1: Option<String>,
}

impl DistributionConfig {
    fn default_for(kind: EngineKind) -> Self {
        let (url, file_name) = match kind {
            EngineKind::Graph => {
                let file = if cfg!(windows) {
                    "neo4j-community-3.5.35-windows.zip"
                } else {
                    "neo4j-community-3.5.35-unix.tar.gz"
                };
                (format!("https://dist.neo4j.org/{file}"), file)
            }
            EngineKind::Timeseries => {
                let file = if cfg!(windows) {
                    "influxdb-1.8.10_windows_amd64.zip"
                } else {
                    "influxdb-1.8.10_linux_amd64.tar.gz"
                };
                (
                    format!("https://dl.influxdata.com/influxdb/releases/{file}"),
                    file,
                )
            }
        };
        Self {
            url,
            file_name: file_name.to_string(),
            sha1: None,
        }
    }
}

/// Host name the health prober connects to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub host: String,
    /// Compose service name of the app container when running in containers.
    pub container_service: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            container_service: None,
        }
    }
}

impl ProbeConfig {
    pub fn resolve_host(&self) -> String {
        self.resolve_host_for(current_hostname().as_deref())
    }

    fn resolve_host_for(&self, hostname: Option<&str>) -> String {
        match self.container_service.as_deref() {
            // Inside the app container the engines listen on every interface.
            Some(service) if hostname == Some(service) => "0.0.0.0".to_string(),
            Some(service) => service.to_string(),
            None => self.host.clone(),
        }
    }
}

#[cfg(unix)]
fn current_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(not(unix))]
fn current_hostname() -> Option<String> {
    env_string("COMPUTERNAME")
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub cache_root: Option<PathBuf>,
    pub base_graph_port: u16,
    pub base_timeseries_port: u16,
    pub start_timeout_secs: u64,
    /// 0 waits for the engines to exit without a bound.
    pub stop_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub probe: ProbeConfig,
    pub graph: DistributionConfig,
    pub timeseries: DistributionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            cache_root: None,
            base_graph_port: DEFAULT_BASE_GRAPH_PORT,
            base_timeseries_port: DEFAULT_BASE_TIMESERIES_PORT,
            start_timeout_secs: DEFAULT_START_TIMEOUT_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            probe: ProbeConfig::default(),
            graph: DistributionConfig::default_for(EngineKind::Graph),
            timeseries: DistributionConfig::default_for(EngineKind::Timeseries),
        }
    }
}

impl AgentConfig {
    /// Defaults, then the optional TOML file, then `DBVISOR_*` overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env_string("DBVISOR_CONFIG").map(PathBuf::from));

        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("read config {}", p.display()))?;
                Self::from_toml(&raw).with_context(|| format!("parse config {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.data_root = absolutize(&cfg.data_root);
        if let Some(cache) = cfg.cache_root.take() {
            cfg.cache_root = Some(absolutize(&cache));
        }
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let cfg: AgentConfig = toml::from_str(raw)?;
        if cfg.base_graph_port == 0 || cfg.base_timeseries_port == 0 {
            anyhow::bail!("base ports must be non-zero");
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("DBVISOR_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = env_string("DBVISOR_CACHE_ROOT") {
            self.cache_root = Some(PathBuf::from(v));
        }
        if let Some(v) = env_u16("DBVISOR_BASE_GRAPH_PORT").filter(|v| *v >= 1024) {
            self.base_graph_port = v;
        }
        if let Some(v) = env_u16("DBVISOR_BASE_TIMESERIES_PORT").filter(|v| *v >= 1024) {
            self.base_timeseries_port = v;
        }
        if let Some(v) = env_u64("DBVISOR_START_TIMEOUT_SEC") {
            self.start_timeout_secs = v.clamp(1, 60 * 60);
        }
        if let Some(v) = env_u64("DBVISOR_STOP_TIMEOUT_SEC") {
            self.stop_timeout_secs = v.min(60 * 60);
        }
        if let Some(v) = env_u64("DBVISOR_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v.clamp(10, 60_000);
        }
        if let Some(v) = env_string("DBVISOR_PROBE_HOST") {
            self.probe.host = v;
        }
        if let Some(v) = env_string("DBVISOR_CONTAINER_SERVICE") {
            self.probe.container_service = Some(v);
        }
    }

    pub fn instances_root(&self) -> PathBuf {
        self.data_root.join(INSTANCES_DIR)
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_root.join(REGISTRY_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_root.join(LOCKS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join(LOGS_DIR)
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(|| self.data_root.join("cache"))
    }

    pub fn base_port(&self, kind: EngineKind) -> u16 {
        match kind {
            EngineKind::Graph => self.base_graph_port,
            EngineKind::Timeseries => self.base_timeseries_port,
        }
    }

    pub fn distribution(&self, kind: EngineKind) -> &DistributionConfig {
        match kind {
            EngineKind::Graph => &self.graph,
            EngineKind::Timeseries => &self.timeseries,
        }
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        if self.stop_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stop_timeout_secs))
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn absolutize(p: &Path) -> PathBuf {
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: the directory may not exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}
