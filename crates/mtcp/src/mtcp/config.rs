use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::mtcp::tunnel::{agent::AgentOptions, relay::RelayOptions};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps MTCP_CONFIG into the flag already; this covers callers that
    // resolve without going through the CLI.
    if let Some(p) = std::env::var_os("MTCP_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("mtcp.toml"));
        }
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["mtcp.toml", "mtcp.yaml", "mtcp.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no mtcp.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/mtcp/mtcp.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "mtcp", "mtcp")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("mtcp.toml"))
    }
}

/// Loads the resolved file. Explicit paths must exist; a missing discovered or
/// default path yields the built-in defaults.
pub fn load_resolved(resolved: &ResolvedConfigPath) -> anyhow::Result<Config> {
    match fs::metadata(&resolved.path) {
        Ok(_) => load_config(&resolved.path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => match resolved.source {
            ConfigPathSource::Flag | ConfigPathSource::Env => {
                anyhow::bail!("config: {} does not exist", resolved.path.display())
            }
            ConfigPathSource::Cwd | ConfigPathSource::Default => Ok(Config::default()),
        },
        Err(err) => {
            Err(err).with_context(|| format!("config: stat {}", resolved.path.display()))
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub pool_size: usize,
    pub max_pending_callers: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: String,
    pub target_addr: String,
    pub fleet_size: usize,
    pub dial_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_addr: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            relay: RelayConfig {
                listen_addr: ":9999".into(),
                pool_size: 10,
                max_pending_callers: 0,
                acquire_timeout: Duration::ZERO,
                idle_timeout: Duration::ZERO,
            },
            agent: AgentConfig {
                server_addr: "127.0.0.1:9999".into(),
                target_addr: "127.0.0.1:80".into(),
                fleet_size: 10,
                dial_timeout: Duration::from_millis(5000),
                reconnect_initial: Duration::from_millis(1000),
                reconnect_max: Duration::from_millis(10_000),
            },
        }
    }
}

impl RelayConfig {
    pub fn options(&self) -> RelayOptions {
        RelayOptions {
            listen_addr: self.listen_addr.clone(),
            pool_size: self.pool_size,
            max_pending_callers: self.max_pending_callers,
            acquire_timeout: self.acquire_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl AgentConfig {
    pub fn options(&self) -> AgentOptions {
        AgentOptions {
            server_addr: self.server_addr.clone(),
            target_addr: self.target_addr.clone(),
            fleet_size: self.fleet_size,
            dial_timeout: self.dial_timeout,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    relay: Option<FileRelay>,

    agent: Option<FileAgent>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    listen_addr: Option<String>,
    pool_size: Option<i64>,
    max_pending_callers: Option<i64>,
    acquire_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    server_addr: Option<String>,
    target_addr: Option<String>,
    fleet_size: Option<i64>,
    dial_timeout_ms: Option<i64>,
    reconnect_initial_ms: Option<i64>,
    reconnect_max_ms: Option<i64>,
}

fn non_empty(v: Option<String>, default: &str) -> String {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    v.map(|ms| Duration::from_millis(ms.max(0) as u64))
        .unwrap_or(default)
}

fn at_least_one(v: Option<i64>, default: usize, field: &str) -> anyhow::Result<usize> {
    match v {
        None => Ok(default),
        Some(n) if n >= 1 => Ok(n as usize),
        Some(n) => anyhow::bail!("config: {field} must be at least 1 (got {n})"),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let d = Config::default();

        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: non_empty(l.level, &d.logging.level).to_ascii_lowercase(),
                format: non_empty(l.format, &d.logging.format).to_ascii_lowercase(),
                output: non_empty(l.output, &d.logging.output),
                add_source: l.add_source,
            },
            None => d.logging.clone(),
        };
        if !matches!(logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "config: logging.format must be text or json (got {:?})",
                logging.format
            );
        }

        let r = fc.relay.unwrap_or_default();
        let relay = RelayConfig {
            listen_addr: non_empty(r.listen_addr, &d.relay.listen_addr),
            pool_size: at_least_one(r.pool_size, d.relay.pool_size, "relay.pool_size")?,
            max_pending_callers: r.max_pending_callers.unwrap_or(0).max(0) as usize,
            acquire_timeout: millis(r.acquire_timeout_ms, d.relay.acquire_timeout),
            idle_timeout: millis(r.idle_timeout_ms, d.relay.idle_timeout),
        };

        let a = fc.agent.unwrap_or_default();
        let mut agent = AgentConfig {
            server_addr: non_empty(a.server_addr, &d.agent.server_addr),
            target_addr: non_empty(a.target_addr, &d.agent.target_addr),
            fleet_size: at_least_one(a.fleet_size, d.agent.fleet_size, "agent.fleet_size")?,
            dial_timeout: millis(a.dial_timeout_ms, d.agent.dial_timeout),
            reconnect_initial: millis(a.reconnect_initial_ms, d.agent.reconnect_initial),
            reconnect_max: millis(a.reconnect_max_ms, d.agent.reconnect_max),
        };
        if agent.reconnect_initial.is_zero() {
            agent.reconnect_initial = d.agent.reconnect_initial;
        }
        if agent.reconnect_max < agent.reconnect_initial {
            agent.reconnect_max = agent.reconnect_initial;
        }

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            relay,
            agent,
        })
    }
}
