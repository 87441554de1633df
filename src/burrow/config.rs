use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_PUBLIC_PORT: u16 = 8000;
const DEFAULT_CLIENT_PORT: u16 = 9000;
const DEFAULT_UPSTREAM_PORT: u16 = 8080;
const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Deployment environment; selects the default log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Dev,
    #[default]
    Prod,
}

impl Env {
    pub fn log_level(self) -> &'static str {
        match self {
            Env::Dev => "debug",
            Env::Prod => "info",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: String,
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "json".into(),
            output: "stderr".into(),
        }
    }
}

/// Relay-side configuration (`burrow serve`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub env: Env,
    pub public_port: u16,
    pub client_port: u16,
    pub logging: LoggingConfig,
}

/// Tunnel-client configuration (`burrow connect`).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub env: Env,
    /// Local upstream port, dialed per session on first use of a new id.
    pub port: u16,
    pub server_addr: String,
    /// Read/write deadline for upstream and tunnel I/O.
    pub timeout: Duration,
    pub logging: LoggingConfig,
}

/// A config path must be given explicitly, via the flag or the environment;
/// there is no default location.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    // clap already maps BURROW_CONFIG into the flag value when unset, but
    // keep the precedence explicit for callers that bypass the CLI.
    if let Some(p) = flag {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(p);
    }

    if let Some(p) = std::env::var_os("BURROW_CONFIG") {
        if !p.is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    anyhow::bail!("config: set a config path via --config or BURROW_CONFIG")
}

pub fn load_server_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let (s, ext) = read_config(path)?;
    let fc: FileServer = parse(&s, &ext).with_context(|| format!("parse {}", path.display()))?;
    Ok(ServerConfig {
        env: fc.env.unwrap_or_default(),
        public_port: fc.public_port.unwrap_or(DEFAULT_PUBLIC_PORT),
        client_port: fc.client_port.unwrap_or(DEFAULT_CLIENT_PORT),
        logging: fc.logging.map(FileLogging::into_config).unwrap_or_default(),
    })
}

pub fn load_client_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let (s, ext) = read_config(path)?;
    let fc: FileClient = parse(&s, &ext).with_context(|| format!("parse {}", path.display()))?;
    let timeout = match fc.timeout.as_deref() {
        None => DEFAULT_TIMEOUT,
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("config: invalid timeout {raw:?}"))?,
    };
    Ok(ClientConfig {
        env: fc.env.unwrap_or_default(),
        port: fc.port.unwrap_or(DEFAULT_UPSTREAM_PORT),
        server_addr: fc
            .server_addr
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_ADDR.into()),
        timeout,
        logging: fc.logging.map(FileLogging::into_config).unwrap_or_default(),
    })
}

fn read_config(path: &Path) -> anyhow::Result<(String, String)> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data).into_owned();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    Ok((s, ext))
}

fn parse<T: serde::de::DeserializeOwned>(s: &str, ext: &str) -> anyhow::Result<T> {
    match ext {
        "toml" => toml::from_str(s).context("parse toml"),
        "yaml" | "yml" => serde_yaml::from_str(s).context("parse yaml"),
        _ => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    env: Option<Env>,
    public_port: Option<u16>,
    client_port: Option<u16>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    env: Option<Env>,
    port: Option<u16>,
    server_addr: Option<String>,
    timeout: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    format: Option<String>,
    output: Option<String>,
}

impl FileLogging {
    fn into_config(self) -> LoggingConfig {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            format: self
                .format
                .map(|f| f.trim().to_ascii_lowercase())
                .filter(|f| !f.is_empty())
                .unwrap_or(defaults.format),
            output: self
                .output
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .unwrap_or(defaults.output),
        }
    }
}
