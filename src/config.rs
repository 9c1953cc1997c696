use clap::Parser;
use codec::{KeySet, Message, SignMethod};
use std::{fs::read_to_string, net::SocketAddr, path::PathBuf};

/// One path registered from the static config file, grouped by its
/// `REDIRECT` line's target.
#[derive(Debug, Clone)]
pub struct StaticRedirect {
    pub path: String,
    pub service: Option<String>,
    pub target: String,
    pub hide: bool,
}

#[derive(Debug, Clone)]
pub struct StaticPeer {
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Codec(codec::Error),
    UnexpectedTimestamp(usize),
    UnknownSignMethod(usize),
}

impl std::error::Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "reading config file: {e}"),
            Self::Codec(e) => write!(f, "parsing config line: {e}"),
            Self::UnexpectedTimestamp(line) => {
                write!(f, "line {line}: static config entries may not carry a timestamp")
            }
            Self::UnknownSignMethod(line) => write!(f, "line {line}: unrecognized SIGN method"),
        }
    }
}

/// Everything read out of `/etc/house/portal.config`: the same line
/// grammar the control socket speaks, minus the leading timestamp on
/// `REDIRECT`/`PEER` (those are static and therefore always permanent).
#[derive(Debug, Default)]
pub struct StaticConfig {
    pub local_only: bool,
    pub keys: KeySet,
    pub redirects: Vec<StaticRedirect>,
    pub peers: Vec<StaticPeer>,
}

impl StaticConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = StaticConfig::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let msg = Message::parse(line).map_err(ConfigError::Codec)?;
            match msg {
                Message::Local => cfg.local_only = true,
                Message::Sign { method, key_hex } => {
                    let method = SignMethod::parse(&method)
                        .ok_or(ConfigError::UnknownSignMethod(lineno + 1))?;
                    cfg.keys.push(method, &key_hex).map_err(ConfigError::Codec)?;
                }
                Message::Redirect {
                    timestamp,
                    target,
                    hide,
                    paths,
                    ..
                } => {
                    if timestamp.is_some() {
                        return Err(ConfigError::UnexpectedTimestamp(lineno + 1));
                    }
                    for p in paths {
                        cfg.redirects.push(StaticRedirect {
                            path: p.path,
                            service: p.service,
                            target: target.clone(),
                            hide,
                        });
                    }
                }
                Message::Peer { timestamp, peers } => {
                    if timestamp.is_some() {
                        return Err(ConfigError::UnexpectedTimestamp(lineno + 1));
                    }
                    for p in peers {
                        cfg.peers.push(StaticPeer { host: p.host });
                    }
                }
            }
        }

        Ok(cfg)
    }

    fn load_from(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&text)
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct Cli {
    /// path to the static control-line config file
    #[arg(long, default_value = "/etc/house/portal.config")]
    pub config: PathBuf,

    /// this portal's own host identity, used for peer-gossip loopback
    /// suppression and as the `target` in path registrations routed
    /// through it
    #[arg(long)]
    pub portal_server: Option<String>,

    /// UDP control port, used for both listening and peer gossip
    #[arg(long)]
    pub portal_udp_port: Option<u16>,

    /// HTTP listen port for the discovery/redirect front door
    #[arg(long)]
    pub portal_http_port: Option<u16>,

    /// also bind the control port on IPv6
    #[arg(long)]
    pub bind_v6: bool,

    /// `EXT:INT` port rewrite applied by registering clients before they
    /// advertise their webport to a Portal; repeatable. The Portal
    /// itself never rewrites anything — this flag is recognized here
    /// only so a shared command line (Portal plus co-located services)
    /// doesn't fail to parse.
    #[arg(long = "portal-map")]
    pub portal_map: Vec<String>,

    /// named group this portal belongs to, advertised on /portal/peers
    #[arg(long, default_value = "default")]
    pub group: String,

    /// append to this log file instead of stderr
    #[arg(long)]
    pub log: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

pub const DEFAULT_UDP_PORT: u16 = 70;
pub const DEFAULT_HTTP_PORT: u16 = 80;

pub struct Config {
    pub config_path: PathBuf,
    pub host: String,
    pub group: String,
    pub udp_port: u16,
    pub http_listen: SocketAddr,
    pub bind_v6: bool,
    pub log_level: LogLevel,
    pub log_path: Option<PathBuf>,
    /// Parsed `-portal-map=EXT:INT` entries, as `(external, internal)`
    /// pairs; unrecognized entries are logged and skipped at startup.
    pub port_maps: Vec<(u16, u16)>,
}

fn parse_port_map(s: &str) -> Option<(u16, u16)> {
    let (ext, int) = s.split_once(':')?;
    Some((ext.trim().parse().ok()?, int.trim().parse().ok()?))
}

impl Config {
    /// Parses CLI flags and the static config file referenced by
    /// `-config`. A missing or unparsable config file is not fatal to the
    /// process (an operator may stand up a bare portal with no static
    /// routes), but a parse error short-circuits with a clear message so
    /// it isn't mistaken for "file absent".
    pub fn load() -> anyhow::Result<(Self, StaticConfig)> {
        let cli = Cli::parse();

        let static_cfg = match StaticConfig::load_from(&cli.config) {
            Ok(cfg) => cfg,
            Err(ConfigError::Io(_)) => StaticConfig::default(),
            Err(e) => return Err(e.into()),
        };

        let udp_port = cli.portal_udp_port.unwrap_or(DEFAULT_UDP_PORT);
        let http_port = cli.portal_http_port.unwrap_or(DEFAULT_HTTP_PORT);
        let host = cli
            .portal_server
            .clone()
            .unwrap_or_else(|| format!("localhost:{udp_port}"));

        let port_maps: Vec<(u16, u16)> = cli
            .portal_map
            .iter()
            .filter_map(|s| {
                let parsed = parse_port_map(s);
                if parsed.is_none() {
                    log::warn!("ignoring unparsable -portal-map value {s:?}");
                }
                parsed
            })
            .collect();

        let config = Config {
            config_path: cli.config,
            host,
            group: cli.group,
            udp_port,
            http_listen: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), http_port),
            bind_v6: cli.bind_v6,
            log_level: cli.log_level,
            log_path: cli.log,
            port_maps,
        };

        Ok((config, static_cfg))
    }

    /// Re-reads the static config file for the mtime-poll reload. A parse
    /// failure here is reported to the caller to log and ignore — the
    /// previously loaded config keeps running.
    pub fn reload(&self) -> Result<StaticConfig, ConfigError> {
        StaticConfig::load_from(&self.config_path)
    }

    pub fn mtime(&self) -> Option<std::time::SystemTime> {
        std::fs::metadata(&self.config_path)
            .and_then(|m| m.modified())
            .ok()
    }
}
