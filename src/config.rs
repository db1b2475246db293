use std::fs::read_to_string;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use sendie_core::TtlConfig;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Http {
    ///
    /// address the HTTP surface and the signaling hub listen on
    ///
    #[serde(default = "Http::listen")]
    pub listen: SocketAddr,
}

impl Http {
    fn listen() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }
}

impl Default for Http {
    fn default() -> Self {
        Self { listen: Self::listen() }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct AccessControl {
    ///
    /// user-ID strings granted the Admin policy; frozen at boot, never
    /// written back by the allow-list's runtime mutations.
    ///
    #[serde(default)]
    pub admins: Vec<String>,
    ///
    /// user-ID strings seeded onto the allow-list on every boot.
    ///
    #[serde(default)]
    pub initial_allow_list: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Session {
    #[serde(default = "Session::base_ttl_minutes")]
    pub base_ttl_minutes: u64,
    #[serde(default = "Session::absolute_max_hours_host_connected")]
    pub absolute_max_hours_host_connected: u64,
    #[serde(default = "Session::absolute_max_hours_host_disconnected")]
    pub absolute_max_hours_host_disconnected: u64,
    #[serde(default = "Session::host_grace_minutes")]
    pub host_grace_minutes: u64,
    #[serde(default = "Session::empty_timeout_minutes")]
    pub empty_timeout_minutes: u64,
}

impl Session {
    fn base_ttl_minutes() -> u64 {
        30
    }

    fn absolute_max_hours_host_connected() -> u64 {
        24
    }

    fn absolute_max_hours_host_disconnected() -> u64 {
        4
    }

    fn host_grace_minutes() -> u64 {
        30
    }

    fn empty_timeout_minutes() -> u64 {
        5
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            base_ttl_minutes: Self::base_ttl_minutes(),
            absolute_max_hours_host_connected: Self::absolute_max_hours_host_connected(),
            absolute_max_hours_host_disconnected: Self::absolute_max_hours_host_disconnected(),
            host_grace_minutes: Self::host_grace_minutes(),
            empty_timeout_minutes: Self::empty_timeout_minutes(),
        }
    }
}

impl From<&Session> for TtlConfig {
    fn from(s: &Session) -> Self {
        Self {
            base_ttl_secs: s.base_ttl_minutes * 60,
            empty_timeout_secs: s.empty_timeout_minutes * 60,
            abs_host_on_secs: s.absolute_max_hours_host_connected * 3600,
            abs_host_off_secs: s.absolute_max_hours_host_disconnected * 3600,
            host_grace_secs: s.host_grace_minutes * 60,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
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
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub access_control: AccessControl,
    #[serde(default)]
    pub session: Session,
    #[serde(default = "Config::data_directory")]
    pub data_directory: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn data_directory() -> String {
        "./data".to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: Http::default(),
            access_control: AccessControl::default(),
            session: Session::default(),
            data_directory: Self::data_directory(),
            ice_servers: Vec::new(),
            log: Log::default(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: sendie-server --config /etc/sendie/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configuration from the file named on the command line.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(&Cli::parse().config)?)?)
    }
}
