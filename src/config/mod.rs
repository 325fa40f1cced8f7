//! Configuration loading and validation.
//!
//! The configuration is a TOML file of blocks mirroring the traditional
//! ircd layout: one `[server]` identity block, `[general]` and
//! `[channel]` tunables, `[serverhide]` visibility switches, and
//! repeated `[[class]]`, `[[listen]]` and `[[connect]]` blocks. All
//! values are consumed read-only after startup.

use serde::Deserialize;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub serverhide: ServerHideConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub class: Vec<ClassBlock>,
    #[serde(default)]
    pub listen: Vec<ListenBlock>,
    #[serde(default)]
    pub connect: Vec<ConnectBlock>,
}

/// This server's identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name shown in prefixes (e.g. "irc.example.org").
    pub name: String,
    /// Three-byte server id used on server-to-server links.
    pub sid: String,
    /// Free-form description carried in SERVER introductions.
    pub description: String,
}

/// General behavior tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Require clients to echo a random PING cookie before registering.
    pub ping_cookie: bool,
    /// Ignore client-class commands arriving from remote users.
    pub disable_remote_commands: bool,
    /// Minimum seconds between paced list-style commands per client.
    pub pace_wait: u64,
    /// Suppress PART/QUIT reasons from connections younger than this.
    pub anti_spam_exit_message_time: u64,
    /// Join/leave count at which a client is considered a spambot.
    pub spam_num: u32,
    /// Rejoin-within window (seconds) counted against `spam_num`.
    pub spam_time: u64,
    /// Joins within `joinfloodtime` seconds before a channel is
    /// reported as join-flooded. Zero time disables the counter.
    pub joinfloodcount: u32,
    pub joinfloodtime: u64,
    /// Topics set locally are truncated to this length.
    pub max_topic_length: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            ping_cookie: false,
            disable_remote_commands: false,
            pace_wait: 10,
            anti_spam_exit_message_time: 0,
            spam_num: 0,
            spam_time: 60,
            joinfloodcount: 16,
            joinfloodtime: 8,
            max_topic_length: 300,
        }
    }
}

/// Channel tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Reject locally created channel names with non-printing characters.
    pub disable_fake_channels: bool,
    /// Allow `$`-prefixed extended bans on mode lists.
    pub enable_extbans: bool,
    /// Combined ban/exception/invex cap per channel.
    pub max_bans: usize,
    /// The cap when the extended-limit channel mode (`+L`) is set.
    pub max_bans_large: usize,
    /// Channels one client may occupy when its class sets no limit.
    pub max_channels: usize,
    /// Reserved channel name patterns; joins are refused with the
    /// recorded reason.
    pub resv: Vec<ResvBlock>,
}

/// One reserved channel name pattern.
#[derive(Debug, Clone, Deserialize)]
pub struct ResvBlock {
    pub mask: String,
    pub reason: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            disable_fake_channels: false,
            enable_extbans: true,
            max_bans: 100,
            max_bans_large: 500,
            max_channels: 25,
            resv: Vec::new(),
        }
    }
}

/// Server visibility switches.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerHideConfig {
    /// Mask peer IP addresses in notices to non-admin opers.
    pub hide_server_ips: bool,
    /// Omit service servers from the flattened links file.
    pub hide_services: bool,
    /// Introduce ourselves as a hidden server (`+h`).
    pub hidden: bool,
    /// Path of the flattened links file; empty disables rewriting.
    pub flatten_links_file: String,
    /// Seconds between links-file rewrites.
    pub flatten_links_delay: Option<u64>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

/// A connection class: shared limits for the connections bound to it.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassBlock {
    pub name: String,
    /// Seconds of silence before a PING probe, twice that before exit.
    #[serde(default = "default_ping_time")]
    pub ping_time: u64,
    /// Seconds between autoconnect attempts for links in this class.
    #[serde(default = "default_con_freq")]
    pub con_freq: u64,
    /// Maximum concurrent connections in this class.
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    /// Send queue cap in bytes; overflow is fatal for the connection.
    #[serde(default = "default_sendq")]
    pub sendq: usize,
    /// Channels one client in this class may occupy (0 = global default).
    #[serde(default)]
    pub max_channels: usize,
}

fn default_ping_time() -> u64 {
    90
}
fn default_con_freq() -> u64 {
    300
}
fn default_max_total() -> usize {
    100
}
fn default_sendq() -> usize {
    1_048_576
}

impl ClassBlock {
    pub fn fallback() -> Self {
        Self {
            name: "default".to_string(),
            ping_time: default_ping_time(),
            con_freq: default_con_freq(),
            max_total: default_max_total(),
            sendq: default_sendq(),
            max_channels: 0,
        }
    }
}

/// A listening socket, plaintext or TLS.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenBlock {
    pub address: SocketAddr,
    /// Present for TLS listeners.
    #[serde(default)]
    pub tls: Option<ListenTls>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenTls {
    pub cert_path: String,
    pub key_path: String,
}

/// A peer server we may link to.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectBlock {
    /// Remote server name.
    pub name: String,
    /// Remote host to connect to.
    pub host: String,
    pub port: u16,
    /// Password we send in PASS.
    pub send_password: String,
    /// Password we require from the peer.
    pub accept_password: String,
    #[serde(default = "default_class_name")]
    pub class: String,
    #[serde(default)]
    pub autoconnect: bool,
    #[serde(default)]
    pub tls: bool,
    /// Expected SHA-256 certificate fingerprint, hex encoded.
    #[serde(default)]
    pub tls_fingerprint: Option<String>,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub timeout: u64,
}

fn default_class_name() -> String {
    "default".to_string()
}
fn default_connect_timeout() -> u64 {
    30
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.is_empty() || !self.server.name.contains('.') {
            return Err(ConfigError::Invalid(
                "server.name must contain a dot".to_string(),
            ));
        }
        if self.server.sid.len() != 3
            || !self.server.sid.starts_with(|c: char| c.is_ascii_digit())
            || !self
                .server
                .sid
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        {
            return Err(ConfigError::Invalid(
                "server.sid must be a digit followed by two uppercase alphanumerics".to_string(),
            ));
        }
        for connect in &self.connect {
            if connect.class != "default" && !self.class.iter().any(|c| c.name == connect.class) {
                return Err(ConfigError::Invalid(format!(
                    "connect block {} references unknown class {}",
                    connect.name, connect.class
                )));
            }
        }
        Ok(())
    }

    /// Resolve a class by name, falling back to built-in defaults.
    pub fn class(&self, name: &str) -> ClassBlock {
        self.class
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .unwrap_or_else(ClassBlock::fallback)
    }
}
