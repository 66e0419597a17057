use std::env;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_PREFIX: &str = "!";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub token: String,
    pub prefix: String,
    pub backend: BackendKind,
    /// How long the bot stays in voice with nothing to play.
    pub idle_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Lavalink(LavalinkConfig),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LavalinkConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub ssl: bool,
}

impl LavalinkConfig {
    pub fn rest_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn socket_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/v4/websocket", self.host, self.port)
    }
}

impl Config {
    /// Reads the configuration from the process environment. `.env` is
    /// expected to be loaded already.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let token = read("DISCORD_TOKEN").ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;
        let prefix = read("COMMAND_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let idle_secs = match read("IDLE_TIMEOUT_SECS") {
            Some(value) => parse("IDLE_TIMEOUT_SECS", value)?,
            None => DEFAULT_IDLE_TIMEOUT_SECS,
        };

        let backend = match read("AUDIO_BACKEND").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("local") => BackendKind::Local,
            Some("lavalink") => BackendKind::Lavalink(LavalinkConfig {
                host: read("LAVALINK_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: match read("LAVALINK_PORT") {
                    Some(value) => parse("LAVALINK_PORT", value)?,
                    None => 2333,
                },
                password: read("LAVALINK_PASSWORD")
                    .ok_or(ConfigError::Missing("LAVALINK_PASSWORD"))?,
                ssl: match read("LAVALINK_SSL") {
                    Some(value) => parse_flag("LAVALINK_SSL", value)?,
                    None => false,
                },
            }),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "AUDIO_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            token,
            prefix,
            backend,
            idle_timeout: Duration::from_secs(idle_secs),
        })
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

fn parse_flag(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { name, value }),
    }
}
