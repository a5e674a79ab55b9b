// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Daemon configuration: `key=value` lines with `#` comments, the same
//! tokens accepted on the command line, later assignments winning.

use ahash::AHashMap;
use bitflags::bitflags;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("line {0}: expected key=value")]
    BadLine(usize),

    #[error("bad value for '{key}': {value}")]
    BadValue { key: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Which pipelines the factory composes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FactoryFlags: u8 {
        const TRANSACTIONS = 1 << 0;
        const LOCAL = 1 << 1;
        const REMOTE = 1 << 2;
        const PROCESS = 1 << 3;
        const UNIX = 1 << 4;
    }
}

impl Default for FactoryFlags {
    fn default() -> Self {
        FactoryFlags::LOCAL | FactoryFlags::REMOTE | FactoryFlags::PROCESS | FactoryFlags::UNIX
    }
}

const KNOWN_KEYS: &[&str] = &[
    "discoverer.fanout",
    "discoverer.scan-interval",
    "remote.connection-timeout",
    "remote.idle-timeout",
    "remote.max-connection-attempts",
    "remote.port",
    "network.interface-update-interval",
    "process.allow-root",
    "factory.flags",
    "resources.tag",
    "transactions.file",
    "unix.socket-path",
];

/// Raw key/value properties.
#[derive(Debug, Default, Clone)]
pub struct Properties {
    values: AHashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut props = Self::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            props.apply_token(line).map_err(|_| ConfigError::BadLine(index + 1))?;
        }
        Ok(props)
    }

    /// One `key=value` token, e.g. from the command line.
    pub fn apply_token(&mut self, token: &str) -> Result<(), ConfigError> {
        let Some((key, value)) = token.split_once('=') else {
            return Err(ConfigError::BadLine(0));
        };
        let key = key.trim();
        let value = value.trim();
        if !KNOWN_KEYS.contains(&key) {
            warn!(key, "unknown configuration key ignored");
        }
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn parse_with<T>(
        &self,
        key: &str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse(raw).ok_or_else(|| ConfigError::BadValue {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }
}

/// Seconds by default; `ms` and `s` suffixes accepted.
fn parse_duration(raw: &str) -> Option<Duration> {
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    let secs = raw.strip_suffix('s').unwrap_or(raw).trim();
    secs.parse().ok().map(Duration::from_secs)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_factory_flags(raw: &str) -> Option<FactoryFlags> {
    let mut flags = FactoryFlags::default();
    for token in raw.split([',', ' ']).map(str::trim).filter(|t| !t.is_empty()) {
        let (on, name) = match token.split_at(1) {
            ("+", rest) => (true, rest),
            ("-", rest) => (false, rest),
            _ => (true, token),
        };
        let flag = match name {
            "transactions" => FactoryFlags::TRANSACTIONS,
            "local" => FactoryFlags::LOCAL,
            "remote" => FactoryFlags::REMOTE,
            "process" => FactoryFlags::PROCESS,
            "unix" => FactoryFlags::UNIX,
            _ => return None,
        };
        if on {
            flags |= flag;
        } else {
            flags &= !flag;
        }
    }
    Some(flags)
}

/// Typed daemon configuration with defaults.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub fanout: u64,
    pub scan_interval: Duration,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_connection_attempts: u32,
    pub port: u16,
    pub interface_update_interval: Duration,
    pub allow_root: bool,
    pub factory_flags: FactoryFlags,
    pub resource_tag: u64,
    pub transactions_file: PathBuf,
    pub unix_socket_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            fanout: 64,
            scan_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(7),
            idle_timeout: Duration::from_secs(60),
            max_connection_attempts: 3,
            port: 33333,
            interface_update_interval: Duration::from_secs(60),
            allow_root: false,
            factory_flags: FactoryFlags::default(),
            resource_tag: 0,
            transactions_file: PathBuf::from("/var/lib/arbor/transactions.log"),
            unix_socket_path: PathBuf::from("/tmp/arbord.sock"),
        }
    }
}

impl DaemonConfig {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            fanout: props.parse_with("discoverer.fanout", defaults.fanout, |s| {
                s.parse().ok().filter(|f| *f >= 1)
            })?,
            scan_interval: props.parse_with(
                "discoverer.scan-interval",
                defaults.scan_interval,
                parse_duration,
            )?,
            connection_timeout: props.parse_with(
                "remote.connection-timeout",
                defaults.connection_timeout,
                parse_duration,
            )?,
            idle_timeout: props.parse_with(
                "remote.idle-timeout",
                defaults.idle_timeout,
                parse_duration,
            )?,
            max_connection_attempts: props.parse_with(
                "remote.max-connection-attempts",
                defaults.max_connection_attempts,
                |s| s.parse().ok(),
            )?,
            port: props.parse_with("remote.port", defaults.port, |s| s.parse().ok())?,
            interface_update_interval: props.parse_with(
                "network.interface-update-interval",
                defaults.interface_update_interval,
                parse_duration,
            )?,
            allow_root: props.parse_with("process.allow-root", defaults.allow_root, parse_bool)?,
            factory_flags: props.parse_with(
                "factory.flags",
                defaults.factory_flags,
                parse_factory_flags,
            )?,
            resource_tag: props.parse_with("resources.tag", defaults.resource_tag, |s| {
                s.parse().ok()
            })?,
            transactions_file: props.parse_with(
                "transactions.file",
                defaults.transactions_file,
                |s| Some(PathBuf::from(s)),
            )?,
            unix_socket_path: props.parse_with(
                "unix.socket-path",
                defaults.unix_socket_path,
                |s| Some(PathBuf::from(s)),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_lines_comments_and_whitespace() {
        let props = Properties::parse(
            "# daemon settings\n\
             discoverer.fanout = 2\n\
             \n\
             remote.connection-timeout=500ms\n\
             process.allow-root = true\n",
        )
        .unwrap();
        let config = DaemonConfig::from_properties(&props).unwrap();
        assert_eq!(config.fanout, 2);
        assert_eq!(config.connection_timeout, Duration::from_millis(500));
        assert!(config.allow_root);
        // untouched keys keep their defaults
        assert_eq!(config.port, 33333);
    }

    #[test]
    fn later_assignments_win() {
        let mut props = Properties::parse("resources.tag=1\n").unwrap();
        props.apply_token("resources.tag=2").unwrap();
        let config = DaemonConfig::from_properties(&props).unwrap();
        assert_eq!(config.resource_tag, 2);
    }

    #[test]
    fn factory_flags_toggle() {
        let props = Properties::parse("factory.flags=+transactions -unix\n").unwrap();
        let config = DaemonConfig::from_properties(&props).unwrap();
        assert!(config.factory_flags.contains(FactoryFlags::TRANSACTIONS));
        assert!(!config.factory_flags.contains(FactoryFlags::UNIX));
        assert!(config.factory_flags.contains(FactoryFlags::LOCAL));
    }

    #[test]
    fn bad_values_are_rejected() {
        let props = Properties::parse("discoverer.fanout=zero\n").unwrap();
        assert!(DaemonConfig::from_properties(&props).is_err());
        assert!(Properties::parse("not a key value line\n").is_err());
    }

    #[test]
    fn scenario_style_overrides() {
        // the daemons of a two-node test are configured like this
        let mut props = Properties::new();
        props.apply_token("discoverer.fanout=2").unwrap();
        props.apply_token("discoverer.scan-interval=1").unwrap();
        let config = DaemonConfig::from_properties(&props).unwrap();
        assert_eq!(config.fanout, 2);
        assert_eq!(config.scan_interval, Duration::from_secs(1));
    }
}
