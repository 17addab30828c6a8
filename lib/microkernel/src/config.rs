// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-time configuration of a microkernel instance.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bf_types::consts::{
    HYPERVISOR_MAX_HUGE_POOL_SIZE, HYPERVISOR_MAX_PPS, HYPERVISOR_PAGE_SIZE,
};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of PPs to bring online.
    #[serde(default = "default_online_pps")]
    pub online_pps: u16,

    /// Frames in the page pool. State areas, direct map roots, and
    /// extension pages all come from here.
    #[serde(default = "default_page_pool_pages")]
    pub page_pool_pages: usize,

    /// Frames in the huge pool.
    #[serde(default = "default_huge_pool_pages")]
    pub huge_pool_pages: u64,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogConfig {
    /// One of the slog level names, e.g. "info" or "debug".
    pub level: Option<String>,
}

fn default_online_pps() -> u16 {
    1
}

fn default_page_pool_pages() -> usize {
    1024
}

fn default_huge_pool_pages() -> u64 {
    HYPERVISOR_MAX_HUGE_POOL_SIZE / HYPERVISOR_PAGE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            online_pps: default_online_pps(),
            page_pool_pages: default_page_pool_pages(),
            huge_pool_pages: default_huge_pool_pages(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "online_pps must be between 1 and {max}, got {0}",
        max = HYPERVISOR_MAX_PPS
    )]
    OnlinePps(u16),

    #[error("{0} must not be empty")]
    EmptyPool(&'static str),

    #[error("huge pool of {0} pages exceeds the platform limit")]
    HugePoolTooLarge(u64),

    #[error("unknown log level {0:?}")]
    LogLevel(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.online_pps == 0 || self.online_pps > HYPERVISOR_MAX_PPS {
            return Err(ConfigError::OnlinePps(self.online_pps));
        }
        if self.page_pool_pages == 0 {
            return Err(ConfigError::EmptyPool("page_pool_pages"));
        }
        if self.huge_pool_pages == 0 {
            return Err(ConfigError::EmptyPool("huge_pool_pages"));
        }
        let huge_max = HYPERVISOR_MAX_HUGE_POOL_SIZE / HYPERVISOR_PAGE_SIZE;
        if self.huge_pool_pages > huge_max {
            return Err(ConfigError::HugePoolTooLarge(self.huge_pool_pages));
        }
        self.log_level()?;
        Ok(())
    }

    /// The configured log level, `Info` when none is given.
    pub fn log_level(&self) -> Result<slog::Level, ConfigError> {
        match &self.log.level {
            None => Ok(slog::Level::Info),
            Some(level) => slog::Level::from_str(level)
                .map_err(|_| ConfigError::LogLevel(level.clone())),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    std::fs::read_to_string(path.as_ref())?.parse()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = "".parse().unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.log_level().unwrap(), slog::Level::Info);
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
online_pps = 4
page_pool_pages = 64
huge_pool_pages = 16

[log]
level = "debug"
"#;
        let cfg: Config = raw.parse().unwrap();
        assert_eq!(cfg.online_pps, 4);
        assert_eq!(cfg.page_pool_pages, 64);
        assert_eq!(cfg.huge_pool_pages, 16);
        assert_eq!(cfg.log_level().unwrap(), slog::Level::Debug);
    }

    #[test]
    fn invalid_configs() {
        const TEST_CASES: &[&str] = &[
            "online_pps = 0",
            "online_pps = 129",
            "page_pool_pages = 0",
            "huge_pool_pages = 0",
            "huge_pool_pages = 1000000",
            "[log]\nlevel = \"loud\"",
            "unknown_key = 1",
            "online_pps = \"two\"",
        ];
        for raw in TEST_CASES {
            assert!(raw.parse::<Config>().is_err(), "accepted {raw:?}");
        }
    }
}
