//! 服务端配置文件
//!
//! 一个 TOML 文件同时描述小车（`[pins]`、`[physics]` 等，与
//! [`PenduleConfig`] 相同）和网络服务（`[server]`）。

use anyhow::{Context, Result};
use pendule_sdk::{PenduleConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 倒立摆服务端的完整配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(flatten)]
    pub pendule: PenduleConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl RigConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid configuration file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.pendule.validate()?;
        self.server.validate()?;
        Ok(())
    }

    /// 带注释头的默认配置
    pub fn template() -> Result<String> {
        let body = toml::to_string_pretty(&Self::default()).context("cannot serialize config")?;
        Ok(format!(
            "# Pendule server configuration\n\
             #\n\
             # Pins use BCM numbering. Durations are in milliseconds, except\n\
             # switches.debounce_us. Lengths are in meters.\n\n{}",
            body
        ))
    }
}
