//! 服务端与客户端配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RemoteError;

/// 默认状态端口（UDP）
pub const DEFAULT_STATE_PORT: u16 = 10001;
/// 默认命令端口（TCP）
pub const DEFAULT_COMMAND_PORT: u16 = 10002;

/// 服务端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    pub state_port: u16,
    pub command_port: u16,
    /// 状态发布周期
    pub publish_period_ms: u64,
    /// 订阅租约：超过此时长未续订的订阅者被移除
    pub subscriber_timeout_ms: u64,
    /// 命令看门狗：非零驱动后此时长内无新的驱动命令则置零（0 关闭）
    pub command_watchdog_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            state_port: DEFAULT_STATE_PORT,
            command_port: DEFAULT_COMMAND_PORT,
            publish_period_ms: 20,
            subscriber_timeout_ms: 5000,
            command_watchdog_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// 仅监听本机的临时端口（测试用）
    pub fn loopback() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            state_port: 0,
            command_port: 0,
            ..Self::default()
        }
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_millis(self.publish_period_ms)
    }

    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    pub fn command_watchdog(&self) -> Option<Duration> {
        (self.command_watchdog_ms > 0).then(|| Duration::from_millis(self.command_watchdog_ms))
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.host.is_empty() {
            return Err(RemoteError::InvalidConfig("server host is empty".into()));
        }
        if self.publish_period_ms == 0 {
            return Err(RemoteError::InvalidConfig("publish_period_ms must be non-zero".into()));
        }
        if self.subscriber_timeout_ms < self.publish_period_ms {
            return Err(RemoteError::InvalidConfig(format!(
                "subscriber_timeout_ms ({}) is shorter than the publish period ({})",
                self.subscriber_timeout_ms, self.publish_period_ms
            )));
        }
        Ok(())
    }
}

/// 客户端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// 服务端主机名或 IP
    pub host: String,
    pub state_port: u16,
    pub command_port: u16,
    /// `false` 时 `drive`/`calibrate` 发送后立即返回，不等待服务端确认
    pub wait: bool,
    /// 建立连接和等待第一条状态的超时
    pub connect_timeout_ms: u64,
    /// 等待命令响应的超时（需覆盖完整的标定时长）
    pub response_timeout_ms: u64,
    /// 订阅续租间隔
    pub lease_renew_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            state_port: DEFAULT_STATE_PORT,
            command_port: DEFAULT_COMMAND_PORT,
            wait: true,
            connect_timeout_ms: 2000,
            response_timeout_ms: 35_000,
            lease_renew_ms: 1000,
        }
    }
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_ports(mut self, state_port: u16, command_port: u16) -> Self {
        self.state_port = state_port;
        self.command_port = command_port;
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn lease_renew(&self) -> Duration {
        Duration::from_millis(self.lease_renew_ms)
    }
}
