//! 远程接口错误类型定义

use pendule_driver::PenduleError;
use pendule_protocol::ProtocolError;
use thiserror::Error;

/// 远程接口错误类型
///
/// 服务端返回的应用错误还原为 [`RemoteError::Pendule`]，与本地调用得到的
/// 错误类型一致；其余变体都是传输层问题。
#[derive(Error, Debug)]
pub enum RemoteError {
    /// 服务端执行命令失败
    #[error(transparent)]
    Pendule(#[from] PenduleError),

    /// 连接失败或连接中断
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// 收到无法解析或不符合预期的消息
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 等待响应超时
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// 尚未收到任何状态快照
    #[error("No state received from the server yet")]
    NoState,

    /// 配置无效
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RemoteError {
    /// 是否为服务端返回的应用错误
    pub fn is_application(&self) -> bool {
        matches!(self, RemoteError::Pendule(_))
    }

    /// 应用错误（如有）
    pub fn as_pendule(&self) -> Option<&PenduleError> {
        match self {
            RemoteError::Pendule(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_is_transparent() {
        let err: RemoteError = PenduleError::NotCalibrated.into();
        assert!(err.is_application());
        assert_eq!(err.to_string(), "Pendule is not calibrated");
        assert!(matches!(err.as_pendule(), Some(PenduleError::NotCalibrated)));
    }

    #[test]
    fn test_transport_errors() {
        let err = RemoteError::Timeout("command response");
        assert!(!err.is_application());
        assert_eq!(err.to_string(), "Timed out waiting for command response");
        assert!(err.as_pendule().is_none());
    }
}
