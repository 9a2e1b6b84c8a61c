//! 驱动层错误类型定义

use pendule_gpio::GpioError;
use pendule_protocol::ErrorKind;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug, Clone)]
pub enum PenduleError {
    /// GPIO 后端错误
    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),

    /// 配置无效
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 开关中断被屏蔽时查询异步状态
    #[error("Switch interrupts are disabled; poll the pin instead")]
    InterruptsAreDisabled,

    /// 未标定（需要先执行 calibrate）
    #[error("Pendule is not calibrated")]
    NotCalibrated,

    /// 标定失败（超时、撞到错误的限位开关、编码器方向相反）
    #[error("Calibration failed: {0}")]
    CalibrationFailed(String),

    /// 急停已锁存（只能通过 reset 清除）
    #[error("Emergency stop is latched: {0}")]
    EmergencyStop(String),

    /// 另一个命令正在执行（标定期间拒绝驱动命令）
    #[error("Another command is in progress")]
    Busy,

    /// 无效命令参数
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl PenduleError {
    /// 对应的线上错误类型
    pub fn kind(&self) -> ErrorKind {
        match self {
            PenduleError::Gpio(GpioError::BackendUnavailable(_)) => ErrorKind::BackendUnavailable,
            PenduleError::Gpio(GpioError::AlreadyActive) => ErrorKind::AlreadyActive,
            PenduleError::Gpio(_) => ErrorKind::Hardware,
            PenduleError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            PenduleError::InterruptsAreDisabled => ErrorKind::InterruptsAreDisabled,
            PenduleError::NotCalibrated => ErrorKind::NotCalibrated,
            PenduleError::CalibrationFailed(_) => ErrorKind::CalibrationFailed,
            PenduleError::EmergencyStop(_) => ErrorKind::EmergencyStop,
            PenduleError::Busy => ErrorKind::Busy,
            PenduleError::InvalidCommand(_) => ErrorKind::InvalidCommand,
        }
    }

    /// 由远端返回的错误类型和消息重建错误
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::BackendUnavailable => GpioError::BackendUnavailable(message).into(),
            ErrorKind::AlreadyActive => GpioError::AlreadyActive.into(),
            ErrorKind::Hardware => GpioError::backend("remote", 0, message).into(),
            ErrorKind::InvalidConfig => PenduleError::InvalidConfig(message),
            ErrorKind::InterruptsAreDisabled => PenduleError::InterruptsAreDisabled,
            ErrorKind::NotCalibrated => PenduleError::NotCalibrated,
            ErrorKind::CalibrationFailed => PenduleError::CalibrationFailed(message),
            ErrorKind::EmergencyStop => PenduleError::EmergencyStop(message),
            ErrorKind::Busy => PenduleError::Busy,
            ErrorKind::InvalidCommand => PenduleError::InvalidCommand(message),
        }
    }

    /// 需要返回给远端的附加消息
    pub fn detail(&self) -> String {
        match self {
            PenduleError::CalibrationFailed(msg)
            | PenduleError::EmergencyStop(msg)
            | PenduleError::InvalidCommand(msg)
            | PenduleError::InvalidConfig(msg) => msg.clone(),
            PenduleError::Gpio(GpioError::BackendUnavailable(msg)) => msg.clone(),
            other => other.to_string(),
        }
    }
}
