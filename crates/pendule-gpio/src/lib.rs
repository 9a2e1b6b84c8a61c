//! # Pendule GPIO Adapter Layer
//!
//! GPIO 硬件抽象层：引脚读写、PWM、边沿回调、周期定时器。
//!
//! ```text
//! Encoder / Switch / Motor (pendule-driver)
//!     ↓ Arc<GpioConnection>（共享借用，不拥有后端）
//! GpioConnection（进程内唯一的所有权令牌）
//!     ↓ dyn GpioBackend
//! rppal（树莓派） / MockGpio（测试、仿真）
//! ```
//!
//! 同一进程内同时最多存在一个 [`GpioConnection`]。最后一个引用释放时
//! 会停止所有 PWM 输出、注销所有边沿回调和周期任务，并把用到的引脚
//! 置为高阻态。

mod backend;
mod connection;
pub mod periodic;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(all(target_os = "linux", feature = "rppal"))]
pub mod rpi;

pub use backend::GpioBackend;
pub use connection::GpioConnection;
pub use periodic::{PeriodicHandle, PeriodicStats};

#[cfg(all(target_os = "linux", feature = "rppal"))]
pub use rpi::RppalBackend;

use thiserror::Error;

/// BCM 引脚编号
pub type Pin = u8;

/// 边沿回调
///
/// 在后端的通知线程上调用，必须短小且不阻塞。
pub type EdgeCallback = Box<dyn Fn(EdgeEvent) + Send + Sync + 'static>;

/// GPIO 适配层统一错误类型
#[derive(Error, Debug, Clone)]
pub enum GpioError {
    /// 后端无法访问（启动时致命，不重试）
    #[error("GPIO backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 已经存在一个活动的 GPIO 连接
    #[error("A GPIO connection is already active in this process")]
    AlreadyActive,

    /// 连接已释放
    #[error("GPIO connection has been released")]
    Released,

    #[error("Invalid pin: {0}")]
    InvalidPin(Pin),

    #[error("Pin {0} is already in use")]
    PinInUse(Pin),

    /// 后端调用失败
    #[error("{op} failed on pin {pin}: {message}")]
    Backend {
        op: &'static str,
        pin: Pin,
        message: String,
    },
}

impl GpioError {
    pub fn backend(op: &'static str, pin: Pin, message: impl Into<String>) -> Self {
        Self::Backend {
            op,
            pin,
            message: message.into(),
        }
    }

    /// 是否为致命错误（无法通过重试恢复）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GpioError::BackendUnavailable(_) | GpioError::AlreadyActive | GpioError::Released
        )
    }
}

/// 电平
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl std::ops::Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// 引脚方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

/// 内部上下拉电阻
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

/// 触发边沿
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// 电平变化到 `level` 时是否应触发
    pub fn matches(self, level: Level) -> bool {
        match self {
            Edge::Both => true,
            Edge::Rising => level == Level::High,
            Edge::Falling => level == Level::Low,
        }
    }
}

/// 边沿事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin: Pin,
    /// 变化后的电平
    pub level: Level,
    /// 后端时钟（微秒）
    pub tick_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_matches() {
        assert!(Edge::Both.matches(Level::High));
        assert!(Edge::Both.matches(Level::Low));
        assert!(Edge::Rising.matches(Level::High));
        assert!(!Edge::Rising.matches(Level::Low));
        assert!(Edge::Falling.matches(Level::Low));
        assert!(!Edge::Falling.matches(Level::High));
    }

    #[test]
    fn test_level_conversions() {
        assert_eq!(Level::from(true), Level::High);
        assert_eq!(!Level::High, Level::Low);
        assert!(Level::High.is_high());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(GpioError::AlreadyActive.is_fatal());
        assert!(GpioError::BackendUnavailable("no daemon".into()).is_fatal());
        assert!(!GpioError::backend("read", 4, "bad level").is_fatal());
        assert_eq!(
            GpioError::backend("set_pwm", 24, "not a PWM pin").to_string(),
            "set_pwm failed on pin 24: not a PWM pin"
        );
    }
}
