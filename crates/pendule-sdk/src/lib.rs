//! Pendule SDK - 倒立摆小车 Rust SDK
//!
//! # 架构设计
//!
//! 分层架构，从底层到高层：
//!
//! - **GPIO 层** (`gpio`): 后端抽象（树莓派 / Mock）、连接所有权、周期任务
//! - **协议层** (`protocol`): 状态/命令消息的编码与解码
//! - **驱动层** (`driver`): 编码器、限位开关、电机、标定状态机
//! - **远程层** (`remote`): 状态发布、命令服务端、远程客户端
//!
//! # 快速开始
//!
//! 本机控制：
//!
//! ```rust,ignore
//! use pendule_sdk::prelude::*;
//!
//! pendule_sdk::init_logger();
//! let conn = GpioConnection::acquire(RppalBackend::new())?;
//! let pendule = Pendule::new(conn, PenduleConfig::load("pendule.toml")?)?;
//! pendule.calibrate()?;
//! ```
//!
//! 远程控制（与本机控制使用同一个 [`PenduleControl`] 接口）：
//!
//! ```rust,ignore
//! use pendule_sdk::prelude::*;
//!
//! let remote = RemotePendule::connect(RemoteConfig::new("raspberrypi.local"))?;
//! remote.drive(0.2)?;
//! ```

pub mod logging;
pub mod prelude;

pub use pendule_driver as driver;
pub use pendule_gpio as gpio;
pub use pendule_protocol as protocol;
pub use pendule_remote as remote;

pub use logging::{init_logger, try_init_logger};

// 常用类型
pub use pendule_driver::{
    Calibration, Pendule, PenduleConfig, PenduleControl, PenduleError, PenduleEvent,
    PenduleSnapshot, PenduleState, Side,
};
pub use pendule_gpio::{GpioBackend, GpioConnection, GpioError};
pub use pendule_protocol::{ProtocolError, StateMessage};
pub use pendule_remote::{
    PenduleServer, RemoteConfig, RemoteError, RemotePendule, ServerConfig, StateSubscriber,
};
