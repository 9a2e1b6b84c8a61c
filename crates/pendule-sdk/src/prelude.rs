//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use pendule_sdk::prelude::*;
//! ```

// 驱动层
pub use crate::driver::{
    Calibration, Pendule, PenduleConfig, PenduleControl, PenduleEvent, PenduleSnapshot,
    PenduleState, Side,
};

// GPIO 层
pub use crate::gpio::{GpioBackend, GpioConnection};
#[cfg(all(target_os = "linux", feature = "rppal"))]
pub use crate::gpio::RppalBackend;

// 远程层
pub use crate::remote::{PenduleServer, RemoteConfig, RemotePendule, ServerConfig, StateSubscriber};

// 错误类型
pub use crate::driver::PenduleError;
pub use crate::gpio::GpioError;
pub use crate::protocol::ProtocolError;
pub use crate::remote::RemoteError;
