//! # Pendule Driver
//!
//! 倒立摆小车的硬件对象与标定状态机：
//!
//! - [`Encoder`]：边沿中断 → 带符号脉冲计数（四倍频正交解码）
//! - [`Switch`]：去抖限位开关，可屏蔽中断
//! - [`Motor`]：带符号功率 → PWM 占空比 + 方向引脚
//! - [`Pendule`]：标定、位置/角度换算、急停锁存
//!
//! 所有硬件对象共享借用同一个 [`GpioConnection`](pendule_gpio::GpioConnection)。
//!
//! # 示例
//!
//! ```rust,ignore
//! use pendule_driver::{Pendule, PenduleConfig};
//! use pendule_gpio::GpioConnection;
//!
//! let conn = GpioConnection::acquire(backend)?;
//! let pendule = Pendule::new(conn, PenduleConfig::load("pendule.toml")?)?;
//! pendule.calibrate()?;
//! println!("x = {:.3} m", pendule.position()?);
//! pendule.drive(0.2)?;
//! ```

pub mod config;
pub mod encoder;
mod error;
pub mod motor;
pub mod pendule;
pub mod switch;

#[cfg(any(test, feature = "mock"))]
pub mod sim;

pub use config::{CalibrationConfig, LimitsConfig, PenduleConfig, PhysicsConfig, PinConfig};
pub use encoder::Encoder;
pub use error::PenduleError;
pub use motor::{Motor, MotorSettings};
pub use pendule::{
    Calibration, Pendule, PenduleControl, PenduleEvent, PenduleSnapshot, PenduleState, Side,
};
pub use switch::{Switch, SwitchSettings};
