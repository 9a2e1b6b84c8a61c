//! # Pendule Remote
//!
//! 倒立摆的网络接口：
//!
//! - 状态通道（UDP）：服务端按固定周期向订阅者广播最新状态，慢订阅者
//!   只会丢掉中间快照，不会积压
//! - 命令通道（TCP）：请求/响应，服务端串行执行命令，急停不排队
//!
//! [`RemotePendule`] 与本地 [`Pendule`](pendule_driver::Pendule) 实现同一个
//! [`PenduleControl`](pendule_driver::PenduleControl) 接口。
//!
//! # 示例
//!
//! ```rust,ignore
//! use pendule_remote::{RemoteConfig, RemotePendule};
//! use pendule_driver::PenduleControl;
//!
//! let remote = RemotePendule::connect(RemoteConfig::new("raspberrypi.local"))?;
//! remote.calibrate()?;
//! println!("x = {:.3} m", remote.position()?);
//! ```

pub mod client;
pub mod command;
pub mod config;
mod error;
pub mod mailbox;
pub mod publisher;
pub mod server;
pub mod subscribers;
mod transport;

pub use client::RemotePendule;
pub use command::CommandHandler;
pub use config::{RemoteConfig, ServerConfig};
pub use error::RemoteError;
pub use mailbox::StateSubscriber;
pub use pendule_protocol::StateMessage;
pub use publisher::{StatePublisher, StateSampler};
pub use server::PenduleServer;
pub use subscribers::SubscriberRegistry;
