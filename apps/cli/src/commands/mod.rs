//! 命令定义和实现

pub mod config;
pub mod remote;
pub mod serve;

pub use config::ConfigCommand;
pub use remote::{Action, DriveCommand, RemoteArgs, StateCommand};
pub use serve::ServeCommand;
