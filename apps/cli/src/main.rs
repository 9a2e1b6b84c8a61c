//! # Pendule CLI
//!
//! 倒立摆小车命令行工具。
//!
//! ## 服务端（树莓派上运行）
//!
//! ```bash
//! # 生成配置模板并按接线修改
//! pendule-cli config template -o pendule.toml
//!
//! # 启动服务（--simulate 使用仿真小车，无需硬件）
//! pendule-cli serve --config pendule.toml --calibrate
//! ```
//!
//! ## 客户端
//!
//! ```bash
//! pendule-cli calibrate --host raspberrypi.local
//! pendule-cli drive 0.2 --duration-ms 500 --host raspberrypi.local
//! pendule-cli state -n 0 --json --host raspberrypi.local
//! pendule-cli stop --host raspberrypi.local
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod rig;
mod singleton;

use commands::{Action, ConfigCommand, DriveCommand, RemoteArgs, ServeCommand, StateCommand};

/// Pendule CLI - 倒立摆小车命令行工具
#[derive(Parser, Debug)]
#[command(name = "pendule-cli")]
#[command(about = "Command-line tool for the inverted pendulum cart", long_about = None)]
#[command(version)]
struct Cli {
    /// 输出调试日志（RUST_LOG 优先）
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 配置文件管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 启动倒立摆服务端
    Serve {
        #[command(flatten)]
        args: ServeCommand,
    },

    /// 读取小车状态
    State {
        #[command(flatten)]
        args: StateCommand,
    },

    /// 驱动电机
    Drive {
        #[command(flatten)]
        args: DriveCommand,
    },

    /// 标定（往返两端限位开关）
    Calibrate {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// 急停（锁存，直到 reset）
    Stop {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// 清除急停和标定
    Reset {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(pendule_sdk::logging::env_filter(default_filter))
        .with_thread_names(true)
        .init();

    match cli.command {
        Commands::Config(cmd) => cmd.execute(),
        Commands::Serve { args } => args.execute(),
        Commands::State { args } => args.execute(),
        Commands::Drive { args } => args.execute(),
        Commands::Calibrate { remote } => Action::Calibrate.execute(&remote),
        Commands::Stop { remote } => Action::EmergencyStop.execute(&remote),
        Commands::Reset { remote } => Action::Reset.execute(&remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_drive_negative_power() {
        let cli = Cli::try_parse_from(["pendule-cli", "drive", "-0.3", "--no-wait", "--host", "cart"])
            .unwrap();
        match cli.command {
            Commands::Drive { args } => {
                assert_eq!(args.power, -0.3);
                assert!(args.no_wait);
                assert_eq!(args.remote.host, "cart");
                assert_eq!(args.duration_ms, None);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from([
            "pendule-cli",
            "-v",
            "serve",
            "--simulate",
            "--config",
            "rig.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Serve { args } => {
                assert!(args.simulate);
                assert!(!args.calibrate);
                assert_eq!(args.config.as_deref(), Some(std::path::Path::new("rig.toml")));
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_state_defaults() {
        let cli = Cli::try_parse_from(["pendule-cli", "state"]).unwrap();
        match cli.command {
            Commands::State { args } => {
                assert_eq!(args.count, 1);
                assert!(!args.json);
                assert_eq!(args.remote.state_port, 10001);
                assert_eq!(args.remote.command_port, 10002);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_drive_requires_power() {
        assert!(Cli::try_parse_from(["pendule-cli", "drive"]).is_err());
    }
}
