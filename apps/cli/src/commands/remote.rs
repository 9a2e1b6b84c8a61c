//! 远程命令：连接正在运行的服务端

use anyhow::{Context, Result};
use clap::Args;
use pendule_sdk::StateMessage;
use pendule_sdk::prelude::*;
use pendule_sdk::remote::config::{DEFAULT_COMMAND_PORT, DEFAULT_STATE_PORT};
use std::thread;
use std::time::Duration;

/// 服务端地址参数
#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    /// 服务端主机名或 IP
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// 状态端口（UDP）
    #[arg(long, default_value_t = DEFAULT_STATE_PORT)]
    pub state_port: u16,

    /// 命令端口（TCP）
    #[arg(long, default_value_t = DEFAULT_COMMAND_PORT)]
    pub command_port: u16,

    /// 连接超时（毫秒）
    #[arg(long, default_value_t = 2000)]
    pub connect_timeout_ms: u64,
}

impl RemoteArgs {
    pub fn remote_config(&self, wait: bool) -> RemoteConfig {
        RemoteConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            ..RemoteConfig::new(self.host.clone())
        }
        .with_ports(self.state_port, self.command_port)
        .with_wait(wait)
    }

    pub fn connect(&self, wait: bool) -> Result<RemotePendule> {
        RemotePendule::connect(self.remote_config(wait)).with_context(|| {
            format!(
                "cannot reach pendule server at {} (state {}, commands {})",
                self.host, self.state_port, self.command_port
            )
        })
    }
}

/// 状态查询命令参数
#[derive(Args, Debug)]
pub struct StateCommand {
    #[command(flatten)]
    pub remote: RemoteArgs,

    /// 输出的状态条数（0 表示持续输出）
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u64,

    /// 以 JSON 行输出
    #[arg(long)]
    pub json: bool,
}

impl StateCommand {
    pub fn execute(&self) -> Result<()> {
        let remote = self.remote.connect(true)?;
        let states = remote.states();

        let mut printed = 0u64;
        let mut next = Some(remote.state()?);
        loop {
            if let Some(state) = next.take() {
                println!("{}", render_state(&state, self.json)?);
                printed += 1;
                if self.count != 0 && printed >= self.count {
                    return Ok(());
                }
            }
            next = states.recv_timeout(Duration::from_secs(2));
            if next.is_none() {
                anyhow::bail!("no state received from the server for 2 s");
            }
        }
    }
}

/// 驱动命令参数
#[derive(Args, Debug)]
pub struct DriveCommand {
    #[command(flatten)]
    pub remote: RemoteArgs,

    /// 功率 [-1, 1]，正值向右
    #[arg(allow_negative_numbers = true)]
    pub power: f64,

    /// 驱动时长（毫秒），到时后驱动置零；缺省时保持驱动
    #[arg(short, long)]
    pub duration_ms: Option<u64>,

    /// 不等待服务端确认
    #[arg(long)]
    pub no_wait: bool,
}

impl DriveCommand {
    pub fn execute(&self) -> Result<()> {
        let remote = self.remote.connect(!self.no_wait)?;
        remote.drive(self.power)?;
        if let Some(ms) = self.duration_ms {
            thread::sleep(Duration::from_millis(ms));
            remote.drive(0.0)?;
        }
        Ok(())
    }
}

/// 无参数的远程动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Calibrate,
    EmergencyStop,
    Reset,
}

impl Action {
    pub fn execute(self, args: &RemoteArgs) -> Result<()> {
        let remote = args.connect(true)?;
        match self {
            Action::Calibrate => {
                println!("⏳ Calibrating...");
                remote.calibrate()?;
                // 等待服务端发布标定后的状态
                let states = remote.states();
                let mut state = remote.state()?;
                while !state.calibrated {
                    state = states
                        .recv_timeout(Duration::from_secs(2))
                        .context("no state received after calibration")?;
                }
                println!("✅ Calibrated, cart at {:.3} m", state.position);
            },
            Action::EmergencyStop => {
                remote.emergency_stop()?;
                println!("🛑 Emergency stop latched (use `reset` to clear)");
            },
            Action::Reset => {
                remote.reset()?;
                println!("✅ Reset, calibrate before driving with position feedback");
            },
        }
        Ok(())
    }
}

/// 格式化一条状态
pub fn render_state(state: &StateMessage, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string(state).context("cannot encode state as JSON");
    }

    let flags = if state.emergency_stopped { " [E-STOP]" } else { "" };
    if !state.calibrated {
        return Ok(format!("#{:<8} uncalibrated{}", state.seq, flags));
    }
    Ok(format!(
        "#{:<8} x={:.4} m  v={:+.3} m/s  θ={:+.4} rad  ω={:+.3} rad/s{}",
        state.seq,
        state.position,
        state.linear_velocity,
        state.angle,
        state.angular_velocity,
        flags
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated() -> StateMessage {
        StateMessage {
            seq: 7,
            position: 0.5,
            angle: -0.25,
            linear_velocity: 0.1,
            angular_velocity: 0.0,
            calibrated: true,
            emergency_stopped: false,
            timestamp_us: 1_000,
        }
    }

    #[test]
    fn test_render_calibrated_state() {
        let text = render_state(&calibrated(), false).unwrap();
        assert!(text.starts_with("#7"), "{}", text);
        assert!(text.contains("x=0.5000 m"), "{}", text);
        assert!(text.contains("θ=-0.2500 rad"), "{}", text);
        assert!(!text.contains("E-STOP"));
    }

    #[test]
    fn test_render_uncalibrated_state() {
        let state = StateMessage::uncalibrated(3, true, 0);
        let text = render_state(&state, false).unwrap();
        assert!(text.contains("uncalibrated"), "{}", text);
        assert!(text.contains("[E-STOP]"), "{}", text);
    }

    #[test]
    fn test_render_json() {
        let text = render_state(&calibrated(), true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["position"], 0.5);
        assert_eq!(value["calibrated"], true);

        // NaN 字段输出为 null
        let text = render_state(&StateMessage::uncalibrated(1, false, 0), true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["position"].is_null());
    }

    #[test]
    fn test_remote_config_from_args() {
        let args = RemoteArgs {
            host: "cart.local".into(),
            state_port: 1,
            command_port: 2,
            connect_timeout_ms: 50,
        };
        let config = args.remote_config(false);
        assert_eq!(config.host, "cart.local");
        assert_eq!(config.state_port, 1);
        assert_eq!(config.command_port, 2);
        assert_eq!(config.connect_timeout(), Duration::from_millis(50));
        assert!(!config.wait);
    }
}
