//! 服务端命令
//!
//! 占用 GPIO，启动状态发布与命令服务，直到收到 Ctrl+C。

use anyhow::{Context, Result};
use clap::Args;
use pendule_sdk::driver::sim::{CartSimulator, SimParams};
use pendule_sdk::gpio::mock::MockGpio;
use pendule_sdk::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::rig::RigConfig;
use crate::singleton::{ServerLock, default_lock_file};

/// 服务端命令参数
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// 配置文件（TOML，缺省使用内置默认值）
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 使用仿真小车代替真实硬件
    #[arg(long)]
    pub simulate: bool,

    /// 启动后立即标定
    #[arg(long)]
    pub calibrate: bool,

    /// 锁文件路径
    ///
    /// 默认: 自动选择用户可写目录（XDG_RUNTIME_DIR 或 /tmp）
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

impl ServeCommand {
    pub fn execute(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => RigConfig::load(path)?,
            None => RigConfig::default(),
        };

        let lock_file = self.lock_file.clone().unwrap_or_else(default_lock_file);
        let _lock = ServerLock::acquire(&lock_file)
            .with_context(|| format!("cannot start the server ({})", lock_file.display()))?;

        let running = Arc::new(AtomicBool::new(true));
        let handler_running = running.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nReceived interrupt signal. Shutting down...");
            handler_running.store(false, Ordering::Release);
        })
        .context("failed to set signal handler")?;

        eprintln!("Pendule server starting...");
        eprintln!(
            "  Backend: {}",
            if self.simulate { "simulated cart" } else { "Raspberry Pi GPIO" }
        );
        eprintln!("  State (UDP): {}:{}", config.server.host, config.server.state_port);
        eprintln!("  Commands (TCP): {}:{}", config.server.host, config.server.command_port);
        eprintln!("  Publish period: {} ms", config.server.publish_period_ms);
        eprintln!("  Lock file: {}", lock_file.display());

        // 仿真器须先于 Pendule 启动
        let (conn, _sim) = if self.simulate {
            let mock = MockGpio::new();
            let sim = CartSimulator::start(
                mock.clone(),
                config.pendule.pins,
                SimParams::for_config(&config.pendule),
            );
            (GpioConnection::acquire(mock)?, Some(sim))
        } else {
            (acquire_hardware()?, None)
        };

        let pendule = Arc::new(Pendule::new(conn, config.pendule.clone())?);
        let events = pendule.events();
        if self.calibrate {
            info!("Calibrating");
            pendule.calibrate().context("calibration failed")?;
        }

        let mut server = PenduleServer::start(pendule.clone(), &config.server)?;
        eprintln!(
            "Pendule server started on {} / {}. Press Ctrl+C to stop.",
            server.state_addr(),
            server.command_addr()
        );

        while running.load(Ordering::Acquire) {
            match events.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => log_event(&event),
                Err(e) if e.is_disconnected() => std::thread::sleep(Duration::from_millis(200)),
                Err(_) => {},
            }
        }

        if let Err(e) = pendule.drive(0.0) {
            warn!("Failed to stop the motor on shutdown: {}", e);
        }
        server.stop();
        info!("Pendule server stopped");
        Ok(())
    }
}

fn log_event(event: &PenduleEvent) {
    match event {
        PenduleEvent::SwitchPressed(side) => info!("{} switch pressed", side),
        PenduleEvent::LimitReached(side) => warn!("Cart reached the {} safety limit", side),
        PenduleEvent::EmergencyStop { reason } => warn!("Emergency stop: {}", reason),
        PenduleEvent::Calibrated(calibration) => info!(
            "Calibrated: bounds {}..{}, {:.3e} m/pulse",
            calibration.left_bound, calibration.right_bound, calibration.meters_per_pulse
        ),
        PenduleEvent::Reset => info!("Calibration cleared"),
    }
}

#[cfg(all(target_os = "linux", feature = "rppal"))]
fn acquire_hardware() -> Result<Arc<GpioConnection>> {
    Ok(GpioConnection::acquire(RppalBackend::new())?)
}

#[cfg(not(all(target_os = "linux", feature = "rppal")))]
fn acquire_hardware() -> Result<Arc<GpioConnection>> {
    anyhow::bail!(
        "pendule-cli was built without Raspberry Pi support; rebuild with `--features rppal` or pass --simulate"
    )
}
