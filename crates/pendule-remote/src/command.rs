//! 命令执行
//!
//! 所有连接共享一个 [`CommandHandler`]：命令闸门保证同一时刻只有一个
//! 命令在执行（标定期间到达的驱动命令排队等待），急停绕过闸门立即执行。

use parking_lot::Mutex;
use pendule_driver::{Pendule, PenduleError};
use pendule_protocol::{CommandOp, CommandRequest, CommandResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 最近一次驱动命令
#[derive(Debug, Clone, Copy)]
struct LastDrive {
    at: Instant,
    power: f64,
}

/// 命令处理器
pub struct CommandHandler {
    pendule: Arc<Pendule>,
    gate: Mutex<()>,
    last_drive: Mutex<Option<LastDrive>>,
    watchdog: Option<Duration>,
}

impl CommandHandler {
    pub fn new(pendule: Arc<Pendule>, watchdog: Option<Duration>) -> Self {
        Self {
            pendule,
            gate: Mutex::new(()),
            last_drive: Mutex::new(None),
            watchdog,
        }
    }

    pub fn pendule(&self) -> &Arc<Pendule> {
        &self.pendule
    }

    /// 执行命令并生成响应
    pub fn execute(&self, request: &CommandRequest) -> CommandResponse {
        debug!("Executing {:?} (seq {})", request.op, request.seq);
        match self.apply(request) {
            Ok(()) => CommandResponse::success(request.seq),
            Err(e) => {
                if request.no_reply {
                    warn!("{:?} (seq {}) failed with no reply requested: {}", request.op, request.seq, e);
                } else {
                    debug!("{:?} (seq {}) failed: {}", request.op, request.seq, e);
                }
                CommandResponse::failure(request.seq, e.kind(), e.detail())
            },
        }
    }

    fn apply(&self, request: &CommandRequest) -> Result<(), PenduleError> {
        if request.op == CommandOp::EmergencyStop {
            self.pendule.emergency_stop("remote emergency stop");
            *self.last_drive.lock() = None;
            return Ok(());
        }

        let _gate = self.gate.lock();
        match request.op {
            CommandOp::Drive => {
                self.pendule.drive(request.power)?;
                *self.last_drive.lock() = Some(LastDrive {
                    at: Instant::now(),
                    power: request.power,
                });
                Ok(())
            },
            CommandOp::Calibrate => {
                info!("Remote calibration requested");
                self.pendule.calibrate()
            },
            CommandOp::Reset => {
                *self.last_drive.lock() = None;
                self.pendule.reset()
            },
            CommandOp::EmergencyStop => Ok(()),
        }
    }

    /// 看门狗检查：非零驱动后超时未收到新的驱动命令则置零
    ///
    /// 返回是否执行了置零。命令正在执行（闸门被占用）时跳过本次检查。
    pub fn watchdog_tick(&self, now: Instant) -> bool {
        let Some(timeout) = self.watchdog else {
            return false;
        };
        let Some(_gate) = self.gate.try_lock() else {
            return false;
        };
        let mut last = self.last_drive.lock();
        let expired = match *last {
            Some(drive) => drive.power != 0.0 && now.saturating_duration_since(drive.at) >= timeout,
            None => false,
        };
        if !expired {
            return false;
        }
        *last = None;
        drop(last);

        warn!("No drive command for {:?}; stopping the motor", timeout);
        if let Err(e) = self.pendule.drive(0.0) {
            debug!("Watchdog stop skipped: {}", e);
        }
        true
    }
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("pendule", &self.pendule)
            .field("watchdog", &self.watchdog)
            .finish()
    }
}
