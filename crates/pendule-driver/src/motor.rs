//! 直流电机（PWM + 方向引脚）

use pendule_gpio::{GpioConnection, Level, Pin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error};

use crate::PenduleError;

/// PWM 占空比上限
pub const MAX_DUTY: u8 = 255;

/// 电机设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// 正向功率的死区补偿（占空比单位）
    pub offset_up: u8,
    /// 反向功率的死区补偿（占空比单位）
    pub offset_down: u8,
    /// 静摩擦补偿：叠加到带符号占空比上的偏置（可为负）
    pub offset_static: i16,
}

/// 功率 → 带符号占空比
///
/// 先按方向加死区补偿，再叠加静摩擦偏置，结果限幅到 ±[`MAX_DUTY`]。
/// 零功率不补偿。
pub fn signed_duty(power: f64, settings: &MotorSettings) -> i16 {
    if power == 0.0 {
        return 0;
    }
    let max = MAX_DUTY as i16;
    let base = (power.abs().min(1.0) * MAX_DUTY as f64).round() as i16;
    let command = if power > 0.0 {
        base + settings.offset_up as i16
    } else {
        -(base + settings.offset_down as i16)
    };
    (command + settings.offset_static.clamp(-max, max)).clamp(-max, max)
}

/// 直流电机
///
/// `stop()` 在任何状态下都可以调用且不会失败；急停路径先 `inhibit()`
/// 再 `stop()`，此后与之竞争的 `drive()` 一定以电机停止收尾。
pub struct Motor {
    conn: Arc<GpioConnection>,
    pwm_pin: Pin,
    dir_pin: Option<Pin>,
    settings: MotorSettings,
    /// 最近一次生效的功率（f64 位模式）
    power: AtomicU64,
    inhibited: AtomicBool,
}

impl Motor {
    pub fn new(
        conn: Arc<GpioConnection>,
        pwm_pin: Pin,
        dir_pin: Option<Pin>,
        settings: MotorSettings,
    ) -> Result<Self, PenduleError> {
        debug!("Creating motor on PWM pin {} (direction pin {:?})", pwm_pin, dir_pin);
        conn.configure_output(pwm_pin, Level::Low)?;
        conn.set_pwm(pwm_pin, 0)?;
        if let Some(dir_pin) = dir_pin {
            conn.configure_output(dir_pin, Level::High)?;
        }
        Ok(Self {
            conn,
            pwm_pin,
            dir_pin,
            settings,
            power: AtomicU64::new(0f64.to_bits()),
            inhibited: AtomicBool::new(false),
        })
    }

    /// 以 `power ∈ [-1, 1]` 驱动电机
    pub fn drive(&self, power: f64) -> Result<(), PenduleError> {
        if !power.is_finite() || power.abs() > 1.0 {
            return Err(PenduleError::InvalidCommand(format!(
                "motor power {} outside [-1, 1]",
                power
            )));
        }
        if power < 0.0 && self.dir_pin.is_none() {
            return Err(PenduleError::InvalidCommand(
                "negative power requires a direction pin".into(),
            ));
        }
        if self.is_inhibited() {
            return Err(PenduleError::EmergencyStop("motor is inhibited".into()));
        }

        let command = signed_duty(power, &self.settings);
        let duty = match self.dir_pin {
            Some(dir_pin) => {
                if command != 0 {
                    self.conn.write(dir_pin, Level::from(command > 0))?;
                }
                command.unsigned_abs() as u8
            },
            // 无方向引脚时不能反转
            None => command.max(0) as u8,
        };
        self.conn.set_pwm(self.pwm_pin, duty)?;
        self.power.store(power.to_bits(), Ordering::SeqCst);

        // 与 inhibit() 竞争：写入后再检查一次
        if self.inhibited.load(Ordering::SeqCst) {
            self.stop();
            return Err(PenduleError::EmergencyStop("motor is inhibited".into()));
        }
        Ok(())
    }

    /// 停止电机（不会失败，错误只记录日志）
    pub fn stop(&self) {
        if let Err(e) = self.conn.set_pwm(self.pwm_pin, 0) {
            error!("Failed to stop motor on pin {}: {}", self.pwm_pin, e);
        }
        self.power.store(0f64.to_bits(), Ordering::SeqCst);
    }

    /// 禁止后续驱动（急停路径）
    pub fn inhibit(&self) {
        self.inhibited.store(true, Ordering::SeqCst);
    }

    pub fn release_inhibit(&self) {
        self.inhibited.store(false, Ordering::SeqCst);
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibited.load(Ordering::SeqCst)
    }

    /// 最近一次生效的功率
    pub fn power(&self) -> f64 {
        f64::from_bits(self.power.load(Ordering::SeqCst))
    }

    pub fn has_direction_pin(&self) -> bool {
        self.dir_pin.is_some()
    }
}

impl Drop for Motor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Motor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Motor")
            .field("pwm_pin", &self.pwm_pin)
            .field("dir_pin", &self.dir_pin)
            .field("power", &self.power())
            .field("inhibited", &self.is_inhibited())
            .finish()
    }
}
