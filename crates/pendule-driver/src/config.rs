//! # 倒立摆配置
//!
//! 引脚分配、开关电气特性、电机死区补偿、物理常数、标定参数和驱动
//! 限制。文件格式为 TOML，时间均以整数毫秒（去抖为微秒）表示。

use pendule_gpio::Pin;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::motor::MotorSettings;
use crate::switch::SwitchSettings;
use crate::PenduleError;

/// 引脚分配（BCM 编号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub motor_pwm: Pin,
    #[serde(default)]
    pub motor_dir: Option<Pin>,
    pub left_switch: Pin,
    pub right_switch: Pin,
    pub position_encoder_a: Pin,
    #[serde(default)]
    pub position_encoder_b: Option<Pin>,
    pub angle_encoder_a: Pin,
    #[serde(default)]
    pub angle_encoder_b: Option<Pin>,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            motor_pwm: 24,
            motor_dir: Some(16),
            left_switch: 17,
            right_switch: 18,
            position_encoder_a: 20,
            position_encoder_b: Some(21),
            angle_encoder_a: 19,
            angle_encoder_b: Some(26),
        }
    }
}

impl PinConfig {
    /// 所有已分配的引脚（含名称）
    pub fn assigned(&self) -> Vec<(&'static str, Pin)> {
        let mut pins = vec![
            ("motor_pwm", self.motor_pwm),
            ("left_switch", self.left_switch),
            ("right_switch", self.right_switch),
            ("position_encoder_a", self.position_encoder_a),
            ("angle_encoder_a", self.angle_encoder_a),
        ];
        pins.extend(self.motor_dir.map(|p| ("motor_dir", p)));
        pins.extend(self.position_encoder_b.map(|p| ("position_encoder_b", p)));
        pins.extend(self.angle_encoder_b.map(|p| ("angle_encoder_b", p)));
        pins
    }

    /// 检查引脚互不相同
    pub fn validate(&self) -> Result<(), PenduleError> {
        let pins = self.assigned();
        for (i, (name, pin)) in pins.iter().enumerate() {
            if let Some((other, _)) = pins[i + 1..].iter().find(|(_, p)| p == pin) {
                return Err(PenduleError::InvalidConfig(format!(
                    "pin {} is assigned to both {} and {}",
                    pin, name, other
                )));
            }
        }
        Ok(())
    }
}

/// 物理常数
///
/// 比例系数以编码器计数（四倍频后的每个边沿）为单位。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// 两个限位开关之间的轨道长度（米）
    pub track_length: f64,
    /// 标称的每计数米数（标定后与实测值比较）
    pub meters_per_step: f64,
    /// 每计数弧度
    pub radians_per_step: f64,
    /// 静止角度（从原始读数中减去）
    pub rest_angle: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            track_length: 0.846,
            // 0.846 m / 84653 步，四倍频
            meters_per_step: 0.846 / 84653.0 / 4.0,
            // 每圈 4000 步，四倍频
            radians_per_step: 2.0 * std::f64::consts::PI / 4000.0 / 4.0,
            rest_angle: 0.0,
        }
    }
}

/// 标定参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// 寻找限位开关时的驱动功率（0, 1]
    pub power: f64,
    /// 整个标定过程的超时
    pub timeout_ms: u64,
    /// 标定循环的轮询间隔
    pub poll_interval_ms: u64,
    /// 角度编码器需要保持静止的时长
    pub angle_settle_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            power: 40.0 / 255.0,
            timeout_ms: 30_000,
            poll_interval_ms: 5,
            angle_settle_ms: 1000,
        }
    }
}

impl CalibrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn angle_settle(&self) -> Duration {
        Duration::from_millis(self.angle_settle_ms)
    }
}

/// 驱动限制
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// 最大驱动功率（绝对值）
    pub max_power: f64,
    /// 硬安全距离（米）：标定后进入该距离即急停
    pub hard_margin: f64,
    /// 软安全距离（米，位于硬安全距离之内侧）：向外的驱动命令被置零
    pub soft_margin: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_power: 1.0,
            hard_margin: 0.05,
            soft_margin: 0.1,
        }
    }
}

/// 倒立摆配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PenduleConfig {
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub switches: SwitchSettings,
    #[serde(default)]
    pub motor: MotorSettings,
    #[serde(default)]
    pub physics: PhysicsConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl PenduleConfig {
    /// 校验配置（构造 Pendule 时调用一次）
    pub fn validate(&self) -> Result<(), PenduleError> {
        self.pins.validate()?;

        let invalid = |msg: String| -> Result<(), PenduleError> { Err(PenduleError::InvalidConfig(msg)) };
        let physics = &self.physics;
        if !(physics.track_length.is_finite() && physics.track_length > 0.0) {
            return invalid(format!("track_length must be positive, got {}", physics.track_length));
        }
        if !(physics.meters_per_step.is_finite() && physics.meters_per_step > 0.0) {
            return invalid(format!(
                "meters_per_step must be positive, got {}",
                physics.meters_per_step
            ));
        }
        if !(physics.radians_per_step.is_finite() && physics.radians_per_step != 0.0) {
            return invalid(format!(
                "radians_per_step must be non-zero, got {}",
                physics.radians_per_step
            ));
        }
        if !physics.rest_angle.is_finite() {
            return invalid("rest_angle must be finite".into());
        }

        let max_duty = crate::motor::MAX_DUTY as i16;
        if !(-max_duty..=max_duty).contains(&self.motor.offset_static) {
            return invalid(format!(
                "motor.offset_static must be within ±{}, got {}",
                max_duty, self.motor.offset_static
            ));
        }

        let calibration = &self.calibration;
        if !(calibration.power > 0.0 && calibration.power <= 1.0) {
            return invalid(format!(
                "calibration.power must be in (0, 1], got {}",
                calibration.power
            ));
        }
        if calibration.timeout_ms == 0 || calibration.poll_interval_ms == 0 {
            return invalid("calibration timeout and poll interval must be non-zero".into());
        }

        let limits = &self.limits;
        if !(limits.max_power > 0.0 && limits.max_power <= 1.0) {
            return invalid(format!("max_power must be in (0, 1], got {}", limits.max_power));
        }
        if !(limits.hard_margin >= 0.0 && limits.soft_margin >= 0.0) {
            return invalid("safety margins must be non-negative".into());
        }
        if 2.0 * (limits.hard_margin + limits.soft_margin) >= physics.track_length {
            return invalid(format!(
                "safety margins ({} + {}) leave no room on a {} m track",
                limits.hard_margin, limits.soft_margin, physics.track_length
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, PenduleError> {
        let config: Self =
            toml::from_str(text).map_err(|e| PenduleError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PenduleError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PenduleError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, PenduleError> {
        toml::to_string_pretty(self).map_err(|e| PenduleError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PenduleConfig::default().validate().unwrap();
    }

    #[test]
    fn test_duplicate_pins_rejected() {
        let mut config = PenduleConfig::default();
        config.pins.angle_encoder_b = Some(config.pins.left_switch);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("left_switch"), "{}", err);
        assert!(err.to_string().contains("angle_encoder_b"), "{}", err);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut config = PenduleConfig::default();
        config.calibration.power = 0.0;
        assert!(config.validate().is_err());

        let mut config = PenduleConfig::default();
        config.limits.max_power = 1.5;
        assert!(config.validate().is_err());

        let mut config = PenduleConfig::default();
        config.physics.track_length = 0.2;
        assert!(config.validate().is_err());

        let mut config = PenduleConfig::default();
        config.motor.offset_static = 300;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("offset_static"), "{}", err);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [pins]
            motor_pwm = 12
            left_switch = 5
            right_switch = 6
            position_encoder_a = 7
            angle_encoder_a = 8

            [physics]
            track_length = 1.0

            [calibration]
            power = 0.3
        "#;
        let config = PenduleConfig::from_toml_str(text).unwrap();
        assert_eq!(config.pins.motor_pwm, 12);
        assert_eq!(config.pins.motor_dir, None);
        assert_eq!(config.physics.track_length, 1.0);
        assert_eq!(config.calibration.power, 0.3);
        assert_eq!(config.calibration.timeout(), Duration::from_secs(30));
        assert_eq!(config.switches.debounce_us, 5000);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = PenduleConfig::default();
        config.motor.offset_up = 12;
        config.motor.offset_static = -7;
        let text = config.to_toml_string().unwrap();
        assert_eq!(PenduleConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PenduleConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, PenduleError::InvalidConfig(_)));
    }
}
