//! 倒立摆状态机
//!
//! ```text
//! Uncalibrated ──calibrate()──▶ Calibrating ──成功──▶ Calibrated
//!      ▲                            │ 失败/超时                │
//!      │                            ▼                          │
//!      └──────────────────────── Uncalibrated                  │
//!      │                                                       │
//!      └──reset()── EmergencyStopped ◀──急停（任意状态）────────┘
//! ```
//!
//! # 并发模型
//!
//! - 编码器、开关回调运行在 GPIO 后端的通知线程上
//! - `calibrate()` 与 `drive()` 由命令锁互斥（`try_lock`，失败返回 `Busy`）
//! - 急停不获取命令锁：直接 `inhibit()` + `stop()` 电机，随后锁存状态
//! - 状态为 `AtomicU8`，标定结果为 `ArcSwapOption`，读取方无锁

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use pendule_gpio::GpioConnection;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::PenduleConfig;
use crate::encoder::Encoder;
use crate::motor::Motor;
use crate::switch::Switch;
use crate::PenduleError;

/// 事件通道容量
const EVENT_CAPACITY: usize = 64;

/// 标称与实测比例系数允许的最大偏差
const SCALE_TOLERANCE: f64 = 0.25;

// ============================================================
// 状态与事件
// ============================================================

/// 状态机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PenduleState {
    Uncalibrated = 0,
    Calibrating = 1,
    Calibrated = 2,
    EmergencyStopped = 3,
}

impl PenduleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PenduleState::Calibrating,
            2 => PenduleState::Calibrated,
            3 => PenduleState::EmergencyStopped,
            _ => PenduleState::Uncalibrated,
        }
    }
}

impl std::fmt::Display for PenduleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PenduleState::Uncalibrated => "uncalibrated",
            PenduleState::Calibrating => "calibrating",
            PenduleState::Calibrated => "calibrated",
            PenduleState::EmergencyStopped => "emergency-stopped",
        };
        f.write_str(name)
    }
}

/// 轨道两端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Side::Left => "left",
            Side::Right => "right",
        })
    }
}

/// 状态机事件（非阻塞推送，通道满时丢弃）
#[derive(Debug, Clone, PartialEq)]
pub enum PenduleEvent {
    SwitchPressed(Side),
    LimitReached(Side),
    EmergencyStop { reason: String },
    Calibrated(Calibration),
    Reset,
}

/// 标定结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// 左限位处的位置编码器计数
    pub left_bound: i64,
    /// 右限位处的位置编码器计数
    pub right_bound: i64,
    pub meters_per_pulse: f64,
    pub radians_per_pulse: f64,
    pub rest_angle: f64,
}

impl Calibration {
    /// 计数 → 距左限位的米数
    pub fn position(&self, pulses: i64) -> f64 {
        (pulses - self.left_bound) as f64 * self.meters_per_pulse
    }

    pub fn angle(&self, pulses: i64) -> f64 {
        pulses as f64 * self.radians_per_pulse - self.rest_angle
    }

    /// 米 → 计数（向上取整）
    pub fn pulses_for(&self, meters: f64) -> i64 {
        (meters / self.meters_per_pulse).ceil() as i64
    }

    pub fn track_length(&self) -> f64 {
        (self.right_bound - self.left_bound) as f64 * self.meters_per_pulse
    }
}

/// 状态快照（不会失败）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenduleSnapshot {
    pub state: PenduleState,
    /// 未标定时为 `None`；急停锁存期间保留标定后的读数
    pub position: Option<f64>,
    pub angle: Option<f64>,
    pub position_pulses: i64,
    pub angle_pulses: i64,
    pub power: f64,
}

impl PenduleSnapshot {
    /// 持有有效标定（急停锁存期间仍为 `true`，直到 `reset()`）
    pub fn is_calibrated(&self) -> bool {
        self.position.is_some()
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.state == PenduleState::EmergencyStopped
    }
}

// ============================================================
// 本地/远程统一接口
// ============================================================

/// 倒立摆控制接口
///
/// 本地 [`Pendule`] 和远程客户端都实现此接口，调用方无需关心位置。
pub trait PenduleControl {
    type Error: std::error::Error + Send + Sync + 'static;

    /// 小车位置（米，距左限位）
    fn position(&self) -> Result<f64, Self::Error>;

    /// 摆杆角度（弧度）
    fn angle(&self) -> Result<f64, Self::Error>;

    /// 驱动（功率 ∈ [-1, 1]）
    fn drive(&self, power: f64) -> Result<(), Self::Error>;

    fn calibrate(&self) -> Result<(), Self::Error>;

    fn emergency_stop(&self) -> Result<(), Self::Error>;

    fn reset(&self) -> Result<(), Self::Error>;

    fn is_calibrated(&self) -> bool;
}

// ============================================================
// 共享状态（回调线程可见）
// ============================================================

struct Shared {
    motor: Motor,
    state: AtomicU8,
    estop_reason: Mutex<Option<String>>,
    /// 急停调用次数（含已锁存时的重复调用），供复位检测竞争
    estops: AtomicU64,
    calibration: ArcSwapOption<Calibration>,
    events: Sender<PenduleEvent>,
}

impl Shared {
    fn state(&self) -> PenduleState {
        PenduleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PenduleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 仅当当前状态为 `from` 时切换
    fn transition(&self, from: PenduleState, to: PenduleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_emergency_stopped(&self) -> bool {
        self.state() == PenduleState::EmergencyStopped
    }

    fn estop_error(&self) -> PenduleError {
        let reason = self
            .estop_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "emergency stop".to_string());
        PenduleError::EmergencyStop(reason)
    }

    fn publish(&self, event: PenduleEvent) {
        match self.events.try_send(event) {
            Ok(()) => {},
            Err(TrySendError::Full(event)) => trace!("Event channel full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => {},
        }
    }

    /// 急停：先停电机，再锁存状态
    fn emergency_stop(&self, reason: &str) {
        self.estops.fetch_add(1, Ordering::SeqCst);
        self.motor.inhibit();
        self.motor.stop();

        let previous = PenduleState::from_u8(
            self.state.swap(PenduleState::EmergencyStopped as u8, Ordering::AcqRel),
        );
        if previous == PenduleState::EmergencyStopped {
            debug!("Emergency stop already latched ({})", reason);
            return;
        }
        *self.estop_reason.lock() = Some(reason.to_string());
        error!("EMERGENCY STOP: {} (state was {})", reason, previous);
        self.publish(PenduleEvent::EmergencyStop {
            reason: reason.to_string(),
        });
    }

    /// 限位开关监听器
    fn on_switch(&self, side: Side) {
        self.publish(PenduleEvent::SwitchPressed(side));
        match self.state() {
            // 标定中的开关是里程碑：只停电机，由标定循环读取
            PenduleState::Calibrating => self.motor.stop(),
            _ => self.emergency_stop(&format!("{} switch hit", side)),
        }
    }
}

// ============================================================
// Pendule
// ============================================================

/// 倒立摆
///
/// 拥有电机、两个限位开关和两个编码器；共享借用 GPIO 连接。
///
/// Drop 顺序：停电机 → 注销编码器/开关回调 → 释放连接引用。
pub struct Pendule {
    config: PenduleConfig,
    shared: Arc<Shared>,
    position_encoder: Encoder,
    angle_encoder: Encoder,
    left_switch: Switch,
    right_switch: Switch,
    command_lock: Mutex<()>,
    events: Receiver<PenduleEvent>,
    conn: Arc<GpioConnection>,
}

impl Pendule {
    /// 创建倒立摆
    ///
    /// 校验配置、配置所有引脚并注册回调。初始状态为 `Uncalibrated`，
    /// 限位开关从此刻起即触发急停。
    pub fn new(conn: Arc<GpioConnection>, config: PenduleConfig) -> Result<Self, PenduleError> {
        config.validate()?;
        let pins = config.pins;
        debug!("Creating Pendule ({:?})", pins);

        let motor = Motor::new(conn.clone(), pins.motor_pwm, pins.motor_dir, config.motor)?;
        let position_encoder =
            Encoder::new(conn.clone(), "position", pins.position_encoder_a, pins.position_encoder_b)?;
        let angle_encoder =
            Encoder::new(conn.clone(), "angle", pins.angle_encoder_a, pins.angle_encoder_b)?;
        let left_switch = Switch::new(conn.clone(), "left", pins.left_switch, config.switches)?;
        let right_switch = Switch::new(conn.clone(), "right", pins.right_switch, config.switches)?;

        let (tx, rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            motor,
            state: AtomicU8::new(PenduleState::Uncalibrated as u8),
            estop_reason: Mutex::new(None),
            estops: AtomicU64::new(0),
            calibration: ArcSwapOption::empty(),
            events: tx,
        });

        for (switch, side) in [(&left_switch, Side::Left), (&right_switch, Side::Right)] {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            switch.set_listener(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_switch(side);
                }
            });
        }

        let pendule = Self {
            config,
            shared,
            position_encoder,
            angle_encoder,
            left_switch,
            right_switch,
            command_lock: Mutex::new(()),
            events: rx,
            conn,
        };

        for switch in [&pendule.left_switch, &pendule.right_switch] {
            if switch.resync()? {
                warn!("{} switch is pressed at start-up", switch.name());
            }
        }

        info!("Pendule created (backend: {})", pendule.conn.backend_name());
        Ok(pendule)
    }

    pub fn config(&self) -> &PenduleConfig {
        &self.config
    }

    pub fn state(&self) -> PenduleState {
        self.shared.state()
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.shared.is_emergency_stopped()
    }

    /// 标定结果
    ///
    /// 标定成功后一直保留，急停锁存不会清除，只有 `reset()` 或重新标定会清除。
    pub fn calibration(&self) -> Option<Calibration> {
        self.shared.calibration.load_full().map(|c| *c)
    }

    fn calibrated(&self) -> Result<Calibration, PenduleError> {
        self.calibration().ok_or(PenduleError::NotCalibrated)
    }

    /// 小车位置（米，距左限位）
    pub fn position(&self) -> Result<f64, PenduleError> {
        Ok(self.calibrated()?.position(self.position_encoder.pulses()))
    }

    /// 摆杆角度（弧度）
    pub fn angle(&self) -> Result<f64, PenduleError> {
        Ok(self.calibrated()?.angle(self.angle_encoder.pulses()))
    }

    /// 最近一次生效的电机功率
    pub fn power(&self) -> f64 {
        self.shared.motor.power()
    }

    pub fn snapshot(&self) -> PenduleSnapshot {
        let position_pulses = self.position_encoder.pulses();
        let angle_pulses = self.angle_encoder.pulses();
        let calibration = self.calibration();
        PenduleSnapshot {
            state: self.state(),
            position: calibration.map(|c| c.position(position_pulses)),
            angle: calibration.map(|c| c.angle(angle_pulses)),
            position_pulses,
            angle_pulses,
            power: self.power(),
        }
    }

    /// 事件接收端（可克隆）
    pub fn events(&self) -> Receiver<PenduleEvent> {
        self.events.clone()
    }

    pub fn position_encoder(&self) -> &Encoder {
        &self.position_encoder
    }

    pub fn angle_encoder(&self) -> &Encoder {
        &self.angle_encoder
    }

    pub fn left_switch(&self) -> &Switch {
        &self.left_switch
    }

    pub fn right_switch(&self) -> &Switch {
        &self.right_switch
    }

    pub fn connection(&self) -> &Arc<GpioConnection> {
        &self.conn
    }

    // ------------------------------------------------------------
    // 驱动
    // ------------------------------------------------------------

    /// 驱动电机
    ///
    /// - 急停锁存时返回 `EmergencyStop`
    /// - 标定进行中返回 `Busy`
    /// - 功率按 `limits.max_power` 限幅
    /// - 标定后，在软安全区内继续向外的命令被置零
    pub fn drive(&self, power: f64) -> Result<(), PenduleError> {
        if self.shared.is_emergency_stopped() {
            return Err(self.shared.estop_error());
        }
        if !power.is_finite() || power.abs() > 1.0 {
            return Err(PenduleError::InvalidCommand(format!(
                "power {} outside [-1, 1]",
                power
            )));
        }
        let _guard = self.command_lock.try_lock().ok_or(PenduleError::Busy)?;

        let max = self.config.limits.max_power;
        let mut power = power.clamp(-max, max);

        if let Some(calibration) = self.calibration() {
            power = self.apply_soft_margin(&calibration, power);
        }

        let previous = self.shared.motor.power();
        let reversing = previous * power < 0.0;
        if reversing {
            // 换向瞬间的开关抖动不触发中断
            self.left_switch.disable_interrupts();
            self.right_switch.disable_interrupts();
        }
        let result = self.shared.motor.drive(power);
        if reversing {
            self.left_switch.enable_interrupts()?;
            self.right_switch.enable_interrupts()?;
        }

        match result {
            Err(PenduleError::EmergencyStop(_)) => Err(self.shared.estop_error()),
            other => other,
        }
    }

    fn apply_soft_margin(&self, calibration: &Calibration, power: f64) -> f64 {
        let limits = &self.config.limits;
        let zone = limits.hard_margin + limits.soft_margin;
        let position = calibration.position(self.position_encoder.pulses());
        let track = calibration.track_length();

        let outward_left = power < 0.0 && position <= zone;
        let outward_right = power > 0.0 && position >= track - zone;
        if outward_left || outward_right {
            debug!(
                "Drive {:.3} zeroed: position {:.3} m inside the soft safety zone",
                power, position
            );
            0.0
        } else {
            power
        }
    }

    // ------------------------------------------------------------
    // 急停 / 复位
    // ------------------------------------------------------------

    /// 急停（不获取命令锁，任何时刻可用）
    pub fn emergency_stop(&self, reason: &str) {
        self.shared.emergency_stop(reason);
    }

    /// 清除急停锁存，回到 `Uncalibrated`
    ///
    /// 不会重新标定；编码器阈值被移除，开关恢复为急停触发。
    /// 复位过程中若有新的急停到达，急停重新锁存并返回 `EmergencyStop`。
    pub fn reset(&self) -> Result<(), PenduleError> {
        let _guard = self.command_lock.try_lock().ok_or(PenduleError::Busy)?;
        let estops = self.shared.estops.load(Ordering::SeqCst);

        self.shared.motor.stop();
        self.position_encoder.clear_limits();
        self.angle_encoder.clear_limits();
        self.shared.calibration.store(None);
        *self.shared.estop_reason.lock() = None;
        self.left_switch.clear_triggered();
        self.right_switch.clear_triggered();
        self.shared.motor.release_inhibit();
        self.shared
            .state
            .store(PenduleState::Uncalibrated as u8, Ordering::SeqCst);

        // 复位期间到达的急停可能已被覆盖：重新锁存
        if self.shared.estops.load(Ordering::SeqCst) != estops {
            self.shared.emergency_stop("emergency stop during reset");
            return Err(self.shared.estop_error());
        }

        info!("Pendule reset (state: uncalibrated)");
        self.shared.publish(PenduleEvent::Reset);
        Ok(())
    }

    // ------------------------------------------------------------
    // 标定
    // ------------------------------------------------------------

    /// 标定
    ///
    /// 阻塞调用线程直到完成或超时（`calibration.timeout`）。
    /// 失败时电机停止，状态回到 `Uncalibrated`（急停除外）。
    pub fn calibrate(&self) -> Result<(), PenduleError> {
        if self.shared.is_emergency_stopped() {
            return Err(self.shared.estop_error());
        }
        let _guard = self.command_lock.try_lock().ok_or(PenduleError::Busy)?;

        let from = self.state();
        if from == PenduleState::EmergencyStopped
            || !self.shared.transition(from, PenduleState::Calibrating)
        {
            return Err(self.shared.estop_error());
        }
        self.shared.calibration.store(None);
        self.position_encoder.clear_limits();
        self.angle_encoder.clear_limits();
        info!("Calibration started");

        let deadline = Instant::now() + self.config.calibration.timeout();
        match self.run_calibration(deadline) {
            Ok(calibration) => {
                self.shared.calibration.store(Some(Arc::new(calibration)));
                self.arm_safety(&calibration);
                if !self.shared.transition(PenduleState::Calibrating, PenduleState::Calibrated) {
                    self.position_encoder.clear_limits();
                    self.shared.calibration.store(None);
                    return Err(self.shared.estop_error());
                }
                info!(
                    "Calibration completed: bounds [{}, {}], {:.3e} m/pulse",
                    calibration.left_bound, calibration.right_bound, calibration.meters_per_pulse
                );
                self.shared.publish(PenduleEvent::Calibrated(calibration));
                Ok(())
            },
            Err(e) => {
                self.shared.motor.stop();
                self.position_encoder.clear_limits();
                self.shared.calibration.store(None);
                if self.shared.transition(PenduleState::Calibrating, PenduleState::Uncalibrated) {
                    warn!("Calibration failed: {}", e);
                    Err(e)
                } else {
                    Err(self.shared.estop_error())
                }
            },
        }
    }

    fn run_calibration(&self, deadline: Instant) -> Result<Calibration, PenduleError> {
        let config = &self.config;

        if self.left_switch.is_pressed_now()? && self.right_switch.is_pressed_now()? {
            return Err(PenduleError::CalibrationFailed(
                "both limit switches are pressed".into(),
            ));
        }

        let left_bound = self.seek(Side::Left, deadline)?;
        info!("Left limit found at {} pulses", left_bound);
        let right_bound = self.seek(Side::Right, deadline)?;
        info!("Right limit found at {} pulses", right_bound);

        if right_bound <= left_bound {
            return Err(PenduleError::CalibrationFailed(format!(
                "right bound {} is not beyond left bound {}; the position encoder reads \
                 backwards (swap its phases)",
                right_bound, left_bound
            )));
        }

        let meters_per_pulse = config.physics.track_length / (right_bound - left_bound) as f64;
        let nominal = config.physics.meters_per_step;
        let deviation = (nominal - meters_per_pulse).abs() / meters_per_pulse;
        if deviation > SCALE_TOLERANCE {
            warn!(
                "Calibrated scale {:.3e} m/pulse deviates {:.0}% from nominal {:.3e}",
                meters_per_pulse,
                deviation * 100.0,
                nominal
            );
        }

        let calibration = Calibration {
            left_bound,
            right_bound,
            meters_per_pulse,
            radians_per_pulse: config.physics.radians_per_step,
            rest_angle: config.physics.rest_angle,
        };

        let margin = calibration.pulses_for(config.limits.hard_margin);
        if left_bound + margin >= right_bound - margin {
            return Err(PenduleError::CalibrationFailed(format!(
                "travel of {} pulses is too short for a hard margin of {} pulses",
                right_bound - left_bound,
                margin
            )));
        }

        let mid = left_bound + (right_bound - left_bound) / 2;
        self.move_to(mid, deadline)?;
        info!("Cart centred at {} pulses", mid);

        self.settle_angle(deadline)?;
        self.angle_encoder.reset();
        Ok(calibration)
    }

    fn switch(&self, side: Side) -> &Switch {
        match side {
            Side::Left => &self.left_switch,
            Side::Right => &self.right_switch,
        }
    }

    fn check_progress(&self, deadline: Instant, what: &str) -> Result<(), PenduleError> {
        if self.shared.is_emergency_stopped() {
            return Err(self.shared.estop_error());
        }
        if Instant::now() >= deadline {
            return Err(PenduleError::CalibrationFailed(format!(
                "{} not completed within {:?}",
                what,
                self.config.calibration.timeout()
            )));
        }
        std::thread::sleep(self.config.calibration.poll_interval());
        Ok(())
    }

    /// 驱动到指定限位开关，记录计数，再退出开关
    fn seek(&self, side: Side, deadline: Instant) -> Result<i64, PenduleError> {
        let target = self.switch(side);
        let opposite = self.switch(match side {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        });
        let power = self.config.calibration.power;
        let toward = match side {
            Side::Left => -power,
            Side::Right => power,
        };

        target.clear_triggered();
        opposite.clear_triggered();

        if !target.is_pressed_now()? {
            self.shared.motor.drive(toward)?;
            let what = format!("reaching the {} switch", side);
            while !target.has_triggered() {
                if opposite.has_triggered() {
                    self.shared.motor.stop();
                    return Err(PenduleError::CalibrationFailed(format!(
                        "hit the {} switch while seeking the {} one",
                        opposite.name(),
                        side
                    )));
                }
                if let Err(e) = self.check_progress(deadline, &what) {
                    self.shared.motor.stop();
                    return Err(e);
                }
            }
            self.shared.motor.stop();
        }
        let bound = self.position_encoder.pulses();

        // 退出开关
        self.shared.motor.drive(-toward)?;
        let what = format!("releasing the {} switch", side);
        while target.is_pressed_now()? {
            if let Err(e) = self.check_progress(deadline, &what) {
                self.shared.motor.stop();
                return Err(e);
            }
        }
        self.shared.motor.stop();
        target.resync()?;
        target.clear_triggered();
        Ok(bound)
    }

    /// 驱动到指定计数（由编码器阈值回调精确停车）
    fn move_to(&self, goal: i64, deadline: Instant) -> Result<(), PenduleError> {
        let current = self.position_encoder.pulses();
        if current == goal {
            return Ok(());
        }
        let forward = goal > current;

        let weak = Arc::downgrade(&self.shared);
        let stop = move |_count: i64| {
            if let Some(shared) = weak.upgrade() {
                shared.motor.stop();
            }
        };
        if forward {
            self.position_encoder.set_limits(i64::MIN, goal, stop);
        } else {
            self.position_encoder.set_limits(goal, i64::MAX, stop);
        }

        let result = self.drive_until_reached(goal, forward, deadline);
        self.shared.motor.stop();
        self.position_encoder.clear_limits();
        result
    }

    fn drive_until_reached(&self, goal: i64, forward: bool, deadline: Instant) -> Result<(), PenduleError> {
        let power = self.config.calibration.power;
        self.shared.motor.drive(if forward { power } else { -power })?;
        loop {
            let pulses = self.position_encoder.pulses();
            if (forward && pulses >= goal) || (!forward && pulses <= goal) {
                return Ok(());
            }
            self.check_progress(deadline, "returning to the centre")?;
        }
    }

    /// 等待摆杆静止 `angle_settle`
    fn settle_angle(&self, deadline: Instant) -> Result<(), PenduleError> {
        let settle = self.config.calibration.angle_settle();
        let mut last = self.angle_encoder.pulses();
        let mut still_since = Instant::now();
        while still_since.elapsed() < settle {
            self.check_progress(deadline, "waiting for the pendulum to come to rest")?;
            let pulses = self.angle_encoder.pulses();
            if pulses != last {
                last = pulses;
                still_since = Instant::now();
            }
        }
        Ok(())
    }

    /// 标定完成后启用安全机制：硬安全距离上的编码器阈值
    fn arm_safety(&self, calibration: &Calibration) {
        let margin = calibration.pulses_for(self.config.limits.hard_margin);
        let lower = calibration.left_bound + margin;
        let upper = calibration.right_bound - margin;

        let weak = Arc::downgrade(&self.shared);
        self.position_encoder.set_limits(lower, upper, move |count| {
            if let Some(shared) = weak.upgrade() {
                let side = if count <= lower { Side::Left } else { Side::Right };
                shared.publish(PenduleEvent::LimitReached(side));
                shared.emergency_stop(&format!("{} position limit reached", side));
            }
        });
        debug!("Hard safety limits armed at [{}, {}] pulses", lower, upper);
    }
}

impl Drop for Pendule {
    fn drop(&mut self) {
        self.shared.motor.stop();
        self.position_encoder.detach();
        self.angle_encoder.detach();
        self.left_switch.detach();
        self.right_switch.detach();
        debug!("Pendule dropped");
    }
}

impl std::fmt::Debug for Pendule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pendule")
            .field("state", &self.state())
            .field("position_pulses", &self.position_encoder.pulses())
            .field("angle_pulses", &self.angle_encoder.pulses())
            .field("power", &self.power())
            .finish()
    }
}

impl PenduleControl for Pendule {
    type Error = PenduleError;

    fn position(&self) -> Result<f64, PenduleError> {
        Pendule::position(self)
    }

    fn angle(&self) -> Result<f64, PenduleError> {
        Pendule::angle(self)
    }

    fn drive(&self, power: f64) -> Result<(), PenduleError> {
        Pendule::drive(self, power)
    }

    fn calibrate(&self) -> Result<(), PenduleError> {
        Pendule::calibrate(self)
    }

    fn emergency_stop(&self) -> Result<(), PenduleError> {
        Pendule::emergency_stop(self, "requested by caller");
        Ok(())
    }

    fn reset(&self) -> Result<(), PenduleError> {
        Pendule::reset(self)
    }

    fn is_calibrated(&self) -> bool {
        self.calibration().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalibrationConfig, LimitsConfig, PhysicsConfig, PinConfig};
    use crate::sim::{CartSimulator, SimParams};
    use pendule_gpio::Level;
    use pendule_gpio::mock::MockGpio;
    use serial_test::serial;
    use std::time::Duration;

    fn test_config() -> PenduleConfig {
        PenduleConfig {
            physics: PhysicsConfig {
                track_length: 1.0,
                meters_per_step: 0.001,
                radians_per_step: 0.01,
                rest_angle: 0.0,
            },
            calibration: CalibrationConfig {
                power: 0.3,
                timeout_ms: 5000,
                poll_interval_ms: 1,
                angle_settle_ms: 20,
            },
            limits: LimitsConfig {
                max_power: 0.8,
                hard_margin: 0.05,
                soft_margin: 0.1,
            },
            ..Default::default()
        }
    }

    struct Rig {
        mock: MockGpio,
        sim: CartSimulator,
        pendule: Pendule,
    }

    fn rig_with(config: PenduleConfig, sim_pins: PinConfig) -> Rig {
        let mock = MockGpio::new();
        let sim = CartSimulator::start(mock.clone(), sim_pins, SimParams::for_config(&config));
        let conn = GpioConnection::acquire(mock.clone()).unwrap();
        let pendule = Pendule::new(conn, config).unwrap();
        Rig { mock, sim, pendule }
    }

    fn rig() -> Rig {
        let config = test_config();
        let pins = config.pins;
        rig_with(config, pins)
    }

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    #[serial]
    fn test_queries_fail_before_calibration() {
        let rig = rig();
        assert_eq!(rig.pendule.state(), PenduleState::Uncalibrated);
        assert!(matches!(rig.pendule.position(), Err(PenduleError::NotCalibrated)));
        assert!(matches!(rig.pendule.angle(), Err(PenduleError::NotCalibrated)));
        let snapshot = rig.pendule.snapshot();
        assert_eq!(snapshot.position, None);
        assert!(!snapshot.is_calibrated());
    }

    #[test]
    #[serial]
    fn test_calibration_finds_bounds_and_centres() {
        let rig = rig();
        rig.pendule.calibrate().unwrap();

        let calibration = rig.pendule.calibration().unwrap();
        assert_eq!(calibration.left_bound, -500);
        assert_eq!(calibration.right_bound, 500);
        assert!(calibration.left_bound < calibration.right_bound);
        assert!((calibration.meters_per_pulse - 0.001).abs() < 1e-9);

        assert!((rig.pendule.position().unwrap() - 0.5).abs() < 0.01);
        assert_eq!(rig.pendule.angle().unwrap(), 0.0);
        assert_eq!(rig.mock.pwm(rig.pendule.config().pins.motor_pwm), 0);
        assert!(PenduleControl::is_calibrated(&rig.pendule));

        let events: Vec<_> = rig.pendule.events().try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, PenduleEvent::Calibrated(_))));
    }

    #[test]
    #[serial]
    fn test_angle_reads_after_calibration() {
        let rig = rig();
        rig.pendule.calibrate().unwrap();
        rig.sim.swing(25);
        assert!((rig.pendule.angle().unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    #[serial]
    fn test_switch_outside_calibration_latches_estop() {
        let rig = rig();
        let left = rig.pendule.config().pins.left_switch;
        let pwm = rig.pendule.config().pins.motor_pwm;

        rig.pendule.drive(0.2).unwrap();
        rig.sim.freeze(true);
        rig.mock.set_input(left, Level::Low);

        assert_eq!(rig.mock.pwm(pwm), 0);
        assert_eq!(rig.pendule.state(), PenduleState::EmergencyStopped);
        let err = rig.pendule.drive(0.1).unwrap_err();
        assert!(matches!(err, PenduleError::EmergencyStop(ref reason) if reason.contains("left")));
        assert!(matches!(rig.pendule.calibrate(), Err(PenduleError::EmergencyStop(_))));

        rig.mock.advance(10_000);
        rig.mock.set_input(left, Level::High);
        rig.pendule.reset().unwrap();
        assert_eq!(rig.pendule.state(), PenduleState::Uncalibrated);
        rig.pendule.drive(0.1).unwrap();
        rig.pendule.drive(0.0).unwrap();
    }

    #[test]
    #[serial]
    fn test_hard_limit_stops_motor_and_reset_uncalibrates() {
        let rig = rig();
        let pwm = rig.pendule.config().pins.motor_pwm;
        rig.pendule.calibrate().unwrap();

        rig.pendule.drive(0.5).unwrap();
        wait_for("emergency stop", || rig.pendule.is_emergency_stopped());
        assert_eq!(rig.mock.pwm(pwm), 0);
        assert_eq!(rig.pendule.power(), 0.0);
        assert!(rig.sim.position() < 1500);

        assert!(matches!(rig.pendule.drive(-0.2), Err(PenduleError::EmergencyStop(_))));
        assert!(rig.pendule.position().unwrap() > 0.9);

        rig.pendule.reset().unwrap();
        assert_eq!(rig.pendule.state(), PenduleState::Uncalibrated);
        assert!(rig.pendule.calibration().is_none());

        let events: Vec<_> = rig.pendule.events().try_iter().collect();
        assert!(events.contains(&PenduleEvent::LimitReached(Side::Right)));
        assert!(events.contains(&PenduleEvent::Reset));
    }

    #[test]
    #[serial]
    fn test_emergency_stop_keeps_calibration_until_reset() {
        let rig = rig();
        rig.pendule.calibrate().unwrap();
        rig.pendule.emergency_stop("operator");

        assert_eq!(rig.pendule.state(), PenduleState::EmergencyStopped);
        assert!((rig.pendule.position().unwrap() - 0.5).abs() < 0.01);
        assert_eq!(rig.pendule.angle().unwrap(), 0.0);
        assert!(PenduleControl::is_calibrated(&rig.pendule));

        let snapshot = rig.pendule.snapshot();
        assert!(snapshot.is_calibrated());
        assert!(snapshot.is_emergency_stopped());
        assert!(snapshot.position.is_some());

        rig.pendule.reset().unwrap();
        assert!(matches!(rig.pendule.position(), Err(PenduleError::NotCalibrated)));
        assert!(!rig.pendule.snapshot().is_calibrated());
    }

    #[test]
    #[serial]
    fn test_calibration_timeout_leaves_motor_stopped() {
        let mut config = test_config();
        config.calibration.timeout_ms = 150;
        let pins = config.pins;
        let rig = rig_with(config, pins);
        rig.sim.freeze(true);

        let err = rig.pendule.calibrate().unwrap_err();
        assert!(matches!(err, PenduleError::CalibrationFailed(_)), "{}", err);
        assert_eq!(rig.mock.pwm(pins.motor_pwm), 0);
        assert_eq!(rig.pendule.state(), PenduleState::Uncalibrated);
    }

    #[test]
    #[serial]
    fn test_wrong_switch_fails_calibration() {
        let config = test_config();
        let mut sim_pins = config.pins;
        std::mem::swap(&mut sim_pins.left_switch, &mut sim_pins.right_switch);
        let rig = rig_with(config, sim_pins);

        let err = rig.pendule.calibrate().unwrap_err();
        assert!(err.to_string().contains("while seeking the left"), "{}", err);
        assert_eq!(rig.pendule.state(), PenduleState::Uncalibrated);
        assert_eq!(rig.pendule.power(), 0.0);
    }

    #[test]
    #[serial]
    fn test_backwards_encoder_fails_calibration() {
        let config = test_config();
        let mut sim_pins = config.pins;
        let b = sim_pins.position_encoder_b.unwrap();
        sim_pins.position_encoder_b = Some(sim_pins.position_encoder_a);
        sim_pins.position_encoder_a = b;
        let rig = rig_with(config, sim_pins);

        let err = rig.pendule.calibrate().unwrap_err();
        assert!(err.to_string().contains("backwards"), "{}", err);
        assert_eq!(rig.pendule.state(), PenduleState::Uncalibrated);
    }

    #[test]
    #[serial]
    fn test_soft_margin_zeroes_outward_drive() {
        let rig = rig();
        rig.pendule.calibrate().unwrap();

        // 距左限位 0.12 m，位于 0.05 + 0.1 的软安全区内
        rig.sim.push_to(620);
        assert!((rig.pendule.position().unwrap() - 0.12).abs() < 1e-9);

        rig.pendule.drive(-0.2).unwrap();
        assert_eq!(rig.pendule.power(), 0.0);

        rig.sim.freeze(true);
        rig.pendule.drive(0.2).unwrap();
        assert_eq!(rig.pendule.power(), 0.2);
        rig.pendule.drive(0.0).unwrap();
    }

    #[test]
    #[serial]
    fn test_drive_clamps_to_max_power() {
        let rig = rig();
        rig.sim.freeze(true);
        rig.pendule.drive(1.0).unwrap();
        assert_eq!(rig.pendule.power(), 0.8);
        assert!(matches!(rig.pendule.drive(1.5), Err(PenduleError::InvalidCommand(_))));
        rig.pendule.drive(0.0).unwrap();
    }

    #[test]
    #[serial]
    fn test_busy_and_estop_during_calibration() {
        let mut config = test_config();
        config.calibration.timeout_ms = 2000;
        let pins = config.pins;
        let rig = rig_with(config, pins);
        rig.sim.freeze(true);

        std::thread::scope(|scope| {
            let calibration = scope.spawn(|| rig.pendule.calibrate());
            wait_for("calibrating state", || rig.pendule.state() == PenduleState::Calibrating);

            assert!(matches!(rig.pendule.drive(0.1), Err(PenduleError::Busy)));
            assert!(matches!(rig.pendule.calibrate(), Err(PenduleError::Busy)));

            rig.pendule.emergency_stop("operator");
            assert_eq!(rig.mock.pwm(pins.motor_pwm), 0);

            let result = calibration.join().unwrap();
            assert!(matches!(result, Err(PenduleError::EmergencyStop(ref r)) if r == "operator"));
        });
        assert_eq!(rig.pendule.state(), PenduleState::EmergencyStopped);
    }

    #[test]
    #[serial]
    fn test_reset_racing_emergency_stop_stays_inhibited() {
        let rig = rig();
        rig.sim.freeze(true);
        for _ in 0..200 {
            rig.pendule.emergency_stop("first");
            std::thread::scope(|scope| {
                scope.spawn(|| rig.pendule.emergency_stop("racing"));
                let _ = rig.pendule.reset();
            });
            // 急停锁存时电机一定被禁止
            if rig.pendule.is_emergency_stopped() {
                assert!(rig.pendule.shared.motor.is_inhibited());
                assert!(rig.pendule.drive(0.1).is_err());
            }
        }
        let _ = rig.pendule.reset();
        assert_eq!(rig.pendule.state(), PenduleState::Uncalibrated);
        rig.pendule.drive(0.1).unwrap();
        rig.pendule.drive(0.0).unwrap();
    }

    #[test]
    #[serial]
    fn test_drop_releases_callbacks() {
        let rig = rig();
        let pins = rig.pendule.config().pins;
        let Rig { mock, sim, pendule } = rig;
        drop(pendule);
        for pin in [pins.left_switch, pins.right_switch, pins.position_encoder_a, pins.angle_encoder_a] {
            assert!(!mock.has_edge_callback(pin));
        }
        assert!(!GpioConnection::is_active());
        assert_eq!(mock.pwm(pins.motor_pwm), 0);
        drop(sim);
    }
}
