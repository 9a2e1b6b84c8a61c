//! 小车仿真器（基于 Mock GPIO）
//!
//! 在后台线程上按电机 PWM/方向引脚移动一辆无惯性的虚拟小车，逐个脉冲
//! 产生正交编码器边沿，并按位置设置限位开关电平。每走一个脉冲都重新
//! 读取 PWM，因此中断回调里的 `stop()` 会让小车在当前脉冲停下。

use parking_lot::Mutex;
use pendule_gpio::mock::MockGpio;
use pendule_gpio::{Level, Pin};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

use crate::config::{PenduleConfig, PinConfig};
use crate::motor::MAX_DUTY;

/// 仿真参数（单位均为编码器计数）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimParams {
    /// 小车初始绝对位置
    pub start: i64,
    /// 位置 ≤ 此值时左限位开关按下
    pub left_switch: i64,
    /// 位置 ≥ 此值时右限位开关按下
    pub right_switch: i64,
    /// 机械止挡（小车无法越过）
    pub left_stop: i64,
    pub right_stop: i64,
    /// 满占空比时的速度（计数/秒）
    pub full_speed: f64,
    /// 仿真步长
    pub tick: Duration,
    /// 限位开关按下时为低电平
    pub switch_active_low: bool,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            start: 1000,
            left_switch: 500,
            right_switch: 1500,
            left_stop: 400,
            right_stop: 1600,
            full_speed: 40_000.0,
            tick: Duration::from_millis(1),
            switch_active_low: true,
        }
    }
}

impl SimParams {
    /// 与配置一致的开关极性
    pub fn for_config(config: &PenduleConfig) -> Self {
        Self {
            switch_active_low: config.switches.normally_up,
            ..Self::default()
        }
    }
}

/// 正交编码器在位置 `pos` 处的 (A, B) 电平（pos ≡ 0 时两相为高）
pub fn quadrature_levels(pos: i64) -> (Level, Level) {
    match pos.rem_euclid(4) {
        0 => (Level::High, Level::High),
        1 => (Level::High, Level::Low),
        2 => (Level::Low, Level::Low),
        _ => (Level::Low, Level::High),
    }
}

struct SimInner {
    mock: MockGpio,
    pins: PinConfig,
    params: SimParams,
    position: AtomicI64,
    angle: AtomicI64,
    /// 冻结时小车不响应电机
    frozen: AtomicBool,
    /// 串行化所有引脚写入（仿真线程与测试线程）
    io: Mutex<()>,
}

impl SimInner {
    fn switch_level(&self, pressed: bool) -> Level {
        Level::from(pressed != self.params.switch_active_low)
    }

    fn apply_switches(&self, pos: i64) {
        self.mock.set_input(
            self.pins.left_switch,
            self.switch_level(pos <= self.params.left_switch),
        );
        self.mock.set_input(
            self.pins.right_switch,
            self.switch_level(pos >= self.params.right_switch),
        );
    }

    fn emit_step(&self, pin_a: Pin, pin_b: Option<Pin>, from: i64, to: i64) {
        match pin_b {
            Some(pin_b) => {
                let (old_a, old_b) = quadrature_levels(from);
                let (a, b) = quadrature_levels(to);
                if a != old_a {
                    self.mock.set_input(pin_a, a);
                }
                if b != old_b {
                    self.mock.set_input(pin_b, b);
                }
            },
            // 单相：每步翻转一次
            None => self.mock.set_input(pin_a, Level::from(to.rem_euclid(2) == 0)),
        }
    }

    /// 小车移动一步；返回是否真的移动了
    fn step_cart(&self, forward: bool) -> bool {
        let from = self.position.load(Ordering::Acquire);
        let to = if forward { from + 1 } else { from - 1 };
        if to < self.params.left_stop || to > self.params.right_stop {
            return false;
        }
        self.position.store(to, Ordering::Release);
        self.emit_step(self.pins.position_encoder_a, self.pins.position_encoder_b, from, to);
        self.apply_switches(to);
        true
    }

    fn motor_duty(&self) -> u8 {
        self.mock.pwm(self.pins.motor_pwm)
    }

    fn motor_forward(&self) -> bool {
        self.pins
            .motor_dir
            .map(|pin| self.mock.level(pin).is_high())
            .unwrap_or(true)
    }

    fn initialise_levels(&self) {
        let _io = self.io.lock();
        let (a, b) = quadrature_levels(self.position.load(Ordering::Acquire));
        self.mock.set_input(self.pins.position_encoder_a, a);
        if let Some(pin_b) = self.pins.position_encoder_b {
            self.mock.set_input(pin_b, b);
        }
        let (a, b) = quadrature_levels(self.angle.load(Ordering::Acquire));
        self.mock.set_input(self.pins.angle_encoder_a, a);
        if let Some(pin_b) = self.pins.angle_encoder_b {
            self.mock.set_input(pin_b, b);
        }
        self.apply_switches(self.position.load(Ordering::Acquire));
    }
}

/// 小车仿真器
///
/// 应在创建 `Pendule` 之前启动，使编码器和开关读到一致的初始电平。
pub struct CartSimulator {
    inner: Arc<SimInner>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CartSimulator {
    pub fn start(mock: MockGpio, pins: PinConfig, params: SimParams) -> Self {
        let inner = Arc::new(SimInner {
            mock,
            pins,
            params,
            position: AtomicI64::new(params.start),
            angle: AtomicI64::new(0),
            frozen: AtomicBool::new(false),
            io: Mutex::new(()),
        });
        inner.initialise_levels();

        let stop = Arc::new(AtomicBool::new(false));
        let thread_inner = inner.clone();
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("cart-sim".into())
            .spawn(move || run(thread_inner, thread_stop))
            .ok();

        debug!("Cart simulator started at {} pulses", params.start);
        Self {
            inner,
            stop,
            thread,
        }
    }

    /// 小车绝对位置（计数）
    pub fn position(&self) -> i64 {
        self.inner.position.load(Ordering::Acquire)
    }

    /// 摆杆位置（计数）
    pub fn angle(&self) -> i64 {
        self.inner.angle.load(Ordering::Acquire)
    }

    /// 冻结小车（电机输出被忽略，用于模拟卡死/断线）
    pub fn freeze(&self, frozen: bool) {
        self.inner.frozen.store(frozen, Ordering::Release);
    }

    /// 手动推动小车到指定绝对位置（逐脉冲产生边沿）
    pub fn push_to(&self, target: i64) {
        let _io = self.inner.io.lock();
        while self.position() != target {
            if !self.inner.step_cart(target > self.position()) {
                break;
            }
        }
    }

    /// 摆动摆杆 `steps` 个计数
    pub fn swing(&self, steps: i64) {
        let _io = self.inner.io.lock();
        let forward = steps > 0;
        for _ in 0..steps.abs() {
            let from = self.inner.angle.load(Ordering::Acquire);
            let to = if forward { from + 1 } else { from - 1 };
            self.inner.angle.store(to, Ordering::Release);
            self.inner
                .emit_step(self.inner.pins.angle_encoder_a, self.inner.pins.angle_encoder_b, from, to);
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CartSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: Arc<SimInner>, stop: Arc<AtomicBool>) {
    let seconds_per_tick = inner.params.tick.as_secs_f64();
    let mut carry = 0.0f64;

    while !stop.load(Ordering::Acquire) {
        spin_sleep::sleep(inner.params.tick);
        if inner.frozen.load(Ordering::Acquire) {
            carry = 0.0;
            continue;
        }

        let duty = inner.motor_duty();
        if duty == 0 {
            carry = 0.0;
            continue;
        }
        carry += duty as f64 / MAX_DUTY as f64 * inner.params.full_speed * seconds_per_tick;
        let forward = inner.motor_forward();

        let _io = inner.io.lock();
        while carry >= 1.0 {
            // 每一步都重新确认电机仍在转
            if inner.motor_duty() == 0 {
                carry = 0.0;
                break;
            }
            carry -= 1.0;
            if !inner.step_cart(forward) {
                carry = 0.0;
                break;
            }
        }
    }
}
