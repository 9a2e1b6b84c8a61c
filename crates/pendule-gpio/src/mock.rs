//! Mock GPIO 后端
//!
//! 纯内存实现，用于单元测试和仿真（无硬件依赖）。
//!
//! - 输入电平由测试通过 [`MockGpio::set_input`] 驱动，边沿回调在调用者
//!   线程上同步执行
//! - 输出电平、PWM 占空比、引脚模式可被检查
//! - 时钟为真实单调时钟加上可手动推进的偏移量

use crate::{Edge, EdgeCallback, EdgeEvent, GpioBackend, GpioError, Level, Pin, PinMode, Pull};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// BCM 编号上限（树莓派 40 针排针对应 GPIO 0..=27）
pub const MAX_PIN: Pin = 27;

#[derive(Debug, Clone, Copy, Default)]
struct PinState {
    mode: Option<PinMode>,
    pull: Pull,
    /// 外部驱动或输出写入的电平；`None` 表示悬空（由上下拉决定）
    level: Option<Level>,
    pwm: u8,
}

impl PinState {
    fn effective_level(&self) -> Level {
        match (self.level, self.pull) {
            (Some(level), _) => level,
            (None, Pull::Up) => Level::High,
            _ => Level::Low,
        }
    }
}

#[derive(Default)]
struct MockState {
    pins: HashMap<Pin, PinState>,
    edges: HashMap<Pin, (Edge, Arc<EdgeCallback>)>,
    fail_init: Option<String>,
}

struct MockInner {
    state: Mutex<MockState>,
    epoch: Instant,
    clock_offset_us: AtomicU64,
    initialised: AtomicBool,
    terminated: AtomicBool,
}

/// Mock GPIO 后端（可克隆句柄，克隆体共享同一状态）
#[derive(Clone)]
pub struct MockGpio {
    inner: Arc<MockInner>,
}

impl Default for MockGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGpio {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState::default()),
                epoch: Instant::now(),
                clock_offset_us: AtomicU64::new(0),
                initialised: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// 让下一次 `initialise` 失败
    pub fn fail_next_init(&self, reason: &str) {
        self.inner.state.lock().fail_init = Some(reason.to_string());
    }

    /// 外部驱动输入电平
    ///
    /// 电平发生变化且匹配已注册的边沿时，在当前线程同步调用回调。
    pub fn set_input(&self, pin: Pin, level: Level) {
        let callback = {
            let mut state = self.inner.state.lock();
            let entry = state.pins.entry(pin).or_default();
            let previous = entry.effective_level();
            entry.level = Some(level);
            if previous == level {
                return;
            }
            match state.edges.get(&pin) {
                Some((edge, callback)) if edge.matches(level) => Some(callback.clone()),
                _ => None,
            }
        };

        if let Some(callback) = callback {
            callback(EdgeEvent {
                pin,
                level,
                tick_us: self.tick_us(),
            });
        }
    }

    /// 推进时钟
    pub fn advance(&self, micros: u64) {
        self.inner.clock_offset_us.fetch_add(micros, Ordering::SeqCst);
    }

    /// 当前 PWM 占空比
    pub fn pwm(&self, pin: Pin) -> u8 {
        self.inner.state.lock().pins.get(&pin).map(|p| p.pwm).unwrap_or(0)
    }

    /// 当前电平（含上下拉效果）
    pub fn level(&self, pin: Pin) -> Level {
        self.inner
            .state
            .lock()
            .pins
            .get(&pin)
            .map(|p| p.effective_level())
            .unwrap_or(Level::Low)
    }

    pub fn mode(&self, pin: Pin) -> Option<PinMode> {
        self.inner.state.lock().pins.get(&pin).and_then(|p| p.mode)
    }

    pub fn pull(&self, pin: Pin) -> Pull {
        self.inner.state.lock().pins.get(&pin).map(|p| p.pull).unwrap_or_default()
    }

    pub fn has_edge_callback(&self, pin: Pin) -> bool {
        self.inner.state.lock().edges.contains_key(&pin)
    }

    pub fn is_initialised(&self) -> bool {
        self.inner.initialised.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    fn check_pin(pin: Pin) -> Result<(), GpioError> {
        if pin > MAX_PIN {
            Err(GpioError::InvalidPin(pin))
        } else {
            Ok(())
        }
    }
}

impl GpioBackend for MockGpio {
    fn name(&self) -> &str {
        "mock"
    }

    fn initialise(&self) -> Result<(), GpioError> {
        if let Some(reason) = self.inner.state.lock().fail_init.take() {
            return Err(GpioError::BackendUnavailable(reason));
        }
        self.inner.initialised.store(true, Ordering::SeqCst);
        self.inner.terminated.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self) {
        self.inner.state.lock().edges.clear();
        self.inner.terminated.store(true, Ordering::SeqCst);
    }

    fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), GpioError> {
        Self::check_pin(pin)?;
        let mut state = self.inner.state.lock();
        let entry = state.pins.entry(pin).or_default();
        entry.mode = Some(mode);
        if mode == PinMode::Input {
            entry.pwm = 0;
        }
        Ok(())
    }

    fn set_pull(&self, pin: Pin, pull: Pull) -> Result<(), GpioError> {
        Self::check_pin(pin)?;
        self.inner.state.lock().pins.entry(pin).or_default().pull = pull;
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        Self::check_pin(pin)?;
        Ok(self.level(pin))
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        Self::check_pin(pin)?;
        let mut state = self.inner.state.lock();
        let entry = state.pins.entry(pin).or_default();
        if entry.mode != Some(PinMode::Output) {
            return Err(GpioError::backend("write", pin, "pin is not an output"));
        }
        entry.level = Some(level);
        Ok(())
    }

    fn set_pwm(&self, pin: Pin, duty: u8) -> Result<(), GpioError> {
        Self::check_pin(pin)?;
        let mut state = self.inner.state.lock();
        let entry = state.pins.entry(pin).or_default();
        if duty > 0 && entry.mode != Some(PinMode::Output) {
            return Err(GpioError::backend("set_pwm", pin, "pin is not an output"));
        }
        entry.pwm = duty;
        Ok(())
    }

    fn on_edge(&self, pin: Pin, edge: Edge, callback: EdgeCallback) -> Result<(), GpioError> {
        Self::check_pin(pin)?;
        self.inner.state.lock().edges.insert(pin, (edge, Arc::new(callback)));
        Ok(())
    }

    fn clear_edge(&self, pin: Pin) -> Result<(), GpioError> {
        Self::check_pin(pin)?;
        self.inner.state.lock().edges.remove(&pin);
        Ok(())
    }

    fn tick_us(&self) -> u64 {
        self.inner.epoch.elapsed().as_micros() as u64
            + self.inner.clock_offset_us.load(Ordering::SeqCst)
    }
}
