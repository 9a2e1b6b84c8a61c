//! 限位开关
//!
//! 去抖的数字输入：距离上一次被处理的边沿不足 `debounce_us` 的边沿视为
//! 触点抖动并丢弃。中断可以被屏蔽（电机换向时），重新启用时同步采样
//! 引脚，不丢失屏蔽期间发生的按下。

use arc_swap::ArcSwapOption;
use pendule_gpio::{Edge, EdgeEvent, GpioConnection, Level, Pin, Pull};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use crate::PenduleError;

/// 尚未处理过任何边沿
const NO_TICK: u64 = u64::MAX;

/// 开关电气设置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchSettings {
    /// 静止（未按下）时为高电平
    pub normally_up: bool,
    /// 启用与静止电平一致的内部上下拉
    pub pull_resistor: bool,
    /// 去抖死区（微秒）
    pub debounce_us: u64,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            normally_up: true,
            pull_resistor: true,
            debounce_us: 5000,
        }
    }
}

impl SwitchSettings {
    fn rest_level(&self) -> Level {
        Level::from(self.normally_up)
    }

    fn pull(&self) -> Pull {
        match (self.pull_resistor, self.normally_up) {
            (false, _) => Pull::Off,
            (true, true) => Pull::Up,
            (true, false) => Pull::Down,
        }
    }
}

/// 按下监听器（中断线程上调用）
pub type SwitchListener = Box<dyn Fn() + Send + Sync + 'static>;

struct SwitchInner {
    name: String,
    settings: SwitchSettings,
    pressed: AtomicBool,
    triggered: AtomicBool,
    interrupts_enabled: AtomicBool,
    last_tick: AtomicU64,
    listener: ArcSwapOption<SwitchListener>,
}

impl SwitchInner {
    fn on_edge(&self, event: EdgeEvent) {
        if !self.interrupts_enabled.load(Ordering::Acquire) {
            return;
        }

        let last = self.last_tick.load(Ordering::Acquire);
        if last != NO_TICK && event.tick_us.saturating_sub(last) < self.settings.debounce_us {
            trace!("Switch '{}': edge ignored (debounce)", self.name);
            return;
        }
        self.last_tick.store(event.tick_us, Ordering::Release);

        let pressed = event.level != self.settings.rest_level();
        self.pressed.store(pressed, Ordering::Release);
        if pressed {
            self.fire();
        }
    }

    fn fire(&self) {
        self.triggered.store(true, Ordering::Release);
        debug!("Switch '{}' pressed", self.name);
        if let Some(listener) = self.listener.load_full() {
            listener();
        }
    }
}

/// 限位开关
pub struct Switch {
    conn: Arc<GpioConnection>,
    pin: Pin,
    inner: Arc<SwitchInner>,
}

impl Switch {
    /// 创建开关（中断默认启用，无监听器）
    pub fn new(
        conn: Arc<GpioConnection>,
        name: &str,
        pin: Pin,
        settings: SwitchSettings,
    ) -> Result<Self, PenduleError> {
        debug!(
            "Creating switch '{}' on pin {} (normally {}, pull {:?})",
            name,
            pin,
            if settings.normally_up { "up" } else { "down" },
            settings.pull()
        );
        conn.configure_input(pin, settings.pull())?;

        let inner = Arc::new(SwitchInner {
            name: name.to_string(),
            settings,
            pressed: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
            interrupts_enabled: AtomicBool::new(true),
            last_tick: AtomicU64::new(NO_TICK),
            listener: ArcSwapOption::empty(),
        });

        let switch = Self { conn, pin, inner };
        let pressed = switch.is_pressed_now()?;
        switch.inner.pressed.store(pressed, Ordering::Release);

        let callback_inner = switch.inner.clone();
        switch
            .conn
            .on_edge(pin, Edge::Both, move |event| callback_inner.on_edge(event))?;
        Ok(switch)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pin(&self) -> Pin {
        self.pin
    }

    /// 由中断维护的按下状态
    ///
    /// 中断被屏蔽时返回 `InterruptsAreDisabled`，此时应使用
    /// [`is_pressed_now`](Self::is_pressed_now) 轮询。
    pub fn pressed(&self) -> Result<bool, PenduleError> {
        if !self.interrupts_enabled() {
            return Err(PenduleError::InterruptsAreDisabled);
        }
        Ok(self.inner.pressed.load(Ordering::Acquire))
    }

    /// 直接读取引脚
    pub fn is_pressed_now(&self) -> Result<bool, PenduleError> {
        let level = self.conn.read(self.pin)?;
        Ok(level != self.inner.settings.rest_level())
    }

    /// 自上次 `clear_triggered` 以来是否被按下过
    pub fn has_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    pub fn clear_triggered(&self) {
        self.inner.triggered.store(false, Ordering::Release);
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.inner.interrupts_enabled.load(Ordering::Acquire)
    }

    /// 屏蔽中断（保留引脚与回调注册）
    pub fn disable_interrupts(&self) {
        self.inner.interrupts_enabled.store(false, Ordering::Release);
        trace!("Switch '{}' interrupts disabled", self.inner.name);
    }

    /// 启用中断并同步采样引脚
    ///
    /// 如果屏蔽期间开关被按下，立即调用监听器。
    pub fn enable_interrupts(&self) -> Result<(), PenduleError> {
        let was_enabled = self.inner.interrupts_enabled.swap(true, Ordering::AcqRel);
        let pressed = self.is_pressed_now()?;
        let was_pressed = self.inner.pressed.swap(pressed, Ordering::AcqRel);
        if pressed && (!was_pressed || !was_enabled) {
            self.inner.fire();
        }
        trace!("Switch '{}' interrupts enabled (pressed: {})", self.inner.name, pressed);
        Ok(())
    }

    /// 重新采样引脚状态（不调用监听器）
    ///
    /// 用于在去抖期内丢弃了释放边沿之后校正缓存状态。
    pub fn resync(&self) -> Result<bool, PenduleError> {
        let pressed = self.is_pressed_now()?;
        self.inner.pressed.store(pressed, Ordering::Release);
        Ok(pressed)
    }

    /// 设置按下监听器（替换已有的）
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: SwitchListener = Box::new(listener);
        self.inner.listener.store(Some(Arc::new(listener)));
    }

    pub fn clear_listener(&self) {
        self.inner.listener.store(None);
    }

    pub(crate) fn detach(&self) {
        self.clear_listener();
        if let Err(e) = self.conn.clear_edge(self.pin) {
            warn!("Switch '{}': failed to clear callback: {}", self.inner.name, e);
        }
    }
}

impl Drop for Switch {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("name", &self.inner.name)
            .field("pin", &self.pin)
            .field("pressed", &self.inner.pressed.load(Ordering::Relaxed))
            .field("interrupts_enabled", &self.interrupts_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pendule_gpio::mock::MockGpio;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    const PIN: Pin = 17;

    fn setup() -> (MockGpio, Arc<GpioConnection>, Switch, Arc<AtomicUsize>) {
        let mock = MockGpio::new();
        let conn = GpioConnection::acquire(mock.clone()).unwrap();
        let switch = Switch::new(conn.clone(), "left", PIN, SwitchSettings::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        switch.set_listener(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        (mock, conn, switch, hits)
    }

    #[test]
    #[serial]
    fn test_press_and_release() {
        let (mock, _conn, switch, hits) = setup();
        assert_eq!(mock.pull(PIN), Pull::Up);
        assert!(!switch.pressed().unwrap());

        mock.set_input(PIN, Level::Low);
        assert!(switch.pressed().unwrap());
        assert!(switch.has_triggered());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        mock.advance(10_000);
        mock.set_input(PIN, Level::High);
        assert!(!switch.pressed().unwrap());
        assert!(switch.has_triggered());
        switch.clear_triggered();
        assert!(!switch.has_triggered());
    }

    #[test]
    #[serial]
    fn test_debounce_ignores_chatter() {
        let (mock, _conn, switch, hits) = setup();
        mock.set_input(PIN, Level::Low);
        // 5ms 死区内的抖动
        mock.set_input(PIN, Level::High);
        mock.set_input(PIN, Level::Low);
        mock.set_input(PIN, Level::High);
        mock.set_input(PIN, Level::Low);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(switch.pressed().unwrap());
    }

    #[test]
    #[serial]
    fn test_disabled_interrupts() {
        let (mock, _conn, switch, hits) = setup();
        switch.disable_interrupts();
        assert!(matches!(switch.pressed(), Err(PenduleError::InterruptsAreDisabled)));

        mock.set_input(PIN, Level::Low);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(switch.is_pressed_now().unwrap());

        // 重新启用时补发屏蔽期间的按下
        switch.enable_interrupts().unwrap();
        assert!(switch.pressed().unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_resync_after_dropped_release() {
        let (mock, _conn, switch, _hits) = setup();
        mock.set_input(PIN, Level::Low);
        // 释放边沿落在死区内被丢弃
        mock.set_input(PIN, Level::High);
        assert!(switch.pressed().unwrap());
        assert!(!switch.resync().unwrap());
        assert!(!switch.pressed().unwrap());
    }

    #[test]
    #[serial]
    fn test_normally_down_without_pull() {
        let mock = MockGpio::new();
        let conn = GpioConnection::acquire(mock.clone()).unwrap();
        let settings = SwitchSettings {
            normally_up: false,
            pull_resistor: false,
            ..Default::default()
        };
        let switch = Switch::new(conn, "right", 18, settings).unwrap();
        assert_eq!(mock.pull(18), Pull::Off);
        assert!(!switch.is_pressed_now().unwrap());
        mock.set_input(18, Level::High);
        assert!(switch.pressed().unwrap());
    }
}
