//! 增量式编码器
//!
//! 边沿中断 → 带符号脉冲计数。
//!
//! - 四倍频正交解码：一相的边沿到来时，该相电平取自事件本身，另一相
//!   电平在回调内同步读取，再查转移表得到 -1/0/+1
//! - 单相模式（无 B 相）：A 相每个边沿 +1
//! - 计数器为 `AtomicI64`，读取方从不阻塞回调线程

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use pendule_gpio::{Edge, EdgeEvent, GpioConnection, Level, Pin, Pull};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::PenduleError;

/// 正交解码转移表，索引为 `(prev_a << 3) | (prev_b << 2) | (a << 1) | b`
pub const QUADRATURE_TABLE: [i8; 16] = [0, 1, -1, 0, -1, 0, 0, 1, 1, 0, 0, -1, 0, -1, 1, 0];

/// 根据前后两相电平计算计数增量
#[inline]
pub fn quadrature_step(prev_a: bool, prev_b: bool, a: bool, b: bool) -> i8 {
    let index = ((prev_a as usize) << 3) | ((prev_b as usize) << 2) | ((a as usize) << 1) | b as usize;
    QUADRATURE_TABLE[index]
}

/// 计数阈值回调
pub type LimitCallback = Box<dyn Fn(i64) + Send + Sync + 'static>;

struct Limits {
    lower: i64,
    upper: i64,
    callback: LimitCallback,
    /// 计数当前是否处于 `(lower, upper)` 之内；离开时触发一次
    inside: AtomicBool,
}

impl Limits {
    fn contains(&self, count: i64) -> bool {
        count > self.lower && count < self.upper
    }
}

struct EncoderInner {
    name: String,
    pin_a: Pin,
    pin_b: Option<Pin>,
    count: AtomicI64,
    /// 上一次的 (A, B) 电平；仅回调线程写
    levels: Mutex<(bool, bool)>,
    limits: ArcSwapOption<Limits>,
}

impl EncoderInner {
    fn on_edge(&self, conn: &GpioConnection, event: EdgeEvent) {
        let delta = match self.pin_b {
            None => 1,
            Some(pin_b) => {
                let mut levels = self.levels.lock();
                let (prev_a, prev_b) = *levels;
                let (a, b) = if event.pin == self.pin_a {
                    let b = match conn.read(pin_b) {
                        Ok(level) => level.is_high(),
                        Err(e) => {
                            warn!("Encoder '{}': failed to read phase B: {}", self.name, e);
                            prev_b
                        },
                    };
                    (event.level.is_high(), b)
                } else {
                    let a = match conn.read(self.pin_a) {
                        Ok(level) => level.is_high(),
                        Err(e) => {
                            warn!("Encoder '{}': failed to read phase A: {}", self.name, e);
                            prev_a
                        },
                    };
                    (a, event.level.is_high())
                };
                *levels = (a, b);
                quadrature_step(prev_a, prev_b, a, b) as i64
            },
        };

        if delta == 0 {
            trace!("Encoder '{}': no transition on pin {}", self.name, event.pin);
            return;
        }
        let count = self.count.fetch_add(delta, Ordering::AcqRel) + delta;
        self.check_limits(count);
    }

    fn check_limits(&self, count: i64) {
        let guard = self.limits.load();
        let Some(limits) = guard.as_ref() else {
            return;
        };
        let inside = limits.contains(count);
        let was_inside = limits.inside.swap(inside, Ordering::AcqRel);
        if was_inside && !inside {
            (limits.callback)(count);
        }
    }
}

/// 增量式编码器
pub struct Encoder {
    conn: Arc<GpioConnection>,
    inner: Arc<EncoderInner>,
}

impl Encoder {
    /// 创建编码器并注册边沿回调
    ///
    /// 两相均启用内部上拉（公共地接法）。`pin_b` 为 `None` 时为单相计数。
    pub fn new(
        conn: Arc<GpioConnection>,
        name: &str,
        pin_a: Pin,
        pin_b: Option<Pin>,
    ) -> Result<Self, PenduleError> {
        debug!("Creating encoder '{}' on pins {} / {:?}", name, pin_a, pin_b);
        conn.configure_input(pin_a, Pull::Up)?;
        if let Some(pin_b) = pin_b {
            conn.configure_input(pin_b, Pull::Up)?;
        }

        let a = conn.read(pin_a)?.is_high();
        let b = match pin_b {
            Some(pin_b) => conn.read(pin_b)?.is_high(),
            None => false,
        };

        let inner = Arc::new(EncoderInner {
            name: name.to_string(),
            pin_a,
            pin_b,
            count: AtomicI64::new(0),
            levels: Mutex::new((a, b)),
            limits: ArcSwapOption::empty(),
        });

        let encoder = Self { conn, inner };
        encoder.register(pin_a)?;
        if let Some(pin_b) = pin_b {
            encoder.register(pin_b)?;
        }
        Ok(encoder)
    }

    fn register(&self, pin: Pin) -> Result<(), PenduleError> {
        let inner = self.inner.clone();
        let conn: Weak<GpioConnection> = Arc::downgrade(&self.conn);
        self.conn.on_edge(pin, Edge::Both, move |event| {
            if let Some(conn) = conn.upgrade() {
                inner.on_edge(&conn, event);
            }
        })?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 当前计数（无锁快照）
    pub fn pulses(&self) -> i64 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// 计数清零
    pub fn reset(&self) {
        self.inner.count.store(0, Ordering::Release);
        debug!("Encoder '{}' reset", self.inner.name);
    }

    /// 设置计数阈值
    ///
    /// 计数到达 `lower` 或 `upper`（含边界）时，在中断线程上调用一次
    /// `callback`；回到区间内后重新生效。
    pub fn set_limits<F>(&self, lower: i64, upper: i64, callback: F)
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        let limits = Limits {
            lower,
            upper,
            callback: Box::new(callback),
            inside: AtomicBool::new(false),
        };
        limits.inside.store(limits.contains(self.pulses()), Ordering::Release);
        self.inner.limits.store(Some(Arc::new(limits)));
        debug!("Encoder '{}' limits set to [{}, {}]", self.inner.name, lower, upper);
    }

    pub fn clear_limits(&self) {
        self.inner.limits.store(None);
    }

    /// 注销边沿回调（Pendule 析构时调用）
    pub(crate) fn detach(&self) {
        self.clear_limits();
        for pin in std::iter::once(self.inner.pin_a).chain(self.inner.pin_b) {
            if let Err(e) = self.conn.clear_edge(pin) {
                warn!("Encoder '{}': failed to clear callback on pin {}: {}", self.inner.name, pin, e);
            }
        }
    }

    /// 当前两相电平（调试用）
    pub fn levels(&self) -> (Level, Level) {
        let (a, b) = *self.inner.levels.lock();
        (Level::from(a), Level::from(b))
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("name", &self.inner.name)
            .field("pin_a", &self.inner.pin_a)
            .field("pin_b", &self.inner.pin_b)
            .field("pulses", &self.pulses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pendule_gpio::mock::MockGpio;
    use proptest::prelude::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    const A: Pin = 20;
    const B: Pin = 21;

    /// 正交序列中第 `pos` 个位置的 (A, B) 电平，pos = 0 时两相均为高
    fn phase(pos: i64) -> (Level, Level) {
        match pos.rem_euclid(4) {
            0 => (Level::High, Level::High),
            1 => (Level::High, Level::Low),
            2 => (Level::Low, Level::Low),
            _ => (Level::Low, Level::High),
        }
    }

    /// 向前或向后走一步，只翻转变化的那一相
    fn step(mock: &MockGpio, pos: &mut i64, forward: bool) {
        let (old_a, old_b) = phase(*pos);
        *pos += if forward { 1 } else { -1 };
        let (a, b) = phase(*pos);
        if a != old_a {
            mock.set_input(A, a);
        }
        if b != old_b {
            mock.set_input(B, b);
        }
    }

    fn setup() -> (MockGpio, Arc<GpioConnection>, Encoder) {
        let mock = MockGpio::new();
        let conn = GpioConnection::acquire(mock.clone()).unwrap();
        let encoder = Encoder::new(conn.clone(), "test", A, Some(B)).unwrap();
        (mock, conn, encoder)
    }

    #[test]
    fn test_quadrature_table_is_antisymmetric() {
        for prev in 0..4usize {
            for next in 0..4usize {
                let (pa, pb) = (prev & 2 != 0, prev & 1 != 0);
                let (a, b) = (next & 2 != 0, next & 1 != 0);
                assert_eq!(quadrature_step(pa, pb, a, b), -quadrature_step(a, b, pa, pb));
            }
        }
    }

    #[test]
    #[serial]
    fn test_forward_and_backward() {
        let (mock, _conn, encoder) = setup();
        let mut pos = 0;
        for _ in 0..10 {
            step(&mock, &mut pos, true);
        }
        assert_eq!(encoder.pulses(), 10);
        for _ in 0..4 {
            step(&mock, &mut pos, false);
        }
        assert_eq!(encoder.pulses(), 6);
        encoder.reset();
        assert_eq!(encoder.pulses(), 0);
    }

    #[test]
    #[serial]
    fn test_single_channel_counts_every_edge() {
        let mock = MockGpio::new();
        let conn = GpioConnection::acquire(mock.clone()).unwrap();
        let encoder = Encoder::new(conn, "single", A, None).unwrap();
        for i in 0..6 {
            mock.set_input(A, if i % 2 == 0 { Level::Low } else { Level::High });
        }
        assert_eq!(encoder.pulses(), 6);
    }

    #[test]
    #[serial]
    fn test_limits_fire_once_per_crossing() {
        let (mock, _conn, encoder) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        encoder.set_limits(-3, 3, move |count| {
            assert!(count <= -3 || count >= 3);
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut pos = 0;
        for _ in 0..5 {
            step(&mock, &mut pos, true);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            step(&mock, &mut pos, false);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        encoder.clear_limits();
        for _ in 0..10 {
            step(&mock, &mut pos, true);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[serial]
    fn test_drop_detaches_callbacks() {
        let (mock, _conn, encoder) = setup();
        drop(encoder);
        assert!(!mock.has_edge_callback(A));
        assert!(!mock.has_edge_callback(B));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// 任意步进序列的计数等于净步数；反向重放后回到零
        #[test]
        #[serial]
        fn prop_count_equals_net_steps(moves in proptest::collection::vec(any::<bool>(), 0..200)) {
            let (mock, _conn, encoder) = setup();
            let mut pos = 0i64;
            for &forward in &moves {
                step(&mock, &mut pos, forward);
            }
            prop_assert_eq!(encoder.pulses(), pos);

            for &forward in moves.iter().rev() {
                step(&mock, &mut pos, !forward);
            }
            prop_assert_eq!(encoder.pulses(), 0);
        }
    }
}
