//! GPIO 连接（进程内唯一的所有权令牌）

use crate::periodic::PeriodicHandle;
use crate::{Edge, EdgeCallback, EdgeEvent, GpioBackend, GpioError, Level, Pin, PinMode, Pull};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 进程内是否已有活动连接
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// 已使用资源登记表（释放时按此恢复硬件）
#[derive(Default)]
struct Registry {
    touched: BTreeSet<Pin>,
    pwm: BTreeSet<Pin>,
    edges: BTreeSet<Pin>,
    periodic: Vec<Arc<PeriodicHandle>>,
}

/// GPIO 连接
///
/// 同一进程内同时最多存在一个。通过 `Arc` 在编码器、开关、电机之间
/// 共享；最后一个引用 drop 时（或显式调用 [`release`](Self::release)）
/// 执行以下清理：
///
/// 1. 所有 PWM 输出置 0
/// 2. 注销所有边沿回调
/// 3. 取消所有周期任务
/// 4. 所有用过的引脚置为输入、关闭上下拉（高阻态）
/// 5. 终止后端
pub struct GpioConnection {
    backend: Box<dyn GpioBackend>,
    registry: Mutex<Registry>,
    released: AtomicBool,
}

impl GpioConnection {
    /// 获取 GPIO 连接
    ///
    /// # 错误
    ///
    /// - `AlreadyActive`: 已有活动连接
    /// - `BackendUnavailable`: 后端初始化失败
    pub fn acquire<B: GpioBackend>(backend: B) -> Result<Arc<Self>, GpioError> {
        if ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GpioError::AlreadyActive);
        }

        if let Err(e) = backend.initialise() {
            ACTIVE.store(false, Ordering::Release);
            error!("Failed to initialise GPIO backend '{}': {}", backend.name(), e);
            return Err(match e {
                GpioError::BackendUnavailable(msg) => GpioError::BackendUnavailable(msg),
                other => GpioError::BackendUnavailable(other.to_string()),
            });
        }

        info!("GPIO connection acquired (backend: {})", backend.name());
        Ok(Arc::new(Self {
            backend: Box::new(backend),
            registry: Mutex::new(Registry::default()),
            released: AtomicBool::new(false),
        }))
    }

    /// 当前进程是否持有活动连接
    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), GpioError> {
        if self.is_released() {
            Err(GpioError::Released)
        } else {
            Ok(())
        }
    }

    fn touch(&self, pin: Pin) {
        self.registry.lock().touched.insert(pin);
    }

    /// 配置为输入引脚
    pub fn configure_input(&self, pin: Pin, pull: Pull) -> Result<(), GpioError> {
        self.ensure_live()?;
        self.touch(pin);
        self.backend.set_mode(pin, PinMode::Input)?;
        self.backend.set_pull(pin, pull)
    }

    /// 配置为输出引脚并写入初始电平
    pub fn configure_output(&self, pin: Pin, initial: Level) -> Result<(), GpioError> {
        self.ensure_live()?;
        self.touch(pin);
        self.backend.set_mode(pin, PinMode::Output)?;
        self.backend.write(pin, initial)
    }

    pub fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        self.ensure_live()?;
        self.backend.read(pin)
    }

    pub fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        self.ensure_live()?;
        self.backend.write(pin, level)
    }

    /// 设置 PWM 占空比（0..=255）
    pub fn set_pwm(&self, pin: Pin, duty: u8) -> Result<(), GpioError> {
        self.ensure_live()?;
        {
            let mut registry = self.registry.lock();
            registry.touched.insert(pin);
            registry.pwm.insert(pin);
        }
        self.backend.set_pwm(pin, duty)
    }

    /// 注册边沿回调
    ///
    /// 回调中的 panic 会被捕获并记录，不会传播到后端线程。
    pub fn on_edge<F>(&self, pin: Pin, edge: Edge, callback: F) -> Result<(), GpioError>
    where
        F: Fn(EdgeEvent) + Send + Sync + 'static,
    {
        self.ensure_live()?;
        {
            let mut registry = self.registry.lock();
            registry.touched.insert(pin);
            registry.edges.insert(pin);
        }
        let guarded: EdgeCallback = Box::new(move |event: EdgeEvent| {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
            if outcome.is_err() {
                error!("Edge callback on pin {} panicked", event.pin);
            }
        });
        self.backend.on_edge(pin, edge, guarded)
    }

    pub fn clear_edge(&self, pin: Pin) -> Result<(), GpioError> {
        self.registry.lock().edges.remove(&pin);
        if self.is_released() {
            return Ok(());
        }
        self.backend.clear_edge(pin)
    }

    /// 注册周期任务
    ///
    /// 任务在连接释放时被取消；已取消的句柄在下一次注册时移出登记表。
    pub fn register_periodic<F>(
        &self,
        name: &str,
        period: Duration,
        callback: F,
    ) -> Result<Arc<PeriodicHandle>, GpioError>
    where
        F: FnMut() + Send + 'static,
    {
        self.ensure_live()?;
        let handle = PeriodicHandle::spawn(name, period, callback)
            .map_err(|e| GpioError::BackendUnavailable(format!("cannot spawn timer: {}", e)))?;
        let handle = Arc::new(handle);

        // 在锁外释放已停止的句柄（Drop 会 join 线程）
        let finished = {
            let mut registry = self.registry.lock();
            let (live, finished): (Vec<_>, Vec<_>) = std::mem::take(&mut registry.periodic)
                .into_iter()
                .partition(|h| h.is_running());
            registry.periodic = live;
            registry.periodic.push(handle.clone());
            finished
        };
        drop(finished);
        Ok(handle)
    }

    #[cfg(test)]
    fn periodic_count(&self) -> usize {
        self.registry.lock().periodic.len()
    }

    /// 后端时钟（微秒）
    pub fn tick_us(&self) -> u64 {
        self.backend.tick_us()
    }

    /// 释放连接（幂等）
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        // 取出登记表后再调用后端，避免持锁执行硬件操作
        let registry = std::mem::take(&mut *self.registry.lock());

        for pin in &registry.pwm {
            if let Err(e) = self.backend.set_pwm(*pin, 0) {
                warn!("Failed to zero PWM on pin {}: {}", pin, e);
            }
        }
        for pin in &registry.edges {
            if let Err(e) = self.backend.clear_edge(*pin) {
                warn!("Failed to clear edge callback on pin {}: {}", pin, e);
            }
        }
        for handle in &registry.periodic {
            handle.cancel();
        }
        for pin in &registry.touched {
            if let Err(e) = self.backend.reset_pin(*pin) {
                warn!("Failed to reset pin {} to high impedance: {}", pin, e);
            }
        }

        self.backend.terminate();
        debug!("GPIO backend '{}' terminated", self.backend.name());
        ACTIVE.store(false, Ordering::Release);
        info!("GPIO connection released");
    }
}

impl Drop for GpioConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for GpioConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpioConnection")
            .field("backend", &self.backend.name())
            .field("released", &self.is_released())
            .finish()
    }
}
