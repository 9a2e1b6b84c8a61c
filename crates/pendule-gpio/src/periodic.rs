//! 周期定时器
//!
//! 在专用线程上以固定周期调用回调，用 `spin_sleep` 获得亚毫秒级精度。
//! 锚点按周期累加（不随回调耗时漂移）；回调超时（overrun）时跳过
//! 错过的周期，而不是连续补发。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// 单次睡眠的最长时间，保证取消请求在有限时间内被看到
const MAX_SLEEP_CHUNK: Duration = Duration::from_millis(10);

/// 周期任务统计
#[derive(Debug, Default)]
pub struct PeriodicStats {
    /// 已执行的周期数
    pub ticks: AtomicU64,
    /// 因超时被跳过的周期数
    pub skipped: AtomicU64,
}

impl PeriodicStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// 周期任务句柄
///
/// Drop 时自动取消任务。
pub struct PeriodicHandle {
    name: String,
    stop: Arc<AtomicBool>,
    stats: Arc<PeriodicStats>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
}

impl PeriodicHandle {
    /// 启动周期任务
    ///
    /// 第一次调用发生在 `period` 之后。
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut callback: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PeriodicStats::default());
        let period = period.max(Duration::from_micros(100));

        let stop_clone = stop.clone();
        let stats_clone = stats.clone();
        let task_name = name.clone();

        let handle = thread::Builder::new().name(format!("periodic-{}", name)).spawn(move || {
            debug!("Periodic task '{}' started ({:?})", task_name, period);
            let mut next_tick = Instant::now() + period;

            loop {
                // 分段睡眠到下一个锚点
                loop {
                    if stop_clone.load(Ordering::Acquire) {
                        debug!("Periodic task '{}' stopped", task_name);
                        return;
                    }
                    let now = Instant::now();
                    if now >= next_tick {
                        break;
                    }
                    spin_sleep::sleep((next_tick - now).min(MAX_SLEEP_CHUNK));
                }

                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut callback));
                if outcome.is_err() {
                    error!("Periodic task '{}' callback panicked", task_name);
                }
                stats_clone.ticks.fetch_add(1, Ordering::Relaxed);

                next_tick += period;
                let now = Instant::now();
                if now > next_tick {
                    // 跳过错过的周期，对齐到下一个未来锚点
                    let behind = now.duration_since(next_tick);
                    let missed = (behind.as_nanos() / period.as_nanos()) as u64 + 1;
                    stats_clone.skipped.fetch_add(missed, Ordering::Relaxed);
                    next_tick += period * missed as u32;
                    warn!(
                        "Periodic task '{}' overrun: skipped {} period(s) of {:?}",
                        task_name, missed, period
                    );
                }
            }
        })?;

        let thread_id = Some(handle.thread().id());
        Ok(Self {
            name,
            stop,
            stats,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &PeriodicStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// 取消任务并等待线程退出
    ///
    /// 在回调内部调用时只设置停止标志（不能 join 自己）。
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Release);

        if self.thread_id == Some(thread::current().id()) {
            return;
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Periodic task '{}' thread panicked", self.name);
            }
        }
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PeriodicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("ticks", &self.stats.ticks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_periodic_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handle = PeriodicHandle::spawn("test", Duration::from_millis(5), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        handle.cancel();
        let after_cancel = count.load(Ordering::SeqCst);
        assert!(after_cancel >= 5, "only {} ticks", after_cancel);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        assert!(!handle.is_running());
    }

    #[test]
    fn test_overrun_skips_ticks() {
        let handle = PeriodicHandle::spawn("slow", Duration::from_millis(2), || {
            thread::sleep(Duration::from_millis(10));
        })
        .unwrap();

        thread::sleep(Duration::from_millis(80));
        handle.cancel();
        assert!(handle.stats().skipped() > 0);
        // 回调耗时 10ms，80ms 内不可能执行超过 10 次
        assert!(handle.stats().ticks() <= 10);
    }

    #[test]
    fn test_panicking_callback_keeps_running() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handle = PeriodicHandle::spawn("panics", Duration::from_millis(5), move || {
            if count_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        drop(handle);
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
