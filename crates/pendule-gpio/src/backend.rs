//! GPIO 后端能力接口

use crate::{Edge, EdgeCallback, GpioError, Level, Pin, PinMode, Pull};

/// GPIO 后端
///
/// 所有方法都以 `&self` 调用：后端会同时被控制线程、边沿回调线程和
/// 服务线程使用，实现必须自行保证内部同步。
///
/// # 回调线程
///
/// `on_edge` 注册的回调在后端自己的通知线程上调用。回调中允许调用
/// `read`（编码器需要同步读取另一相），实现不得在调用回调时持有会被
/// `read` 争用的锁。
pub trait GpioBackend: Send + Sync + 'static {
    /// 后端名称（用于日志）
    fn name(&self) -> &str;

    /// 初始化后端
    ///
    /// 由 [`GpioConnection::acquire`](crate::GpioConnection::acquire) 调用一次。
    /// 无法连接时返回 `GpioError::BackendUnavailable`。
    fn initialise(&self) -> Result<(), GpioError>;

    /// 终止后端（连接释放时调用一次，不得失败）
    fn terminate(&self);

    fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), GpioError>;

    fn set_pull(&self, pin: Pin, pull: Pull) -> Result<(), GpioError>;

    fn read(&self, pin: Pin) -> Result<Level, GpioError>;

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError>;

    /// 设置 PWM 占空比（0..=255）
    fn set_pwm(&self, pin: Pin, duty: u8) -> Result<(), GpioError>;

    /// 注册边沿回调（替换该引脚上已有的回调）
    fn on_edge(&self, pin: Pin, edge: Edge, callback: EdgeCallback) -> Result<(), GpioError>;

    /// 注销边沿回调
    ///
    /// 返回后不会再有新的回调开始执行。
    fn clear_edge(&self, pin: Pin) -> Result<(), GpioError>;

    /// 后端时钟（微秒，单调递增）
    fn tick_us(&self) -> u64;

    /// 引脚置为高阻态（输入、无上下拉）
    fn reset_pin(&self, pin: Pin) -> Result<(), GpioError> {
        self.set_mode(pin, PinMode::Input)?;
        self.set_pull(pin, Pull::Off)
    }
}
