//! 日志初始化
//!
//! 安装 `tracing-subscriber`（`EnvFilter`，默认 `info`，可用 `RUST_LOG`
//! 覆盖），并把 `log` crate 的记录桥接到 `tracing`。

use tracing_subscriber::EnvFilter;

/// 默认过滤规则
pub const DEFAULT_FILTER: &str = "info";

/// 构造过滤器：优先使用 `RUST_LOG`，否则使用 `default`
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// 初始化日志；已经初始化过时返回错误
pub fn try_init_logger() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_FILTER))
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

/// 初始化日志（重复调用无副作用）
pub fn init_logger() {
    let _ = try_init_logger();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_twice() {
        init_logger();
        init_logger();
        tracing::info!("logger initialised");
        assert!(try_init_logger().is_err());
    }

    #[test]
    fn test_env_filter_default() {
        let filter = env_filter("pendule_driver=debug");
        assert!(!filter.to_string().is_empty());
    }
}
