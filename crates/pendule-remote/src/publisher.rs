//! 状态发布
//!
//! 发布任务注册为 GPIO 连接上的周期任务：每个周期读取一次
//! [`PenduleSnapshot`]，用相邻两次采样的差分估计速度，编码后发送给所有
//! UDP 订阅者，并投递到本地订阅者的邮箱。周期超时则跳过，不积压。

use parking_lot::Mutex;
use pendule_driver::{Pendule, PenduleError, PenduleSnapshot};
use pendule_gpio::{PeriodicHandle, PeriodicStats};
use pendule_protocol::{Message, STATE_MESSAGE_LEN, StateMessage, decode_message, encode_state};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::mailbox::{Mailbox, StateSubscriber};
use crate::subscribers::SubscriberRegistry;
use crate::transport::is_timeout;
use crate::RemoteError;

/// 订阅线程检查退出标志的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================
// 采样
// ============================================================

/// 快照 → 状态消息（含差分速度）
#[derive(Debug)]
pub struct StateSampler {
    seq: u32,
    epoch: Instant,
    /// 上一次已标定采样 (时间, 位置, 角度)
    previous: Option<(Instant, f64, f64)>,
}

impl Default for StateSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSampler {
    pub fn new() -> Self {
        Self {
            seq: 0,
            epoch: Instant::now(),
            previous: None,
        }
    }

    pub fn sample(&mut self, snapshot: &PenduleSnapshot, now: Instant) -> StateMessage {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let timestamp_us = now.saturating_duration_since(self.epoch).as_micros() as u64;

        let (Some(position), Some(angle)) = (snapshot.position, snapshot.angle) else {
            self.previous = None;
            return StateMessage::uncalibrated(seq, snapshot.is_emergency_stopped(), timestamp_us);
        };

        let (linear_velocity, angular_velocity) = match self.previous {
            Some((at, last_position, last_angle)) => {
                let dt = now.saturating_duration_since(at).as_secs_f64();
                if dt > 0.0 {
                    ((position - last_position) / dt, (angle - last_angle) / dt)
                } else {
                    (0.0, 0.0)
                }
            },
            None => (0.0, 0.0),
        };
        self.previous = Some((now, position, angle));

        StateMessage {
            seq,
            position,
            angle,
            linear_velocity,
            angular_velocity,
            calibrated: snapshot.is_calibrated(),
            emergency_stopped: snapshot.is_emergency_stopped(),
            timestamp_us,
        }
    }
}

// ============================================================
// 发布者
// ============================================================

struct PublisherInner {
    socket: UdpSocket,
    registry: Mutex<SubscriberRegistry>,
    local: Mutex<Vec<Weak<Mailbox>>>,
    last: Mutex<Option<StateMessage>>,
    published: AtomicU64,
}

impl PublisherInner {
    fn send(&self, bytes: &[u8], addr: SocketAddr) -> bool {
        match self.socket.send_to(bytes, addr) {
            Ok(_) => true,
            Err(e) => {
                trace!("State send to {} failed: {}", addr, e);
                false
            },
        }
    }

    fn publish(&self, state: &StateMessage) {
        let mut buf = [0u8; STATE_MESSAGE_LEN];
        let bytes = encode_state(state, &mut buf);

        {
            let mut registry = self.registry.lock();
            for addr in registry.expire(Instant::now()) {
                info!("State subscriber {} lease expired", addr);
            }
            for addr in registry.addrs() {
                let ok = self.send(bytes, addr);
                if registry.record_send(&addr, ok) {
                    warn!(
                        "Dropping state subscriber {} after {} failed sends",
                        addr,
                        SubscriberRegistry::MAX_SEND_ERRORS
                    );
                }
            }
        }

        self.local.lock().retain(|weak| match weak.upgrade() {
            Some(mailbox) => {
                mailbox.post(*state);
                true
            },
            None => false,
        });

        *self.last.lock() = Some(*state);
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        match decode_message(bytes) {
            Ok(Message::Subscribe { .. }) => {
                if self.registry.lock().subscribe(from, Instant::now()) {
                    info!("State subscriber {} joined", from);
                    // 新订阅者立即收到最近一次状态
                    let last = *self.last.lock();
                    if let Some(state) = last {
                        let mut buf = [0u8; STATE_MESSAGE_LEN];
                        self.send(encode_state(&state, &mut buf), from);
                    }
                }
            },
            Ok(Message::Unsubscribe { .. }) => {
                if self.registry.lock().unsubscribe(&from) {
                    info!("State subscriber {} left", from);
                }
            },
            Ok(other) => debug!(
                "Ignoring {:?} message on the state channel from {}",
                other.message_type(),
                from
            ),
            Err(e) => debug!("Malformed datagram from {}: {}", from, e),
        }
    }

    fn close_local(&self) {
        for weak in self.local.lock().drain(..) {
            if let Some(mailbox) = weak.upgrade() {
                mailbox.close();
            }
        }
    }
}

/// 状态发布者
///
/// Drop 时取消周期任务、停止订阅线程并关闭所有本地订阅者。
pub struct StatePublisher {
    inner: Arc<PublisherInner>,
    timer: Arc<PeriodicHandle>,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl StatePublisher {
    /// 在已绑定的 UDP 套接字上开始发布
    pub fn start(
        pendule: &Arc<Pendule>,
        socket: UdpSocket,
        config: &ServerConfig,
    ) -> Result<Self, RemoteError> {
        config.validate()?;
        let local_addr = socket.local_addr()?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let recv_socket = socket.try_clone()?;

        let inner = Arc::new(PublisherInner {
            socket,
            registry: Mutex::new(SubscriberRegistry::new(config.subscriber_timeout())),
            local: Mutex::new(Vec::new()),
            last: Mutex::new(None),
            published: AtomicU64::new(0),
        });

        let running = Arc::new(AtomicBool::new(true));
        let listener_inner = inner.clone();
        let listener_running = running.clone();
        let listener = thread::Builder::new()
            .name("state-subscriptions".into())
            .spawn(move || subscription_loop(recv_socket, listener_inner, listener_running))?;

        let weak = Arc::downgrade(pendule);
        let timer_inner = inner.clone();
        let mut sampler = StateSampler::new();
        let timer = pendule
            .connection()
            .register_periodic("state-publisher", config.publish_period(), move || {
                if let Some(pendule) = weak.upgrade() {
                    let state = sampler.sample(&pendule.snapshot(), Instant::now());
                    timer_inner.publish(&state);
                }
            })
            .map_err(PenduleError::from);
        let timer = match timer {
            Ok(timer) => timer,
            Err(e) => {
                running.store(false, Ordering::Release);
                let _ = listener.join();
                return Err(e.into());
            },
        };

        info!(
            "State publisher on udp://{} every {:?}",
            local_addr,
            config.publish_period()
        );
        Ok(Self {
            inner,
            timer,
            running,
            listener: Some(listener),
            local_addr,
        })
    }

    /// 本地订阅（覆盖策略邮箱）
    pub fn subscribe(&self) -> StateSubscriber {
        let mailbox = Mailbox::new();
        self.inner.local.lock().push(Arc::downgrade(&mailbox));
        StateSubscriber::new(mailbox)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 当前 UDP 订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// 累计发布次数
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// 最近一次发布的状态
    pub fn last_state(&self) -> Option<StateMessage> {
        *self.inner.last.lock()
    }

    pub fn timer_stats(&self) -> &PeriodicStats {
        self.timer.stats()
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.timer.cancel();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        self.inner.close_local();
        debug!("State publisher on {} stopped", self.local_addr);
    }
}

impl Drop for StatePublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn subscription_loop(socket: UdpSocket, inner: Arc<PublisherInner>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; 64];
    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => inner.handle_datagram(&buf[..len], from),
            Err(e) if is_timeout(&e) => {},
            Err(e) => {
                warn!("State socket receive error: {}", e);
                thread::sleep(Duration::from_millis(100));
            },
        }
    }
    trace!("Subscription loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pendule_driver::PenduleState;

    fn snapshot(state: PenduleState, position: Option<f64>, angle: Option<f64>) -> PenduleSnapshot {
        PenduleSnapshot {
            state,
            position,
            angle,
            position_pulses: 0,
            angle_pulses: 0,
            power: 0.0,
        }
    }

    #[test]
    fn test_uncalibrated_sample_is_nan() {
        let mut sampler = StateSampler::new();
        let state = sampler.sample(&snapshot(PenduleState::Uncalibrated, None, None), Instant::now());
        assert!(!state.calibrated);
        assert!(state.position.is_nan());
        assert!(state.linear_velocity.is_nan());
    }

    #[test]
    fn test_velocity_by_finite_difference() {
        let mut sampler = StateSampler::new();
        let t0 = Instant::now();
        let first = sampler.sample(&snapshot(PenduleState::Calibrated, Some(0.5), Some(0.0)), t0);
        assert_eq!(first.linear_velocity, 0.0);
        assert!(first.calibrated);

        let t1 = t0 + Duration::from_millis(20);
        let second = sampler.sample(&snapshot(PenduleState::Calibrated, Some(0.52), Some(-0.1)), t1);
        assert!((second.linear_velocity - 1.0).abs() < 1e-9);
        assert!((second.angular_velocity + 5.0).abs() < 1e-9);
        assert_eq!(second.seq, first.seq + 1);
        assert!(second.timestamp_us >= first.timestamp_us + 20_000);
    }

    #[test]
    fn test_estop_resets_difference() {
        let mut sampler = StateSampler::new();
        let t0 = Instant::now();
        sampler.sample(&snapshot(PenduleState::Calibrated, Some(0.1), Some(0.0)), t0);
        let stopped = sampler.sample(
            &snapshot(PenduleState::EmergencyStopped, None, None),
            t0 + Duration::from_millis(20),
        );
        assert!(stopped.emergency_stopped);
        assert!(!stopped.calibrated);

        let resumed = sampler.sample(
            &snapshot(PenduleState::Calibrated, Some(0.9), Some(0.0)),
            t0 + Duration::from_millis(40),
        );
        assert_eq!(resumed.linear_velocity, 0.0);
    }

    #[test]
    fn test_estop_after_calibration_keeps_position() {
        let mut sampler = StateSampler::new();
        let state = sampler.sample(
            &snapshot(PenduleState::EmergencyStopped, Some(0.8), Some(0.1)),
            Instant::now(),
        );
        assert!(state.calibrated);
        assert!(state.emergency_stopped);
        assert_eq!(state.position, 0.8);
        assert_eq!(state.angle, 0.1);
    }
}
