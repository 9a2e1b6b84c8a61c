//! 状态邮箱（覆盖策略）
//!
//! 每个订阅者一个插槽：新快照直接覆盖尚未取走的旧快照（Last Write Wins），
//! 深度永远不超过 1。被覆盖的次数计入 `overwrites`，用于判断订阅者是否
//! 跟得上发布频率。

use parking_lot::{Condvar, Mutex};
use pendule_protocol::StateMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Slot {
    latest: Option<StateMessage>,
    /// `latest` 尚未被取走
    fresh: bool,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct Mailbox {
    slot: Mutex<Slot>,
    ready: Condvar,
    posted: AtomicU64,
    overwrites: AtomicU64,
}

impl Mailbox {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 投递快照（永不阻塞）
    pub(crate) fn post(&self, state: StateMessage) {
        let overwritten = {
            let mut slot = self.slot.lock();
            let overwritten = slot.fresh;
            slot.latest = Some(state);
            slot.fresh = true;
            overwritten
        };
        self.posted.fetch_add(1, Ordering::Relaxed);
        if overwritten {
            self.overwrites.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_all();
    }

    /// 关闭邮箱，唤醒所有等待者
    pub(crate) fn close(&self) {
        self.slot.lock().closed = true;
        self.ready.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    pub(crate) fn latest(&self) -> Option<StateMessage> {
        self.slot.lock().latest
    }
}

/// 状态订阅者
///
/// 可克隆；所有克隆共享同一个插槽（一个快照只会被其中一个取走）。
#[derive(Clone)]
pub struct StateSubscriber {
    mailbox: Arc<Mailbox>,
}

impl StateSubscriber {
    pub(crate) fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }

    /// 取走尚未读取的最新快照（不阻塞）
    pub fn try_recv(&self) -> Option<StateMessage> {
        let mut slot = self.mailbox.slot.lock();
        if slot.fresh {
            slot.fresh = false;
            slot.latest
        } else {
            None
        }
    }

    /// 等待下一条快照
    ///
    /// 超时或发布端关闭时返回 `None`。
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StateMessage> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.mailbox.slot.lock();
        while !slot.fresh {
            if slot.closed {
                return None;
            }
            if self.mailbox.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        if slot.fresh {
            slot.fresh = false;
            slot.latest
        } else {
            None
        }
    }

    /// 最近一次收到的快照（不论是否已读）
    pub fn latest(&self) -> Option<StateMessage> {
        self.mailbox.latest()
    }

    /// 当前积压的快照数（0 或 1）
    pub fn pending(&self) -> usize {
        usize::from(self.mailbox.slot.lock().fresh)
    }

    /// 累计投递次数
    pub fn posted(&self) -> u64 {
        self.mailbox.posted.load(Ordering::Relaxed)
    }

    /// 未读即被覆盖的次数
    pub fn overwrites(&self) -> u64 {
        self.mailbox.overwrites.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

impl std::fmt::Debug for StateSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSubscriber")
            .field("pending", &self.pending())
            .field("posted", &self.posted())
            .field("overwrites", &self.overwrites())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn state(seq: u32) -> StateMessage {
        StateMessage::uncalibrated(seq, false, seq as u64 * 1000)
    }

    #[test]
    fn test_latest_wins() {
        let mailbox = Mailbox::new();
        let subscriber = StateSubscriber::new(mailbox.clone());
        for seq in 0..100 {
            mailbox.post(state(seq));
            assert!(subscriber.pending() <= 1);
        }
        assert_eq!(subscriber.try_recv().map(|s| s.seq), Some(99));
        assert_eq!(subscriber.try_recv(), None);
        assert_eq!(subscriber.posted(), 100);
        assert_eq!(subscriber.overwrites(), 99);
        assert_eq!(subscriber.latest().map(|s| s.seq), Some(99));
    }

    #[test]
    fn test_recv_timeout_wakes_on_post() {
        let mailbox = Mailbox::new();
        let subscriber = StateSubscriber::new(mailbox.clone());
        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            mailbox.post(state(7));
        });
        let received = subscriber.recv_timeout(Duration::from_secs(2));
        poster.join().unwrap();
        assert_eq!(received.map(|s| s.seq), Some(7));
    }

    #[test]
    fn test_recv_timeout_expires() {
        let subscriber = StateSubscriber::new(Mailbox::new());
        let start = Instant::now();
        assert_eq!(subscriber.recv_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_close_wakes_waiter() {
        let mailbox = Mailbox::new();
        let subscriber = StateSubscriber::new(mailbox.clone());
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            mailbox.close();
        });
        assert_eq!(subscriber.recv_timeout(Duration::from_secs(5)), None);
        closer.join().unwrap();
        assert!(subscriber.is_closed());
    }
}
