//! UDP 订阅者登记（带租约）
//!
//! 客户端周期性地重发 Subscribe 续租；超过 `timeout` 未续租的订阅者在
//! 下一次发布时被移除。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// 订阅者信息
#[derive(Debug, Clone, Copy)]
pub struct Subscriber {
    pub addr: SocketAddr,
    /// 首次订阅时间
    pub since: Instant,
    /// 最近一次续租时间
    pub last_seen: Instant,
    /// 连续发送失败次数
    pub send_errors: u32,
}

/// 订阅者登记表
#[derive(Debug)]
pub struct SubscriberRegistry {
    subscribers: HashMap<SocketAddr, Subscriber>,
    timeout: Duration,
}

impl SubscriberRegistry {
    /// 连续发送失败多少次后移除订阅者
    pub const MAX_SEND_ERRORS: u32 = 50;

    pub fn new(timeout: Duration) -> Self {
        Self {
            subscribers: HashMap::new(),
            timeout,
        }
    }

    /// 订阅或续租；返回是否为新订阅者
    pub fn subscribe(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.subscribers.get_mut(&addr) {
            Some(subscriber) => {
                subscriber.last_seen = now;
                false
            },
            None => {
                self.subscribers.insert(
                    addr,
                    Subscriber {
                        addr,
                        since: now,
                        last_seen: now,
                        send_errors: 0,
                    },
                );
                true
            },
        }
    }

    pub fn unsubscribe(&mut self, addr: &SocketAddr) -> bool {
        self.subscribers.remove(addr).is_some()
    }

    /// 移除租约过期的订阅者，返回被移除的地址
    pub fn expire(&mut self, now: Instant) -> Vec<SocketAddr> {
        let timeout = self.timeout;
        let expired: Vec<SocketAddr> = self
            .subscribers
            .values()
            .filter(|s| now.saturating_duration_since(s.last_seen) > timeout)
            .map(|s| s.addr)
            .collect();
        for addr in &expired {
            self.subscribers.remove(addr);
        }
        expired
    }

    /// 记录一次发送结果；连续失败过多时移除并返回 `true`
    pub fn record_send(&mut self, addr: &SocketAddr, ok: bool) -> bool {
        let Some(subscriber) = self.subscribers.get_mut(addr) else {
            return false;
        };
        if ok {
            subscriber.send_errors = 0;
            return false;
        }
        subscriber.send_errors += 1;
        if subscriber.send_errors >= Self::MAX_SEND_ERRORS {
            self.subscribers.remove(addr);
            return true;
        }
        false
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.subscribers.keys().copied().collect()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Subscriber> {
        self.subscribers.get(addr)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_subscribe_and_renew() {
        let mut registry = SubscriberRegistry::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(registry.subscribe(addr(1000), t0));
        assert!(!registry.subscribe(addr(1000), t0 + Duration::from_secs(1)));
        assert_eq!(registry.len(), 1);
        let subscriber = registry.get(&addr(1000)).unwrap();
        assert_eq!(subscriber.since, t0);
        assert_eq!(subscriber.last_seen, t0 + Duration::from_secs(1));
    }

    #[test]
    fn test_expire_only_stale() {
        let mut registry = SubscriberRegistry::new(Duration::from_secs(5));
        let t0 = Instant::now();
        registry.subscribe(addr(1), t0);
        registry.subscribe(addr(2), t0 + Duration::from_secs(4));

        assert!(registry.expire(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(registry.expire(t0 + Duration::from_secs(6)), vec![addr(1)]);
        assert_eq!(registry.addrs(), vec![addr(2)]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut registry = SubscriberRegistry::new(Duration::from_secs(5));
        registry.subscribe(addr(1), Instant::now());
        assert!(registry.unsubscribe(&addr(1)));
        assert!(!registry.unsubscribe(&addr(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_errors_drop_subscriber() {
        let mut registry = SubscriberRegistry::new(Duration::from_secs(5));
        registry.subscribe(addr(1), Instant::now());
        for _ in 0..SubscriberRegistry::MAX_SEND_ERRORS - 1 {
            assert!(!registry.record_send(&addr(1), false));
        }
        assert!(!registry.record_send(&addr(1), true));
        assert_eq!(registry.get(&addr(1)).unwrap().send_errors, 0);
        for _ in 0..SubscriberRegistry::MAX_SEND_ERRORS - 1 {
            registry.record_send(&addr(1), false);
        }
        assert!(registry.record_send(&addr(1), false));
        assert!(registry.is_empty());
    }
}
