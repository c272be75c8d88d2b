//! Per-user accounting state.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

/// One authenticated user: traffic totals, concurrent client IPs, limits.
///
/// Traffic counters are monotonic and safe for concurrent adds. IP-set
/// membership changes are serialised by the internal lock; a limit of zero
/// means unlimited.
#[derive(Debug)]
pub struct User {
    hash: String,
    sent: AtomicU64,
    recv: AtomicU64,
    ip_set: Mutex<HashSet<IpAddr>>,
    ip_limit: AtomicU32,
    speed_limit_up: AtomicU64,
    speed_limit_down: AtomicU64,
}

impl User {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            ip_set: Mutex::new(HashSet::new()),
            ip_limit: AtomicU32::new(0),
            speed_limit_up: AtomicU64::new(0),
            speed_limit_down: AtomicU64::new(0),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Record bytes written to and read from the client.
    pub fn add_traffic(&self, sent: u64, recv: u64) {
        if sent > 0 {
            self.sent.fetch_add(sent, Ordering::Relaxed);
        }
        if recv > 0 {
            self.recv.fetch_add(recv, Ordering::Relaxed);
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    /// Register a client IP. Returns false when the concurrent-IP ceiling
    /// would be exceeded; the set is left unchanged in that case.
    pub fn add_ip(&self, ip: IpAddr) -> bool {
        let limit = self.ip_limit.load(Ordering::Relaxed);
        let mut set = self.ip_set.lock();
        if set.contains(&ip) {
            return true;
        }
        if limit > 0 && set.len() >= limit as usize {
            return false;
        }
        set.insert(ip);
        true
    }

    /// Drop a client IP from the set.
    pub fn del_ip(&self, ip: &IpAddr) -> bool {
        self.ip_set.lock().remove(ip)
    }

    pub fn ip_count(&self) -> usize {
        self.ip_set.lock().len()
    }

    pub fn ip_limit(&self) -> u32 {
        self.ip_limit.load(Ordering::Relaxed)
    }

    pub fn set_ip_limit(&self, limit: u32) {
        self.ip_limit.store(limit, Ordering::Relaxed);
    }

    pub fn speed_limit(&self) -> (u64, u64) {
        (
            self.speed_limit_up.load(Ordering::Relaxed),
            self.speed_limit_down.load(Ordering::Relaxed),
        )
    }

    pub fn set_speed_limit(&self, up: u64, down: u64) {
        self.speed_limit_up.store(up, Ordering::Relaxed);
        self.speed_limit_down.store(down, Ordering::Relaxed);
    }
}
