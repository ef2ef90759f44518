use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::ServerAddr;

/// Ring points contributed by each unit of server weight.
pub const POINTS_PER_WEIGHT: u32 = 160;

/// Largest accepted server weight. Keeps a server at no more than 160 000
/// ring points.
pub const MAX_WEIGHT: u32 = 1000;

/// CRC32 of the bytes, pushed through the murmur3 finaliser so that similar
/// inputs spread over the whole ring.
pub fn hash_key(bytes: &[u8]) -> u32 {
    let mut h = crc32fast::hash(bytes);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub addr: ServerAddr,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Health {
    dead_since: Option<Instant>,
}

/// The configured servers laid out on a weighted hash ring, plus their
/// alive/dead bookkeeping.
///
/// Servers are addressed by their index in [`ServerPool::servers`].
#[derive(Debug)]
pub struct ServerPool {
    servers: Vec<Server>,
    ring: Vec<(u32, usize)>,
    health: Mutex<Vec<Health>>,
    dead_retry_interval: Duration,
}

impl ServerPool {
    /// Lays `(address, weight)` pairs out on the ring. Weights are clamped
    /// to `1..=`[`MAX_WEIGHT`]; [`ClientConfig`](crate::ClientConfig) rejects
    /// anything outside that range before it gets here.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use mcring::{ServerAddr, ServerPool};
    ///
    /// let pool = ServerPool::new(
    ///     vec![
    ///         (ServerAddr::Tcp("10.0.0.1:11211".into()), 1),
    ///         (ServerAddr::Tcp("10.0.0.2:11211".into()), 2),
    ///     ],
    ///     Duration::from_secs(30),
    /// );
    /// let order = pool.resolve(b"user:1");
    /// assert_eq!(order.len(), 2);
    ///
    /// pool.mark_dead(order[0]);
    /// assert_eq!(pool.resolve(b"user:1"), vec![order[1]]);
    /// ```
    pub fn new(servers: Vec<(ServerAddr, u32)>, dead_retry_interval: Duration) -> Self {
        let servers: Vec<Server> = servers
            .into_iter()
            .map(|(addr, weight)| Server {
                addr,
                weight: weight.clamp(1, MAX_WEIGHT),
            })
            .collect();

        let mut ring = Vec::new();
        for (idx, server) in servers.iter().enumerate() {
            let id = server.addr.to_string();
            for i in 0..server.weight * POINTS_PER_WEIGHT {
                ring.push((hash_key(format!("{id}-{i}").as_bytes()), idx));
            }
        }
        ring.sort_unstable();

        let health = Mutex::new(vec![Health::default(); servers.len()]);
        Self {
            servers,
            ring,
            health,
            dead_retry_interval,
        }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server(&self, idx: usize) -> &Server {
        &self.servers[idx]
    }

    /// How long a dead server is skipped before it is tried again.
    pub fn dead_retry_interval(&self) -> Duration {
        self.dead_retry_interval
    }

    /// Alive servers in the order they should be tried for `key`: the owner
    /// of the key's ring segment first, then the distinct servers met walking
    /// clockwise. Empty when every server is dead.
    pub fn resolve(&self, key: &[u8]) -> Vec<usize> {
        self.resolve_at(key, Instant::now())
    }

    /// [`ServerPool::resolve`] against an explicit clock.
    pub fn resolve_at(&self, key: &[u8], now: Instant) -> Vec<usize> {
        let alive = self.alive_at(now);
        let alive_count = alive.iter().filter(|x| **x).count();
        if alive_count == 0 {
            return Vec::new();
        }

        let h = hash_key(key);
        let start = self.ring.partition_point(|&(point, _)| point < h);
        let mut order = Vec::with_capacity(alive_count);
        for &(_, idx) in self.ring[start..].iter().chain(&self.ring[..start]) {
            if alive[idx] && !order.contains(&idx) {
                order.push(idx);
                if order.len() == alive_count {
                    break;
                }
            }
        }
        order
    }

    /// Indices of every server currently eligible for traffic.
    pub fn alive_servers(&self) -> Vec<usize> {
        self.alive_at(Instant::now())
            .into_iter()
            .enumerate()
            .filter_map(|(idx, alive)| alive.then_some(idx))
            .collect()
    }

    pub fn is_alive(&self, idx: usize) -> bool {
        self.health()[idx].dead_since.is_none()
    }

    /// Takes a server out of rotation until the retry interval has passed.
    pub fn mark_dead(&self, idx: usize) {
        self.mark_dead_at(idx, Instant::now())
    }

    /// Marks a server dead as of `now`. Marking an already dead server
    /// restarts its retry interval.
    pub fn mark_dead_at(&self, idx: usize, now: Instant) {
        let mut health = self.health();
        if health[idx].dead_since.is_none() {
            tracing::warn!(
                server = %self.servers[idx].addr,
                retry_in = ?self.dead_retry_interval,
                "marking server dead"
            );
        }
        health[idx].dead_since = Some(now);
    }

    /// Snapshot of which servers may be tried at `now`. Dead servers whose
    /// retry interval has elapsed are flipped back to alive; the next request
    /// sent to them is the probe.
    fn alive_at(&self, now: Instant) -> Vec<bool> {
        let mut health = self.health();
        health
            .iter_mut()
            .enumerate()
            .map(|(idx, h)| match h.dead_since {
                None => true,
                Some(since) if now.saturating_duration_since(since) > self.dead_retry_interval => {
                    tracing::info!(server = %self.servers[idx].addr, "retrying dead server");
                    h.dead_since = None;
                    true
                }
                Some(_) => false,
            })
            .collect()
    }

    fn health(&self) -> MutexGuard<'_, Vec<Health>> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
