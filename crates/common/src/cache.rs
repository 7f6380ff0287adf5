//! 带过期时间的本地缓存
//!
//! 用于缓存浏览器轮询结果，减少对存储的重复读取。
//! 过期条目在访问时惰性清理，插入时顺带回收已过期的条目。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// 固定 TTL 的缓存
///
/// 非线程安全，调用方自行加锁
#[derive(Debug)]
pub struct ExpiringCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, (Instant, V)>,
    expirations: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            expirations: BinaryHeap::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<V> {
        match self.entries.get(key) {
            Some((expires_at, value)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert_at(&mut self, key: K, value: V, now: Instant) {
        self.purge_expired(now);
        let expires_at = now + self.ttl;
        self.expirations.push(Reverse((expires_at, key.clone())));
        self.entries.insert(key, (expires_at, value));
    }

    /// 回收截至 `now` 已过期的条目
    pub fn purge_expired(&mut self, now: Instant) {
        while let Some(Reverse((expires_at, _))) = self.expirations.peek() {
            if *expires_at > now {
                break;
            }
            let Some(Reverse((expires_at, key))) = self.expirations.pop() else {
                break;
            };
            // 键被重新插入过时，以 entries 中记录的过期时间为准
            if self
                .entries
                .get(&key)
                .is_some_and(|(current, _)| *current == expires_at)
            {
                self.entries.remove(&key);
            }
        }
    }
}
