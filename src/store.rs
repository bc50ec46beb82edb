use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// 持久化键值存储契约
///
/// 实际的存储服务是外部协作方（带 TTL 的映射服务）。框架只依赖本契约：
/// 按 Bot 维度的主人集合、按平台维度的句柄到数字 ID 的映射、跨次运行的计数器。
/// 实现必须允许任意数量的更新处理任务并发调用。
#[async_trait]
pub trait Store: Send + Sync {
    /// 向集合添加成员
    async fn sadd(&self, key: &str, member: i64) -> Result<(), StoreError>;

    /// 从集合移除成员
    async fn srem(&self, key: &str, member: i64) -> Result<(), StoreError>;

    /// 成员是否在集合中
    async fn sismember(&self, key: &str, member: i64) -> Result<bool, StoreError>;

    /// 写入散列字段
    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), StoreError>;

    /// 读取散列字段
    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError>;

    /// 自增计数器并返回新值
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// 设置键的存活时间，到期后键被回收
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    sets: HashMap<String, HashSet<i64>>,
    hashes: HashMap<String, HashMap<String, i64>>,
    counters: HashMap<String, i64>,
    deadlines: HashMap<String, Instant>,
}

impl MemoryInner {
    /// 惰性回收：访问时检查到期键
    fn purge(&mut self, key: &str) {
        let expired = self
            .deadlines
            .get(key)
            .is_some_and(|deadline| Instant::now() >= *deadline);
        if expired {
            self.deadlines.remove(key);
            self.sets.remove(key);
            self.hashes.remove(key);
            self.counters.remove(key);
        }
    }
}

/// 进程内存储实现
///
/// 默认实现，也用于测试。不跨进程持久化，满足契约的并发与 TTL 语义。
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn sadd(&self, key: &str, member: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        inner.sets.entry(key.to_string()).or_default().insert(member);
        Ok(())
    }

    async fn srem(&self, key: &str, member: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(&member);
        }
        Ok(())
    }

    async fn sismember(&self, key: &str, member: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner.sets.get(key).is_some_and(|s| s.contains(&member)))
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner.hashes.get(key).and_then(|h| h.get(field).copied()))
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.deadlines.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }
}
