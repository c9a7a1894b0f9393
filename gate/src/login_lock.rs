//! Fleet-wide per-account login lock
//!
//! The lock is a key with a TTL set only if absent (`SET NX PX`), holding a
//! random owner token. Release deletes the key only while it still holds
//! that token, so a holder whose TTL ran out cannot free a lock that another
//! login has since taken. A [`LoginLockGuard`] releases explicitly on the
//! happy path and from `Drop` on every other exit.

use crate::error::GateError;
use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[async_trait]
pub trait LoginLock: Send + Sync {
    /// Takes the lock for `owner`; false when another login holds it
    async fn try_lock(&self, account_uid: &str, owner: &str, ttl: Duration) -> Result<bool, GateError>;

    /// Frees the lock if `owner` still holds it; false when it did not
    async fn unlock(&self, account_uid: &str, owner: &str) -> Result<bool, GateError>;
}

fn lock_key(account_uid: &str) -> String {
    format!("gate:login_lock:{}", account_uid)
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisLoginLock {
    client: redis::Client,
}

impl RedisLoginLock {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LoginLock for RedisLoginLock {
    async fn try_lock(&self, account_uid: &str, owner: &str, ttl: Duration) -> Result<bool, GateError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply = redis::cmd("SET")
            .arg(lock_key(account_uid))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, account_uid: &str, owner: &str) -> Result<bool, GateError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted = redis::Script::new(RELEASE_SCRIPT)
            .key(lock_key(account_uid))
            .arg(owner)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

struct Held {
    owner: String,
    expiry: Instant,
}

/// In-memory lock with the same TTL and owner semantics
#[derive(Default)]
pub struct MemoryLoginLock {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLoginLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, account_uid: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(account_uid).is_some_and(|h| h.expiry > Instant::now())
    }
}

#[async_trait]
impl LoginLock for MemoryLoginLock {
    async fn try_lock(&self, account_uid: &str, owner: &str, ttl: Duration) -> Result<bool, GateError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match held.get(account_uid) {
            Some(h) if h.expiry > now => Ok(false),
            _ => {
                let entry = Held {
                    owner: owner.to_string(),
                    expiry: now + ttl,
                };
                held.insert(account_uid.to_string(), entry);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, account_uid: &str, owner: &str) -> Result<bool, GateError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let owned = held
            .get(account_uid)
            .is_some_and(|h| h.owner == owner && h.expiry > Instant::now());
        if owned {
            held.remove(account_uid);
        }
        Ok(owned)
    }
}

/// Holds an acquired lock until released or dropped
pub struct LoginLockGuard {
    lock: Arc<dyn LoginLock>,
    account_uid: String,
    owner: String,
    released: bool,
}

impl LoginLockGuard {
    /// `Ok(None)` means the account is already locked
    pub async fn acquire(
        lock: Arc<dyn LoginLock>,
        account_uid: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, GateError> {
        let owner = format!("{:016x}", rand::thread_rng().gen::<u64>());
        if !lock.try_lock(account_uid, &owner, ttl).await? {
            return Ok(None);
        }
        debug!("Login lock taken for {}", account_uid);
        Ok(Some(Self {
            lock,
            account_uid: account_uid.to_string(),
            owner,
            released: false,
        }))
    }

    pub async fn release(mut self) {
        self.released = true;
        release(self.lock.as_ref(), &self.account_uid, &self.owner).await;
    }
}

async fn release(lock: &dyn LoginLock, account_uid: &str, owner: &str) {
    match lock.unlock(account_uid, owner).await {
        Ok(true) => {}
        Ok(false) => warn!("Login lock for {} expired before release", account_uid),
        Err(e) => warn!("Failed to release login lock for {}: {}", account_uid, e),
    }
}

impl Drop for LoginLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = Arc::clone(&self.lock);
        let account_uid = std::mem::take(&mut self.account_uid);
        let owner = std::mem::take(&mut self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                release(lock.as_ref(), &account_uid, &owner).await;
            });
        }
    }
}
