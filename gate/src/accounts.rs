//! `account_uid -> uid` mapping
//!
//! Accounts are created on first login with a uid from the discovery
//! allocator. A forbidden account carries the end of its ban in Unix seconds;
//! zero means the ban never ends.

use crate::error::GateError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Ban end reported for forbidden accounts without one (2100-01-01)
pub const FOREVER_END_TIME: u32 = 4_102_444_800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_uid: String,
    pub uid: u32,
    #[serde(default)]
    pub forbid: bool,
    #[serde(default)]
    pub forbid_end_time: u32,
}

impl Account {
    pub fn new(account_uid: &str, uid: u32) -> Self {
        Self {
            account_uid: account_uid.to_string(),
            uid,
            forbid: false,
            forbid_end_time: 0,
        }
    }

    /// End of an active ban at `now`, if the account is banned
    pub fn ban_end(&self, now: u32) -> Option<u32> {
        if !self.forbid {
            return None;
        }
        let end = if self.forbid_end_time == 0 {
            FOREVER_END_TIME
        } else {
            self.forbid_end_time
        };
        (end > now).then_some(end)
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find(&self, account_uid: &str) -> Result<Option<Account>, GateError>;

    async fn insert(&self, account: &Account) -> Result<(), GateError>;
}

pub struct RedisAccountStore {
    client: redis::Client,
}

impl RedisAccountStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

fn account_key(account_uid: &str) -> String {
    format!("gate:account:{}", account_uid)
}

#[async_trait]
impl AccountStore for RedisAccountStore {
    async fn find(&self, account_uid: &str) -> Result<Option<Account>, GateError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw = redis::cmd("GET")
            .arg(account_key(account_uid))
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, account: &Account) -> Result<(), GateError> {
        let json = serde_json::to_string(account)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("SET")
            .arg(account_key(&account.account_uid))
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bans an existing account; `end_time` 0 bans forever
    pub fn forbid(&self, account_uid: &str, end_time: u32) -> bool {
        match self.lock().get_mut(account_uid) {
            Some(account) => {
                account.forbid = true;
                account.forbid_end_time = end_time;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find(&self, account_uid: &str) -> Result<Option<Account>, GateError> {
        Ok(self.lock().get(account_uid).cloned())
    }

    async fn insert(&self, account: &Account) -> Result<(), GateError> {
        self.lock()
            .insert(account.account_uid.clone(), account.clone());
        Ok(())
    }
}
