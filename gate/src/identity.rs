//! Credential verification against the identity service

use crate::crypto::sdk_sign;
use crate::error::HandshakeError;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Succeeds when the identity service accepts `token` for `account_uid`
    async fn verify(&self, account_uid: &str, token: &str) -> Result<(), HandshakeError>;
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    app_id: u32,
    channel_id: u32,
    open_id: &'a str,
    combo_token: &'a str,
    sign: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    retcode: i32,
    #[serde(default)]
    message: String,
}

pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    url: String,
    account_key: String,
}

impl HttpIdentityVerifier {
    pub fn new(url: &str, account_key: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(VERIFY_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            account_key: account_key.to_string(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, account_uid: &str, token: &str) -> Result<(), HandshakeError> {
        let sign = sdk_sign(&self.account_key, token, account_uid)?;
        let body = VerifyRequest {
            app_id: 1,
            channel_id: 1,
            open_id: account_uid,
            combo_token: token,
            sign,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HandshakeError::IdentityUnavailable(e.to_string()))?;
        let verdict: VerifyResponse = response
            .json()
            .await
            .map_err(|e| HandshakeError::IdentityUnavailable(e.to_string()))?;

        if verdict.retcode != 0 {
            warn!(
                "Identity service rejected account {}: {} ({})",
                account_uid, verdict.retcode, verdict.message
            );
            return Err(HandshakeError::AccountVerify(verdict.retcode));
        }
        debug!("Account {} verified", account_uid);
        Ok(())
    }
}

/// In-process verifier: accepts every credential except rejected accounts
#[derive(Default)]
pub struct LocalIdentityVerifier {
    rejected: Mutex<HashSet<String>>,
}

impl LocalIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, account_uid: &str) {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_uid.to_string());
    }
}

#[async_trait]
impl IdentityVerifier for LocalIdentityVerifier {
    async fn verify(&self, account_uid: &str, _token: &str) -> Result<(), HandshakeError> {
        let rejected = self
            .rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(account_uid);
        if rejected {
            return Err(HandshakeError::AccountVerify(-1));
        }
        Ok(())
    }
}
