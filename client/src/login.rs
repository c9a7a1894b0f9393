//! Client half of the login handshake
//!
//! With key id 0 the gate hands back `secret_key_seed` in the clear and the
//! session keystream is derived from it in normal mode. With any other key
//! id the client encrypts a random seed under that key, the gate answers
//! with the combined seed encrypted under the same key and signed with its
//! signing key, and the keystream is derived in magic mode.

use crate::error::ClientError;
use crate::network::GateClient;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use log::{debug, info};
use prost::Message;
use rand::Rng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use shared::proto::{cmd, GetPlayerTokenReq, GetPlayerTokenRsp, PingReq, PlayerLoginReq, PlayerLoginRsp};
use shared::{Keystream, Retcode, SeedMode};
use std::path::Path;
use std::time::Duration;

/// Key material for a non-zero key id
pub struct SeedKeys {
    pub key_id: u32,
    /// Key pair of `key_id`, shipped with the client build
    pub key: RsaPrivateKey,
    /// Gate signing key; the signature is not checked when absent
    pub signing: Option<RsaPublicKey>,
}

impl SeedKeys {
    pub fn load(key_id: u32, key_file: &Path, signing_file: Option<&Path>) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(key_file)?;
        let key = RsaPrivateKey::from_pkcs1_pem(&text)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&text))
            .map_err(|e| ClientError::KeyFile(format!("{}: {}", key_file.display(), e)))?;

        let signing = match signing_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let public = RsaPublicKey::from_pkcs1_pem(&text)
                    .or_else(|_| RsaPublicKey::from_public_key_pem(&text))
                    .map_err(|e| ClientError::KeyFile(format!("{}: {}", path.display(), e)))?;
                Some(public)
            }
            None => None,
        };
        Ok(Self { key_id, key, signing })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub account_uid: String,
    pub account_token: String,
    pub platform_type: u32,
    pub channel_id: u32,
}

impl GateClient {
    /// Sends `GetPlayerTokenReq` and, on success, switches to the negotiated keystream
    ///
    /// A refusal is not an error: the response comes back with its retcode and
    /// the keystream is left alone.
    pub async fn request_token(
        &mut self,
        credentials: &Credentials,
        keys: Option<&SeedKeys>,
        timeout: Duration,
    ) -> Result<GetPlayerTokenRsp, ClientError> {
        let mut req = GetPlayerTokenReq {
            account_type: 1,
            account_uid: credentials.account_uid.clone(),
            account_token: credentials.account_token.clone(),
            platform_type: credentials.platform_type,
            channel_id: credentials.channel_id,
            ..Default::default()
        };

        let mut client_seed = 0u64;
        if let Some(keys) = keys {
            client_seed = rand::thread_rng().gen();
            let cipher = keys
                .key
                .to_public_key()
                .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &client_seed.to_be_bytes())?;
            req.key_id = keys.key_id;
            req.client_rand_key = Base64.encode(cipher);
        }

        self.send_message(cmd::GET_PLAYER_TOKEN_REQ, &req).await?;
        let frame = self.recv_cmd(cmd::GET_PLAYER_TOKEN_RSP, timeout).await?;
        let rsp = GetPlayerTokenRsp::decode(frame.body.as_slice())?;

        if rsp.retcode != Retcode::Succ.code() {
            info!("Token request refused with retcode {} ({})", rsp.retcode, rsp.msg);
            return Ok(rsp);
        }

        let keystream = match keys {
            None => Keystream::derive(rsp.secret_key_seed, SeedMode::Normal),
            Some(keys) => {
                let combined = open_server_seed(keys, &rsp.server_rand_key, &rsp.sign)?;
                debug!("Server seed half is {:#018x}", combined ^ client_seed);
                Keystream::derive(combined, SeedMode::Magic)
            }
        };
        self.set_keystream(keystream);
        info!("Logged in as uid {}", rsp.uid);
        Ok(rsp)
    }

    /// Sends `PlayerLoginReq` and waits for the worker's answer
    pub async fn login(&mut self, token: &str, uid: u32, timeout: Duration) -> Result<PlayerLoginRsp, ClientError> {
        let req = PlayerLoginReq {
            token: token.to_string(),
            target_uid: uid,
            ..Default::default()
        };
        self.send_message(cmd::PLAYER_LOGIN_REQ, &req).await?;
        let frame = self.recv_cmd(cmd::PLAYER_LOGIN_RSP, timeout).await?;
        Ok(PlayerLoginRsp::decode(frame.body.as_slice())?)
    }

    pub async fn ping(&mut self, seq: u32) -> Result<u32, ClientError> {
        let req = PingReq {
            client_time: shared::now_ms() as u32,
            seq,
        };
        self.send_message(cmd::PING_REQ, &req).await
    }
}

fn open_server_seed(keys: &SeedKeys, server_rand_key: &str, sign: &str) -> Result<u64, ClientError> {
    let cipher = Base64.decode(server_rand_key.trim())?;
    let mut plain = Vec::new();
    for part in cipher.chunks(keys.key.size()) {
        plain.extend(keys.key.decrypt(Pkcs1v15Encrypt, part)?);
    }

    if let Some(signing) = &keys.signing {
        let signature = Base64.decode(sign.trim())?;
        let digest = Sha256::digest(&plain);
        signing
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|_| ClientError::BadSignature)?;
    }

    let bytes: [u8; 8] = plain
        .as_slice()
        .try_into()
        .map_err(|_| ClientError::BadSeedLength(plain.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
    }

    fn seal(key: &RsaPrivateKey, seed: u64) -> (String, String) {
        let plain = seed.to_be_bytes();
        let cipher = key
            .to_public_key()
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &plain)
            .unwrap();
        let digest = Sha256::digest(plain);
        let sign = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        (Base64.encode(cipher), Base64.encode(sign))
    }

    #[test]
    fn test_open_server_seed_verifies_signature() {
        let keys = SeedKeys {
            key_id: 3,
            key: key().clone(),
            signing: Some(key().to_public_key()),
        };
        let (cipher, sign) = seal(key(), 0x0102_0304_0506_0708);
        assert_eq!(open_server_seed(&keys, &cipher, &sign).unwrap(), 0x0102_0304_0506_0708);

        let (_, other_sign) = seal(key(), 99);
        assert!(matches!(
            open_server_seed(&keys, &cipher, &other_sign),
            Err(ClientError::BadSignature)
        ));
    }

    #[test]
    fn test_open_server_seed_without_signing_key() {
        let keys = SeedKeys {
            key_id: 3,
            key: key().clone(),
            signing: None,
        };
        let (cipher, _) = seal(key(), 42);
        assert_eq!(open_server_seed(&keys, &cipher, "").unwrap(), 42);
    }
}
