//! Cryptographic primitives of the login exchange
//!
//! ### Identity signature
//! Requests to the identity service are signed with HMAC-SHA-256 over
//! `app_id=1&channel_id=1&combo_token={token}&open_id={uid}`, hex encoded.
//!
//! ### Seed exchange
//! Each key id names an RSA key pair shared with the client build. The client
//! seed arrives RSA-encrypted under that key; the combined seed goes back
//! encrypted under the same key and signed (PKCS#1 v1.5, SHA-256) with the
//! gateway's signing key. Plaintexts longer than one block are split into
//! `modulus - 11` byte chunks, ciphertexts into modulus-sized chunks.
//!
//! The keystream that results is whitening only. It gives the frames no
//! confidentiality; the RSA operations above are the only real cryptography.

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::{Rng, SeedableRng};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

const PKCS1_PADDING: usize = 11;
const SIGNING_KEY_FILE: &str = "signing.pem";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("cannot load key {path}: {reason}")]
    KeyFile { path: String, reason: String },
    #[error("decrypted seed has {0} bytes, expected 8")]
    BadSeedLength(usize),
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("invalid hmac key")]
    HmacKey,
}

/// Hex HMAC-SHA-256 signature of an identity verification request
pub fn sdk_sign(secret: &str, token: &str, open_id: &str) -> Result<String, CryptoError> {
    let content = format!(
        "app_id=1&channel_id=1&combo_token={}&open_id={}",
        token, open_id
    );
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| CryptoError::HmacKey)?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn rsa_encrypt(public: &RsaPublicKey, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let chunk = public.size() - PKCS1_PADDING;
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(plain.len().div_ceil(chunk) * public.size());
    for part in plain.chunks(chunk) {
        out.extend(public.encrypt(&mut rng, Pkcs1v15Encrypt, part)?);
    }
    Ok(out)
}

pub fn rsa_decrypt(private: &RsaPrivateKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if cipher.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }
    let mut out = Vec::new();
    for part in cipher.chunks(private.size()) {
        out.extend(private.decrypt(Pkcs1v15Encrypt, part)?);
    }
    Ok(out)
}

pub fn rsa_sign(private: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(message);
    Ok(private.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
}

pub fn rsa_verify(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

/// Key pairs indexed by key id, plus the signing key
pub struct RsaKeyring {
    keys: HashMap<u32, RsaPrivateKey>,
    signing: RsaPrivateKey,
}

impl std::fmt::Debug for RsaKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("RsaKeyring").field("key_ids", &ids).finish()
    }
}

fn load_pem(path: &Path) -> Result<RsaPrivateKey, CryptoError> {
    let key_err = |reason: String| CryptoError::KeyFile {
        path: path.display().to_string(),
        reason,
    };
    let pem = std::fs::read_to_string(path).map_err(|e| key_err(e.to_string()))?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|e| key_err(e.to_string()))
}

impl RsaKeyring {
    pub fn new(keys: HashMap<u32, RsaPrivateKey>, signing: RsaPrivateKey) -> Self {
        Self { keys, signing }
    }

    /// Loads `{key_id}.pem` files and `signing.pem` from a directory
    ///
    /// PKCS#1 and PKCS#8 PEM are both accepted. Files whose stem is not a
    /// number are skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, CryptoError> {
        let signing = load_pem(&dir.join(SIGNING_KEY_FILE))?;

        let entries = std::fs::read_dir(dir).map_err(|e| CryptoError::KeyFile {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut keys = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(key_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            keys.insert(key_id, load_pem(&path)?);
        }

        log::info!("Loaded {} rsa key pairs from {}", keys.len(), dir.display());
        Ok(Self { keys, signing })
    }

    pub fn has_key(&self, key_id: u32) -> bool {
        self.keys.contains_key(&key_id)
    }

    pub fn signing_public(&self) -> RsaPublicKey {
        self.signing.to_public_key()
    }

    /// Decrypts the base64 `client_rand_key` into a big-endian u64
    pub fn decrypt_client_seed(&self, key_id: u32, client_rand_key: &str) -> Result<u64, CryptoError> {
        let private = self.key(key_id)?;
        let cipher = Base64.decode(client_rand_key.trim())?;
        let plain = rsa_decrypt(private, &cipher)?;
        let bytes: [u8; 8] = plain
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BadSeedLength(plain.len()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Encrypts and signs the combined seed; returns both as base64
    pub fn seal_seed(&self, key_id: u32, seed: u64) -> Result<(String, String), CryptoError> {
        let private = self.key(key_id)?;
        let plain = seed.to_be_bytes();
        let encrypted = rsa_encrypt(&private.to_public_key(), &plain)?;
        let signature = rsa_sign(&self.signing, &plain)?;
        Ok((Base64.encode(encrypted), Base64.encode(signature)))
    }

    fn key(&self, key_id: u32) -> Result<&RsaPrivateKey, CryptoError> {
        self.keys.get(&key_id).ok_or_else(|| CryptoError::KeyFile {
            path: format!("{}.pem", key_id),
            reason: "no key pair for this id".to_string(),
        })
    }
}

/// Server half of the seed exchange, derived from the clock
pub fn time_seed() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    rand::rngs::StdRng::seed_from_u64(nanos).gen()
}

/// Opaque `%03x-%012x` cookie used for `secret_key` and the version key
pub fn random_cookie() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:03x}-{:012x}",
        rng.gen_range(0..0x1000u32),
        rng.gen_range(0..(1u64 << 48))
    )
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill(buf.as_mut_slice());
    buf
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
    use std::sync::OnceLock;

    pub(crate) fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
    }

    pub(crate) fn keyring() -> RsaKeyring {
        let mut keys = HashMap::new();
        keys.insert(3, test_key().clone());
        RsaKeyring::new(keys, test_key().clone())
    }

    #[test]
    fn test_sdk_sign_is_stable_hex() {
        let a = sdk_sign("secret", "t", "u").unwrap();
        let b = sdk_sign("secret", "t", "u").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, sdk_sign("other", "t", "u").unwrap());
    }

    #[test]
    fn test_sign_then_verify() {
        let key = test_key();
        let sig = rsa_sign(key, b"combined seed").unwrap();
        assert!(rsa_verify(&key.to_public_key(), b"combined seed", &sig));
        assert!(!rsa_verify(&key.to_public_key(), b"other message", &sig));
    }

    #[test]
    fn test_encrypt_splits_long_plaintext() {
        let key = test_key();
        let plain: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let cipher = rsa_encrypt(&key.to_public_key(), &plain).unwrap();
        // 117-byte chunks at 1024 bits: three blocks
        assert_eq!(cipher.len(), 3 * 128);
        assert_eq!(rsa_decrypt(key, &cipher).unwrap(), plain);
    }

    #[test]
    fn test_client_seed_exchange() {
        let ring = keyring();
        let client_seed = 0x0123_4567_89AB_CDEFu64;
        let cipher = rsa_encrypt(&test_key().to_public_key(), &client_seed.to_be_bytes()).unwrap();

        let decoded = ring.decrypt_client_seed(3, &Base64.encode(cipher)).unwrap();
        assert_eq!(decoded, client_seed);

        let (encrypted, sign) = ring.seal_seed(3, decoded ^ 42).unwrap();
        let plain = rsa_decrypt(test_key(), &Base64.decode(encrypted).unwrap()).unwrap();
        assert_eq!(plain, (client_seed ^ 42).to_be_bytes());
        assert!(rsa_verify(
            &ring.signing_public(),
            &plain,
            &Base64.decode(sign).unwrap()
        ));
    }

    #[test]
    fn test_unknown_key_id() {
        let ring = keyring();
        assert!(!ring.has_key(9));
        assert!(ring.seal_seed(9, 1).is_err());
    }

    #[test]
    fn test_wrong_seed_length() {
        let ring = keyring();
        let cipher = rsa_encrypt(&test_key().to_public_key(), &[1, 2, 3]).unwrap();
        let err = ring.decrypt_client_seed(3, &Base64.encode(cipher)).unwrap_err();
        assert!(matches!(err, CryptoError::BadSeedLength(3)));
    }

    #[test]
    fn test_load_dir() {
        let dir = std::env::temp_dir().join(format!("gate-keys-{}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let pem = test_key().to_pkcs1_pem(LineEnding::LF).unwrap();
        std::fs::write(dir.join("signing.pem"), pem.as_bytes()).unwrap();
        std::fs::write(dir.join("5.pem"), pem.as_bytes()).unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let ring = RsaKeyring::load_dir(&dir).unwrap();
        assert!(ring.has_key(5));
        assert!(!ring.has_key(3));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cookie_format() {
        let cookie = random_cookie();
        let (a, b) = cookie.split_once('-').unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 12);
        assert!(a.chars().chain(b.chars()).all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_random_bytes_len() {
        assert_eq!(random_bytes(32).len(), 32);
    }
}
