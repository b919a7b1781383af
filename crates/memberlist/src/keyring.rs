use crate::error::{MemberError, MemberResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
enum AeadKey {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl AeadKey {
    fn new(key: &[u8]) -> MemberResult<Self> {
        match key.len() {
            16 => Ok(AeadKey::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|_| MemberError::Crypto)?,
            ))),
            32 => Ok(AeadKey::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| MemberError::Crypto)?,
            ))),
            n => Err(MemberError::InvalidKeyLength(n)),
        }
    }

    fn encrypt(&self, nonce: &Nonce, payload: Payload) -> MemberResult<Vec<u8>> {
        let result = match self {
            AeadKey::Aes128(c) => c.encrypt(nonce, payload),
            AeadKey::Aes256(c) => c.encrypt(nonce, payload),
        };
        result.map_err(|_| MemberError::Crypto)
    }

    fn decrypt(&self, nonce: &Nonce, payload: Payload) -> MemberResult<Vec<u8>> {
        let result = match self {
            AeadKey::Aes128(c) => c.decrypt(nonce, payload),
            AeadKey::Aes256(c) => c.decrypt(nonce, payload),
        };
        result.map_err(|_| MemberError::Crypto)
    }
}

struct Entry {
    raw: Vec<u8>,
    aead: AeadKey,
}

/// An ordered list of symmetric keys. Index 0 ("primary") is
/// used to encrypt; every installed key is tried on decrypt so gossip from
/// peers mid-rotation still verifies. Mutation (install/use/remove) is
/// serialized behind a single mutex, held only during key selection.
#[derive(Clone)]
pub struct Keyring {
    inner: Arc<Mutex<Vec<Entry>>>,
}

impl Keyring {
    pub fn new(keys: Vec<Vec<u8>>) -> MemberResult<Self> {
        let mut entries = Vec::with_capacity(keys.len());
        for k in keys {
            let aead = AeadKey::new(&k)?;
            entries.push(Entry { raw: k, aead });
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(entries)),
        })
    }

    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Install-Key: append if absent, never changes the primary.
    pub fn install_key(&self, key: Vec<u8>) -> MemberResult<()> {
        let aead = AeadKey::new(&key)?;
        let mut g = self.inner.lock();
        if g.iter().any(|e| e.raw == key) {
            return Ok(());
        }
        g.push(Entry { raw: key, aead });
        Ok(())
    }

    /// Use-Key: move an already-installed key to index 0, making it primary.
    pub fn use_key(&self, key: &[u8]) -> MemberResult<()> {
        let mut g = self.inner.lock();
        let pos = g.iter().position(|e| e.raw == key).ok_or(MemberError::UnknownKey)?;
        let entry = g.remove(pos);
        g.insert(0, entry);
        Ok(())
    }

    /// Remove-Key: the primary key can never be removed.
    pub fn remove_key(&self, key: &[u8]) -> MemberResult<()> {
        let mut g = self.inner.lock();
        if g.first().map(|e| e.raw.as_slice()) == Some(key) {
            return Err(MemberError::CannotRemovePrimaryKey);
        }
        g.retain(|e| e.raw != key);
        Ok(())
    }

    pub fn list_keys(&self) -> Vec<Vec<u8>> {
        self.inner.lock().iter().map(|e| e.raw.clone()).collect()
    }

    /// Encrypts with the primary key. AAD is `type_tag || version`;
    /// since `version` is determined by which cipher the primary key
    /// selects, the caller supplies only `type_tag` and this method builds
    /// the full AAD itself so the two can never disagree.
    pub fn encrypt(&self, plaintext: &[u8], type_tag: u8) -> MemberResult<(u8, Vec<u8>, Vec<u8>)> {
        let g = self.inner.lock();
        let primary = g.first().ok_or(MemberError::EmptyKeyring)?;
        let version = if matches!(primary.aead, AeadKey::Aes256(_)) { 1 } else { 0 };
        let aad = [type_tag, version];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = primary.aead.encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )?;
        Ok((version, nonce_bytes.to_vec(), ct))
    }

    /// Decrypts trying every installed key (all keys are accepted for
    /// decryption"), primary first.
    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> MemberResult<Vec<u8>> {
        let g = self.inner.lock();
        if g.is_empty() {
            return Err(MemberError::EmptyKeyring);
        }
        let nonce = Nonce::from_slice(nonce);
        for entry in g.iter() {
            if let Ok(pt) = entry.aead.decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            ) {
                return Ok(pt);
            }
        }
        Err(MemberError::Crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_encrypt_decrypt() {
        let kr = Keyring::new(vec![vec![1u8; 16]]).unwrap();
        let (version, nonce, ct) = kr.encrypt(b"hello", 4).unwrap();
        let pt = kr.decrypt(&nonce, &ct, &[4, version]).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn accepts_any_installed_key_on_decrypt() {
        let kr = Keyring::new(vec![vec![1u8; 32]]).unwrap();
        let (version, nonce, ct) = kr.encrypt(b"payload", 4).unwrap();
        kr.install_key(vec![2u8; 32]).unwrap();
        kr.use_key(&vec![2u8; 32]).unwrap();
        // old ciphertext, encrypted under key 1, must still decrypt.
        let pt = kr.decrypt(&nonce, &ct, &[4, version]).unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(Keyring::new(vec![vec![0u8; 7]]).is_err());
    }

    #[test]
    fn cannot_remove_primary() {
        let kr = Keyring::new(vec![vec![1u8; 16], vec![2u8; 16]]).unwrap();
        assert!(kr.remove_key(&[1u8; 16]).is_err());
        kr.remove_key(&[2u8; 16]).unwrap();
    }
}
