use std::collections::HashMap;
use std::sync::Mutex;

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use huddle_core::config::SESSION_KEY_LEN;

use crate::error::{KeystoreError, Result};

const MEDIA_KEY_INFO: &[u8] = b"media";

/// Handle for removing a previously registered change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ChangeListener = Box<dyn Fn(u32) + Send>;

struct SessionKey {
    index: u32,
    key: Zeroizing<Vec<u8>>,
    /// Wall clock (ms) the key was installed or became current.
    updated_ts: u64,
}

#[derive(Default)]
struct Inner {
    salt: Vec<u8>,
    current: Option<SessionKey>,
    next: Option<SessionKey>,
    /// Highest index ever installed in this call; generation bumps derive
    /// from it even after rotation discarded the key itself.
    max_index: u32,
    has_max: bool,
    decrypt_attempted: bool,
    decrypt_successful: bool,
    media_key_cache: HashMap<u32, Zeroizing<Vec<u8>>>,
}

/// Session-key store for one call.
///
/// Invariant: the store holds {}, {current}, or {current, next}, and
/// `current.index < next.index` whenever both are present.
pub struct KeyStore {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    listener_seq: Mutex<u64>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            listeners: Mutex::new(Vec::new()),
            listener_seq: Mutex::new(0),
        }
    }

    /// Set the HKDF salt for media-key derivation. Safe to call repeatedly;
    /// only the derivation cache is reset.
    pub fn set_salt(&self, salt: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.salt = salt.to_vec();
        inner.media_key_cache.clear();
    }

    /// Install a freshly generated session key. Keygenerator path only: the
    /// index must be strictly above every index this call has seen, and the
    /// SFT entropy is mixed into the stored key material.
    pub fn set_fresh_session_key(
        &self,
        index: u32,
        key: &[u8],
        entropy: &[u8],
        now_ms: u64,
    ) -> Result<()> {
        if key.len() != SESSION_KEY_LEN {
            return Err(KeystoreError::InvalidKeyLength(key.len()));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.has_max && index <= inner.max_index {
            return Err(KeystoreError::IndexTooLow {
                index,
                max: inner.max_index,
            });
        }

        let mixed = mix_entropy(key, entropy);
        info!(index, entropy_len = entropy.len(), "installing fresh session key");
        let first = inner.current.is_none();
        install(&mut inner, index, mixed, now_ms);
        drop(inner);

        if first {
            self.notify_current(index);
        }
        Ok(())
    }

    /// Install an externally supplied session key (CONFKEY response or MLS
    /// epoch key). Re-installing a known index with identical bytes returns
    /// `AlreadyKnown`; different bytes for a known index is a hard conflict.
    pub fn set_session_key(&self, index: u32, key: &[u8], now_ms: u64) -> Result<()> {
        if key.len() != SESSION_KEY_LEN {
            return Err(KeystoreError::InvalidKeyLength(key.len()));
        }

        let mut inner = self.inner.lock().unwrap();
        for slot in [&inner.current, &inner.next].into_iter().flatten() {
            if slot.index == index {
                return if slot.key.as_slice() == key {
                    Err(KeystoreError::AlreadyKnown)
                } else {
                    Err(KeystoreError::KeyConflict { index })
                };
            }
        }

        if let Some(current) = &inner.current {
            if index < current.index {
                return Err(KeystoreError::StaleIndex {
                    index,
                    current: current.index,
                });
            }
        }

        debug!(index, "installing session key");
        let first = inner.current.is_none();
        install(&mut inner, index, Zeroizing::new(key.to_vec()), now_ms);
        drop(inner);

        if first {
            self.notify_current(index);
        }
        Ok(())
    }

    /// Index and install time of the current key.
    pub fn current(&self) -> Result<(u32, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .current
            .as_ref()
            .map(|k| (k.index, k.updated_ts))
            .ok_or(KeystoreError::NoKey)
    }

    /// Current key material for a CONFKEY response.
    pub fn current_key(&self) -> Result<(u32, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .current
            .as_ref()
            .map(|k| (k.index, k.key.to_vec()))
            .ok_or(KeystoreError::NoKey)
    }

    /// Next (pre-distributed) key material, if any.
    pub fn next_key(&self) -> Result<(u32, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .next
            .as_ref()
            .map(|k| (k.index, k.key.to_vec()))
            .ok_or(KeystoreError::NoKey)
    }

    /// Promote next → current. Noop when no next key is staged.
    pub fn rotate(&self, now_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut next) = inner.next.take() else {
            return;
        };
        next.updated_ts = now_ms;
        let index = next.index;
        info!(index, "rotating session key");
        inner.current = Some(next);
        drop(inner);
        self.notify_current(index);
    }

    /// Promote next → current when the current key is older than
    /// `threshold_ms`. Returns whether a staged key remains, so the caller
    /// can re-arm its rotation timer.
    pub fn rotate_by_time(&self, threshold_ms: u64, now_ms: u64) -> bool {
        let mut rotated = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let due = matches!(
                (&inner.current, &inner.next),
                (Some(current), Some(_)) if current.updated_ts < threshold_ms
            );
            if due {
                let mut next = inner.next.take().expect("next checked above");
                next.updated_ts = now_ms;
                rotated = Some(next.index);
                inner.current = Some(next);
            }
        }
        if let Some(index) = rotated {
            info!(index, "rotating session key by age");
            self.notify_current(index);
        }
        self.inner.lock().unwrap().next.is_some()
    }

    /// Fast-forward the current pointer to `index` if a staged key covers
    /// it. Used when the roster's minimum usable epoch is ahead of us.
    pub fn set_current(&self, index: u32, now_ms: u64) {
        let mut promoted = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let promote = matches!(&inner.next, Some(next) if next.index <= index);
            if promote {
                let mut next = inner.next.take().expect("next checked above");
                next.updated_ts = now_ms;
                promoted = Some(next.index);
                inner.current = Some(next);
            }
        }
        if let Some(index) = promoted {
            info!(index, "fast-forwarding current key");
            self.notify_current(index);
        }
    }

    pub fn has_keys(&self) -> bool {
        self.inner.lock().unwrap().current.is_some()
    }

    /// Highest key index this call has installed.
    pub fn max_key_index(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        if inner.has_max {
            inner.max_index
        } else {
            0
        }
    }

    /// Decrypt liveness: (attempted, successful). Set by the media path,
    /// read by the controller's decrypt-check timer.
    pub fn decrypt_states(&self) -> (bool, bool) {
        let inner = self.inner.lock().unwrap();
        (inner.decrypt_attempted, inner.decrypt_successful)
    }

    pub fn mark_decrypt_attempted(&self) {
        self.inner.lock().unwrap().decrypt_attempted = true;
    }

    pub fn mark_decrypt_successful(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.decrypt_attempted = true;
        inner.decrypt_successful = true;
    }

    /// Derive the 32-byte media key for the given installed index:
    /// HKDF-SHA256(ikm = session key, salt = conversation hash).
    pub fn media_key(&self, index: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cached) = inner.media_key_cache.get(&index) {
            return Ok(cached.to_vec());
        }

        let session_key = [&inner.current, &inner.next]
            .into_iter()
            .flatten()
            .find(|k| k.index == index)
            .map(|k| k.key.clone())
            .ok_or(KeystoreError::NoKey)?;

        let hk = Hkdf::<Sha256>::new(Some(&inner.salt), &session_key);
        let mut okm = Zeroizing::new(vec![0u8; SESSION_KEY_LEN]);
        hk.expand(MEDIA_KEY_INFO, &mut okm)
            .map_err(|_| KeystoreError::InvalidKeyLength(SESSION_KEY_LEN))?;

        let out = okm.to_vec();
        inner.media_key_cache.insert(index, okm);
        Ok(out)
    }

    /// Discard all state including salt and liveness flags.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
    }

    /// Discard only key material; the salt and listener set survive.
    pub fn reset_keys(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.current = None;
        inner.next = None;
        inner.max_index = 0;
        inner.has_max = false;
        inner.decrypt_attempted = false;
        inner.decrypt_successful = false;
        inner.media_key_cache.clear();
    }

    /// Register a callback fired with the new index whenever the current key
    /// changes, so SRTP contexts can be re-derived.
    pub fn add_listener(&self, listener: impl Fn(u32) + Send + 'static) -> ListenerId {
        let mut seq = self.listener_seq.lock().unwrap();
        *seq += 1;
        let id = *seq;
        self.listeners
            .lock()
            .unwrap()
            .push((id, Box::new(listener)));
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id.0);
    }

    fn notify_current(&self, index: u32) {
        let listeners = self.listeners.lock().unwrap();
        for (_, listener) in listeners.iter() {
            listener(index);
        }
    }
}

/// Place a key into current (first key) or next (subsequent), tracking the
/// maximum index seen.
fn install(inner: &mut Inner, index: u32, key: Zeroizing<Vec<u8>>, now_ms: u64) {
    let entry = SessionKey {
        index,
        key,
        updated_ts: now_ms,
    };
    if !inner.has_max || index > inner.max_index {
        inner.max_index = index;
        inner.has_max = true;
    }
    if inner.current.is_none() {
        inner.current = Some(entry);
        return;
    }
    match &inner.next {
        Some(next) if next.index >= index => {
            warn!(index, staged = next.index, "ignoring key below staged next");
        }
        _ => inner.next = Some(entry),
    }
}

/// Mix SFT-contributed entropy into a locally generated key so the SFT
/// contributes to freshness but cannot predict keys alone.
fn mix_entropy(key: &[u8], entropy: &[u8]) -> Zeroizing<Vec<u8>> {
    if entropy.is_empty() {
        return Zeroizing::new(key.to_vec());
    }
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(entropy);
    Zeroizing::new(hasher.finalize().to_vec())
}
