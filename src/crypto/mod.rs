use crate::{NocturneError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use sha2::{Digest, Sha256};

pub const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Generate cryptographically secure random bytes
pub fn secure_random(bytes: &mut [u8]) {
    OsRng.fill_bytes(bytes);
}

/// Generate a fresh per-agent session key. Set exactly once at agent
/// creation; all traffic for that agent uses this key.
pub fn generate_session_key() -> Vec<u8> {
    let mut key = vec![0u8; SESSION_KEY_LEN];
    secure_random(&mut key);
    key
}

/// Derive a stable agent id from first-beacon key material.
pub fn derive_agent_id(material: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material);
    let digest = hasher.finalize();
    hex_lower(&digest[..8])
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Wrap a payload for one agent: AES-256-GCM, nonce | ciphertext | tag.
pub fn seal(plaintext: &[u8], session_key: &[u8]) -> Result<Vec<u8>> {
    let unbound = UnboundKey::new(&AES_256_GCM, session_key)
        .map_err(|_| NocturneError::Crypto("invalid session key length".into()))?;
    let key = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    secure_random(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| NocturneError::Crypto("seal failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len() + TAG_LEN);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    sealed.extend_from_slice(tag.as_ref());
    Ok(sealed)
}

/// Unwrap a payload. Fails with `AuthenticationFailure` when the tag does
/// not verify: key mismatch, tampering, or traffic for a different agent.
/// The envelope, not the transport, is the trust boundary between agents.
pub fn open(sealed: &[u8], session_key: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(NocturneError::AuthenticationFailure);
    }

    let unbound = UnboundKey::new(&AES_256_GCM, session_key)
        .map_err(|_| NocturneError::Crypto("invalid session key length".into()))?;
    let key = LessSafeKey::new(unbound);

    let (nonce_bytes, rest) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| NocturneError::AuthenticationFailure)?;

    let mut in_out = rest.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| NocturneError::AuthenticationFailure)?;

    Ok(plaintext.to_vec())
}
