//! AEAD sealing helpers, grounded on `wireguard/src/noise/aead.rs`'s
//! `Sealed<T>::seal`/`open` pattern and `voxbrix_protocol`'s server-side
//! `ChaCha20Poly1305::new` handshake use. `spec.md` treats token sealing and
//! per-packet encryption as opaque; this module makes both concrete with
//! `chacha20poly1305`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// 32-byte symmetric key shared by two parties (a token key, or a
/// per-direction client/server traffic key).
pub type SealKey = [u8; 32];

/// Error returned by [`open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to authenticate and decrypt")]
pub struct OpenError;

/// Builds the 12-byte nonce AEAD needs from a 64-bit per-direction packet
/// counter, zero-padded in the high bytes - the same "nonce from a monotonic
/// counter" approach `wireguard::noise::aead` takes from its transport
/// counter.
#[must_use]
pub fn nonce_from_counter(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::clone_from_slice(&bytes)
}

/// Encrypts `plaintext` under `key`, authenticating `aad` alongside it.
/// Returns the ciphertext with its 16-byte authentication tag appended.
#[must_use]
pub fn seal(key: &SealKey, counter: u64, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_from_counter(counter);
    let payload = chacha20poly1305::aead::Payload { msg: plaintext, aad };
    cipher
        .encrypt(&nonce, payload)
        .expect("chacha20poly1305 encryption does not fail for in-range inputs")
}

/// Decrypts and authenticates a blob produced by [`seal`] with the same
/// `key`, `counter`, and `aad`.
///
/// # Errors
///
/// Returns [`OpenError`] if authentication fails (wrong key, tampered bytes,
/// or mismatched `aad`/`counter`).
pub fn open(key: &SealKey, counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, OpenError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_from_counter(counter);
    let payload = chacha20poly1305::aead::Payload { msg: ciphertext, aad };
    cipher.decrypt(&nonce, payload).map_err(|_| OpenError)
}

/// Seals `plaintext` with a freshly generated random nonce, prefixing the
/// nonce onto the returned blob. Used for one-off sealed values (connect and
/// challenge tokens) that are not part of an ordered per-direction stream and
/// so have no natural counter to derive a nonce from.
#[must_use]
pub fn seal_standalone(key: &SealKey, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    use rand::RngCore;
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let payload = chacha20poly1305::aead::Payload { msg: plaintext, aad };
    let ciphertext = cipher
        .encrypt(nonce, payload)
        .expect("chacha20poly1305 encryption does not fail for in-range inputs");

    let mut blob = Vec::with_capacity(12 + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    blob
}

/// Opens a blob produced by [`seal_standalone`] with the same `key`/`aad`.
///
/// # Errors
///
/// Returns [`OpenError`] if `blob` is too short to contain a nonce, or if
/// authentication fails.
pub fn open_standalone(key: &SealKey, aad: &[u8], blob: &[u8]) -> Result<Vec<u8>, OpenError> {
    if blob.len() < 12 {
        return Err(OpenError);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(12);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    let payload = chacha20poly1305::aead::Payload { msg: ciphertext, aad };
    cipher.decrypt(nonce, payload).map_err(|_| OpenError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [7u8; 32];
        let ct = seal(&key, 42, b"channel", b"hello world");
        let pt = open(&key, 42, b"channel", &ct).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn open_rejects_wrong_counter() {
        let key = [7u8; 32];
        let ct = seal(&key, 1, b"", b"payload");
        assert_eq!(open(&key, 2, b"", &ct), Err(OpenError));
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let key = [1u8; 32];
        let mut ct = seal(&key, 0, b"", b"payload");
        *ct.last_mut().unwrap() ^= 0xFF;
        assert_eq!(open(&key, 0, b"", &ct), Err(OpenError));
    }

    #[test]
    fn standalone_round_trip() {
        let key = [3u8; 32];
        let blob = seal_standalone(&key, b"token", b"client-id:7");
        let pt = open_standalone(&key, b"token", &blob).unwrap();
        assert_eq!(pt, b"client-id:7");
    }

    #[test]
    fn standalone_rejects_truncated_blob() {
        let key = [3u8; 32];
        assert_eq!(open_standalone(&key, b"", &[0u8; 4]), Err(OpenError));
    }
}
