//! Frame encryption for the signaling and transport channels
//!
//! A frame on the wire is `message_key (16 bytes) || AES-256-GCM ciphertext`.
//! The message key is the truncated SHA-256 of the sending key part and the
//! plaintext; the per-frame cipher key and nonce are derived from both with
//! HKDF. Since the plaintext begins with the frame counter, every frame gets
//! a distinct message key and therefore a distinct nonce.
//!
//! Sender and receiver select opposite slices of the 256-byte session secret
//! (and the two channels use disjoint regions of it), so a frame reflected
//! back to its sender never authenticates.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use super::error::NetworkError;

/// Size of the preshared session secret
pub const SESSION_KEY_SIZE: usize = 256;

/// Size of the message-key prefix on every frame
pub const MESSAGE_KEY_SIZE: usize = 16;

/// Size of the key part sliced out of the session secret
const KEY_PART_SIZE: usize = 32;

/// The symmetric session secret shared by both endpoints
///
/// `is_outgoing` marks the initiator; it decides which slice of the secret
/// each side encrypts with. Immutable for the lifetime of a call.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: Box<[u8; SESSION_KEY_SIZE]>,
    is_outgoing: bool,
}

impl EncryptionKey {
    pub fn new(bytes: [u8; SESSION_KEY_SIZE], is_outgoing: bool) -> Self {
        Self {
            bytes: Box::new(bytes),
            is_outgoing,
        }
    }

    /// Build a key from a slice; fails unless it is exactly 256 bytes
    pub fn from_slice(bytes: &[u8], is_outgoing: bool) -> Result<Self, NetworkError> {
        let bytes: [u8; SESSION_KEY_SIZE] =
            bytes.try_into().map_err(|_| NetworkError::InvalidKey)?;
        Ok(Self::new(bytes, is_outgoing))
    }

    /// Whether this side initiated the call
    pub fn is_outgoing(&self) -> bool {
        self.is_outgoing
    }

    fn part(&self, signaling: bool, originator_is_outgoing: bool) -> &[u8] {
        let offset =
            (if originator_is_outgoing { 0 } else { 8 }) + (if signaling { 128 } else { 0 });
        &self.bytes[offset..offset + KEY_PART_SIZE]
    }

    /// Key part used when this side encrypts
    pub(crate) fn send_part(&self, signaling: bool) -> &[u8] {
        self.part(signaling, self.is_outgoing)
    }

    /// Key part used when this side decrypts
    pub(crate) fn recv_part(&self, signaling: bool) -> &[u8] {
        self.part(signaling, !self.is_outgoing)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("is_outgoing", &self.is_outgoing)
            .finish_non_exhaustive()
    }
}

fn message_key(key_part: &[u8], plaintext: &[u8]) -> [u8; MESSAGE_KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(key_part);
    hasher.update(plaintext);
    let digest = hasher.finalize();

    let mut key = [0u8; MESSAGE_KEY_SIZE];
    key.copy_from_slice(&digest[..MESSAGE_KEY_SIZE]);
    key
}

fn derive_frame_secrets(key_part: &[u8], message_key: &[u8]) -> ([u8; 32], [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(Some(message_key), key_part);

    let mut cipher_key = [0u8; 32];
    hk.expand(b"parley-frame-key", &mut cipher_key)
        .expect("HKDF expand should not fail");
    let mut nonce = [0u8; 12];
    hk.expand(b"parley-frame-nonce", &mut nonce)
        .expect("HKDF expand should not fail");

    (cipher_key, nonce)
}

/// Encrypt a plaintext into a `message_key || ciphertext` frame
pub fn encrypt_frame(key_part: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NetworkError> {
    let message_key = message_key(key_part, plaintext);
    let (cipher_key, nonce) = derive_frame_secrets(key_part, &message_key);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&cipher_key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| NetworkError::EncryptionFailed)?;

    let mut frame = Vec::with_capacity(MESSAGE_KEY_SIZE + ciphertext.len());
    frame.extend_from_slice(&message_key);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Authenticate and decrypt a `message_key || ciphertext` frame
pub fn decrypt_frame(key_part: &[u8], frame: &[u8]) -> Result<Vec<u8>, NetworkError> {
    // Shortest valid frame: message key plus the GCM tag of an empty payload
    if frame.len() < MESSAGE_KEY_SIZE + 16 {
        return Err(NetworkError::MalformedPacket);
    }
    let (received_key, ciphertext) = frame.split_at(MESSAGE_KEY_SIZE);

    let (cipher_key, nonce) = derive_frame_secrets(key_part, received_key);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&cipher_key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| NetworkError::AuthenticationFailed)?;

    // The GCM tag authenticates the payload; the prefix check binds the frame
    // to this direction's key part.
    if message_key(key_part, &plaintext) != received_key {
        return Err(NetworkError::AuthenticationFailed);
    }

    Ok(plaintext)
}
