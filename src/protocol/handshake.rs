//! RSA/AES key exchange and block decryption.
//!
//! The server answers a client's RSA public key with a fresh AES-128 session
//! key wrapped under RSA-OAEP (SHA-1, MGF1-SHA-1). File bodies are then
//! AES-128 encrypted by the client.
//!
//! **Block mode**
//! Every 16-byte block is run through a new CBC context whose IV is all zero.
//! Nothing is chained across blocks, so the result equals independent
//! single-block decryption. Existing clients encrypt this way and the wire
//! format depends on it; it must not be "fixed" without a protocol version bump.
//!
//! The client half of the exchange (`ClientKeyPair`, `encrypt_blocks`) lives
//! here too so both ends share one definition of the block layout.

use crate::core::packet::{PUBLIC_KEY_LEN, SESSION_KEY_LEN, WRAPPED_KEY_LEN};
use crate::error::{ProtocolError, Result};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::cipher::block_padding::NoPadding;
use rand_core::{OsRng, RngCore};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tracing::{debug, instrument};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// AES block size in bytes
pub const BLOCK_LEN: usize = 16;

/// RSA modulus size in bits expected from clients
pub const RSA_KEY_BITS: usize = 1024;

/// Public exponent that makes a 1024-bit SubjectPublicKeyInfo exactly 160 bytes
pub const RSA_PUBLIC_EXPONENT: u32 = 17;

const ZERO_IV: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

// ── SessionKey ───────────────────────────────────────────────────

/// Ephemeral AES-128 key for one client's transfers. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Draw a key from the operating system RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

// ── Server side ──────────────────────────────────────────────────

/// Parse a client public key.
///
/// Accepts a DER SubjectPublicKeyInfo (what clients send) or a bare PKCS#1
/// `RSAPublicKey`. The modulus must be 1024 bits so the wrapped key is
/// exactly 128 bytes.
pub fn import_public_key(bytes: &[u8]) -> Result<RsaPublicKey> {
    let key = RsaPublicKey::from_public_key_der(bytes)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(bytes))
        .map_err(|e| ProtocolError::KeyImportError(e.to_string()))?;

    if key.size() != WRAPPED_KEY_LEN {
        return Err(ProtocolError::KeyImportError(format!(
            "expected a {RSA_KEY_BITS}-bit modulus, got {} bits",
            key.size() * 8
        )));
    }
    Ok(key)
}

/// Generate a session key and wrap it under the client's public key.
///
/// Returns the raw key (kept by the session and the registry) and the
/// 128-byte RSA-OAEP ciphertext sent back to the client.
#[instrument(skip(public_key), fields(key_len = public_key.len()))]
pub fn wrap_session_key(public_key: &[u8]) -> Result<(SessionKey, [u8; WRAPPED_KEY_LEN])> {
    let rsa_key = import_public_key(public_key)?;
    let session_key = SessionKey::generate();

    let wrapped = rsa_key
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), session_key.as_bytes())
        .map_err(|_| ProtocolError::EncryptionFailure)?;

    let wrapped: [u8; WRAPPED_KEY_LEN] = wrapped
        .try_into()
        .map_err(|_| ProtocolError::EncryptionFailure)?;

    debug!("Session key generated and wrapped");
    Ok((session_key, wrapped))
}

/// Decrypt `ciphertext` one block at a time with a zero IV per block.
///
/// # Errors
/// `DecryptionFailure` if the length is not a multiple of 16.
pub fn decrypt_blocks(key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(ProtocolError::DecryptionFailure);
    }

    let mut plaintext = ciphertext.to_vec();
    for block in plaintext.chunks_exact_mut(BLOCK_LEN) {
        let cipher = Aes128CbcDec::new_from_slices(key.as_bytes(), &ZERO_IV)
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        cipher
            .decrypt_padded_mut::<NoPadding>(block)
            .map_err(|_| ProtocolError::DecryptionFailure)?;
    }
    Ok(plaintext)
}

// ── Client side ──────────────────────────────────────────────────

/// Encrypt `plaintext` with the same per-block zero-IV layout.
///
/// The last block is zero-padded; the receiver truncates to the declared
/// content size.
pub fn encrypt_blocks(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let padded_len = plaintext.len().div_ceil(BLOCK_LEN) * BLOCK_LEN;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);

    for block in buffer.chunks_exact_mut(BLOCK_LEN) {
        let cipher = Aes128CbcEnc::new_from_slices(key.as_bytes(), &ZERO_IV)
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        cipher
            .encrypt_padded_mut::<NoPadding>(block, BLOCK_LEN)
            .map_err(|_| ProtocolError::EncryptionFailure)?;
    }
    Ok(buffer)
}

/// A client's RSA key pair.
#[derive(Clone)]
pub struct ClientKeyPair {
    private: RsaPrivateKey,
}

impl ClientKeyPair {
    /// Generate a 1024-bit key with public exponent 17.
    pub fn generate() -> Result<Self> {
        let exponent = BigUint::from(RSA_PUBLIC_EXPONENT);
        let private = RsaPrivateKey::new_with_exp(&mut OsRng, RSA_KEY_BITS, &exponent)
            .map_err(|e| ProtocolError::KeyImportError(e.to_string()))?;
        Ok(Self { private })
    }

    pub fn from_private_key(private: RsaPrivateKey) -> Self {
        Self { private }
    }

    /// DER SubjectPublicKeyInfo, exactly 160 bytes.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let der = self
            .private
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| ProtocolError::KeyImportError(e.to_string()))?
            .into_vec();

        if der.len() != PUBLIC_KEY_LEN {
            return Err(ProtocolError::KeyImportError(format!(
                "encoded public key is {} bytes, expected {PUBLIC_KEY_LEN}",
                der.len()
            )));
        }
        Ok(der)
    }

    /// Recover the session key from a server's wrapped key.
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey> {
        let mut raw = self
            .private
            .decrypt(Oaep::new::<Sha1>(), wrapped)
            .map_err(|_| ProtocolError::DecryptionFailure)?;

        let key: [u8; SESSION_KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        raw.zeroize();
        Ok(SessionKey::from_bytes(key))
    }
}
