//! Symmetric ciphers and key derivation as used by .NET protectors.
//!
//! All ciphers run in CBC mode with PKCS7 padding, which is what the `System.Security.
//! Cryptography` providers default to. Key sizes select the variant:
//!
//! | Function | Key sizes | Block size |
//! |----------|-----------|------------|
//! | [`des_cbc_decrypt`] | 8 bytes | 8 bytes |
//! | [`tdes_cbc_decrypt`] | 16 (two-key) or 24 bytes | 8 bytes |
//! | [`aes_cbc_decrypt`] | 16, 24 or 32 bytes | 16 bytes |
//!
//! [`PasswordDeriveBytes`] reproduces the .NET class of the same name, including its
//! proprietary extension for output longer than one SHA-1 block and the way leftover
//! bytes carry over between `GetBytes` calls. [`derive_pbkdf1_key`] is a single call.
//!
//! Every failure (bad key or IV length, empty input, bad padding) maps to
//! [`crate::Error::Crypto`].

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{
    block_padding::Pkcs7, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use cbc::{Decryptor, Encryptor};
use des::{Des, TdesEde2, TdesEde3};
use sha1::{Digest, Sha1};

use crate::{Error, Result};

fn decrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    Decryptor<C>: BlockDecryptMut + KeyIvInit,
    C: BlockCipher + BlockDecryptMut,
{
    if data.is_empty() {
        return Err(Error::Crypto("Empty cipher text".to_string()));
    }
    let cipher = Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto(format!("Invalid key ({}) or IV ({}) length", key.len(), iv.len())))?;
    let mut buffer = data.to_vec();
    let plain = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| Error::Crypto("Invalid padding".to_string()))?;
    Ok(plain.to_vec())
}

fn encrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8], block_size: usize) -> Result<Vec<u8>>
where
    Encryptor<C>: BlockEncryptMut + KeyIvInit,
    C: BlockCipher + BlockEncryptMut,
{
    let cipher = Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto(format!("Invalid key ({}) or IV ({}) length", key.len(), iv.len())))?;
    let mut buffer = vec![0u8; (data.len() / block_size + 1) * block_size];
    buffer[..data.len()].copy_from_slice(data);
    let encrypted = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, data.len())
        .map_err(|_| Error::Crypto("Padding failed".to_string()))?;
    Ok(encrypted.to_vec())
}

/// DES-CBC decryption.
///
/// # Errors
/// Returns [`crate::Error::Crypto`] on bad key/IV sizes, empty input or bad padding.
pub fn des_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    decrypt_with::<Des>(key, iv, data)
}

/// DES-CBC encryption.
///
/// # Errors
/// Returns [`crate::Error::Crypto`] on bad key/IV sizes.
pub fn des_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    encrypt_with::<Des>(key, iv, data, 8)
}

/// TripleDES-CBC decryption with a 16 byte (two-key) or 24 byte key.
///
/// # Errors
/// Returns [`crate::Error::Crypto`] on bad key/IV sizes, empty input or bad padding.
pub fn tdes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => decrypt_with::<TdesEde2>(key, iv, data),
        24 => decrypt_with::<TdesEde3>(key, iv, data),
        other => Err(Error::Crypto(format!("Invalid TripleDES key length {other}"))),
    }
}

/// TripleDES-CBC encryption with a 16 byte (two-key) or 24 byte key.
///
/// # Errors
/// Returns [`crate::Error::Crypto`] on bad key/IV sizes.
pub fn tdes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => encrypt_with::<TdesEde2>(key, iv, data, 8),
        24 => encrypt_with::<TdesEde3>(key, iv, data, 8),
        other => Err(Error::Crypto(format!("Invalid TripleDES key length {other}"))),
    }
}

/// AES-CBC decryption; the key length selects AES-128, AES-192 or AES-256.
///
/// # Errors
/// Returns [`crate::Error::Crypto`] on bad key/IV sizes, empty input or bad padding.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => decrypt_with::<Aes128>(key, iv, data),
        24 => decrypt_with::<Aes192>(key, iv, data),
        32 => decrypt_with::<Aes256>(key, iv, data),
        other => Err(Error::Crypto(format!("Invalid AES key length {other}"))),
    }
}

/// AES-CBC encryption; the key length selects AES-128, AES-192 or AES-256.
///
/// # Errors
/// Returns [`crate::Error::Crypto`] on bad key/IV sizes.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => encrypt_with::<Aes128>(key, iv, data, 16),
        24 => encrypt_with::<Aes192>(key, iv, data, 16),
        32 => encrypt_with::<Aes256>(key, iv, data, 16),
        other => Err(Error::Crypto(format!("Invalid AES key length {other}"))),
    }
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Stateful SHA-1 `PasswordDeriveBytes`.
///
/// The base value is `SHA1(password || salt)` hashed `iterations - 2` more times. Output
/// block `n` is `SHA1(prefix(n) || base)` where `prefix(0)` is empty and `prefix(n)` is the
/// decimal string of `n`.
///
/// Successive [`get_bytes`](Self::get_bytes) calls are NOT a prefix split of one long
/// derivation. When a call needs more than the bytes left over from the previous block,
/// .NET copies the leftovers starting at offset `block_len - consumed` instead of
/// `consumed`, and that quirk is reproduced here.
///
/// # Examples
///
/// ```rust
/// use dotscope_deob::utils::crypto::PasswordDeriveBytes;
///
/// let mut pdb = PasswordDeriveBytes::new(b"ab", &[9, 8, 7, 6, 5, 4], 100);
/// let key = pdb.get_bytes(16).unwrap();
/// let iv = pdb.get_bytes(8).unwrap();
/// assert_eq!(iv, [0xcf, 0x41, 0x3b, 0x1e, 0x5a, 0xf1, 0x98, 0x12]);
/// assert_eq!(key.len(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct PasswordDeriveBytes {
    base: [u8; 20],
    prefix: u32,
    extra: Option<Vec<u8>>,
    extra_count: usize,
}

impl PasswordDeriveBytes {
    /// Compute the base value for `password` and `salt`.
    #[must_use]
    pub fn new(password: &[u8], salt: &[u8], iterations: u32) -> Self {
        let mut base = sha1(&[password, salt]);
        for _ in 1..iterations.saturating_sub(1) {
            base = sha1(&[&base]);
        }
        PasswordDeriveBytes {
            base,
            prefix: 0,
            extra: None,
            extra_count: 0,
        }
    }

    /// Next `count` bytes of output, as `GetBytes(count)` returns them.
    ///
    /// # Errors
    /// Returns [`crate::Error::Crypto`] when the leftover copy would read past the end of
    /// the previous block, where .NET throws.
    pub fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count];
        let mut carried = 0;

        if let Some(extra) = self.extra.take() {
            carried = extra.len() - self.extra_count;
            if carried >= count {
                out.copy_from_slice(&extra[self.extra_count..self.extra_count + count]);
                if carried > count {
                    self.extra_count += count;
                    self.extra = Some(extra);
                }
                return Ok(out);
            }
            let leftover = extra.get(carried..carried * 2).ok_or_else(|| {
                Error::Crypto(format!(
                    "PasswordDeriveBytes cannot carry {carried} bytes from a {} byte block",
                    extra.len()
                ))
            })?;
            out[..carried].copy_from_slice(leftover);
        }

        let block = self.compute(count - carried);
        out[carried..].copy_from_slice(&block[..count - carried]);
        if block.len() + carried > count {
            self.extra_count = count - carried;
            self.extra = Some(block);
        }
        Ok(out)
    }

    fn compute(&mut self, count: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(count + 20);
        loop {
            let block = if self.prefix == 0 {
                sha1(&[&self.base])
            } else {
                sha1(&[self.prefix.to_string().as_bytes(), &self.base])
            };
            self.prefix += 1;
            output.extend_from_slice(&block);
            if output.len() >= count {
                return output;
            }
        }
    }
}

/// Derive `key_len` bytes with a single `GetBytes` call on a fresh
/// [`PasswordDeriveBytes`].
#[must_use]
pub fn derive_pbkdf1_key(password: &[u8], salt: &[u8], iterations: u32, key_len: usize) -> Vec<u8> {
    let mut pdb = PasswordDeriveBytes::new(password, salt, iterations);
    let mut output = pdb.compute(key_len);
    output.truncate(key_len);
    output
}
