use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};

use crate::error::{HozonError, HozonResult};

const BLOCK_SIZE: usize = 16;

/// Resolved AES-128 key of a media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsKey {
    key: [u8; 16],
    /// Declared IV. When absent, the IV is derived from the segment index.
    iv: Option<[u8; 16]>,
}

impl HlsKey {
    pub fn new(key: [u8; 16], iv: Option<[u8; 16]>) -> Self {
        Self { key, iv }
    }

    pub fn from_bytes(key: &[u8], iv: Option<[u8; 16]>) -> HozonResult<Self> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| HozonError::InvalidAes128Key(key.len()))?;
        Ok(Self { key, iv })
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// IV used for the segment at `index`.
    ///
    /// Without a declared IV the low 4 bytes hold the big-endian index and the rest is zero.
    pub fn iv_for(&self, index: usize) -> [u8; 16] {
        if let Some(iv) = self.iv {
            return iv;
        }

        let mut iv = [0u8; 16];
        iv[12..].copy_from_slice(&(index as u32).to_be_bytes());
        iv
    }

    /// Decrypt one segment.
    ///
    /// Data that is not block aligned is returned untouched, and so is the ciphertext
    /// when decryption fails.
    pub fn decrypt(&self, index: usize, data: Vec<u8>) -> Vec<u8> {
        if data.len() % BLOCK_SIZE != 0 {
            tracing::debug!(
                "Segment {index} is {} bytes, not block aligned. Treat as clear data.",
                data.len()
            );
            return data;
        }

        let iv = self.iv_for(index);
        let decryptor = cbc::Decryptor::<aes::Aes128>::new((&self.key).into(), (&iv).into());
        match decryptor.decrypt_padded_vec_mut::<NoPadding>(&data) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                tracing::warn!("Failed to decrypt segment {index}, keep original data: {e}");
                data
            }
        }
    }
}

/// Parse a hex IV with an optional `0x` prefix.
pub fn parse_iv(iv: &str) -> Option<[u8; 16]> {
    let iv = iv
        .strip_prefix("0x")
        .or_else(|| iv.strip_prefix("0X"))
        .unwrap_or(iv);
    if iv.is_empty() || iv.len() > 32 {
        return None;
    }
    u128::from_str_radix(iv, 16).ok().map(u128::to_be_bytes)
}
