//! AES-256-CBC with PKCS7 padding over whole buffers.
//!
//! Each call to [`encrypt`] must be given a fresh IV from [`generate_iv`];
//! the IV travels with the artifact descriptor, the key never does.

use crate::backup::result_error::error::IntegrityFailure;
use crate::backup::secret::SecretKey;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use std::result;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size, which is also the CBC IV length
pub const IV_LEN: usize = 16;

pub type Iv = [u8; IV_LEN];

pub fn generate_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

pub fn encrypt(plain: &[u8], key: &SecretKey, iv: &Iv) -> Vec<u8> {
    Aes256CbcEnc::new(&(*key.bytes()).into(), &(*iv).into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
}

/// Fails when the padding does not check out, which is what a wrong key,
/// a wrong IV or a modified ciphertext usually look like.
pub fn decrypt(cipher: &[u8], key: &SecretKey, iv: &Iv) -> result::Result<Vec<u8>, IntegrityFailure> {
    Aes256CbcDec::new(&(*key.bytes()).into(), &(*iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(cipher)
        .map_err(|_| IntegrityFailure::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_various_lengths() {
        let key = SecretKey::generate();
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plain: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let iv = generate_iv();
            let cipher = encrypt(&plain, &key, &iv);
            assert_eq!(cipher.len() % IV_LEN, 0);
            assert!(cipher.len() > plain.len());
            assert_eq!(decrypt(&cipher, &key, &iv).unwrap(), plain);
        }
    }

    #[test]
    fn test_fresh_iv_changes_ciphertext() {
        let key = SecretKey::generate();
        let (iv1, iv2) = (generate_iv(), generate_iv());
        assert_ne!(iv1, iv2);
        assert_ne!(encrypt(b"same", &key, &iv1), encrypt(b"same", &key, &iv2));
    }

    #[test]
    fn test_truncated_ciphertext_is_rejected() {
        let key = SecretKey::generate();
        let iv = generate_iv();
        let cipher = encrypt(b"some plaintext", &key, &iv);
        assert_eq!(
            decrypt(&cipher[..cipher.len() - 1], &key, &iv),
            Err(IntegrityFailure::Decrypt)
        );
    }
}
