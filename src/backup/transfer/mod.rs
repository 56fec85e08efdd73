//! Hash, compress, encrypt and upload file content, and the reverse.
//!
//! The digest is taken over the original bytes and compression always runs
//! before encryption. A restore either returns exactly the bytes that were
//! backed up or fails with an integrity error.

pub mod digest;

use crate::backup::compress::{decompress, CompressionCodec, CompressorConfig};
use crate::backup::encrypt::{self, Iv};
use crate::backup::result_error::error::{Error, IntegrityFailure};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::secret::SecretKey;
use crate::backup::storage::{RemoteObject, StorageProvider};
use crate::backup::transfer::digest::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;

/// Everything needed to fetch and reverse a stored artifact except the key
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBlobDescriptor {
    pub remote_path: String,
    #[serde_as(as = "Base64")]
    pub iv: Iv,
    /// Hex SHA-256 of the original content
    pub digest: String,
    pub compression: CompressionCodec,
    pub compression_ratio: f64,
    pub original_size: u64,
    pub stored_size: u64,
}

/// Turns `data` into the bytes to store plus the descriptor to restore them.
pub fn seal(
    data: &[u8],
    key: &SecretKey,
    compressor: &CompressorConfig,
    remote_path: &str,
) -> Result<(Vec<u8>, EncryptedBlobDescriptor)> {
    let digest = sha256_hex(data);
    let compressed = compressor.compress(data)?;
    let iv = encrypt::generate_iv();
    let blob = encrypt::encrypt(&compressed, key, &iv);
    let descriptor = EncryptedBlobDescriptor {
        remote_path: remote_path.to_string(),
        iv,
        digest,
        compression: compressor.codec(),
        compression_ratio: compression_ratio(data.len(), compressed.len()),
        original_size: data.len() as u64,
        stored_size: blob.len() as u64,
    };
    Ok((blob, descriptor))
}

/// Reverses [`seal`], verifying size and digest of the result.
pub fn open(blob: &[u8], descriptor: &EncryptedBlobDescriptor, key: &SecretKey) -> Result<Vec<u8>> {
    let path = &descriptor.remote_path;
    let fail = |failure: IntegrityFailure| Error::integrity(path.as_str(), failure);

    let compressed = encrypt::decrypt(blob, key, &descriptor.iv).map_err(fail)?;
    let data = decompress(descriptor.compression, &compressed, descriptor.original_size)
        .map_err(fail)?;
    if data.len() as u64 != descriptor.original_size {
        return Err(fail(IntegrityFailure::SizeMismatch {
            expected: descriptor.original_size,
            actual: data.len() as u64,
        }));
    }
    let actual = sha256_hex(&data);
    if actual != descriptor.digest {
        return Err(fail(IntegrityFailure::DigestMismatch {
            expected: descriptor.digest.clone(),
            actual,
        }));
    }
    Ok(data)
}

/// Share of bytes saved by compression, 0 for empty input
fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (original as f64 - compressed as f64) / original as f64
}

pub struct TransferPipeline<P: StorageProvider> {
    provider: P,
    compressor: CompressorConfig,
}

impl<P: StorageProvider> TransferPipeline<P> {
    pub fn new(provider: P, compressor: CompressorConfig) -> Self {
        Self {
            provider,
            compressor,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Seals `data` and uploads it to `remote_path`. `progress` receives
    /// increasing percentages ending at 100 on success.
    pub fn backup(
        &self,
        data: &[u8],
        key: &SecretKey,
        remote_path: &str,
        progress: &mut dyn FnMut(u8),
    ) -> Result<EncryptedBlobDescriptor> {
        progress(0);
        let (blob, mut descriptor) = seal(data, key, &self.compressor, remote_path)?;
        progress(70);
        descriptor.remote_path = self
            .provider
            .upload(&blob, remote_path)
            .with_msg(format!("Upload of {} bytes failed", blob.len()))?;
        progress(100);
        tracing::debug!(
            "Stored {:?}: {} -> {} bytes, ratio {:.2}",
            descriptor.remote_path,
            descriptor.original_size,
            descriptor.stored_size,
            descriptor.compression_ratio
        );
        Ok(descriptor)
    }

    pub fn restore(&self, descriptor: &EncryptedBlobDescriptor, key: &SecretKey) -> Result<Vec<u8>> {
        let blob = self.provider.download(&descriptor.remote_path)?;
        if blob.len() as u64 != descriptor.stored_size {
            return Err(Error::integrity(
                descriptor.remote_path.as_str(),
                IntegrityFailure::SizeMismatch {
                    expected: descriptor.stored_size,
                    actual: blob.len() as u64,
                },
            ));
        }
        let data = open(&blob, descriptor, key)?;
        tracing::debug!("Restored {:?} ({} bytes)", descriptor.remote_path, data.len());
        Ok(data)
    }

    pub fn discard(&self, descriptor: &EncryptedBlobDescriptor) -> Result<()> {
        self.provider.delete(&descriptor.remote_path)
    }

    pub fn artifacts(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        self.provider.list(prefix)
    }
}
