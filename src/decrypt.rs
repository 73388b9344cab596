//! Streaming decryption of encrypted-at-rest downloads.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::DecryptError;

const KEY_LEN: usize = 16;
const NONCE_LEN: usize = 8;
const BLOCK_LEN: usize = 16;

/// In-place stream transform applied chunk by chunk, in order.
pub trait ChunkDecryptor: Send + Sync {
    fn decrypt(&mut self, chunk: &mut [u8]);
}

/// AES-128-CTR with a 64-bit nonce and a 64-bit big-endian block counter.
pub struct AesCtrDecryptor {
    cipher: Aes128,
    nonce: [u8; NONCE_LEN],
    counter: u64,
    keystream: [u8; BLOCK_LEN],
    used: usize,
}

impl AesCtrDecryptor {
    pub fn new(key: &[u8], nonce: &[u8]) -> Result<Self, DecryptError> {
        if key.len() != KEY_LEN {
            return Err(DecryptError::InvalidKey {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| DecryptError::InvalidKey {
            expected: NONCE_LEN,
            actual: nonce.len(),
        })?;
        Ok(Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            nonce,
            counter: 0,
            keystream: [0; BLOCK_LEN],
            used: BLOCK_LEN,
        })
    }

    /// Key material laid out as `key || nonce`.
    pub fn from_key_material(material: &[u8]) -> Result<Self, DecryptError> {
        if material.len() != KEY_LEN + NONCE_LEN {
            return Err(DecryptError::InvalidKey {
                expected: KEY_LEN + NONCE_LEN,
                actual: material.len(),
            });
        }
        Self::new(&material[..KEY_LEN], &material[KEY_LEN..])
    }

    fn refill(&mut self) {
        let mut block = GenericArray::clone_from_slice(
            &[self.nonce, self.counter.to_be_bytes()].concat(),
        );
        self.cipher.encrypt_block(&mut block);
        self.keystream.copy_from_slice(&block);
        self.counter = self.counter.wrapping_add(1);
        self.used = 0;
    }
}

impl ChunkDecryptor for AesCtrDecryptor {
    fn decrypt(&mut self, chunk: &mut [u8]) {
        for byte in chunk {
            if self.used == BLOCK_LEN {
                self.refill();
            }
            *byte ^= self.keystream[self.used];
            self.used += 1;
        }
    }
}

/// Key material and plaintext destination for one pending download.
pub struct DecryptJob {
    /// Plaintext path with a temporary suffix, stripped once decryption finishes.
    pub destination: PathBuf,
    pub cipher: Box<dyn ChunkDecryptor>,
}

/// Byte counts observed by the progress loop, plus the cancel switch.
#[derive(Debug)]
pub struct DecryptProgress {
    pub total: u64,
    written: AtomicU64,
    cancel: CancellationToken,
}

impl DecryptProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            written: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Final plaintext name: the destination without its temporary suffix.
pub fn final_path(destination: &Path) -> PathBuf {
    destination.with_extension("")
}

/// Decrypts `source` into the job's destination `chunk_size` bytes at a time,
/// flushing every chunk to disk before reading the next. On success the
/// ciphertext is deleted and the plaintext renamed to its final name.
pub async fn relay(
    source: &Path,
    job: DecryptJob,
    chunk_size: usize,
    progress: &DecryptProgress,
) -> Result<PathBuf, DecryptError> {
    let destination = job.destination.clone();
    if let Err(e) = stream(source, job, chunk_size, progress).await {
        let _ = tokio::fs::remove_file(&destination).await;
        return Err(e);
    }

    tokio::fs::remove_file(source).await?;
    let target = final_path(&destination);
    tokio::fs::rename(&destination, &target).await?;
    Ok(target)
}

async fn stream(
    source: &Path,
    job: DecryptJob,
    chunk_size: usize,
    progress: &DecryptProgress,
) -> Result<(), DecryptError> {
    let mut reader = File::open(source).await?;
    let mut writer = File::create(&job.destination).await?;
    let mut cipher = job.cipher;

    loop {
        if progress.is_cancelled() {
            return Err(DecryptError::Cancelled);
        }
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let read = read_full(&mut reader, &mut chunk).await?;
        if read == 0 {
            break;
        }
        chunk.truncate(read);

        let (returned, chunk) = tokio::task::spawn_blocking(move || {
            cipher.decrypt(&mut chunk);
            (cipher, chunk)
        })
        .await?;
        cipher = returned;

        writer.write_all(&chunk).await?;
        writer.sync_data().await?;
        progress.written.fetch_add(read as u64, Ordering::Relaxed);
    }
    writer.flush().await?;
    Ok(())
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
