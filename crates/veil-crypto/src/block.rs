//! AES-256 block cipher with serial and pool-parallel drivers.
//!
//! The transport encrypts every block independently (an ECB-equivalent
//! mode) with zero padding up to the 16-byte block boundary. Per-block
//! independence is what makes the parallel drivers possible: the buffer is
//! split into block-aligned slices, each enciphered as a separate job on a
//! [`WorkerPool`], and the serial and parallel paths produce bytewise
//! identical output.
//!
//! There is no chaining, no nonce, and no authentication; this reproduces
//! the wire contract of the protocol and is not a general-purpose mode.

use crate::CryptoError;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use std::sync::Arc;
use veil_runtime::WorkerPool;
use zeroize::Zeroize;

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Round `n` up to the next multiple of [`BLOCK_SIZE`].
#[must_use]
pub const fn padded_len(n: usize) -> usize {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// An expanded AES-256 key schedule.
///
/// Holds the encryption and decryption schedules plus the raw key material;
/// the raw bytes are overwritten before release when the key is dropped.
pub struct SymmetricKey {
    cipher: Aes256,
    raw: [u8; 32],
}

impl SymmetricKey {
    /// Expand a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `raw` is exactly
    /// 32 bytes.
    pub fn new(raw: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: raw.len(),
            })?;
        Ok(Self {
            cipher: Aes256::new(&raw.into()),
            raw,
        })
    }

    /// Encrypt a single block in place.
    pub fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.cipher.encrypt_block(Block::from_mut_slice(block));
    }

    /// Decrypt a single block in place.
    pub fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.cipher.decrypt_block(Block::from_mut_slice(block));
    }

    /// Encrypt `n` logical bytes of `data` in place.
    ///
    /// With `pad` set, the tail of the final block is zero-filled and the
    /// padded length is processed; without it, `n` must already be
    /// block-aligned. Returns the number of bytes enciphered.
    ///
    /// # Panics
    ///
    /// Panics if `data` is shorter than the (padded) length, or if `pad` is
    /// false and `n` is not a multiple of [`BLOCK_SIZE`].
    pub fn encrypt_in_place(&self, data: &mut [u8], n: usize, pad: bool) -> usize {
        let total = prepare(data, n, pad, Direction::Encrypt);
        self.apply(&mut data[..total], Direction::Encrypt);
        total
    }

    /// Decrypt `n` logical bytes of `data` in place.
    ///
    /// With `pad` set, the padded length is processed (the ciphertext always
    /// occupies whole blocks). Returns the number of bytes deciphered.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as
    /// [`encrypt_in_place`](Self::encrypt_in_place).
    pub fn decrypt_in_place(&self, data: &mut [u8], n: usize, pad: bool) -> usize {
        let total = prepare(data, n, pad, Direction::Decrypt);
        self.apply(&mut data[..total], Direction::Decrypt);
        total
    }

    /// Run the per-block primitive over a block-aligned slice.
    fn apply(&self, data: &mut [u8], direction: Direction) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = Block::from_mut_slice(chunk);
            match direction {
                Direction::Encrypt => self.cipher.encrypt_block(block),
                Direction::Decrypt => self.cipher.decrypt_block(block),
            }
        }
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.raw.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SymmetricKey(..)")
    }
}

/// Validate arguments and zero-fill the padding tail for encryption.
/// Returns the total (block-aligned) byte count to process.
fn prepare(data: &mut [u8], n: usize, pad: bool, direction: Direction) -> usize {
    let total = if pad {
        padded_len(n)
    } else {
        assert!(
            n % BLOCK_SIZE == 0,
            "unpadded length {n} is not block-aligned"
        );
        n
    };
    assert!(
        data.len() >= total,
        "buffer of {} bytes cannot hold {} cipher bytes",
        data.len(),
        total
    );
    if matches!(direction, Direction::Encrypt) && total > n {
        data[n..total].fill(0);
    }
    total
}

/// Encrypt `n` logical bytes of `data` in place, splitting the work into
/// `n_jobs` block-aligned jobs on `pool`.
///
/// The slices are approximately equal; the last absorbs the remainder. When
/// `blocks / n_jobs == 0` the work runs serially on the caller's thread.
/// Blocks until every job has completed. Output is bytewise identical to
/// [`SymmetricKey::encrypt_in_place`].
///
/// # Panics
///
/// Panics under the same conditions as [`SymmetricKey::encrypt_in_place`].
pub fn encrypt_parallel(
    data: &mut [u8],
    n: usize,
    key: &Arc<SymmetricKey>,
    pad: bool,
    n_jobs: usize,
    pool: &WorkerPool,
) -> usize {
    crypt_parallel(data, n, key, pad, n_jobs, pool, Direction::Encrypt)
}

/// Decrypt `n` logical bytes of `data` in place, splitting the work into
/// `n_jobs` block-aligned jobs on `pool`.
///
/// # Panics
///
/// Panics under the same conditions as [`SymmetricKey::decrypt_in_place`].
pub fn decrypt_parallel(
    data: &mut [u8],
    n: usize,
    key: &Arc<SymmetricKey>,
    pad: bool,
    n_jobs: usize,
    pool: &WorkerPool,
) -> usize {
    crypt_parallel(data, n, key, pad, n_jobs, pool, Direction::Decrypt)
}

/// A raw sub-slice handed to a cipher job.
struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is a disjoint sub-slice of a buffer whose exclusive
// borrow is pinned in `crypt_parallel` until every job has completed.
unsafe impl Send for RawRegion {}

fn crypt_parallel(
    data: &mut [u8],
    n: usize,
    key: &Arc<SymmetricKey>,
    pad: bool,
    n_jobs: usize,
    pool: &WorkerPool,
    direction: Direction,
) -> usize {
    let total = prepare(data, n, pad, direction);
    if total == 0 {
        return 0;
    }

    let blocks = total / BLOCK_SIZE;
    let jobs = n_jobs.max(1);
    let blocks_per_job = blocks / jobs;
    if blocks_per_job == 0 {
        // Fewer blocks than jobs: not worth dispatching.
        key.apply(&mut data[..total], direction);
        return total;
    }

    let base = data.as_mut_ptr();
    let mut last_ticket = 0;
    for i in 0..jobs {
        let start = i * blocks_per_job * BLOCK_SIZE;
        let len = if i == jobs - 1 {
            total - start
        } else {
            blocks_per_job * BLOCK_SIZE
        };
        let region = RawRegion {
            // SAFETY: `start < total <= data.len()`, so the offset stays
            // inside the buffer.
            ptr: unsafe { base.add(start) },
            len,
        };
        let key = Arc::clone(key);
        last_ticket = pool.submit(move || {
            // Bind `region` as a whole so the closure captures the entire
            // `RawRegion` (and its `unsafe impl Send`) rather than just the
            // raw-pointer field, per Rust 2021 disjoint closure capture.
            let region = region;
            // SAFETY: the regions submitted by this call are pairwise
            // disjoint, and the caller's `&mut data` borrow outlives the
            // `wait_ticket` below, so no other access can overlap.
            let slice = unsafe { std::slice::from_raw_parts_mut(region.ptr, region.len) };
            key.apply(slice, direction);
        });
    }

    // `last_ticket` is the newest ticket on the pool, so this returns only
    // once every job submitted above has run.
    pool.wait_ticket(last_ticket);
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    fn key() -> SymmetricKey {
        SymmetricKey::new(&KEY).unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            SymmetricKey::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { expected: 32, .. })
        ));
    }

    #[test]
    fn padded_len_rounds_up() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 16);
        assert_eq!(padded_len(16), 16);
        assert_eq!(padded_len(17), 32);
    }

    #[test]
    fn block_round_trip() {
        let key = key();
        let mut block = [0x5Au8; BLOCK_SIZE];
        key.encrypt_block(&mut block);
        assert_ne!(block, [0x5Au8; BLOCK_SIZE]);
        key.decrypt_block(&mut block);
        assert_eq!(block, [0x5Au8; BLOCK_SIZE]);
    }

    #[test]
    fn aligned_round_trip() {
        let key = key();
        let original = payload(256);
        let mut data = original.clone();

        let n = key.encrypt_in_place(&mut data, 256, false);
        assert_eq!(n, 256);
        assert_ne!(data, original);

        key.decrypt_in_place(&mut data, 256, false);
        assert_eq!(data, original);
    }

    #[test]
    fn padding_zero_fills_the_tail() {
        let key = key();
        let mut data = vec![0xFFu8; 32];
        data[..5].copy_from_slice(b"hello");

        let n = key.encrypt_in_place(&mut data, 5, true);
        assert_eq!(n, 16);

        key.decrypt_in_place(&mut data, 5, true);
        assert_eq!(&data[..5], b"hello");
        assert_eq!(&data[5..16], &[0u8; 11]);
    }

    #[test]
    #[should_panic(expected = "not block-aligned")]
    fn unpadded_unaligned_length_panics() {
        let key = key();
        let mut data = vec![0u8; 32];
        key.encrypt_in_place(&mut data, 17, false);
    }

    #[test]
    fn parallel_matches_serial() {
        let key = Arc::new(key());
        let pool = WorkerPool::new(4);
        let original = payload(64 * 1024);

        let mut expected = original.clone();
        key.encrypt_in_place(&mut expected, original.len(), true);

        for n_jobs in [1, 2, 3, 7, 8] {
            let mut data = original.clone();
            let n = encrypt_parallel(&mut data, original.len(), &key, true, n_jobs, &pool);
            assert_eq!(n, expected.len());
            assert_eq!(data, expected, "n_jobs = {n_jobs}");
        }
    }

    #[test]
    fn parallel_decrypt_round_trip() {
        let key = Arc::new(key());
        let pool = WorkerPool::new(3);
        let original = payload(4096 + 7);
        let mut data = original.clone();
        data.resize(padded_len(original.len()), 0);

        encrypt_parallel(&mut data, original.len(), &key, true, 3, &pool);
        decrypt_parallel(&mut data, original.len(), &key, true, 3, &pool);
        assert_eq!(&data[..original.len()], &original[..]);
    }

    #[test]
    fn parallel_falls_back_to_serial_for_tiny_inputs() {
        let key = Arc::new(key());
        let pool = WorkerPool::new(2);
        let mut data = vec![1u8; BLOCK_SIZE];

        let mut expected = data.clone();
        key.encrypt_in_place(&mut expected, BLOCK_SIZE, false);

        // One block, eight jobs: blocks / jobs == 0.
        encrypt_parallel(&mut data, BLOCK_SIZE, &key, false, 8, &pool);
        assert_eq!(data, expected);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// decrypt(encrypt(p)) == p for block-aligned payloads.
            #[test]
            fn round_trip_aligned(blocks in 1usize..64, seed in any::<u8>()) {
                let key = key();
                let original: Vec<u8> =
                    (0..blocks * BLOCK_SIZE).map(|i| (i as u8).wrapping_add(seed)).collect();
                let mut data = original.clone();
                let len = data.len();
                key.encrypt_in_place(&mut data, len, false);
                let n = data.len();
                key.decrypt_in_place(&mut data, n, false);
                prop_assert_eq!(data, original);
            }

            /// Parallel output equals serial output for any job count.
            #[test]
            fn parallel_equals_serial(len in 1usize..4096, n_jobs in 1usize..9) {
                let key = Arc::new(key());
                let pool = WorkerPool::new(4);
                let original: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();

                let mut expected = original.clone();
                expected.resize(padded_len(len), 0);
                key.encrypt_in_place(&mut expected, len, true);

                let mut data = original;
                data.resize(padded_len(len), 0);
                encrypt_parallel(&mut data, len, &key, true, n_jobs, &pool);
                prop_assert_eq!(data, expected);
            }
        }
    }
}
