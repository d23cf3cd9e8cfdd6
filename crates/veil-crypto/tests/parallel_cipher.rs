//! Cross-driver cipher equivalence at bulk-transfer sizes.

use rand::RngCore;
use std::sync::Arc;
use veil_crypto::block::{decrypt_parallel, encrypt_parallel, padded_len, SymmetricKey};
use veil_runtime::WorkerPool;

#[test]
fn parallel_encrypt_matches_serial_at_one_mebibyte() {
    let mut key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let key = Arc::new(SymmetricKey::new(&key_bytes).unwrap());

    let mut payload = vec![0u8; 1 << 20];
    rand::thread_rng().fill_bytes(&mut payload);

    let mut expected = payload.clone();
    let serial_len = key.encrypt_in_place(&mut expected, payload.len(), true);
    assert_eq!(serial_len, payload.len());

    let pool = WorkerPool::new(8);
    for n_jobs in [1usize, 2, 3, 7, 8] {
        let mut data = payload.clone();
        let parallel_len = encrypt_parallel(&mut data, payload.len(), &key, true, n_jobs, &pool);
        assert_eq!(parallel_len, serial_len);
        assert_eq!(data, expected, "ciphertext diverged with {n_jobs} jobs");
    }
}

#[test]
fn parallel_round_trip_with_unaligned_tail() {
    let key = Arc::new(SymmetricKey::new(&[9u8; 32]).unwrap());
    let pool = WorkerPool::new(4);

    let mut payload = vec![0u8; 65_543]; // deliberately not block-aligned
    rand::thread_rng().fill_bytes(&mut payload);

    let mut data = payload.clone();
    data.resize(padded_len(payload.len()), 0);

    let enciphered = encrypt_parallel(&mut data, payload.len(), &key, true, 4, &pool);
    assert_eq!(enciphered, padded_len(payload.len()));

    decrypt_parallel(&mut data, payload.len(), &key, true, 4, &pool);
    assert_eq!(&data[..payload.len()], &payload[..]);
}
