// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Module for the simulated key wrap and key derivation primitives.
//!
//! A wrapped blob is `tag || ciphertext`. The tag is a truncated SHA-256 over
//! the wrapping key, the policy of the wrapped asset and the plaintext, which
//! binds a blob to the policy of the asset it was produced for.

use azihsm_psa_interface::AssetError;
use azihsm_psa_interface::AssetPolicy;
use azihsm_psa_interface::AssetResult;
use azihsm_psa_interface::KEY_BLOB_OVERHEAD;
use sha2::Digest;
use sha2::Sha256;
use zeroize::Zeroizing;

const WRAP_STREAM_LABEL: &[u8] = b"psa-sim-wrap-stream";
const WRAP_TAG_LABEL: &[u8] = b"psa-sim-wrap-tag";

fn keystream_block(kek: &[u8], policy: AssetPolicy, counter: u32) -> [u8; 32] {
    Sha256::new()
        .chain_update(WRAP_STREAM_LABEL)
        .chain_update(kek)
        .chain_update(policy.bits().to_le_bytes())
        .chain_update(counter.to_le_bytes())
        .finalize()
        .into()
}

fn apply_keystream(kek: &[u8], policy: AssetPolicy, data: &mut [u8]) {
    for (counter, chunk) in data.chunks_mut(32).enumerate() {
        let block = keystream_block(kek, policy, counter as u32);
        chunk
            .iter_mut()
            .zip(block.iter())
            .for_each(|(byte, key)| *byte ^= key);
    }
}

fn tag(kek: &[u8], policy: AssetPolicy, plaintext: &[u8]) -> [u8; KEY_BLOB_OVERHEAD] {
    let digest = Sha256::new()
        .chain_update(WRAP_TAG_LABEL)
        .chain_update(kek)
        .chain_update(policy.bits().to_le_bytes())
        .chain_update(plaintext)
        .finalize();

    let mut tag = [0u8; KEY_BLOB_OVERHEAD];
    tag.copy_from_slice(&digest[..KEY_BLOB_OVERHEAD]);
    tag
}

/// Wraps `plaintext` for an asset governed by `policy`.
pub(crate) fn wrap_key(kek: &[u8], policy: AssetPolicy, plaintext: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(KEY_BLOB_OVERHEAD + plaintext.len());
    blob.extend_from_slice(&tag(kek, policy, plaintext));
    blob.extend_from_slice(plaintext);
    apply_keystream(kek, policy, &mut blob[KEY_BLOB_OVERHEAD..]);
    blob
}

/// Unwraps a blob produced by [`wrap_key`] for the same key and policy.
///
/// # Errors
/// * `AssetError::InvalidParameter` - If the blob is shorter than its tag.
/// * `AssetError::AuthenticationFailed` - If the tag does not verify.
pub(crate) fn unwrap_key(
    kek: &[u8],
    policy: AssetPolicy,
    blob: &[u8],
) -> AssetResult<Zeroizing<Vec<u8>>> {
    if blob.len() < KEY_BLOB_OVERHEAD {
        Err(AssetError::InvalidParameter)?
    }

    let (expected, ciphertext) = blob.split_at(KEY_BLOB_OVERHEAD);
    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    apply_keystream(kek, policy, &mut plaintext);

    if tag(kek, policy, &plaintext) != expected {
        tracing::error!(%policy, "Key blob failed to authenticate");
        Err(AssetError::AuthenticationFailed)?
    }

    Ok(plaintext)
}

/// Derives `len` bytes from `kdk` and the fixed input `context`.
///
/// Counter mode hashes each block independently; feedback mode chains the
/// previous block into the next one.
pub(crate) fn derive(
    kdk: &[u8],
    context: &[u8],
    counter_mode: bool,
    len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut output = Zeroizing::new(Vec::with_capacity(len));
    let mut previous = [0u8; 32];
    let mut counter = 1u32;

    while output.len() < len {
        let mut hasher = Sha256::new().chain_update(kdk);
        if !counter_mode && counter > 1 {
            hasher.update(previous);
        }
        let block: [u8; 32] = hasher
            .chain_update(counter.to_be_bytes())
            .chain_update(context)
            .finalize()
            .into();

        let take = (len - output.len()).min(block.len());
        output.extend_from_slice(&block[..take]);
        previous = block;
        counter += 1;
    }

    output
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    const KEK: [u8; 32] = [0x5a; 32];

    #[test]
    fn test_wrap_is_bound_to_policy() {
        let policy = AssetPolicy::SYM_CIPHER_AUTH | AssetPolicy::DIR_ENC_GEN;
        let blob = wrap_key(&KEK, policy, &[7u8; 16]);
        assert_eq!(blob.len(), 32);
        assert_ne!(&blob[KEY_BLOB_OVERHEAD..], &[7u8; 16]);

        assert_eq!(unwrap_key(&KEK, policy, &blob).unwrap().as_slice(), &[7u8; 16]);
        assert_eq!(
            unwrap_key(&KEK, policy ^ AssetPolicy::DIR_MASK, &blob).unwrap_err(),
            AssetError::AuthenticationFailed
        );
        assert_eq!(
            unwrap_key(&[0u8; 32], policy, &blob).unwrap_err(),
            AssetError::AuthenticationFailed
        );
    }

    #[test]
    fn test_derive_modes_differ() {
        let counter = derive(&KEK, b"context", true, 48);
        let feedback = derive(&KEK, b"context", false, 48);

        assert_eq!(counter.len(), 48);
        assert_eq!(&counter[..32], &feedback[..32]);
        assert_ne!(&counter[32..], &feedback[32..]);
        assert_eq!(counter, derive(&KEK, b"context", true, 48));
        assert_ne!(counter, derive(&KEK, b"other", true, 48));
    }
}
