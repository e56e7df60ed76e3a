//! Agile (XML) encryption: password verification, secret key recovery and
//! segment-wise `EncryptedPackage` decryption.
//!
//! The iterated password hash is computed once per attempt and reused for the three
//! block keys (verifier input, verifier value, key value).

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::{
    aes_cbc_decrypt_in_place, ct_eq, iterated_hash, password_to_utf16le, AgileEncryptionInfo,
    DecryptOptions, HashAlgorithm, OffcryptoError, Reader,
};

const VERIFIER_HASH_INPUT_BLOCK: [u8; 8] = [0xFE, 0xA7, 0xD2, 0x76, 0x3B, 0x4B, 0x9E, 0x79];
const VERIFIER_HASH_VALUE_BLOCK: [u8; 8] = [0xD7, 0xAA, 0x0F, 0x6D, 0x30, 0x61, 0x34, 0x4E];
const KEY_VALUE_BLOCK: [u8; 8] = [0x14, 0x6E, 0x0B, 0xE7, 0xAB, 0xAC, 0xD0, 0xD6];
const HMAC_KEY_BLOCK: [u8; 8] = [0x5F, 0xB2, 0xAD, 0x01, 0x0C, 0xB9, 0xE1, 0xF6];
const HMAC_VALUE_BLOCK: [u8; 8] = [0xA0, 0x67, 0x7F, 0x02, 0xB2, 0x2C, 0x84, 0x33];

const SEGMENT_LEN: usize = 4096;
const VERIFIER_HASH_INPUT_LEN: usize = 16;

/// Truncate `bytes` to `len`, or pad it with `0x36` up to `len`.
fn fit(mut bytes: Vec<u8>, len: usize) -> Vec<u8> {
    bytes.resize(len, 0x36);
    bytes
}

fn block_key(
    h: &[u8],
    block: &[u8; 8],
    hash_alg: HashAlgorithm,
    key_bits: usize,
) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(fit(hash_alg.digest_parts(&[h, &block[..]]), key_bits / 8))
}

fn key_data_iv(info: &AgileEncryptionInfo, suffix: &[u8]) -> Vec<u8> {
    fit(
        info.key_data_hash_algorithm
            .digest_parts(&[&info.key_data_salt[..], suffix]),
        info.key_data_block_size,
    )
}

fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, OffcryptoError> {
    let mut buf = ciphertext.to_vec();
    aes_cbc_decrypt_in_place(key, iv, &mut buf)?;
    Ok(buf)
}

/// Verify `password` and recover the package key.
pub fn secret_key_from_password(
    info: &AgileEncryptionInfo,
    password: &str,
) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
    if info.password_key_bits == 0 || info.password_key_bits % 8 != 0 {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "encryptedKey.keyBits is not divisible by 8",
        });
    }
    let alg = info.password_hash_algorithm;
    let bits = info.password_key_bits;
    let iv = &info.password_salt;

    let password_utf16le = Zeroizing::new(password_to_utf16le(password));
    let h = iterated_hash(&password_utf16le, &info.password_salt, alg, info.spin_count);

    let input_key = block_key(&h, &VERIFIER_HASH_INPUT_BLOCK, alg, bits);
    let verifier_input = decrypt(&input_key, iv, &info.encrypted_verifier_hash_input)?;
    let verifier_input = verifier_input
        .get(..VERIFIER_HASH_INPUT_LEN)
        .ok_or(OffcryptoError::InvalidEncryptionInfo {
            context: "decrypted verifierHashInput is truncated",
        })?;

    let value_key = block_key(&h, &VERIFIER_HASH_VALUE_BLOCK, alg, bits);
    let verifier_value = decrypt(&value_key, iv, &info.encrypted_verifier_hash_value)?;
    let expected = alg.digest(verifier_input);
    let actual = verifier_value
        .get(..expected.len())
        .ok_or(OffcryptoError::InvalidPassword)?;
    if !ct_eq(&expected, actual) {
        return Err(OffcryptoError::InvalidPassword);
    }

    let secret_key = block_key(&h, &KEY_VALUE_BLOCK, alg, bits);
    let key_value = Zeroizing::new(decrypt(&secret_key, iv, &info.encrypted_key_value)?);
    let secret = key_value
        .get(..bits / 8)
        .ok_or(OffcryptoError::InvalidEncryptionInfo {
            context: "decrypted keyValue is truncated",
        })?;
    Ok(Zeroizing::new(secret.to_vec()))
}

fn hmac(alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, OffcryptoError> {
    macro_rules! run {
        ($digest:ty) => {{
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key).map_err(|_| {
                OffcryptoError::InvalidEncryptionInfo {
                    context: "invalid HMAC key",
                }
            })?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }};
    }
    Ok(match alg {
        HashAlgorithm::Md5 => run!(Md5),
        HashAlgorithm::Sha1 => run!(Sha1),
        HashAlgorithm::Sha256 => run!(Sha256),
        HashAlgorithm::Sha384 => run!(Sha384),
        HashAlgorithm::Sha512 => run!(Sha512),
    })
}

/// Check the `dataIntegrity` HMAC over the whole `EncryptedPackage` stream.
pub fn verify_data_integrity(
    info: &AgileEncryptionInfo,
    secret_key: &[u8],
    encrypted_package: &[u8],
) -> Result<(), OffcryptoError> {
    if info.encrypted_hmac_key.is_empty() || info.encrypted_hmac_value.is_empty() {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "missing dataIntegrity element",
        });
    }
    let digest_len = info.key_data_hash_algorithm.digest_len();

    let hmac_key = decrypt(
        secret_key,
        &key_data_iv(info, &HMAC_KEY_BLOCK),
        &info.encrypted_hmac_key,
    )?;
    let hmac_key = hmac_key
        .get(..digest_len)
        .ok_or(OffcryptoError::IntegrityMismatch)?;
    let hmac_value = decrypt(
        secret_key,
        &key_data_iv(info, &HMAC_VALUE_BLOCK),
        &info.encrypted_hmac_value,
    )?;
    let expected = hmac_value
        .get(..digest_len)
        .ok_or(OffcryptoError::IntegrityMismatch)?;

    let computed = hmac(info.key_data_hash_algorithm, hmac_key, encrypted_package)?;
    if ct_eq(&computed, expected) {
        Ok(())
    } else {
        Err(OffcryptoError::IntegrityMismatch)
    }
}

pub(crate) fn decrypt_package(
    info: &AgileEncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
    options: DecryptOptions,
) -> Result<Vec<u8>, OffcryptoError> {
    let secret = secret_key_from_password(info, password)?;
    if options.verify_integrity {
        verify_data_integrity(info, &secret, encrypted_package)?;
    }

    let mut r = Reader::new(encrypted_package);
    let declared = r.read_u64_le("EncryptedPackage.size")?;
    let ciphertext = r.remaining();

    let mut out = Vec::with_capacity(ciphertext.len());
    for (index, segment) in ciphertext.chunks(SEGMENT_LEN).enumerate() {
        if out.len() as u64 >= declared {
            break;
        }
        let iv = key_data_iv(info, &(index as u32).to_le_bytes());
        out.extend_from_slice(&decrypt(&secret, &iv, segment)?);
    }

    if (out.len() as u64) < declared {
        return Err(OffcryptoError::PackageSizeMismatch {
            declared,
            available: out.len(),
        });
    }
    out.truncate(declared as usize);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_truncates_and_pads() {
        assert_eq!(fit(vec![1, 2, 3], 2), vec![1, 2]);
        assert_eq!(fit(vec![1], 3), vec![1, 0x36, 0x36]);
    }

    #[test]
    fn zero_spin_count_is_a_single_hash() {
        let h = iterated_hash(b"p\0", b"salt", HashAlgorithm::Sha256, 0);
        assert_eq!(h.as_slice(), HashAlgorithm::Sha256.digest(b"saltp\0").as_slice());
    }

    #[test]
    fn spin_rounds_prefix_the_counter() {
        let h0 = HashAlgorithm::Sha1.digest(b"s\x61\x00");
        let mut round = 0u32.to_le_bytes().to_vec();
        round.extend_from_slice(&h0);
        let h1 = HashAlgorithm::Sha1.digest(&round);
        assert_eq!(
            iterated_hash(b"\x61\x00", b"s", HashAlgorithm::Sha1, 1).as_slice(),
            h1.as_slice()
        );
    }
}
