//! Standard (CryptoAPI) encryption.
//!
//! The AES variant derives the package key from SHA-1 with a fixed 50,000 spin count, verifies
//! it against the `EncryptionVerifier`, and decrypts the package body with AES-ECB and no IV.
//! RC4 headers are parsed here and handed to the RC4 package reader.

use sha1::{Digest as _, Sha1};
use zeroize::Zeroizing;

use crate::cryptoapi::{rc4_key_bits, STANDARD_SPIN_COUNT};
use crate::{
    aes_ecb_decrypt_in_place, ct_eq, iterated_hash, password_to_utf16le, standard_rc4,
    HashAlgorithm, OffcryptoError, Reader, StandardEncryptionHeader, StandardEncryptionInfo,
    StandardEncryptionVerifier, CALG_AES_128, CALG_AES_192, CALG_AES_256, CALG_RC4,
};

const SHA1_LEN: usize = 20;
/// The AES verifier hash is a SHA-1 digest padded to two AES blocks.
const AES_VERIFIER_HASH_LEN: usize = 32;

pub(crate) fn parse_standard_info(
    r: &mut Reader<'_>,
) -> Result<StandardEncryptionInfo, OffcryptoError> {
    let header_size = r.read_u32_le("EncryptionInfo.headerSize")? as usize;
    let mut hr = Reader::new(r.take(header_size, "EncryptionHeader")?);
    let flags = hr.read_u32_le("EncryptionHeader.flags")?;
    let _size_extra = hr.read_u32_le("EncryptionHeader.sizeExtra")?;
    let alg_id = hr.read_u32_le("EncryptionHeader.algId")?;
    let alg_id_hash = hr.read_u32_le("EncryptionHeader.algIdHash")?;
    let key_size_bits = hr.read_u32_le("EncryptionHeader.keySize")?;

    let hash_alg = HashAlgorithm::from_cryptoapi(alg_id_hash)?;
    match alg_id {
        CALG_AES_128 | CALG_AES_192 | CALG_AES_256 => {
            let expected_bits = match alg_id {
                CALG_AES_128 => 128,
                CALG_AES_192 => 192,
                _ => 256,
            };
            if key_size_bits != expected_bits {
                return Err(OffcryptoError::UnsupportedAlgorithm(alg_id));
            }
            if hash_alg != HashAlgorithm::Sha1 {
                return Err(OffcryptoError::UnsupportedAlgorithm(alg_id_hash));
            }
        }
        CALG_RC4 => {
            if !matches!(rc4_key_bits(key_size_bits), 40 | 56 | 128) {
                return Err(OffcryptoError::UnsupportedAlgorithm(alg_id));
            }
        }
        other => return Err(OffcryptoError::UnsupportedAlgorithm(other)),
    }

    let salt_size = r.read_u32_le("EncryptionVerifier.saltSize")? as usize;
    if salt_size != 16 {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "EncryptionVerifier.saltSize must be 16",
        });
    }
    let salt = r.take(16, "EncryptionVerifier.salt")?.to_vec();
    let mut encrypted_verifier = [0u8; 16];
    encrypted_verifier.copy_from_slice(r.take(16, "EncryptionVerifier.encryptedVerifier")?);
    let verifier_hash_size = r.read_u32_le("EncryptionVerifier.verifierHashSize")?;
    let hash_field_len = if alg_id == CALG_RC4 {
        if verifier_hash_size as usize != hash_alg.digest_len() {
            return Err(OffcryptoError::InvalidEncryptionInfo {
                context: "EncryptionVerifier.verifierHashSize does not match algIdHash",
            });
        }
        verifier_hash_size as usize
    } else {
        AES_VERIFIER_HASH_LEN
    };
    let encrypted_verifier_hash = r
        .take(hash_field_len, "EncryptionVerifier.encryptedVerifierHash")?
        .to_vec();

    Ok(StandardEncryptionInfo {
        header: StandardEncryptionHeader {
            flags,
            alg_id,
            alg_id_hash,
            key_size_bits,
        },
        verifier: StandardEncryptionVerifier {
            salt,
            encrypted_verifier,
            verifier_hash_size,
            encrypted_verifier_hash,
        },
    })
}

fn sha1(parts: &[&[u8]]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Password to AES key derivation for Standard encryption.
pub fn derive_key(
    info: &StandardEncryptionInfo,
    password: &str,
) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
    let key_len = (info.header.key_size_bits / 8) as usize;
    let password_utf16 = Zeroizing::new(password_to_utf16le(password));
    let h = iterated_hash(
        &password_utf16,
        &info.verifier.salt,
        HashAlgorithm::Sha1,
        STANDARD_SPIN_COUNT,
    );
    let hfinal = sha1(&[&h[..], &0u32.to_le_bytes()[..]]);

    let mut inner = [0x36u8; 64];
    let mut outer = [0x5cu8; 64];
    for i in 0..SHA1_LEN {
        inner[i] ^= hfinal[i];
        outer[i] ^= hfinal[i];
    }
    let mut derived = Zeroizing::new(Vec::with_capacity(SHA1_LEN * 2));
    derived.extend_from_slice(&sha1(&[&inner[..]]));
    derived.extend_from_slice(&sha1(&[&outer[..]]));

    if key_len > derived.len() {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "keySize exceeds the SHA-1 derivation output",
        });
    }
    derived.truncate(key_len);
    Ok(derived)
}

/// Check a derived key against the `EncryptionVerifier`.
pub fn verify_key(info: &StandardEncryptionInfo, key: &[u8]) -> Result<(), OffcryptoError> {
    let mut verifier = info.verifier.encrypted_verifier;
    aes_ecb_decrypt_in_place(key, &mut verifier)?;
    let expected = sha1(&[&verifier[..]]);

    let mut verifier_hash = info.verifier.encrypted_verifier_hash.clone();
    aes_ecb_decrypt_in_place(key, &mut verifier_hash)?;
    if ct_eq(&expected, &verifier_hash[..SHA1_LEN]) {
        Ok(())
    } else {
        Err(OffcryptoError::InvalidPassword)
    }
}

pub(crate) fn decrypt_package(
    info: &StandardEncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
) -> Result<Vec<u8>, OffcryptoError> {
    if info.header.alg_id == CALG_RC4 {
        return standard_rc4::decrypt_package(info, encrypted_package, password);
    }
    let key = derive_key(info, password)?;
    verify_key(info, &key)?;

    let mut r = Reader::new(encrypted_package);
    let declared = r.read_u64_le("EncryptedPackage.size")?;
    let ciphertext = r.remaining();
    // Trailing bytes past the last whole block are container slack.
    let usable = ciphertext.len() - ciphertext.len() % 16;
    let mut out = ciphertext[..usable].to_vec();
    aes_ecb_decrypt_in_place(&key, &mut out)?;

    if (out.len() as u64) < declared {
        return Err(OffcryptoError::PackageSizeMismatch {
            declared,
            available: out.len(),
        });
    }
    out.truncate(declared as usize);
    Ok(out)
}
