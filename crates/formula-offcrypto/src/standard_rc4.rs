//! Standard (CryptoAPI) RC4 `EncryptedPackage` decryption.
//!
//! The package body is RC4, re-keyed every [`RC4_BLOCK_LEN`] bytes with the block index.

use crate::cryptoapi::{Rc4BlockKeys, RC4_BLOCK_LEN, STANDARD_SPIN_COUNT};
use crate::{OffcryptoError, Reader, StandardEncryptionInfo};

pub(crate) fn decrypt_package(
    info: &StandardEncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
) -> Result<Vec<u8>, OffcryptoError> {
    let keys = Rc4BlockKeys::unlock(info, password, STANDARD_SPIN_COUNT)?;

    let mut r = Reader::new(encrypted_package);
    let declared = r.read_u64_le("EncryptedPackage.size")?;
    let ciphertext = r.remaining();
    if (ciphertext.len() as u64) < declared {
        return Err(OffcryptoError::PackageSizeMismatch {
            declared,
            available: ciphertext.len(),
        });
    }

    let mut out = ciphertext[..declared as usize].to_vec();
    for (block, chunk) in out.chunks_mut(RC4_BLOCK_LEN).enumerate() {
        let block = u32::try_from(block).map_err(|_| OffcryptoError::InvalidEncryptionInfo {
            context: "EncryptedPackage has too many RC4 blocks",
        })?;
        keys.cipher_for_block(block)?.apply_keystream(chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::cryptoapi::{rc4_key_for_block, Rc4Cipher, RC4_BLOCK_LEN, STANDARD_SPIN_COUNT};
    use crate::{
        decrypt_encrypted_package, iterated_hash, password_to_utf16le, DecryptOptions,
        HashAlgorithm, OffcryptoError, CALG_MD5, CALG_RC4,
    };

    const SALT: [u8; 16] = [0x3C; 16];

    fn encrypt_blocks(h: &[u8], data: &mut [u8]) {
        for (block, chunk) in data.chunks_mut(RC4_BLOCK_LEN).enumerate() {
            let key = rc4_key_for_block(h, block as u32, 128, HashAlgorithm::Md5).unwrap();
            Rc4Cipher::new(&key).unwrap().apply_keystream(chunk);
        }
    }

    /// MD5-hashed, 128-bit RC4 `EncryptionInfo` plus the matching `EncryptedPackage`.
    fn encrypt(plain: &[u8], password: &str) -> (Vec<u8>, Vec<u8>) {
        let h = iterated_hash(
            &password_to_utf16le(password),
            &SALT,
            HashAlgorithm::Md5,
            STANDARD_SPIN_COUNT,
        );

        let verifier = [0x24u8; 16];
        let mut sealed = verifier.to_vec();
        sealed.extend_from_slice(&HashAlgorithm::Md5.digest(&verifier));
        let key0 = rc4_key_for_block(&h, 0, 128, HashAlgorithm::Md5).unwrap();
        Rc4Cipher::new(&key0).unwrap().apply_keystream(&mut sealed);

        let mut header = Vec::new();
        for field in [0x04u32, 0, CALG_RC4, CALG_MD5, 128, 1, 0, 0] {
            header.extend_from_slice(&field.to_le_bytes());
        }

        let mut info = Vec::new();
        info.extend_from_slice(&4u16.to_le_bytes());
        info.extend_from_slice(&2u16.to_le_bytes());
        info.extend_from_slice(&0x04u32.to_le_bytes());
        info.extend_from_slice(&(header.len() as u32).to_le_bytes());
        info.extend_from_slice(&header);
        info.extend_from_slice(&16u32.to_le_bytes());
        info.extend_from_slice(&SALT);
        info.extend_from_slice(&sealed[..16]);
        info.extend_from_slice(&16u32.to_le_bytes());
        info.extend_from_slice(&sealed[16..]);

        let mut body = plain.to_vec();
        encrypt_blocks(&h, &mut body);
        let mut package = (plain.len() as u64).to_le_bytes().to_vec();
        package.extend_from_slice(&body);
        (info, package)
    }

    #[test]
    fn rc4_package_spanning_several_blocks_decrypts() {
        let plain: Vec<u8> = (0..1300u32).map(|i| (i * 7 % 251) as u8).collect();
        let (info, package) = encrypt(&plain, "pässword");

        let decrypted =
            decrypt_encrypted_package(&info, &package, "pässword", DecryptOptions::default())
                .unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn rc4_package_rejects_wrong_password() {
        let (info, package) = encrypt(b"PK\x03\x04", "right");
        let err =
            decrypt_encrypted_package(&info, &package, "wrong", DecryptOptions::default())
                .unwrap_err();
        assert_eq!(err, OffcryptoError::InvalidPassword);
    }

    #[test]
    fn rc4_package_shorter_than_declared_size_is_rejected() {
        let (info, mut package) = encrypt(&[0x55; 40], "right");
        package.truncate(package.len() - 10);
        let err =
            decrypt_encrypted_package(&info, &package, "right", DecryptOptions::default())
                .unwrap_err();
        assert_eq!(
            err,
            OffcryptoError::PackageSizeMismatch {
                declared: 40,
                available: 30
            }
        );
    }
}
