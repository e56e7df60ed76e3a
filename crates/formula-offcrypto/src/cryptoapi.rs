//! CryptoAPI RC4 keys shared by Standard `EncryptedPackage` streams and BIFF8 `FILEPASS`
//! workbooks.
//!
//! Both derive a base hash `H` from the salted password, then key RC4 per block with
//! `Hash(H || LE32(block))` truncated to the key size. They differ in the spin count and in how
//! block numbers map onto the ciphertext, so callers pick both.

use rc4::consts::{U16, U7};
use rc4::{KeyInit, Rc4, StreamCipher};
use zeroize::Zeroizing;

use crate::{
    ct_eq, iterated_hash, password_to_utf16le, HashAlgorithm, OffcryptoError,
    StandardEncryptionInfo, CALG_RC4,
};

/// Spin count Office applies to Standard `EncryptedPackage` passwords.
pub const STANDARD_SPIN_COUNT: u32 = 50_000;

/// `EncryptedPackage` streams are re-keyed every 512 bytes.
pub const RC4_BLOCK_LEN: usize = 0x200;

/// An RC4 keystream for one block.
pub enum Rc4Cipher {
    Key56(Rc4<U7>),
    Key128(Rc4<U16>),
}

impl Rc4Cipher {
    pub fn new(key: &[u8]) -> Result<Self, OffcryptoError> {
        let invalid = |_| OffcryptoError::InvalidKeyLength { len: key.len() };
        match key.len() {
            7 => Rc4::<U7>::new_from_slice(key).map(Self::Key56).map_err(invalid),
            16 => Rc4::<U16>::new_from_slice(key).map(Self::Key128).map_err(invalid),
            len => Err(OffcryptoError::InvalidKeyLength { len }),
        }
    }

    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        match self {
            Self::Key56(cipher) => cipher.apply_keystream(buf),
            Self::Key128(cipher) => cipher.apply_keystream(buf),
        }
    }

    /// Advance the keystream by `len` bytes without touching any data.
    pub fn skip(&mut self, mut len: usize) {
        let mut scratch = [0u8; 64];
        while len > 0 {
            let n = len.min(scratch.len());
            self.apply_keystream(&mut scratch[..n]);
            len -= n;
        }
    }
}

/// Key size in bits for a CryptoAPI RC4 header; zero means 40.
pub(crate) fn rc4_key_bits(key_size_bits: u32) -> u32 {
    if key_size_bits == 0 {
        40
    } else {
        key_size_bits
    }
}

/// `Hash(H || LE32(block))` truncated to the key size.
///
/// A 40-bit key is five bytes of hash followed by eleven zero bytes.
pub fn rc4_key_for_block(
    h: &[u8],
    block: u32,
    key_size_bits: u32,
    hash_alg: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, OffcryptoError> {
    let bits = rc4_key_bits(key_size_bits);
    if bits % 8 != 0 {
        return Err(OffcryptoError::UnsupportedAlgorithm(CALG_RC4));
    }
    let mut key = Zeroizing::new(hash_alg.digest_parts(&[h, &block.to_le_bytes()[..]]));
    let len = (bits / 8) as usize;
    if key.len() < len {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "RC4 key size exceeds the hash output",
        });
    }
    key.truncate(len);
    if bits == 40 {
        key.resize(16, 0);
    }
    Ok(key)
}

/// Password-checked RC4 key material for one document.
pub struct Rc4BlockKeys {
    h: Zeroizing<Vec<u8>>,
    key_size_bits: u32,
    hash_alg: HashAlgorithm,
}

impl Rc4BlockKeys {
    /// Derive the base hash with `spin_count` rounds and check it against the verifier.
    ///
    /// The verifier and its hash share one block-0 keystream, in that order.
    pub fn unlock(
        info: &StandardEncryptionInfo,
        password: &str,
        spin_count: u32,
    ) -> Result<Self, OffcryptoError> {
        if info.header.alg_id != CALG_RC4 {
            return Err(OffcryptoError::UnsupportedAlgorithm(info.header.alg_id));
        }
        let hash_alg = HashAlgorithm::from_cryptoapi(info.header.alg_id_hash)?;
        let password_utf16le = Zeroizing::new(password_to_utf16le(password));
        let keys = Self {
            h: iterated_hash(&password_utf16le, &info.verifier.salt, hash_alg, spin_count),
            key_size_bits: info.header.key_size_bits,
            hash_alg,
        };

        let mut cipher = keys.cipher_for_block(0)?;
        let mut verifier = Zeroizing::new(info.verifier.encrypted_verifier);
        cipher.apply_keystream(&mut verifier[..]);
        let mut verifier_hash = Zeroizing::new(info.verifier.encrypted_verifier_hash.clone());
        cipher.apply_keystream(&mut verifier_hash);

        let expected = hash_alg.digest(&verifier[..]);
        let actual = verifier_hash
            .get(..info.verifier.verifier_hash_size as usize)
            .ok_or(OffcryptoError::InvalidEncryptionInfo {
                context: "encryptedVerifierHash is shorter than verifierHashSize",
            })?;
        if ct_eq(&expected, actual) {
            Ok(keys)
        } else {
            Err(OffcryptoError::InvalidPassword)
        }
    }

    pub fn cipher_for_block(&self, block: u32) -> Result<Rc4Cipher, OffcryptoError> {
        let key = rc4_key_for_block(&self.h, block, self.key_size_bits, self.hash_alg)?;
        Rc4Cipher::new(&key)
    }
}
