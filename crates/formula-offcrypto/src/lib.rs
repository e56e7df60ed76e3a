//! MS-OFFCRYPTO parsing and decryption for password-protected OOXML containers.
//!
//! Supported:
//! - Agile (XML) encryption, `EncryptionInfo` version 4.4, password key encryptor only
//! - Standard (CryptoAPI) AES encryption, `EncryptionInfo` version 3.2
//! - Standard (CryptoAPI) RC4 encryption, `EncryptionInfo` versions 2.2 to 4.2
//!
//! The entry points are [`parse_encryption_info`] and [`decrypt_encrypted_package`], plus
//! [`decrypt_ole_container`] which pulls both streams out of an OLE compound file.
//! [`cryptoapi`] exposes the RC4 block keys for callers that decrypt binary record streams.

use std::io::{Cursor, Read};

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use md5::Md5;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader as XmlReader;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

pub mod agile;
pub mod cryptoapi;
pub mod standard;
mod standard_rc4;

const PASSWORD_KEY_ENCRYPTOR_NS: &[u8] =
    b"http://schemas.microsoft.com/office/2006/keyEncryptor/password";

pub(crate) const CALG_AES_128: u32 = 0x0000_660E;
pub(crate) const CALG_AES_192: u32 = 0x0000_660F;
pub(crate) const CALG_AES_256: u32 = 0x0000_6610;
pub(crate) const CALG_RC4: u32 = 0x0000_6801;
pub(crate) const CALG_MD5: u32 = 0x0000_8003;
pub(crate) const CALG_SHA1: u32 = 0x0000_8004;

/// Stream names inside the OLE container.
pub const ENCRYPTION_INFO_STREAM: &str = "EncryptionInfo";
pub const ENCRYPTED_PACKAGE_STREAM: &str = "EncryptedPackage";

/// Errors returned by this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OffcryptoError {
    #[error("truncated data while reading {context}")]
    Truncated { context: &'static str },
    #[error("unsupported encryption algorithm id 0x{0:08X}")]
    UnsupportedAlgorithm(u32),
    #[error("invalid EncryptionInfo: {context}")]
    InvalidEncryptionInfo { context: &'static str },
    #[error("unsupported EncryptionInfo version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("ciphertext length must be a multiple of 16 bytes, got {len}")]
    InvalidCiphertextLength { len: usize },
    #[error("invalid cipher key length {len}")]
    InvalidKeyLength { len: usize },
    #[error("EncryptedPackage declares {declared} bytes but only {available} decrypted")]
    PackageSizeMismatch { declared: u64, available: usize },
    #[error("container is missing the `{0}` stream")]
    MissingStream(&'static str),
    #[error("failed to read OLE container: {0}")]
    Container(String),
    #[error("invalid password")]
    InvalidPassword,
    #[error("data integrity check failed")]
    IntegrityMismatch,
}

/// Options for [`decrypt_encrypted_package`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecryptOptions {
    /// Validate the Agile `dataIntegrity` HMAC over the `EncryptedPackage` stream.
    ///
    /// Standard encryption carries no integrity data and ignores this flag.
    pub verify_integrity: bool,
}

/// Parsed `EncryptionVersionInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionVersionInfo {
    pub major: u16,
    pub minor: u16,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    fn from_name(name: &str) -> Result<Self, OffcryptoError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(HashAlgorithm::Md5),
            "SHA1" | "SHA-1" => Ok(HashAlgorithm::Sha1),
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA384" | "SHA-384" => Ok(HashAlgorithm::Sha384),
            "SHA512" | "SHA-512" => Ok(HashAlgorithm::Sha512),
            _ => Err(OffcryptoError::InvalidEncryptionInfo {
                context: "unsupported hashAlgorithm",
            }),
        }
    }

    /// Map a CryptoAPI `AlgIDHash`; zero means SHA-1.
    pub(crate) fn from_cryptoapi(alg_id_hash: u32) -> Result<Self, OffcryptoError> {
        match alg_id_hash {
            0 | CALG_SHA1 => Ok(HashAlgorithm::Sha1),
            CALG_MD5 => Ok(HashAlgorithm::Md5),
            other => Err(OffcryptoError::UnsupportedAlgorithm(other)),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        self.digest_parts(&[data])
    }

    pub(crate) fn digest_parts(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            HashAlgorithm::Md5 => run::<Md5>(parts),
            HashAlgorithm::Sha1 => run::<Sha1>(parts),
            HashAlgorithm::Sha256 => run::<Sha256>(parts),
            HashAlgorithm::Sha384 => run::<Sha384>(parts),
            HashAlgorithm::Sha512 => run::<Sha512>(parts),
        }
    }
}

/// The subset of an Agile `EncryptionInfo` needed for password-based decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileEncryptionInfo {
    pub key_data_salt: Vec<u8>,
    pub key_data_hash_algorithm: HashAlgorithm,
    pub key_data_block_size: usize,
    pub encrypted_hmac_key: Vec<u8>,
    pub encrypted_hmac_value: Vec<u8>,
    pub spin_count: u32,
    pub password_salt: Vec<u8>,
    pub password_hash_algorithm: HashAlgorithm,
    pub password_key_bits: usize,
    pub encrypted_key_value: Vec<u8>,
    pub encrypted_verifier_hash_input: Vec<u8>,
    pub encrypted_verifier_hash_value: Vec<u8>,
}

/// Standard (CryptoAPI) `EncryptionHeader` fields we rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionHeader {
    pub flags: u32,
    pub alg_id: u32,
    pub alg_id_hash: u32,
    pub key_size_bits: u32,
}

/// Standard (CryptoAPI) `EncryptionVerifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionVerifier {
    pub salt: Vec<u8>,
    pub encrypted_verifier: [u8; 16],
    pub verifier_hash_size: u32,
    pub encrypted_verifier_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionInfo {
    pub header: StandardEncryptionHeader,
    pub verifier: StandardEncryptionVerifier,
}

/// Parsed `EncryptionInfo` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionInfo {
    Standard {
        version: EncryptionVersionInfo,
        info: StandardEncryptionInfo,
    },
    Agile {
        version: EncryptionVersionInfo,
        info: AgileEncryptionInfo,
    },
}

pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub(crate) fn take(
        &mut self,
        n: usize,
        context: &'static str,
    ) -> Result<&'a [u8], OffcryptoError> {
        let end = self.pos.saturating_add(n);
        let out = self
            .bytes
            .get(self.pos..end)
            .ok_or(OffcryptoError::Truncated { context })?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u16_le(&mut self, context: &'static str) -> Result<u16, OffcryptoError> {
        let b = self.take(2, context)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32_le(&mut self, context: &'static str) -> Result<u32, OffcryptoError> {
        let b = self.take(4, context)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64_le(&mut self, context: &'static str) -> Result<u64, OffcryptoError> {
        let b = self.take(8, context)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}

/// Parse an MS-OFFCRYPTO `EncryptionInfo` stream.
pub fn parse_encryption_info(bytes: &[u8]) -> Result<EncryptionInfo, OffcryptoError> {
    let mut r = Reader::new(bytes);
    let major = r.read_u16_le("EncryptionVersionInfo.major")?;
    let minor = r.read_u16_le("EncryptionVersionInfo.minor")?;
    let flags = r.read_u32_le("EncryptionVersionInfo.flags")?;
    let version = EncryptionVersionInfo {
        major,
        minor,
        flags,
    };

    match (major, minor) {
        (4, 4) => {
            let info = parse_agile_xml(r.remaining())?;
            Ok(EncryptionInfo::Agile { version, info })
        }
        (2..=4, 2) => {
            let info = standard::parse_standard_info(&mut r)?;
            Ok(EncryptionInfo::Standard { version, info })
        }
        _ => Err(OffcryptoError::UnsupportedVersion { major, minor }),
    }
}

/// Decrypt an `EncryptedPackage` stream into the plaintext OOXML zip bytes.
pub fn decrypt_encrypted_package(
    encryption_info: &[u8],
    encrypted_package: &[u8],
    password: &str,
    options: DecryptOptions,
) -> Result<Vec<u8>, OffcryptoError> {
    match parse_encryption_info(encryption_info)? {
        EncryptionInfo::Agile { info, .. } => {
            agile::decrypt_package(&info, encrypted_package, password, options)
        }
        EncryptionInfo::Standard { info, .. } => {
            standard::decrypt_package(&info, encrypted_package, password)
        }
    }
}

/// Read `EncryptionInfo` and `EncryptedPackage` out of an OLE compound file and decrypt.
pub fn decrypt_ole_container(
    ole_bytes: &[u8],
    password: &str,
    options: DecryptOptions,
) -> Result<Vec<u8>, OffcryptoError> {
    let mut ole = cfb::CompoundFile::open(Cursor::new(ole_bytes))
        .map_err(|err| OffcryptoError::Container(err.to_string()))?;
    let encryption_info = read_stream(&mut ole, ENCRYPTION_INFO_STREAM)?;
    let encrypted_package = read_stream(&mut ole, ENCRYPTED_PACKAGE_STREAM)?;
    decrypt_encrypted_package(&encryption_info, &encrypted_package, password, options)
}

fn read_stream<R: std::io::Read + std::io::Seek>(
    ole: &mut cfb::CompoundFile<R>,
    name: &'static str,
) -> Result<Vec<u8>, OffcryptoError> {
    let path = format!("/{name}");
    if !ole.is_stream(&path) {
        return Err(OffcryptoError::MissingStream(name));
    }
    let mut stream = ole
        .open_stream(&path)
        .map_err(|err| OffcryptoError::Container(err.to_string()))?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(|err| OffcryptoError::Container(err.to_string()))?;
    Ok(buf)
}

/// Collects Agile attributes while walking the XML.
#[derive(Default)]
struct AgileFields {
    key_data_salt: Option<Vec<u8>>,
    key_data_hash_algorithm: Option<HashAlgorithm>,
    key_data_block_size: Option<usize>,
    encrypted_hmac_key: Option<Vec<u8>>,
    encrypted_hmac_value: Option<Vec<u8>>,
    spin_count: Option<u32>,
    password_salt: Option<Vec<u8>>,
    password_hash_algorithm: Option<HashAlgorithm>,
    password_key_bits: Option<usize>,
    encrypted_key_value: Option<Vec<u8>>,
    encrypted_verifier_hash_input: Option<Vec<u8>>,
    encrypted_verifier_hash_value: Option<Vec<u8>>,
}

impl AgileFields {
    fn visit(
        &mut self,
        e: &BytesStart<'_>,
        namespaces: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<(), OffcryptoError> {
        match e.local_name().as_ref() {
            b"keyData" => {
                for (key, value) in attributes(e)? {
                    match key.as_slice() {
                        b"saltValue" => self.key_data_salt = Some(decode_base64(&value)?),
                        b"hashAlgorithm" => {
                            self.key_data_hash_algorithm =
                                Some(HashAlgorithm::from_name(attr_str(&value)?)?)
                        }
                        b"blockSize" => self.key_data_block_size = Some(parse_number(&value)?),
                        _ => {}
                    }
                }
            }
            b"dataIntegrity" => {
                for (key, value) in attributes(e)? {
                    match key.as_slice() {
                        b"encryptedHmacKey" => {
                            self.encrypted_hmac_key = Some(decode_base64(&value)?)
                        }
                        b"encryptedHmacValue" => {
                            self.encrypted_hmac_value = Some(decode_base64(&value)?)
                        }
                        _ => {}
                    }
                }
            }
            b"encryptedKey" => {
                let name = e.name();
                let prefix = match name.as_ref().iter().rposition(|b| *b == b':') {
                    Some(idx) => &name.as_ref()[..idx],
                    None => &[][..],
                };
                let uri = namespaces
                    .iter()
                    .rev()
                    .find(|(p, _)| p.as_slice() == prefix)
                    .map(|(_, uri)| uri.as_slice());
                if uri != Some(PASSWORD_KEY_ENCRYPTOR_NS) {
                    return Ok(());
                }
                for (key, value) in attributes(e)? {
                    match key.as_slice() {
                        b"spinCount" => self.spin_count = Some(parse_number(&value)?),
                        b"saltValue" => self.password_salt = Some(decode_base64(&value)?),
                        b"hashAlgorithm" => {
                            self.password_hash_algorithm =
                                Some(HashAlgorithm::from_name(attr_str(&value)?)?)
                        }
                        b"keyBits" => self.password_key_bits = Some(parse_number(&value)?),
                        b"encryptedKeyValue" => {
                            self.encrypted_key_value = Some(decode_base64(&value)?)
                        }
                        b"encryptedVerifierHashInput" => {
                            self.encrypted_verifier_hash_input = Some(decode_base64(&value)?)
                        }
                        b"encryptedVerifierHashValue" => {
                            self.encrypted_verifier_hash_value = Some(decode_base64(&value)?)
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<AgileEncryptionInfo, OffcryptoError> {
        fn req<T>(v: Option<T>, context: &'static str) -> Result<T, OffcryptoError> {
            v.ok_or(OffcryptoError::InvalidEncryptionInfo { context })
        }
        Ok(AgileEncryptionInfo {
            key_data_salt: req(self.key_data_salt, "missing keyData.saltValue")?,
            key_data_hash_algorithm: req(
                self.key_data_hash_algorithm,
                "missing keyData.hashAlgorithm",
            )?,
            key_data_block_size: req(self.key_data_block_size, "missing keyData.blockSize")?,
            encrypted_hmac_key: self.encrypted_hmac_key.unwrap_or_default(),
            encrypted_hmac_value: self.encrypted_hmac_value.unwrap_or_default(),
            spin_count: req(self.spin_count, "missing encryptedKey.spinCount")?,
            password_salt: req(self.password_salt, "missing encryptedKey.saltValue")?,
            password_hash_algorithm: req(
                self.password_hash_algorithm,
                "missing encryptedKey.hashAlgorithm",
            )?,
            password_key_bits: req(self.password_key_bits, "missing encryptedKey.keyBits")?,
            encrypted_key_value: req(
                self.encrypted_key_value,
                "missing encryptedKey.encryptedKeyValue",
            )?,
            encrypted_verifier_hash_input: req(
                self.encrypted_verifier_hash_input,
                "missing encryptedKey.encryptedVerifierHashInput",
            )?,
            encrypted_verifier_hash_value: req(
                self.encrypted_verifier_hash_value,
                "missing encryptedKey.encryptedVerifierHashValue",
            )?,
        })
    }
}

fn parse_agile_xml(xml_bytes: &[u8]) -> Result<AgileEncryptionInfo, OffcryptoError> {
    let xml = std::str::from_utf8(xml_bytes).map_err(|_| OffcryptoError::InvalidEncryptionInfo {
        context: "agile EncryptionInfo XML is not valid UTF-8",
    })?;
    // Some producers prepend a BOM.
    let xml = xml.trim_start_matches('\u{feff}');

    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    // (prefix, uri) declarations plus the depth at which each was declared.
    let mut namespaces: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut frames: Vec<usize> = Vec::new();
    let mut fields = AgileFields::default();

    loop {
        let event = reader
            .read_event()
            .map_err(|_| OffcryptoError::InvalidEncryptionInfo {
                context: "agile EncryptionInfo XML parse error",
            })?;
        match event {
            XmlEvent::Start(e) => {
                frames.push(namespaces.len());
                push_namespaces(&e, &mut namespaces)?;
                fields.visit(&e, &namespaces)?;
            }
            XmlEvent::Empty(e) => {
                let mark = namespaces.len();
                push_namespaces(&e, &mut namespaces)?;
                fields.visit(&e, &namespaces)?;
                namespaces.truncate(mark);
            }
            XmlEvent::End(_) => {
                if let Some(mark) = frames.pop() {
                    namespaces.truncate(mark);
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    fields.finish()
}

fn push_namespaces(
    e: &BytesStart<'_>,
    namespaces: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<(), OffcryptoError> {
    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| OffcryptoError::InvalidEncryptionInfo {
            context: "invalid XML attribute",
        })?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            namespaces.push((Vec::new(), attr.value.to_vec()));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            namespaces.push((prefix.to_vec(), attr.value.to_vec()));
        }
    }
    Ok(())
}

fn attributes(e: &BytesStart<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, OffcryptoError> {
    let mut out = Vec::new();
    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| OffcryptoError::InvalidEncryptionInfo {
            context: "invalid XML attribute",
        })?;
        out.push((attr.key.local_name().as_ref().to_vec(), attr.value.to_vec()));
    }
    Ok(out)
}

fn attr_str(value: &[u8]) -> Result<&str, OffcryptoError> {
    std::str::from_utf8(value).map_err(|_| OffcryptoError::InvalidEncryptionInfo {
        context: "invalid UTF-8 attribute value",
    })
}

fn parse_number<T: std::str::FromStr>(value: &[u8]) -> Result<T, OffcryptoError> {
    attr_str(value)?
        .trim()
        .parse::<T>()
        .map_err(|_| OffcryptoError::InvalidEncryptionInfo {
            context: "invalid numeric attribute",
        })
}

/// Base64 attribute values may be pretty-printed with whitespace and may omit padding.
fn decode_base64(value: &[u8]) -> Result<Vec<u8>, OffcryptoError> {
    let cleaned: Vec<u8> = value
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .map_err(|_| OffcryptoError::InvalidEncryptionInfo {
            context: "invalid base64 value",
        })
}

/// `H0 = Hash(salt || password)`, then `Hn = Hash(LE32(n) || Hn-1)` for each spin.
pub fn iterated_hash(
    password_utf16le: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    spin_count: u32,
) -> Zeroizing<Vec<u8>> {
    let mut h = Zeroizing::new(hash_alg.digest_parts(&[salt, password_utf16le]));
    for i in 0..spin_count {
        h = Zeroizing::new(hash_alg.digest_parts(&[&i.to_le_bytes()[..], &h[..]]));
    }
    h
}

pub(crate) fn password_to_utf16le(password: &str) -> Vec<u8> {
    password
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq as _;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn with_cipher<F>(key: &[u8], f: F) -> Result<(), OffcryptoError>
where
    F: FnOnce(&dyn Fn(&mut [u8])),
{
    fn build<C: BlockDecrypt + KeyInit>(key: &[u8]) -> Result<C, OffcryptoError> {
        C::new_from_slice(key).map_err(|_| OffcryptoError::InvalidKeyLength { len: key.len() })
    }
    match key.len() {
        16 => {
            let c: Aes128 = build(key)?;
            f(&|block: &mut [u8]| c.decrypt_block(GenericArray::from_mut_slice(block)));
        }
        24 => {
            let c: Aes192 = build(key)?;
            f(&|block: &mut [u8]| c.decrypt_block(GenericArray::from_mut_slice(block)));
        }
        32 => {
            let c: Aes256 = build(key)?;
            f(&|block: &mut [u8]| c.decrypt_block(GenericArray::from_mut_slice(block)));
        }
        len => return Err(OffcryptoError::InvalidKeyLength { len }),
    }
    Ok(())
}

pub(crate) fn aes_ecb_decrypt_in_place(key: &[u8], buf: &mut [u8]) -> Result<(), OffcryptoError> {
    if buf.len() % 16 != 0 {
        return Err(OffcryptoError::InvalidCiphertextLength { len: buf.len() });
    }
    with_cipher(key, |decrypt| {
        for block in buf.chunks_mut(16) {
            decrypt(block);
        }
    })
}

pub(crate) fn aes_cbc_decrypt_in_place(
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), OffcryptoError> {
    if buf.len() % 16 != 0 {
        return Err(OffcryptoError::InvalidCiphertextLength { len: buf.len() });
    }
    if iv.len() != 16 {
        return Err(OffcryptoError::InvalidEncryptionInfo {
            context: "AES IV must be 16 bytes",
        });
    }
    with_cipher(key, |decrypt| {
        let mut prev = [0u8; 16];
        prev.copy_from_slice(iv);
        for block in buf.chunks_mut(16) {
            let mut saved = [0u8; 16];
            saved.copy_from_slice(block);
            decrypt(block);
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            prev = saved;
        }
    })
}
