//! Password-protected `.xls` workbooks (BIFF8 `FILEPASS`, RC4 CryptoAPI).
//!
//! The workbook stream is decrypted in place and the `FILEPASS` record id is masked, so record
//! offsets such as `BoundSheet8.lbPlyPos` stay valid and the backend sees a plaintext workbook.
//! Record headers are never encrypted. Payload bytes are XORed with an RC4 keystream addressed
//! by absolute stream offset and re-keyed every 1024 bytes.

use std::io::{Cursor, Read, Write};

use formula_offcrypto::cryptoapi::{Rc4BlockKeys, Rc4Cipher};
use formula_offcrypto::{parse_encryption_info, EncryptionInfo};
use log::debug;

use crate::error::OpenError;
use crate::format::SourceReader;

const RECORD_BOF: u16 = 0x0809;
const RECORD_EOF: u16 = 0x000A;
const RECORD_FILEPASS: u16 = 0x002F;
const RECORD_INTERFACEHDR: u16 = 0x00E1;
const RECORD_BOUNDSHEET: u16 = 0x0085;
const RECORD_RRDHEAD: u16 = 0x0138;
const RECORD_USREXCL: u16 = 0x0194;
const RECORD_FILELOCK: u16 = 0x0195;
const RECORD_RRDINFO: u16 = 0x0196;
/// Not a defined BIFF record id; backends skip it.
const RECORD_MASKED: u16 = 0xFFFF;

const ENCRYPTION_TYPE_XOR: u16 = 0x0000;
const ENCRYPTION_TYPE_RC4: u16 = 0x0001;

const REKEY_INTERVAL: usize = 1024;
/// The password hash is not iterated for binary workbooks.
const SPIN_COUNT: u32 = 0;

/// Decrypt the workbook stream of the compound file in `reader` and return a new in-memory
/// compound file holding the plaintext stream.
pub(crate) fn decrypt_legacy_workbook(
    reader: &mut SourceReader,
    password: &str,
) -> Result<SourceReader, OpenError> {
    let mut ole = cfb::CompoundFile::open(&mut *reader).map_err(OpenError::io)?;
    let name = ["/Workbook", "/Book"]
        .into_iter()
        .find(|name| ole.is_stream(name))
        .ok_or(OpenError::NotAWorkbook)?;

    let mut stream = Vec::new();
    ole.open_stream(name)
        .and_then(|mut s| s.read_to_end(&mut stream))
        .map_err(OpenError::io)?;
    drop(ole);

    decrypt_workbook_stream(&mut stream, password)?;

    let mut plain = cfb::CompoundFile::create(Cursor::new(Vec::new())).map_err(OpenError::io)?;
    plain
        .create_stream(name)
        .and_then(|mut s| s.write_all(&stream))
        .map_err(OpenError::io)?;
    plain.flush().map_err(OpenError::io)?;
    Ok(SourceReader::Memory(Cursor::new(plain.into_inner().into_inner())))
}

struct Record {
    offset: usize,
    id: u16,
    len: usize,
}

impl Record {
    fn payload(&self) -> std::ops::Range<usize> {
        self.offset + 4..self.offset + 4 + self.len
    }
}

fn records(stream: &[u8]) -> impl Iterator<Item = Record> + '_ {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        let header = stream.get(offset..offset + 4)?;
        let id = u16::from_le_bytes([header[0], header[1]]);
        let len = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let record = Record { offset, id, len };
        offset += 4 + len;
        Some(record)
    })
}

pub(crate) fn decrypt_workbook_stream(stream: &mut [u8], password: &str) -> Result<(), OpenError> {
    let filepass = records(stream)
        .take_while(|record| record.id != RECORD_EOF)
        .find(|record| record.id == RECORD_FILEPASS)
        .ok_or(OpenError::UnsupportedEncryption("`FILEPASS` outside the workbook globals"))?;
    let payload = stream
        .get(filepass.payload())
        .ok_or(OpenError::UnsupportedEncryption("truncated `FILEPASS` record"))?;

    let keys = unlock(payload, password)?;
    debug!("`FILEPASS` password verified; decrypting workbook stream");

    let mut cipher = StreamCipher::new(&keys);
    let after = filepass.offset + 4 + filepass.len;
    let tail: Vec<Record> = records(&stream[after..])
        .map(|record| Record {
            offset: record.offset + after,
            ..record
        })
        .collect();
    for record in tail {
        if is_never_encrypted(record.id) {
            continue;
        }
        let mut range = record.payload();
        range.end = range.end.min(stream.len());
        if record.id == RECORD_BOUNDSHEET {
            // lbPlyPos stays plaintext.
            range.start += 4;
        }
        range.start = range.start.min(range.end);
        let start = range.start;
        cipher.apply_at(start, &mut stream[range])?;
    }

    stream[filepass.offset..filepass.offset + 2].copy_from_slice(&RECORD_MASKED.to_le_bytes());
    Ok(())
}

fn unlock(filepass: &[u8], password: &str) -> Result<Rc4BlockKeys, OpenError> {
    let encryption_type = filepass
        .get(..2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(OpenError::UnsupportedEncryption("truncated `FILEPASS` record"))?;
    match encryption_type {
        ENCRYPTION_TYPE_RC4 => {}
        ENCRYPTION_TYPE_XOR => {
            return Err(OpenError::UnsupportedEncryption("`.xls` XOR obfuscation"));
        }
        _ => {
            return Err(OpenError::UnsupportedEncryption(
                "unknown `FILEPASS` encryption type",
            ));
        }
    }

    let version = filepass
        .get(2..6)
        .map(|b| (u16::from_le_bytes([b[0], b[1]]), u16::from_le_bytes([b[2], b[3]])))
        .ok_or(OpenError::UnsupportedEncryption("truncated `FILEPASS` record"))?;
    if version == (1, 1) {
        return Err(OpenError::UnsupportedEncryption("`.xls` Office 97 RC4 encryption"));
    }

    match parse_encryption_info(&filepass[2..]).map_err(OpenError::from_offcrypto)? {
        EncryptionInfo::Standard { info, .. } => {
            Rc4BlockKeys::unlock(&info, password, SPIN_COUNT).map_err(OpenError::from_offcrypto)
        }
        EncryptionInfo::Agile { .. } => Err(OpenError::UnsupportedEncryption(
            "agile encryption inside a `FILEPASS` record",
        )),
    }
}

fn is_never_encrypted(id: u16) -> bool {
    matches!(
        id,
        RECORD_BOF
            | RECORD_FILEPASS
            | RECORD_USREXCL
            | RECORD_FILELOCK
            | RECORD_INTERFACEHDR
            | RECORD_RRDINFO
            | RECORD_RRDHEAD
    )
}

/// RC4 keystream addressed by absolute stream offset.
struct StreamCipher<'k> {
    keys: &'k Rc4BlockKeys,
    /// Keystream for the current block, positioned at `pos`.
    current: Option<(u32, Rc4Cipher)>,
    pos: usize,
}

impl<'k> StreamCipher<'k> {
    fn new(keys: &'k Rc4BlockKeys) -> Self {
        Self {
            keys,
            current: None,
            pos: 0,
        }
    }

    fn apply_at(&mut self, mut offset: usize, mut data: &mut [u8]) -> Result<(), OpenError> {
        while !data.is_empty() {
            let block = u32::try_from(offset / REKEY_INTERVAL)
                .map_err(|_| OpenError::UnsupportedEncryption("workbook stream too large"))?;
            let block_start = block as usize * REKEY_INTERVAL;

            let (_, cipher) = match self.current.take() {
                Some((b, cipher)) if b == block && self.pos <= offset => {
                    self.current.insert((b, cipher))
                }
                _ => {
                    let fresh = self
                        .keys
                        .cipher_for_block(block)
                        .map_err(OpenError::from_offcrypto)?;
                    self.pos = block_start;
                    self.current.insert((block, fresh))
                }
            };
            cipher.skip(offset - self.pos);

            let n = data.len().min(block_start + REKEY_INTERVAL - offset);
            let (head, rest) = std::mem::take(&mut data).split_at_mut(n);
            cipher.apply_keystream(head);
            offset += n;
            self.pos = offset;
            data = rest;
        }
        Ok(())
    }
}
