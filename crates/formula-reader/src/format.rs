//! Container sniffing and password-protected package unwrapping.
//!
//! The backend is chosen from the leading bytes of the document, never from the file
//! extension:
//! - `D0 CF 11 E0 A1 B1 1A E1`: OLE compound file. Either a legacy BIFF workbook
//!   (`Workbook`/`Book` stream) or an encrypted OOXML package
//!   (`EncryptionInfo` + `EncryptedPackage` streams).
//! - `PK\x03\x04` / `PK\x05\x06`: zip, i.e. an OOXML package.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use formula_offcrypto::DecryptOptions;

use crate::error::OpenError;

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP_LOCAL_HEADER: [u8; 4] = *b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: [u8; 4] = *b"PK\x05\x06";

const BIFF_EOF: u16 = 0x000A;
const BIFF_FILEPASS: u16 = 0x002F;

/// Which backend reads the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Compound-binary BIFF (`.xls`).
    LegacyBinary,
    /// Zip/XML OOXML (`.xlsx`, `.xlsm`).
    ModernXml,
}

/// Result of sniffing a document without opening a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentInfo {
    pub kind: BackendKind,
    /// The container reports itself as password protected.
    pub encrypted: bool,
}

/// Where a document comes from.
pub enum Source {
    Path(PathBuf),
    Bytes(Vec<u8>),
    /// Drained into memory when the document is opened; read failures surface as
    /// [`OpenError::Io`].
    Stream(Box<dyn Read + Send>),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Source::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Source::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Source {
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Source::Stream(Box::new(reader))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Source::Path(path) => Some(path),
            Source::Bytes(_) | Source::Stream(_) => None,
        }
    }

    pub(crate) fn open(self) -> Result<SourceReader, OpenError> {
        match self {
            Source::Path(path) => {
                let file = File::open(&path).map_err(|source| OpenError::Io {
                    path: Some(path.clone()),
                    source,
                })?;
                Ok(SourceReader::File(BufReader::new(file)))
            }
            Source::Bytes(bytes) => Ok(SourceReader::Memory(Cursor::new(bytes))),
            Source::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).map_err(OpenError::io)?;
                Ok(SourceReader::Memory(Cursor::new(buf)))
            }
        }
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::Path(path)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Source::Path(path.to_path_buf())
    }
}

impl From<&PathBuf> for Source {
    fn from(path: &PathBuf) -> Self {
        Source::Path(path.clone())
    }
}

impl From<&str> for Source {
    fn from(path: &str) -> Self {
        Source::Path(PathBuf::from(path))
    }
}

impl From<String> for Source {
    fn from(path: String) -> Self {
        Source::Path(PathBuf::from(path))
    }
}

impl From<Vec<u8>> for Source {
    fn from(bytes: Vec<u8>) -> Self {
        Source::Bytes(bytes)
    }
}

impl From<&[u8]> for Source {
    fn from(bytes: &[u8]) -> Self {
        Source::Bytes(bytes.to_vec())
    }
}

/// The byte stream handed to a backend.
pub(crate) enum SourceReader {
    File(BufReader<File>),
    Memory(Cursor<Vec<u8>>),
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SourceReader::File(r) => r.read(buf),
            SourceReader::Memory(r) => r.read(buf),
        }
    }
}

impl Seek for SourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            SourceReader::File(r) => r.seek(pos),
            SourceReader::Memory(r) => r.seek(pos),
        }
    }
}

/// Sniff a document's container format.
pub fn detect_format(source: impl Into<Source>) -> Result<DocumentInfo, OpenError> {
    let source = source.into();
    let path = source.path().map(Path::to_path_buf);
    let mut reader = source.open()?;
    sniff(&mut reader).map_err(|err| err.with_path(path.as_deref()))
}

/// Classify the container, leaving `reader` rewound to the start.
pub(crate) fn sniff(reader: &mut SourceReader) -> Result<DocumentInfo, OpenError> {
    let mut magic = [0u8; 8];
    let n = read_prefix(reader, &mut magic).map_err(OpenError::io)?;
    reader.rewind().map_err(OpenError::io)?;
    let magic = &magic[..n];

    if magic == OLE_MAGIC {
        let info = inspect_ole(reader)?;
        reader.rewind().map_err(OpenError::io)?;
        return Ok(info);
    }
    if magic.starts_with(&ZIP_LOCAL_HEADER) || magic.starts_with(&ZIP_EMPTY_ARCHIVE) {
        return Ok(DocumentInfo {
            kind: BackendKind::ModernXml,
            encrypted: false,
        });
    }
    Err(OpenError::UnrecognizedSignature)
}

fn read_prefix(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn inspect_ole(reader: &mut SourceReader) -> Result<DocumentInfo, OpenError> {
    let mut ole = cfb::CompoundFile::open(&mut *reader).map_err(OpenError::io)?;

    if ole.is_stream("/EncryptionInfo") && ole.is_stream("/EncryptedPackage") {
        return Ok(DocumentInfo {
            kind: BackendKind::ModernXml,
            encrypted: true,
        });
    }

    for name in ["/Workbook", "/Book"] {
        if ole.is_stream(name) {
            let stream = ole.open_stream(name).map_err(OpenError::io)?;
            let encrypted = globals_have_filepass(stream).map_err(OpenError::io)?;
            return Ok(DocumentInfo {
                kind: BackendKind::LegacyBinary,
                encrypted,
            });
        }
    }

    Err(OpenError::NotAWorkbook)
}

/// Walk the BIFF globals substream up to its `EOF` looking for `FILEPASS`.
fn globals_have_filepass(mut stream: impl Read) -> io::Result<bool> {
    let mut header = [0u8; 4];
    loop {
        if read_prefix(&mut stream, &mut header)? < header.len() {
            return Ok(false);
        }
        let id = u16::from_le_bytes([header[0], header[1]]);
        let len = u16::from_le_bytes([header[2], header[3]]);
        match id {
            BIFF_FILEPASS => return Ok(true),
            BIFF_EOF => return Ok(false),
            _ => {
                io::copy(&mut (&mut stream).take(u64::from(len)), &mut io::sink())?;
            }
        }
    }
}

/// Decrypt an encrypted OOXML container held by `reader` into an in-memory zip.
pub(crate) fn unwrap_encrypted_package(
    reader: &mut SourceReader,
    password: &str,
    verify_integrity: bool,
) -> Result<SourceReader, OpenError> {
    let mut container = Vec::new();
    reader
        .read_to_end(&mut container)
        .map_err(OpenError::io)?;

    let package =
        formula_offcrypto::decrypt_ole_container(&container, password, DecryptOptions {
            verify_integrity,
        })
        .map_err(OpenError::from_offcrypto)?;

    Ok(SourceReader::Memory(Cursor::new(package)))
}
