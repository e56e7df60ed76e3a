use std::path::{Path, PathBuf};

use crate::handler::HandlerError;
use crate::lifecycle::ReaderState;

/// Failure to turn a source into a [`SheetReader`](crate::SheetReader).
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to read document{}: {source}", display_path(.path))]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecognized document signature (expected an OLE compound file or a zip package)")]
    UnrecognizedSignature,
    #[error("compound file does not contain a workbook stream")]
    NotAWorkbook,
    #[error("document is password protected; a password is required")]
    PasswordRequired,
    #[error("invalid password")]
    InvalidPassword,
    #[error("unsupported encryption: {0}")]
    UnsupportedEncryption(&'static str),
    #[error("failed to decrypt document: {0}")]
    Decrypt(#[source] formula_offcrypto::OffcryptoError),
    #[error("failed to open `.xls` workbook: {0}")]
    Xls(#[source] calamine::XlsError),
    #[error("failed to open `.xlsx` workbook: {0}")]
    Xlsx(#[source] calamine::XlsxError),
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" `{}`", path.display()),
        None => String::new(),
    }
}

impl OpenError {
    pub(crate) fn io(source: std::io::Error) -> Self {
        OpenError::Io { path: None, source }
    }

    pub(crate) fn from_offcrypto(err: formula_offcrypto::OffcryptoError) -> Self {
        match err {
            formula_offcrypto::OffcryptoError::InvalidPassword => OpenError::InvalidPassword,
            other => OpenError::Decrypt(other),
        }
    }

    pub(crate) fn with_path(self, path: Option<&Path>) -> Self {
        match self {
            OpenError::Io { path: None, source } => OpenError::Io {
                path: path.map(Path::to_path_buf),
                source,
            },
            other => other,
        }
    }
}

/// Errors a backend can raise while streaming a sheet.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Xls(#[from] calamine::XlsError),
    #[error(transparent)]
    Xlsx(#[from] calamine::XlsxError),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("cannot {operation} while the reader is {state}")]
    Lifecycle {
        operation: &'static str,
        state: ReaderState,
    },
    #[error("failed to read sheet `{sheet}`: {source}")]
    Backend {
        sheet: String,
        #[source]
        source: BackendError,
    },
    #[error("event handler aborted the read: {0}")]
    Handler(#[source] HandlerError),
}

impl Error {
    /// The error a handler returned, if the read was aborted by one.
    pub fn handler_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::Handler(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    pub fn into_handler_error(self) -> Result<HandlerError, Self> {
        match self {
            Error::Handler(err) => Ok(err),
            other => Err(other),
        }
    }
}
