use std::path::Path;
use std::sync::Arc;

use calamine::{Reader, Xls, XlsError, Xlsx};
use log::debug;

use crate::decrypt;
use crate::dispatch;
use crate::error::{Error, OpenError};
use crate::format::{self, BackendKind, Source, SourceReader};
use crate::handler::EventHandler;
use crate::lifecycle::{CancelHandle, Lifecycle, ReadGuard, ReaderState};
use crate::value::DateSystem;

/// Options controlling how a document is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Password for protected documents. Ignored for unprotected ones.
    pub password: Option<String>,
    /// Date system used to interpret date serials. The workbook's own flag is not consulted.
    pub date_system: DateSystem,
    /// Verify the HMAC of an encrypted OOXML package before handing it to the backend.
    pub verify_integrity: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            password: None,
            date_system: DateSystem::default(),
            verify_integrity: true,
        }
    }
}

impl OpenOptions {
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn date_system(mut self, date_system: DateSystem) -> Self {
        self.date_system = date_system;
        self
    }

    pub fn verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }
}

/// How a call to [`SheetReader::read`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Every sheet was dispatched.
    Completed,
    /// A cancellation checkpoint stopped the read.
    Cancelled,
}

pub(crate) enum Backend {
    LegacyBinary(Xls<SourceReader>),
    ModernXml(Xlsx<SourceReader>),
}

/// Streams the cells of one workbook to an [`EventHandler`].
///
/// A reader is single-use: `read` may be called once, after which the backend is released
/// and the reader is `Closed` (or `Cancelled`).
pub struct SheetReader {
    backend: Option<Backend>,
    kind: BackendKind,
    sheet_names: Vec<String>,
    date_system: DateSystem,
    lifecycle: Arc<Lifecycle>,
}

impl std::fmt::Debug for SheetReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetReader")
            .field("kind", &self.kind)
            .field("sheet_names", &self.sheet_names)
            .field("date_system", &self.date_system)
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl SheetReader {
    pub fn open(source: impl Into<Source>) -> Result<Self, OpenError> {
        Self::open_with(source, OpenOptions::default())
    }

    pub fn open_with_password(
        source: impl Into<Source>,
        password: impl Into<String>,
    ) -> Result<Self, OpenError> {
        Self::open_with(source, OpenOptions::default().password(password))
    }

    pub fn open_with(source: impl Into<Source>, options: OpenOptions) -> Result<Self, OpenError> {
        let source = source.into();
        let path = source.path().map(Path::to_path_buf);
        Self::open_source(source, options).map_err(|err| err.with_path(path.as_deref()))
    }

    fn open_source(source: Source, options: OpenOptions) -> Result<Self, OpenError> {
        let mut reader = source.open()?;
        let info = format::sniff(&mut reader)?;
        let has_password = options.password.is_some();

        let backend = match (info.kind, info.encrypted) {
            (BackendKind::LegacyBinary, true) => {
                let Some(password) = options.password.as_deref() else {
                    return Err(OpenError::PasswordRequired);
                };
                let decrypted = decrypt::decrypt_legacy_workbook(&mut reader, password)?;
                Backend::LegacyBinary(Xls::new(decrypted).map_err(open_xls_error)?)
            }
            (BackendKind::LegacyBinary, false) => {
                if has_password {
                    debug!("ignoring password for unprotected `.xls` workbook");
                }
                Backend::LegacyBinary(Xls::new(reader).map_err(open_xls_error)?)
            }
            (BackendKind::ModernXml, true) => {
                let Some(password) = options.password.as_deref() else {
                    return Err(OpenError::PasswordRequired);
                };
                let decrypted =
                    format::unwrap_encrypted_package(&mut reader, password, options.verify_integrity)?;
                Backend::ModernXml(Xlsx::new(decrypted).map_err(OpenError::Xlsx)?)
            }
            (BackendKind::ModernXml, false) => {
                if has_password {
                    debug!("ignoring password for unprotected `.xlsx` package");
                }
                Backend::ModernXml(Xlsx::new(reader).map_err(OpenError::Xlsx)?)
            }
        };

        let sheet_names = match &backend {
            Backend::LegacyBinary(xls) => xls.sheet_names(),
            Backend::ModernXml(xlsx) => xlsx.sheet_names(),
        };
        debug!(
            "opened {:?} workbook with {} sheet(s)",
            info.kind,
            sheet_names.len()
        );

        Ok(Self {
            backend: Some(backend),
            kind: info.kind,
            sheet_names,
            date_system: options.date_system,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    pub fn state(&self) -> ReaderState {
        self.lifecycle.state()
    }

    /// Sheet names in workbook order; `read` reports sheets by their index in this list.
    pub fn sheet_names(&self) -> &[String] {
        &self.sheet_names
    }

    pub fn date_system(&self) -> DateSystem {
        self.date_system
    }

    /// Change the date system. Only allowed before `read`.
    pub fn set_date_system(&mut self, date_system: DateSystem) -> Result<(), Error> {
        self.lifecycle.require(ReaderState::Open, "change the date system")?;
        self.date_system = date_system;
        Ok(())
    }

    pub fn set_1904_windowing(&mut self, enabled: bool) -> Result<(), Error> {
        self.set_date_system(if enabled {
            DateSystem::Excel1904
        } else {
            DateSystem::Excel1900
        })
    }

    /// A handle that can cancel the read from inside an event handler or another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    pub fn cancel(&self) -> Result<(), Error> {
        self.lifecycle.request_cancel()
    }

    /// Dispatch every sheet to `handler`.
    ///
    /// The reader ends `Cancelled` if a checkpoint observed a cancel request, otherwise
    /// `Closed`, whether the read succeeded or failed.
    pub fn read<H>(&mut self, handler: &mut H) -> Result<ReadOutcome, Error>
    where
        H: EventHandler + ?Sized,
    {
        self.lifecycle
            .transition(ReaderState::Open, ReaderState::Reading, "read")?;
        let mut guard = ReadGuard::new(&self.lifecycle);

        let Some(mut backend) = self.backend.take() else {
            return Err(Error::Lifecycle {
                operation: "read",
                state: ReaderState::Closed,
            });
        };

        let outcome = dispatch::dispatch(
            &mut backend,
            &self.sheet_names,
            self.date_system,
            &self.lifecycle,
            handler,
        );
        if matches!(outcome, Ok(ReadOutcome::Cancelled)) {
            guard.outcome = ReaderState::Cancelled;
        }
        outcome
    }

    /// Release the backend. Safe to call in any state, any number of times.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            debug!("closing reader before it was read");
        }
        self.lifecycle.set(ReaderState::Closed);
    }
}

impl Drop for SheetReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// The backend only reports `FILEPASS` records the globals scan did not see.
fn open_xls_error(err: XlsError) -> OpenError {
    match err {
        XlsError::Password => {
            OpenError::UnsupportedEncryption("`FILEPASS` outside the workbook globals")
        }
        other => OpenError::Xls(other),
    }
}
