use formula_reader::{DateSystem, OpenOptions, SheetReader, Source};
use log::debug;

use crate::compile::compile_record;
use crate::error::{ExtractError, MappingError};
use crate::factory::{factory_for, Strategy};
use crate::mapper::{Extraction, RowMapper};
use crate::meta::Record;

/// Opens a workbook and maps it onto a [`Record`] type in one call.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    options: OpenOptions,
    strategy: Strategy,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.options.password = Some(password.into());
        self
    }

    pub fn date_system(mut self, date_system: DateSystem) -> Self {
        self.options.date_system = date_system;
        self
    }

    pub fn verify_integrity(mut self, verify: bool) -> Self {
        self.options.verify_integrity = verify;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn extract<T: Record>(&self, source: impl Into<Source>) -> Result<Extraction<T>, ExtractError> {
        let mut reader = SheetReader::open_with(source, self.options.clone())?;
        self.extract_from(&mut reader)
    }

    /// Map an already opened reader. The reader's own date system applies.
    ///
    /// Take a [`CancelHandle`](formula_reader::CancelHandle) from `reader` first to be able
    /// to stop the extraction early; records finished before the cancel are kept.
    pub fn extract_from<T: Record>(
        &self,
        reader: &mut SheetReader,
    ) -> Result<Extraction<T>, ExtractError> {
        let bindings = compile_record::<T>()?;
        let factory = factory_for::<T>(self.strategy)?;
        let mut mapper = RowMapper::<T>::new(bindings, factory);

        match reader.read(&mut mapper) {
            Ok(outcome) => {
                debug!("extraction finished: {outcome:?}");
                Ok(mapper.finish())
            }
            Err(err) => Err(unwrap_mapping_error(err)),
        }
    }
}

fn unwrap_mapping_error(err: formula_reader::Error) -> ExtractError {
    match err.into_handler_error() {
        Ok(handler_err) => match handler_err.downcast::<MappingError>() {
            Ok(mapping) => ExtractError::Mapping(*mapping),
            Err(other) => ExtractError::Read(formula_reader::Error::Handler(other)),
        },
        Err(other) => ExtractError::Read(other),
    }
}
