//! [`RowMapper`]: an [`EventHandler`] that turns rows into records.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use formula_reader::{CellValue, EventHandler, HandlerResult, RawValue};
use log::trace;

use crate::compile::CompiledBindings;
use crate::error::{ConstructError, MappingError, MappingErrorKind};
use crate::factory::{ObjectFactory, Strategy};
use crate::meta::{ContextKind, FieldValue, ValueKind};

/// Records and titles captured from one sheet.
#[derive(Debug, Clone)]
pub struct SheetExtraction<T> {
    pub name: String,
    pub records: Vec<T>,
    pub titles: BTreeMap<u32, String>,
}

/// Result of one read, keyed by sheet index. Only in-range sheets appear.
#[derive(Debug, Clone)]
pub struct Extraction<T> {
    sheets: BTreeMap<usize, SheetExtraction<T>>,
    cancelled: bool,
}

impl<T> Extraction<T> {
    pub fn records(&self, sheet: usize) -> &[T] {
        self.sheets
            .get(&sheet)
            .map(|s| s.records.as_slice())
            .unwrap_or(&[])
    }

    pub fn sheet(&self, sheet: usize) -> Option<&SheetExtraction<T>> {
        self.sheets.get(&sheet)
    }

    pub fn sheet_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.sheets.keys().copied()
    }

    /// Title texts keyed by column.
    pub fn column_titles(&self, sheet: usize) -> Option<&BTreeMap<u32, String>> {
        self.sheets.get(&sheet).map(|s| &s.titles)
    }

    pub fn column_title(&self, sheet: usize, column: u32) -> Option<&str> {
        self.column_titles(sheet)?.get(&column).map(String::as_str)
    }

    /// Title texts in column order.
    pub fn all_column_titles(&self, sheet: usize) -> Vec<&str> {
        self.column_titles(sheet)
            .map(|titles| titles.values().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All records with their sheet index, in sheet then row order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.sheets
            .iter()
            .flat_map(|(index, sheet)| sheet.records.iter().map(move |r| (*index, r)))
    }

    pub fn len(&self) -> usize {
        self.sheets.values().map(|s| s.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_records(self) -> Vec<T> {
        self.sheets
            .into_values()
            .flat_map(|sheet| sheet.records)
            .collect()
    }

    /// The read stopped at a cancellation checkpoint; the row in progress was dropped.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }
}

enum RowMode<T> {
    Skip,
    Title,
    Data(T),
}

struct CurrentSheet {
    index: usize,
    name: String,
    in_range: bool,
}

/// Maps reader events onto records of type `T`.
pub struct RowMapper<T> {
    bindings: Arc<CompiledBindings>,
    factory: Arc<ObjectFactory>,
    sheets: BTreeMap<usize, SheetExtraction<T>>,
    current: Option<CurrentSheet>,
    row: Option<(u32, RowMode<T>)>,
    cancelled: bool,
}

impl<T: Any> RowMapper<T> {
    pub fn new(bindings: Arc<CompiledBindings>, factory: Arc<ObjectFactory>) -> Self {
        Self {
            bindings,
            factory,
            sheets: BTreeMap::new(),
            current: None,
            row: None,
            cancelled: false,
        }
    }

    /// Build a mapper with a private factory for the compiled class.
    pub fn with_strategy(
        bindings: Arc<CompiledBindings>,
        strategy: Strategy,
    ) -> Result<Self, ConstructError> {
        let factory = Arc::new(ObjectFactory::from_shared(&bindings.class, strategy)?);
        Ok(Self::new(bindings, factory))
    }

    pub fn finish(self) -> Extraction<T> {
        Extraction {
            sheets: self.sheets,
            cancelled: self.cancelled,
        }
    }

    fn new_record(&self, sheet: &CurrentSheet, row: u32) -> Result<T, MappingError> {
        let mut record = self
            .factory
            .create_as::<T>()
            .map_err(|err| mapping_error(Some(sheet), row, None, None, err))?;

        for &(field_index, kind) in self.bindings.context_fields() {
            let value = match kind {
                ContextKind::SheetName => FieldValue::Text(sheet.name.clone()),
                ContextKind::SheetIndex => FieldValue::WholeNumber(sheet.index as i64),
                ContextKind::RowNumber => FieldValue::WholeNumber(i64::from(row)),
            };
            let field = self.bindings.field(field_index);
            (field.setter)(&mut record as &mut dyn Any, value)
                .map_err(|err| mapping_error(Some(sheet), row, None, Some(&field.name), err))?;
        }
        Ok(record)
    }
}

fn mapping_error(
    sheet: Option<&CurrentSheet>,
    row: u32,
    column: Option<u32>,
    field: Option<&str>,
    kind: impl Into<MappingErrorKind>,
) -> MappingError {
    let (sheet, sheet_index) = sheet
        .map(|s| (s.name.clone(), s.index))
        .unwrap_or_default();
    MappingError {
        sheet,
        sheet_index,
        row,
        column,
        field: field.map(str::to_owned),
        kind: kind.into(),
    }
}

fn coerce(kind: ValueKind, value: &CellValue<'_>) -> Result<FieldValue, MappingErrorKind> {
    let coerced = match kind {
        ValueKind::Text => FieldValue::Text(value.as_str()?.to_owned()),
        ValueKind::WholeNumber => FieldValue::WholeNumber(value.as_i64()?),
        ValueKind::BigInteger => FieldValue::BigInteger(value.as_i128()?),
        ValueKind::Decimal => FieldValue::Decimal(value.as_decimal()?),
        ValueKind::Date => FieldValue::Date(value.as_datetime()?),
        ValueKind::Boolean => FieldValue::Boolean(value.as_bool()?),
        ValueKind::Auto => match value.raw() {
            RawValue::Text(text) => FieldValue::Text(text.to_string()),
            RawValue::Int(v) => FieldValue::WholeNumber(*v),
            RawValue::Float(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => {
                FieldValue::WholeNumber(*v as i64)
            }
            RawValue::Float(v) => FieldValue::Number(*v),
            RawValue::Bool(v) => FieldValue::Boolean(*v),
            RawValue::DateSerial(_) | RawValue::DateIso(_) => FieldValue::Date(value.as_datetime()?),
            RawValue::Error(code) => FieldValue::Error(*code),
            // Blank cells are never dispatched.
            RawValue::Blank => FieldValue::Text(String::new()),
        },
    };
    Ok(coerced)
}

impl<T: Any> EventHandler for RowMapper<T> {
    fn start_sheet(&mut self, sheet: usize, name: &str) -> HandlerResult {
        let in_range = self.bindings.range().contains_sheet(sheet);
        trace!("sheet {sheet} `{name}`: in range = {in_range}");
        if in_range {
            self.sheets.insert(
                sheet,
                SheetExtraction {
                    name: name.to_owned(),
                    records: Vec::new(),
                    titles: BTreeMap::new(),
                },
            );
        }
        self.current = Some(CurrentSheet {
            index: sheet,
            name: name.to_owned(),
            in_range,
        });
        Ok(())
    }

    fn end_sheet(&mut self, _sheet: usize) -> HandlerResult {
        self.current = None;
        Ok(())
    }

    fn start_row(&mut self, _sheet: usize, row: u32) -> HandlerResult {
        let Some(current) = self.current.as_ref().filter(|c| c.in_range) else {
            return Ok(());
        };
        let range = self.bindings.range();
        let mode = if range.title_row == Some(row) {
            RowMode::Title
        } else if range.contains_row(row) {
            RowMode::Data(self.new_record(current, row)?)
        } else {
            RowMode::Skip
        };
        self.row = Some((row, mode));
        Ok(())
    }

    fn cell(&mut self, sheet: usize, row: u32, col: u32, value: &CellValue<'_>) -> HandlerResult {
        if !self.bindings.range().contains_column(col) {
            return Ok(());
        }
        let bindings = &self.bindings;
        let Some((_, mode)) = self.row.as_mut() else {
            return Ok(());
        };

        match mode {
            RowMode::Skip => {}
            RowMode::Title => {
                if let Some(extraction) = self.sheets.get_mut(&sheet) {
                    extraction.titles.insert(col, value.to_string());
                }
            }
            RowMode::Data(record) => {
                for slot in bindings.slots(col) {
                    let field = bindings.field(slot.field);
                    let result = coerce(slot.kind, value).and_then(|coerced| {
                        (field.setter)(&mut *record as &mut dyn Any, coerced).map_err(Into::into)
                    });
                    if let Err(kind) = result {
                        let current = self.current.as_ref();
                        return Err(Box::new(mapping_error(
                            current,
                            row,
                            Some(col),
                            Some(&field.name),
                            kind,
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn end_row(&mut self, sheet: usize, _row: u32) -> HandlerResult {
        if let Some((_, RowMode::Data(record))) = self.row.take() {
            if let Some(extraction) = self.sheets.get_mut(&sheet) {
                extraction.records.push(record);
            }
        }
        Ok(())
    }

    fn cancelled(&mut self) {
        self.row = None;
        self.cancelled = true;
    }
}
