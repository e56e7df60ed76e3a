//! Declarative record metadata: which fields bind to which columns, and how to build
//! an instance.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use formula_reader::CellErrorCode;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{BoxError, ConversionError};

/// How a bound cell is coerced before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Date,
    WholeNumber,
    BigInteger,
    Decimal,
    Boolean,
    /// Follow the cell's own type.
    Auto,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Text => "text",
            ValueKind::Date => "date",
            ValueKind::WholeNumber => "whole number",
            ValueKind::BigInteger => "big integer",
            ValueKind::Decimal => "decimal",
            ValueKind::Boolean => "boolean",
            ValueKind::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Document attributes a field can bind to instead of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    SheetName,
    /// Zero-based position of the sheet in the workbook.
    SheetIndex,
    /// Zero-based worksheet row.
    RowNumber,
}

impl ContextKind {
    pub(crate) fn value_kind(self) -> ValueKind {
        match self {
            ContextKind::SheetName => ValueKind::Text,
            ContextKind::SheetIndex | ContextKind::RowNumber => ValueKind::WholeNumber,
        }
    }
}

/// A coerced cell (or context) value on its way into a record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    WholeNumber(i64),
    BigInteger(i128),
    Decimal(Decimal),
    Date(NaiveDateTime),
    Boolean(bool),
    /// A non-integral number seen through [`ValueKind::Auto`].
    Number(f64),
    Error(CellErrorCode),
}

impl FieldValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::WholeNumber(_) => "whole number",
            FieldValue::BigInteger(_) => "big integer",
            FieldValue::Decimal(_) => "decimal",
            FieldValue::Date(_) => "date",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Number(_) => "number",
            FieldValue::Error(_) => "error",
        }
    }
}

/// Field types a [`FieldValue`] can be stored into.
pub trait FromFieldValue: Sized + 'static {
    /// Whether a field of this type can be declared with `kind`.
    fn accepts(kind: ValueKind) -> bool;

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError>;
}

fn mismatch<T>(value: &FieldValue) -> ConversionError {
    ConversionError {
        from: value.kind_name(),
        target: type_name::<T>(),
    }
}

fn integral(value: f64) -> Option<i128> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1.7e38 {
        Some(value as i128)
    } else {
        None
    }
}

impl FromFieldValue for String {
    fn accepts(kind: ValueKind) -> bool {
        matches!(kind, ValueKind::Text | ValueKind::Auto)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        match value {
            FieldValue::Text(s) => Ok(s),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromFieldValue for i128 {
    fn accepts(kind: ValueKind) -> bool {
        matches!(
            kind,
            ValueKind::WholeNumber | ValueKind::BigInteger | ValueKind::Auto
        )
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        match value {
            FieldValue::WholeNumber(v) => Ok(i128::from(v)),
            FieldValue::BigInteger(v) => Ok(v),
            FieldValue::Number(v) => integral(v).ok_or_else(|| mismatch::<Self>(&value)),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

macro_rules! whole_number_field {
    ($($ty:ty),*) => {$(
        impl FromFieldValue for $ty {
            fn accepts(kind: ValueKind) -> bool {
                matches!(kind, ValueKind::WholeNumber | ValueKind::Auto)
            }

            fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
                let wide = i128::from_field_value(value.clone())?;
                <$ty>::try_from(wide).map_err(|_| mismatch::<Self>(&value))
            }
        }
    )*};
}

whole_number_field!(i64, i32, u32, u64, usize);

impl FromFieldValue for Decimal {
    fn accepts(kind: ValueKind) -> bool {
        matches!(
            kind,
            ValueKind::Decimal | ValueKind::WholeNumber | ValueKind::Auto
        )
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        match value {
            FieldValue::Decimal(v) => Ok(v),
            FieldValue::WholeNumber(v) => Ok(Decimal::from(v)),
            FieldValue::Number(v) => Decimal::try_from(v)
                .map(|d| d.normalize())
                .map_err(|_| mismatch::<Self>(&value)),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromFieldValue for f64 {
    fn accepts(kind: ValueKind) -> bool {
        matches!(
            kind,
            ValueKind::Decimal | ValueKind::WholeNumber | ValueKind::Auto
        )
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        match value {
            FieldValue::Number(v) => Ok(v),
            FieldValue::WholeNumber(v) => Ok(v as f64),
            FieldValue::Decimal(v) => v.to_f64().ok_or_else(|| mismatch::<Self>(&value)),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromFieldValue for NaiveDateTime {
    fn accepts(kind: ValueKind) -> bool {
        matches!(kind, ValueKind::Date | ValueKind::Auto)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        match value {
            FieldValue::Date(v) => Ok(v),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromFieldValue for NaiveDate {
    fn accepts(kind: ValueKind) -> bool {
        matches!(kind, ValueKind::Date | ValueKind::Auto)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        NaiveDateTime::from_field_value(value).map(|v| v.date())
    }
}

impl FromFieldValue for bool {
    fn accepts(kind: ValueKind) -> bool {
        matches!(kind, ValueKind::Boolean | ValueKind::Auto)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        match value {
            FieldValue::Boolean(v) => Ok(v),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromFieldValue for CellErrorCode {
    fn accepts(kind: ValueKind) -> bool {
        kind == ValueKind::Auto
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        match value {
            FieldValue::Error(code) => Ok(code),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromFieldValue for FieldValue {
    fn accepts(_: ValueKind) -> bool {
        true
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        Ok(value)
    }
}

/// Populated cells only ever reach a field as `Some`; `None` marks a column left empty.
impl<T: FromFieldValue> FromFieldValue for Option<T> {
    fn accepts(kind: ValueKind) -> bool {
        T::accepts(kind)
    }

    fn from_field_value(value: FieldValue) -> Result<Self, ConversionError> {
        T::from_field_value(value).map(Some)
    }
}

/// Types that can be extracted with their own built-in metadata.
pub trait Record: Any + Sized {
    fn record_class() -> RecordClass;
}

pub(crate) type Setter =
    Arc<dyn Fn(&mut dyn Any, FieldValue) -> Result<(), ConversionError> + Send + Sync>;

pub(crate) type Constructor = Arc<dyn Fn() -> Result<Box<dyn Any>, BoxError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Column {
        index: u32,
        kind: ValueKind,
        shared: bool,
    },
    Context(ContextKind),
}

#[derive(Clone)]
pub(crate) struct FieldSpec {
    pub(crate) name: String,
    pub(crate) binding: Binding,
    pub(crate) target: &'static str,
    pub(crate) accepts: fn(ValueKind) -> bool,
    pub(crate) setter: Setter,
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("binding", &self.binding)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Class-level range filter. `None` leaves a bound open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeSpec {
    pub start_sheet: Option<usize>,
    pub end_sheet: Option<usize>,
    pub start_row: Option<u32>,
    pub end_row: Option<u32>,
    pub end_column: Option<u32>,
    pub title_row: Option<u32>,
}

/// Everything needed to bind rows onto one record type.
#[derive(Clone)]
pub struct RecordClass {
    pub(crate) name: String,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) range: RangeSpec,
    pub(crate) fields: Vec<FieldSpec>,
    pub(crate) constructor: Option<Constructor>,
    pub(crate) is_abstract: bool,
}

impl fmt::Debug for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordClass")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("range", &self.range)
            .field("fields", &self.fields)
            .field("has_constructor", &self.constructor.is_some())
            .field("is_abstract", &self.is_abstract)
            .finish()
    }
}

impl RecordClass {
    pub fn builder<T: Any>(name: impl Into<String>) -> RecordClassBuilder<T> {
        RecordClassBuilder {
            class: RecordClass {
                name: name.into(),
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                range: RangeSpec::default(),
                fields: Vec::new(),
                constructor: None,
                is_abstract: false,
            },
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn range(&self) -> &RangeSpec {
        &self.range
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}

pub struct RecordClassBuilder<T> {
    class: RecordClass,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any> RecordClassBuilder<T> {
    pub fn start_sheet(mut self, sheet: usize) -> Self {
        self.class.range.start_sheet = Some(sheet);
        self
    }

    pub fn end_sheet(mut self, sheet: usize) -> Self {
        self.class.range.end_sheet = Some(sheet);
        self
    }

    pub fn start_row(mut self, row: u32) -> Self {
        self.class.range.start_row = Some(row);
        self
    }

    pub fn end_row(mut self, row: u32) -> Self {
        self.class.range.end_row = Some(row);
        self
    }

    pub fn end_column(mut self, column: u32) -> Self {
        self.class.range.end_column = Some(column);
        self
    }

    /// Row whose cells are captured as column titles instead of being mapped.
    pub fn title_row(mut self, row: u32) -> Self {
        self.class.range.title_row = Some(row);
        self
    }

    /// Bind `field` to `column`, coerced as `kind`.
    pub fn column<F: FromFieldValue>(
        self,
        name: impl Into<String>,
        column: u32,
        kind: ValueKind,
        field: fn(&mut T) -> &mut F,
    ) -> Self {
        self.push_field(
            name.into(),
            Binding::Column {
                index: column,
                kind,
                shared: false,
            },
            field,
        )
    }

    /// Like [`column`](Self::column), but other shared fields may read the same column.
    pub fn shared_column<F: FromFieldValue>(
        self,
        name: impl Into<String>,
        column: u32,
        kind: ValueKind,
        field: fn(&mut T) -> &mut F,
    ) -> Self {
        self.push_field(
            name.into(),
            Binding::Column {
                index: column,
                kind,
                shared: true,
            },
            field,
        )
    }

    pub fn context<F: FromFieldValue>(
        self,
        name: impl Into<String>,
        kind: ContextKind,
        field: fn(&mut T) -> &mut F,
    ) -> Self {
        self.push_field(name.into(), Binding::Context(kind), field)
    }

    fn push_field<F: FromFieldValue>(
        mut self,
        name: String,
        binding: Binding,
        field: fn(&mut T) -> &mut F,
    ) -> Self {
        let setter: Setter = Arc::new(move |target: &mut dyn Any, value: FieldValue| {
            let target = target.downcast_mut::<T>().ok_or(ConversionError {
                from: "record",
                target: type_name::<T>(),
            })?;
            *field(target) = F::from_field_value(value)?;
            Ok(())
        });
        self.class.fields.push(FieldSpec {
            name,
            binding,
            target: type_name::<F>(),
            accepts: F::accepts,
            setter,
        });
        self
    }

    pub fn constructor<C>(mut self, constructor: C) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
    {
        self.class.constructor = Some(Arc::new(move || Ok(Box::new(constructor()) as Box<dyn Any>)));
        self
    }

    /// A constructor that may fail; failures surface as construction errors.
    pub fn try_constructor<C, E>(mut self, constructor: C) -> Self
    where
        C: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.class.constructor = Some(Arc::new(move || {
            constructor()
                .map(|value| Box::new(value) as Box<dyn Any>)
                .map_err(Into::into)
        }));
        self
    }

    /// Mark the type as non-instantiable; factories for it cannot be built.
    pub fn abstract_type(mut self) -> Self {
        self.class.is_abstract = true;
        self
    }

    pub fn build(self) -> RecordClass {
        self.class
    }
}

impl<T: Any + Default> RecordClassBuilder<T> {
    pub fn default_constructor(self) -> Self {
        self.constructor(T::default)
    }
}
