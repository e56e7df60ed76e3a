//! Uniform tagged cell values.
//!
//! Every backend cell is normalised into a [`CellValue`], which keeps the original
//! [`RawValue`] around for introspection and offers typed accessors that refuse to
//! convert across type tags. The only cross-tag conversion is number to date, which
//! depends on the [`DateSystem`] captured when the read started.

use std::borrow::Cow;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use rust_decimal::Decimal;

/// Excel workbook date system used to interpret serial date values.
///
/// - `Excel1900` (default; includes the Lotus 1-2-3 leap year bug)
/// - `Excel1904` (older Mac workbooks)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DateSystem {
    #[default]
    Excel1900,
    Excel1904,
}

/// Days between the 1900 and 1904 epochs for serials past the phantom 1900-02-29.
pub const EPOCH_OFFSET_DAYS: i64 = 1462;

impl DateSystem {
    /// Convert an Excel serial number to a calendar date-time.
    ///
    /// Returns `None` for negative, non-finite, or out-of-calendar serials, and for any time on
    /// 1900-system day 60, the nonexistent 1900-02-29.
    pub fn serial_to_datetime(self, serial: f64) -> Option<NaiveDateTime> {
        if !serial.is_finite() || serial < 0.0 {
            return None;
        }
        let mut days = serial.trunc() as i64;
        let mut millis = ((serial - serial.trunc()) * 86_400_000.0).round() as i64;
        if millis >= 86_400_000 {
            days += 1;
            millis -= 86_400_000;
        }

        let base = match self {
            DateSystem::Excel1900 if days == 60 => return None,
            // Before the phantom leap day, serials count from 1899-12-31.
            DateSystem::Excel1900 if days < 60 => NaiveDate::from_ymd_opt(1899, 12, 31)?,
            DateSystem::Excel1900 => NaiveDate::from_ymd_opt(1899, 12, 30)?,
            DateSystem::Excel1904 => NaiveDate::from_ymd_opt(1904, 1, 1)?,
        };
        base.and_hms_opt(0, 0, 0)?
            .checked_add_signed(TimeDelta::try_days(days)?)?
            .checked_add_signed(TimeDelta::try_milliseconds(millis)?)
    }
}

/// Spreadsheet error literal carried by a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellErrorCode {
    Div0,
    NA,
    Name,
    Null,
    Num,
    Ref,
    Value,
    GettingData,
}

impl CellErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CellErrorCode::Div0 => "#DIV/0!",
            CellErrorCode::NA => "#N/A",
            CellErrorCode::Name => "#NAME?",
            CellErrorCode::Null => "#NULL!",
            CellErrorCode::Num => "#NUM!",
            CellErrorCode::Ref => "#REF!",
            CellErrorCode::Value => "#VALUE!",
            CellErrorCode::GettingData => "#GETTING_DATA",
        }
    }
}

impl From<&calamine::CellErrorType> for CellErrorCode {
    fn from(err: &calamine::CellErrorType) -> Self {
        use calamine::CellErrorType;

        match err {
            CellErrorType::Div0 => CellErrorCode::Div0,
            CellErrorType::NA => CellErrorCode::NA,
            CellErrorType::Name => CellErrorCode::Name,
            CellErrorType::Null => CellErrorCode::Null,
            CellErrorType::Num => CellErrorCode::Num,
            CellErrorType::Ref => CellErrorCode::Ref,
            CellErrorType::Value => CellErrorCode::Value,
            CellErrorType::GettingData => CellErrorCode::GettingData,
        }
    }
}

/// The type tag of a cell as stored in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    Blank,
    Number,
    Text,
    Boolean,
    Date,
    Error,
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellType::Blank => "blank",
            CellType::Number => "number",
            CellType::Text => "text",
            CellType::Boolean => "boolean",
            CellType::Date => "date",
            CellType::Error => "error",
        };
        f.write_str(name)
    }
}

/// The value exactly as the backend produced it.
///
/// Formula cells carry their cached result; durations are plain numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue<'a> {
    Blank,
    Int(i64),
    Float(f64),
    Text(Cow<'a, str>),
    Bool(bool),
    /// A number whose cell format marks it as a date.
    DateSerial(f64),
    /// A date stored as ISO 8601 text.
    DateIso(Cow<'a, str>),
    Error(CellErrorCode),
}

impl RawValue<'_> {
    pub fn cell_type(&self) -> CellType {
        match self {
            RawValue::Blank => CellType::Blank,
            RawValue::Int(_) | RawValue::Float(_) => CellType::Number,
            RawValue::Text(_) => CellType::Text,
            RawValue::Bool(_) => CellType::Boolean,
            RawValue::DateSerial(_) | RawValue::DateIso(_) => CellType::Date,
            RawValue::Error(_) => CellType::Error,
        }
    }

    pub fn into_owned(self) -> RawValue<'static> {
        match self {
            RawValue::Blank => RawValue::Blank,
            RawValue::Int(v) => RawValue::Int(v),
            RawValue::Float(v) => RawValue::Float(v),
            RawValue::Text(v) => RawValue::Text(Cow::Owned(v.into_owned())),
            RawValue::Bool(v) => RawValue::Bool(v),
            RawValue::DateSerial(v) => RawValue::DateSerial(v),
            RawValue::DateIso(v) => RawValue::DateIso(Cow::Owned(v.into_owned())),
            RawValue::Error(e) => RawValue::Error(e),
        }
    }
}

impl From<&calamine::Data> for RawValue<'static> {
    fn from(value: &calamine::Data) -> Self {
        use calamine::Data;

        match value {
            Data::Empty => RawValue::Blank,
            Data::Int(v) => RawValue::Int(*v),
            Data::Float(v) => RawValue::Float(*v),
            Data::String(v) => RawValue::Text(Cow::Owned(v.clone())),
            Data::Bool(v) => RawValue::Bool(*v),
            Data::DateTime(v) if v.is_duration() => RawValue::Float(v.as_f64()),
            Data::DateTime(v) => RawValue::DateSerial(v.as_f64()),
            Data::DateTimeIso(v) => RawValue::DateIso(Cow::Owned(v.clone())),
            Data::DurationIso(v) => RawValue::Text(Cow::Owned(v.clone())),
            Data::Error(e) => RawValue::Error(e.into()),
        }
    }
}

impl<'a> From<calamine::DataRef<'a>> for RawValue<'a> {
    fn from(value: calamine::DataRef<'a>) -> Self {
        use calamine::DataRef;

        match value {
            DataRef::Empty => RawValue::Blank,
            DataRef::Int(v) => RawValue::Int(v),
            DataRef::Float(v) => RawValue::Float(v),
            DataRef::String(v) => RawValue::Text(Cow::Owned(v)),
            DataRef::SharedString(v) => RawValue::Text(Cow::Borrowed(v)),
            DataRef::Bool(v) => RawValue::Bool(v),
            DataRef::DateTime(v) if v.is_duration() => RawValue::Float(v.as_f64()),
            DataRef::DateTime(v) => RawValue::DateSerial(v.as_f64()),
            DataRef::DateTimeIso(v) => RawValue::DateIso(Cow::Owned(v)),
            DataRef::DurationIso(v) => RawValue::Text(Cow::Owned(v)),
            DataRef::Error(e) => RawValue::Error((&e).into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("expected a {expected} cell, found {found}")]
    TypeMismatch { expected: CellType, found: CellType },
    #[error("{value} cannot be represented as {target}")]
    OutOfRange { value: String, target: &'static str },
}

/// One cell as seen by an event handler.
///
/// Borrowed from the dispatcher for the duration of the callback; call
/// [`CellValue::into_owned`] to keep it.
#[derive(Debug, Clone, PartialEq)]
pub struct CellValue<'a> {
    raw: RawValue<'a>,
    date_system: DateSystem,
}

impl<'a> CellValue<'a> {
    pub fn new(raw: RawValue<'a>, date_system: DateSystem) -> Self {
        Self { raw, date_system }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.raw, RawValue::Blank)
    }

    pub fn cell_type(&self) -> CellType {
        self.raw.cell_type()
    }

    pub fn raw(&self) -> &RawValue<'a> {
        &self.raw
    }

    pub fn date_system(&self) -> DateSystem {
        self.date_system
    }

    pub fn into_owned(self) -> CellValue<'static> {
        CellValue {
            raw: self.raw.into_owned(),
            date_system: self.date_system,
        }
    }

    fn mismatch(&self, expected: CellType) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            found: self.cell_type(),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match &self.raw {
            RawValue::Text(s) => Ok(s),
            _ => Err(self.mismatch(CellType::Text)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self.raw {
            RawValue::Bool(b) => Ok(b),
            _ => Err(self.mismatch(CellType::Boolean)),
        }
    }

    pub fn as_error(&self) -> Result<CellErrorCode, ValueError> {
        match self.raw {
            RawValue::Error(e) => Ok(e),
            _ => Err(self.mismatch(CellType::Error)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self.raw {
            RawValue::Int(v) => Ok(v as f64),
            RawValue::Float(v) => Ok(v),
            _ => Err(self.mismatch(CellType::Number)),
        }
    }

    /// Whole numbers only; a fractional value is out of range rather than truncated.
    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self.raw {
            RawValue::Int(v) => Ok(v),
            RawValue::Float(v) => {
                if v.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&v) {
                    Ok(v as i64)
                } else {
                    Err(out_of_range(v, "i64"))
                }
            }
            _ => Err(self.mismatch(CellType::Number)),
        }
    }

    pub fn as_i128(&self) -> Result<i128, ValueError> {
        match self.raw {
            RawValue::Int(v) => Ok(i128::from(v)),
            RawValue::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1.0e38 {
                    Ok(v as i128)
                } else {
                    Err(out_of_range(v, "i128"))
                }
            }
            _ => Err(self.mismatch(CellType::Number)),
        }
    }

    pub fn as_decimal(&self) -> Result<Decimal, ValueError> {
        match self.raw {
            RawValue::Int(v) => Ok(Decimal::from(v)),
            RawValue::Float(v) => Decimal::try_from(v)
                .map(|d| d.normalize())
                .map_err(|_| out_of_range(v, "decimal")),
            _ => Err(self.mismatch(CellType::Number)),
        }
    }

    /// Dates, and plain numbers interpreted as serials in the captured date system.
    pub fn as_datetime(&self) -> Result<NaiveDateTime, ValueError> {
        let serial = match &self.raw {
            RawValue::DateSerial(v) | RawValue::Float(v) => *v,
            RawValue::Int(v) => *v as f64,
            RawValue::DateIso(text) => return parse_iso_datetime(text),
            _ => return Err(self.mismatch(CellType::Date)),
        };
        self.date_system
            .serial_to_datetime(serial)
            .ok_or_else(|| out_of_range(serial, "date"))
    }

    pub fn as_date(&self) -> Result<NaiveDate, ValueError> {
        self.as_datetime().map(|dt| dt.date())
    }
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

fn out_of_range(value: impl fmt::Display, target: &'static str) -> ValueError {
    ValueError::OutOfRange {
        value: value.to_string(),
        target,
    }
}

fn parse_iso_datetime(text: &str) -> Result<NaiveDateTime, ValueError> {
    let text = text.trim();
    if let Ok(dt) = text.parse::<NaiveDateTime>() {
        return Ok(dt);
    }
    text.parse::<NaiveDate>()
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| out_of_range(text, "date"))
}

impl fmt::Display for CellValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            RawValue::Blank => Ok(()),
            RawValue::Int(v) => write!(f, "{v}"),
            RawValue::Float(v) => write!(f, "{v}"),
            RawValue::Text(s) | RawValue::DateIso(s) => f.write_str(s),
            RawValue::Bool(true) => f.write_str("TRUE"),
            RawValue::Bool(false) => f.write_str("FALSE"),
            RawValue::DateSerial(v) => match self.date_system.serial_to_datetime(*v) {
                Some(dt) if dt.time() == chrono::NaiveTime::MIN => {
                    write!(f, "{}", dt.format("%Y-%m-%d"))
                }
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
                None => write!(f, "{v}"),
            },
            RawValue::Error(e) => f.write_str(e.as_str()),
        }
    }
}
