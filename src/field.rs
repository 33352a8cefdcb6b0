//! # Field Module
//!
//! Messages carry named, typed scalar fields. This module provides the
//! [`FieldType`] and [`FieldValue`] taxonomy, the [`Field`] container with
//! its header/tracking flags, read-side value conversion, and the
//! template-driven write-side coercion table used by
//! `Message::set_field_value`.
//!
//! ## Coercion Rules
//!
//! When a target type is known (from a message template), the target
//! dictates: numeric narrowing that would lose data fails with
//! `VALUE_OUT_OF_RANGE`; a non-numeric string offered to a numeric target
//! fails with `INVALID_TYPE_CONVERSION`; `BOOL` accepts `true`/`false`
//! and `0`/`1`; `BIN` accepts hex or raw bytes depending on the convert
//! flag.

use crate::status::{Result, Status, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Char,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    Binary,
}

impl FieldType {
    /// Canonical tag used in the XML/JSON text forms.
    pub fn tag(&self) -> &'static str {
        match self {
            FieldType::Bool => "BOOL",
            FieldType::Char => "CHAR",
            FieldType::I8 => "I8",
            FieldType::I16 => "I16",
            FieldType::I32 => "I32",
            FieldType::I64 => "I64",
            FieldType::U8 => "U8",
            FieldType::U16 => "U16",
            FieldType::U32 => "U32",
            FieldType::U64 => "U64",
            FieldType::F32 => "F32",
            FieldType::F64 => "F64",
            FieldType::String => "STRING",
            FieldType::Binary => "BIN",
        }
    }

    /// Parse a type tag. Accepts the legacy spellings (`SHORT`, `LONG`,
    /// `DOUBLE`, ...) still found in archived message captures.
    pub fn from_tag(tag: &str) -> Result<Self> {
        let ty = match tag.to_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => FieldType::Bool,
            "CHAR" => FieldType::Char,
            "I8" => FieldType::I8,
            "I16" | "SHORT" => FieldType::I16,
            "I32" | "LONG" => FieldType::I32,
            "I64" => FieldType::I64,
            "U8" => FieldType::U8,
            "U16" | "USHORT" => FieldType::U16,
            "U32" | "ULONG" => FieldType::U32,
            "U64" => FieldType::U64,
            "F32" | "FLOAT" => FieldType::F32,
            "F64" | "DOUBLE" => FieldType::F64,
            "STRING" => FieldType::String,
            "BIN" | "BINARY" | "BLOB" => FieldType::Binary,
            other => {
                return Err(Status::field_error(
                    StatusCode::UnknownFieldType,
                    format!("Unknown field type: {other}"),
                ))
            }
        };
        Ok(ty)
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            FieldType::Bool | FieldType::Char | FieldType::String | FieldType::Binary
        )
    }
}

/// A typed scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Char(char),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Binary(Vec<u8>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Char(_) => FieldType::Char,
            FieldValue::I8(_) => FieldType::I8,
            FieldValue::I16(_) => FieldType::I16,
            FieldValue::I32(_) => FieldType::I32,
            FieldValue::I64(_) => FieldType::I64,
            FieldValue::U8(_) => FieldType::U8,
            FieldValue::U16(_) => FieldType::U16,
            FieldValue::U32(_) => FieldType::U32,
            FieldValue::U64(_) => FieldType::U64,
            FieldValue::F32(_) => FieldType::F32,
            FieldValue::F64(_) => FieldType::F64,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Binary(_) => FieldType::Binary,
        }
    }

    /// Render the value in its canonical text form (hex for binary).
    pub fn render(&self) -> String {
        match self {
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Char(v) => v.to_string(),
            FieldValue::I8(v) => v.to_string(),
            FieldValue::I16(v) => v.to_string(),
            FieldValue::I32(v) => v.to_string(),
            FieldValue::I64(v) => v.to_string(),
            FieldValue::U8(v) => v.to_string(),
            FieldValue::U16(v) => v.to_string(),
            FieldValue::U32(v) => v.to_string(),
            FieldValue::U64(v) => v.to_string(),
            FieldValue::F32(v) => v.to_string(),
            FieldValue::F64(v) => v.to_string(),
            FieldValue::String(v) => v.clone(),
            FieldValue::Binary(v) => hex_encode(v),
        }
    }

    /// Parse a value from its canonical text form for the given type.
    pub fn parse(ty: FieldType, text: &str) -> Result<Self> {
        coerce(ty, &FieldValue::String(text.to_string()), true)
    }

    /// Approximate serialized footprint in bytes.
    pub fn size(&self) -> usize {
        match self {
            FieldValue::Bool(_) | FieldValue::I8(_) | FieldValue::U8(_) => 1,
            FieldValue::Char(_) => 1,
            FieldValue::I16(_) | FieldValue::U16(_) => 2,
            FieldValue::I32(_) | FieldValue::U32(_) | FieldValue::F32(_) => 4,
            FieldValue::I64(_) | FieldValue::U64(_) | FieldValue::F64(_) => 8,
            FieldValue::String(v) => v.len(),
            FieldValue::Binary(v) => v.len(),
        }
    }
}

macro_rules! field_value_from {
    ($($src:ty => $variant:ident),* $(,)?) => {
        $(impl From<$src> for FieldValue {
            fn from(v: $src) -> Self {
                FieldValue::$variant(v)
            }
        })*
    };
}

field_value_from! {
    bool => Bool,
    char => Char,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Binary,
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<&[u8]> for FieldValue {
    fn from(v: &[u8]) -> Self {
        FieldValue::Binary(v.to_vec())
    }
}

/// A named field with its header and tracking flags.
///
/// The header flag marks fields that belong to the message header in the
/// wire representation; the tracking flag marks fields injected by the
/// runtime so they can be stripped again after a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    value: FieldValue,
    header: bool,
    #[serde(skip)]
    tracking: bool,
}

impl Field {
    pub fn new(name: &str, value: impl Into<FieldValue>) -> Result<Self> {
        validate_field_name(name)?;
        Ok(Self {
            name: name.to_string(),
            value: value.into(),
            header: false,
            tracking: false,
        })
    }

    pub fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    pub(crate) fn with_tracking(mut self, tracking: bool) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn field_type(&self) -> FieldType {
        self.value.field_type()
    }

    pub fn is_header(&self) -> bool {
        self.header
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Signed-integer view of the value.
    pub fn i64_value(&self) -> Result<i64> {
        match &self.value {
            FieldValue::Bool(v) => Ok(*v as i64),
            FieldValue::Char(v) => Ok(*v as i64),
            FieldValue::I8(v) => Ok(*v as i64),
            FieldValue::I16(v) => Ok(*v as i64),
            FieldValue::I32(v) => Ok(*v as i64),
            FieldValue::I64(v) => Ok(*v),
            FieldValue::U8(v) => Ok(*v as i64),
            FieldValue::U16(v) => Ok(*v as i64),
            FieldValue::U32(v) => Ok(*v as i64),
            FieldValue::U64(v) => i64::try_from(*v).map_err(|_| {
                Status::field_error(
                    StatusCode::ValueOutOfRange,
                    format!("Field {} exceeds I64 range", self.name),
                )
            }),
            FieldValue::F32(v) => Ok(*v as i64),
            FieldValue::F64(v) => Ok(*v as i64),
            FieldValue::String(v) => v.trim().parse::<i64>().map_err(|_| {
                Status::field_error(
                    StatusCode::InvalidTypeConversion,
                    format!("Field {} cannot be converted to I64", self.name),
                )
            }),
            FieldValue::Binary(_) => Err(Status::field_error(
                StatusCode::InvalidTypeConversion,
                format!("Field {} cannot be converted to I64", self.name),
            )),
        }
    }

    /// Unsigned-integer view of the value.
    pub fn u64_value(&self) -> Result<u64> {
        let out_of_range = || {
            Status::field_error(
                StatusCode::ValueOutOfRange,
                format!("Field {} is negative", self.name),
            )
        };
        match &self.value {
            FieldValue::U8(v) => Ok(*v as u64),
            FieldValue::U16(v) => Ok(*v as u64),
            FieldValue::U32(v) => Ok(*v as u64),
            FieldValue::U64(v) => Ok(*v),
            FieldValue::String(v) => v.trim().parse::<u64>().map_err(|_| {
                Status::field_error(
                    StatusCode::InvalidTypeConversion,
                    format!("Field {} cannot be converted to U64", self.name),
                )
            }),
            _ => {
                let signed = self.i64_value()?;
                u64::try_from(signed).map_err(|_| out_of_range())
            }
        }
    }

    pub fn f64_value(&self) -> Result<f64> {
        match &self.value {
            FieldValue::F32(v) => Ok(*v as f64),
            FieldValue::F64(v) => Ok(*v),
            FieldValue::String(v) => v.trim().parse::<f64>().map_err(|_| {
                Status::field_error(
                    StatusCode::InvalidTypeConversion,
                    format!("Field {} cannot be converted to F64", self.name),
                )
            }),
            FieldValue::Binary(_) => Err(Status::field_error(
                StatusCode::InvalidTypeConversion,
                format!("Field {} cannot be converted to F64", self.name),
            )),
            _ => Ok(self.i64_value()? as f64),
        }
    }

    /// Text view of the value (canonical rendering).
    pub fn string_value(&self) -> String {
        self.value.render()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]={}",
            self.name,
            self.field_type().tag(),
            self.value.render()
        )
    }
}

/// Field names are non-empty and limited to alphanumerics plus `-`, `_`,
/// and `.` (the dot appears in indexed names such as
/// `SUBSCRIPTION.1.SUBJECT-PATTERN`).
pub fn validate_field_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(Status::field_error(
            StatusCode::InvalidFieldName,
            format!("Invalid field name: '{name}'"),
        ))
    }
}

/// Coerce `source` into `target`. `convert_bin` selects whether a string
/// offered to a `BIN` target is decoded as hex (`true`) or taken as raw
/// bytes (`false`).
pub fn coerce(target: FieldType, source: &FieldValue, convert_bin: bool) -> Result<FieldValue> {
    let conversion_error = || {
        Status::field_error(
            StatusCode::InvalidTypeConversion,
            format!(
                "Cannot convert {} value to {}",
                source.field_type().tag(),
                target.tag()
            ),
        )
    };
    let range_error = || {
        Status::field_error(
            StatusCode::ValueOutOfRange,
            format!("Value does not fit in {}", target.tag()),
        )
    };

    // Integer targets funnel through i128 so a single range check covers
    // every width.
    if let Some((min, max)) = integer_bounds(target) {
        let wide: i128 = match source {
            FieldValue::Bool(v) => *v as i128,
            FieldValue::Char(v) => *v as i128,
            FieldValue::I8(v) => *v as i128,
            FieldValue::I16(v) => *v as i128,
            FieldValue::I32(v) => *v as i128,
            FieldValue::I64(v) => *v as i128,
            FieldValue::U8(v) => *v as i128,
            FieldValue::U16(v) => *v as i128,
            FieldValue::U32(v) => *v as i128,
            FieldValue::U64(v) => *v as i128,
            FieldValue::F32(v) => float_to_integer(*v as f64).ok_or_else(range_error)?,
            FieldValue::F64(v) => float_to_integer(*v).ok_or_else(range_error)?,
            FieldValue::String(v) => v.trim().parse::<i128>().map_err(|_| conversion_error())?,
            FieldValue::Binary(_) => return Err(conversion_error()),
        };
        if wide < min || wide > max {
            return Err(range_error());
        }
        return Ok(integer_value(target, wide));
    }

    match target {
        FieldType::Bool => match source {
            FieldValue::Bool(v) => Ok(FieldValue::Bool(*v)),
            FieldValue::String(v) => match v.trim().to_lowercase().as_str() {
                "true" | "1" => Ok(FieldValue::Bool(true)),
                "false" | "0" => Ok(FieldValue::Bool(false)),
                _ => Err(conversion_error()),
            },
            _ => {
                let field = Field::new("tmp", source.clone())?;
                match field.i64_value() {
                    Ok(0) => Ok(FieldValue::Bool(false)),
                    Ok(1) => Ok(FieldValue::Bool(true)),
                    _ => Err(conversion_error()),
                }
            }
        },
        FieldType::Char => match source {
            FieldValue::Char(v) => Ok(FieldValue::Char(*v)),
            FieldValue::String(v) => {
                let mut chars = v.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(FieldValue::Char(c)),
                    _ => Err(conversion_error()),
                }
            }
            _ => Err(conversion_error()),
        },
        FieldType::F32 => match source {
            FieldValue::F32(v) => Ok(FieldValue::F32(*v)),
            FieldValue::F64(v) => Ok(FieldValue::F32(*v as f32)),
            FieldValue::String(v) => v
                .trim()
                .parse::<f32>()
                .map(FieldValue::F32)
                .map_err(|_| conversion_error()),
            _ => {
                let field = Field::new("tmp", source.clone())?;
                Ok(FieldValue::F32(field.f64_value()? as f32))
            }
        },
        FieldType::F64 => match source {
            FieldValue::F32(v) => Ok(FieldValue::F64(*v as f64)),
            FieldValue::F64(v) => Ok(FieldValue::F64(*v)),
            FieldValue::String(v) => v
                .trim()
                .parse::<f64>()
                .map(FieldValue::F64)
                .map_err(|_| conversion_error()),
            _ => {
                let field = Field::new("tmp", source.clone())?;
                Ok(FieldValue::F64(field.f64_value()?))
            }
        },
        FieldType::String => Ok(FieldValue::String(source.render())),
        FieldType::Binary => match source {
            FieldValue::Binary(v) => Ok(FieldValue::Binary(v.clone())),
            FieldValue::String(v) => {
                if convert_bin {
                    hex_decode(v).map(FieldValue::Binary).ok_or_else(conversion_error)
                } else {
                    Ok(FieldValue::Binary(v.as_bytes().to_vec()))
                }
            }
            _ => Err(conversion_error()),
        },
        // Integer targets handled above.
        _ => unreachable!("integer targets resolved via integer_bounds"),
    }
}

fn integer_bounds(ty: FieldType) -> Option<(i128, i128)> {
    match ty {
        FieldType::I8 => Some((i8::MIN as i128, i8::MAX as i128)),
        FieldType::I16 => Some((i16::MIN as i128, i16::MAX as i128)),
        FieldType::I32 => Some((i32::MIN as i128, i32::MAX as i128)),
        FieldType::I64 => Some((i64::MIN as i128, i64::MAX as i128)),
        FieldType::U8 => Some((0, u8::MAX as i128)),
        FieldType::U16 => Some((0, u16::MAX as i128)),
        FieldType::U32 => Some((0, u32::MAX as i128)),
        FieldType::U64 => Some((0, u64::MAX as i128)),
        _ => None,
    }
}

fn integer_value(ty: FieldType, wide: i128) -> FieldValue {
    match ty {
        FieldType::I8 => FieldValue::I8(wide as i8),
        FieldType::I16 => FieldValue::I16(wide as i16),
        FieldType::I32 => FieldValue::I32(wide as i32),
        FieldType::I64 => FieldValue::I64(wide as i64),
        FieldType::U8 => FieldValue::U8(wide as u8),
        FieldType::U16 => FieldValue::U16(wide as u16),
        FieldType::U32 => FieldValue::U32(wide as u32),
        FieldType::U64 => FieldValue::U64(wide as u64),
        _ => unreachable!("not an integer type"),
    }
}

// Narrowing a float into an integer must not lose data.
fn float_to_integer(v: f64) -> Option<i128> {
    if v.fract() == 0.0 && v.is_finite() {
        Some(v as i128)
    } else {
        None
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

pub(crate) fn hex_decode(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_are_validated() {
        assert!(Field::new("NODE", "HOST1").is_ok());
        assert!(Field::new("SUBSCRIPTION.1.SUBJECT-PATTERN", "A.>").is_ok());
        assert!(Field::new("", 1i32).is_err());
        assert!(Field::new("BAD NAME", 1i32).is_err());
    }

    #[test]
    fn type_tags_round_trip() {
        for ty in [
            FieldType::Bool,
            FieldType::Char,
            FieldType::I8,
            FieldType::I16,
            FieldType::I32,
            FieldType::I64,
            FieldType::U8,
            FieldType::U16,
            FieldType::U32,
            FieldType::U64,
            FieldType::F32,
            FieldType::F64,
            FieldType::String,
            FieldType::Binary,
        ] {
            assert_eq!(FieldType::from_tag(ty.tag()).unwrap(), ty);
        }
        assert_eq!(FieldType::from_tag("SHORT").unwrap(), FieldType::I16);
        assert!(FieldType::from_tag("GARBAGE").is_err());
    }

    #[test]
    fn integer_narrowing_checks_range() {
        assert_eq!(
            coerce(FieldType::I16, &FieldValue::I32(1000), true).unwrap(),
            FieldValue::I16(1000)
        );
        let err = coerce(FieldType::I16, &FieldValue::I32(70000), true).unwrap_err();
        assert_eq!(err.code(), StatusCode::ValueOutOfRange);

        let err = coerce(FieldType::U32, &FieldValue::I32(-1), true).unwrap_err();
        assert_eq!(err.code(), StatusCode::ValueOutOfRange);
    }

    #[test]
    fn string_to_numeric_requires_numeric_text() {
        assert_eq!(
            coerce(FieldType::I32, &FieldValue::String("42".into()), true).unwrap(),
            FieldValue::I32(42)
        );
        let err = coerce(FieldType::I32, &FieldValue::String("forty-two".into()), true).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidTypeConversion);
    }

    #[test]
    fn bool_accepts_the_documented_spellings() {
        for (text, expected) in [("true", true), ("false", false), ("1", true), ("0", false)] {
            assert_eq!(
                coerce(FieldType::Bool, &FieldValue::String(text.into()), true).unwrap(),
                FieldValue::Bool(expected)
            );
        }
        assert!(coerce(FieldType::Bool, &FieldValue::String("yes".into()), true).is_err());
        assert_eq!(
            coerce(FieldType::Bool, &FieldValue::I32(1), true).unwrap(),
            FieldValue::Bool(true)
        );
        assert!(coerce(FieldType::Bool, &FieldValue::I32(2), true).is_err());
    }

    #[test]
    fn float_narrowing_requires_integral_values() {
        assert_eq!(
            coerce(FieldType::I32, &FieldValue::F64(12.0), true).unwrap(),
            FieldValue::I32(12)
        );
        let err = coerce(FieldType::I32, &FieldValue::F64(12.5), true).unwrap_err();
        assert_eq!(err.code(), StatusCode::ValueOutOfRange);
    }

    #[test]
    fn bin_honors_the_convert_flag() {
        assert_eq!(
            coerce(FieldType::Binary, &FieldValue::String("DEADBEEF".into()), true).unwrap(),
            FieldValue::Binary(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert_eq!(
            coerce(FieldType::Binary, &FieldValue::String("AB".into()), false).unwrap(),
            FieldValue::Binary(vec![b'A', b'B'])
        );
        assert!(coerce(FieldType::Binary, &FieldValue::String("XYZ".into()), true).is_err());
    }

    #[test]
    fn read_side_conversions() {
        let field = Field::new("X", 42i32).unwrap();
        assert_eq!(field.i64_value().unwrap(), 42);
        assert_eq!(field.u64_value().unwrap(), 42);
        assert_eq!(field.f64_value().unwrap(), 42.0);
        assert_eq!(field.string_value(), "42");

        let negative = Field::new("X", -1i32).unwrap();
        assert_eq!(
            negative.u64_value().unwrap_err().code(),
            StatusCode::ValueOutOfRange
        );

        let text = Field::new("X", "123").unwrap();
        assert_eq!(text.i64_value().unwrap(), 123);
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x00, 0x7F, 0xFF, 0x10];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("ABC").is_none());
        assert!(hex_decode("GG").is_none());
    }

    #[test]
    fn process_id_wraps_through_i16_and_back() {
        // Legacy behavior: a pid beyond i16::MAX is stored as its
        // two's-complement I16 and must round-trip through U32 unscathed.
        let pid: u32 = 40000;
        let stored = FieldValue::I16(pid as u16 as i16);
        let FieldValue::I16(raw) = stored else { unreachable!() };
        assert!(raw < 0);
        assert_eq!(raw as u16 as u32, pid);
    }
}
