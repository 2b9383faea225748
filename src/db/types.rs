//! Row decoding into JSON maps.
//!
//! Columns are first classified into a [`TypeCategory`] from the backend's type
//! name, then decoded by a backend-specific routine. Values that cannot be
//! decoded become `null` rather than failing the whole fetch.

use crate::models::{DatabaseType, Row as JsonRow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Text,
}

/// Classify a backend type name.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();

    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite NUMERIC affinity stores REAL or INTEGER
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    TypeCategory::Text
}

/// DECIMAL/NUMERIC kept as its textual representation.
#[derive(Debug)]
struct RawDecimal(String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("decimal")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <&str as Decode<sqlx::MySql>>::decode(value).map(|s| RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("numeric")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("numeric")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        // Text protocol only; binary NUMERIC falls back to null
        <&str as Decode<sqlx::Postgres>>::decode(value).map(|s| RawDecimal(s.to_string()))
    }
}

/// Return the first `Some` decoded as one of the listed types.
macro_rules! first_decoded {
    ($row:expr, $idx:expr, [$($ty:ty),+ $(,)?], $map:expr) => {{
        let mut out = JsonValue::Null;
        $(
            if out.is_null() {
                if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                    out = $map(v);
                }
            }
        )+
        out
    }};
}

fn int_value<T: Into<serde_json::Number>>(v: T) -> JsonValue {
    JsonValue::Number(v.into())
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn bytes_value(v: Vec<u8>) -> JsonValue {
    JsonValue::String(STANDARD.encode(v))
}

/// Text columns whose declared type mentions JSON are parsed when possible.
fn text_value(v: String, type_name: &str) -> JsonValue {
    if type_name.to_ascii_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

/// Conversion of a driver row into a [`JsonRow`].
pub trait DecodeRow {
    fn decode_row(&self) -> JsonRow;
}

impl DecodeRow for MySqlRow {
    fn decode_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let value = match categorize_type(type_name, DatabaseType::MySQL) {
                    TypeCategory::Decimal => first_decoded!(self, idx, [RawDecimal], |d: RawDecimal| JsonValue::String(d.0)),
                    TypeCategory::Integer => first_decoded!(self, idx, [i64, u64], int_value),
                    TypeCategory::Boolean => first_decoded!(self, idx, [bool], JsonValue::Bool),
                    TypeCategory::Float => {
                        first_decoded!(self, idx, [f64, f32], |v| float_value(f64::from(v)))
                    }
                    TypeCategory::Binary => first_decoded!(self, idx, [Vec<u8>], bytes_value),
                    TypeCategory::Json => first_decoded!(self, idx, [JsonValue], |v| v),
                    TypeCategory::Text => {
                        first_decoded!(self, idx, [String], |v| text_value(v, type_name))
                    }
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl DecodeRow for PgRow {
    fn decode_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let value = match categorize_type(type_name, DatabaseType::PostgreSQL) {
                    TypeCategory::Decimal => first_decoded!(self, idx, [RawDecimal], |d: RawDecimal| JsonValue::String(d.0)),
                    TypeCategory::Integer => first_decoded!(self, idx, [i64, i32, i16], int_value),
                    TypeCategory::Boolean => first_decoded!(self, idx, [bool], JsonValue::Bool),
                    TypeCategory::Float => {
                        first_decoded!(self, idx, [f64, f32], |v| float_value(f64::from(v)))
                    }
                    TypeCategory::Binary => first_decoded!(self, idx, [Vec<u8>], bytes_value),
                    TypeCategory::Json => first_decoded!(self, idx, [JsonValue], |v| v),
                    TypeCategory::Text => {
                        first_decoded!(self, idx, [String], |v| text_value(v, type_name))
                    }
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl DecodeRow for SqliteRow {
    fn decode_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                // Expression columns report the storage class of the value
                let type_name = col.type_info().name();
                let value = match categorize_type(type_name, DatabaseType::SQLite) {
                    TypeCategory::Integer => first_decoded!(self, idx, [i64], int_value),
                    TypeCategory::Boolean => first_decoded!(self, idx, [bool], JsonValue::Bool),
                    TypeCategory::Float | TypeCategory::Decimal => {
                        first_decoded!(self, idx, [f64], float_value)
                    }
                    TypeCategory::Binary => first_decoded!(self, idx, [Vec<u8>], bytes_value),
                    TypeCategory::Json | TypeCategory::Text => {
                        first_decoded!(self, idx, [String], |v| text_value(v, type_name))
                    }
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}
