//! Transform engine for legacy column encodings
//!
//! Each asset definition maps some columns to a [`TransformDirective`]: a
//! named transform function plus the declared scalar type of the result. The
//! codec is a pure function over `(raw value, directive)`. Malformed input
//! never fails a row; it degrades to null with a diagnostic the composer logs.
//! The only fatal condition is a directive that cannot run at all with the
//! chunk's configuration (e.g. a delimited array without a delimiter).

pub mod records;
pub mod scalar;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{WorkerError, WorkerResult};
use crate::source::SourceValue;
use records::RecordSet;
pub use scalar::{ensure_type, excel_date, repair_text, strip_control};

/// Outcome of decoding one column value
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(Value),
    /// Best-effort value; the diagnostic says what was wrong
    Degraded { value: Value, diagnostic: String },
}

impl Decoded {
    pub fn into_value(self) -> Value {
        match self {
            Decoded::Value(v) | Decoded::Degraded { value: v, .. } => v,
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Decoded::Value(_) => None,
            Decoded::Degraded { diagnostic, .. } => Some(diagnostic.as_str()),
        }
    }

    fn from_records(set: RecordSet, what: &str) -> Self {
        let value = Value::Array(set.records);
        if set.truncated > 0 {
            Decoded::Degraded {
                value,
                diagnostic: format!("{}: {} truncated record(s)", what, set.truncated),
            }
        } else {
            Decoded::Value(value)
        }
    }
}

/// Declared scalar type (`ts_type`) of a transformed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScalarType {
    Object,
    String,
    Number,
    Date,
    Other(String),
}

impl From<String> for ScalarType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "object" => ScalarType::Object,
            "string" => ScalarType::String,
            "number" => ScalarType::Number,
            "date" => ScalarType::Date,
            _ => ScalarType::Other(s),
        }
    }
}

impl From<ScalarType> for String {
    fn from(t: ScalarType) -> Self {
        match t {
            ScalarType::Object => "object".to_string(),
            ScalarType::String => "string".to_string(),
            ScalarType::Number => "number".to_string(),
            ScalarType::Date => "date".to_string(),
            ScalarType::Other(s) => s,
        }
    }
}

/// How each element of a delimited array is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementDecoder {
    /// Coerce by the directive's declared scalar type
    Scalar,
    ExcelDate,
    Hex,
    RepairedText,
}

/// Named transform function (`xform`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransformFn {
    BlobToHex,
    ExcelDate,
    DelimitedArray(ElementDecoder),
    F64Array,
    DepthRegistration,
    RasterCalibration,
    CurveValues,
    Recoveries,
    Treatments,
    LegalDescription,
    /// Anything not recognised; decoded by scalar coercion with a diagnostic
    Unmapped(String),
}

impl TransformFn {
    pub fn name(&self) -> &str {
        match self {
            TransformFn::BlobToHex => "blob_to_hex",
            TransformFn::ExcelDate => "excel_date",
            TransformFn::DelimitedArray(ElementDecoder::Scalar) => "delimited_array_with_nulls",
            TransformFn::DelimitedArray(ElementDecoder::ExcelDate) => "delimited_array_of_excel_dates",
            TransformFn::DelimitedArray(ElementDecoder::Hex) => "delimited_array_of_hex",
            TransformFn::DelimitedArray(ElementDecoder::RepairedText) => "delimited_array_of_repaired_text",
            TransformFn::F64Array => "decode_f64_array",
            TransformFn::DepthRegistration => "decode_depth_registration",
            TransformFn::RasterCalibration => "decode_raster_calibration",
            TransformFn::CurveValues => "decode_curve_values",
            TransformFn::Recoveries => "decode_recoveries",
            TransformFn::Treatments => "decode_treatments",
            TransformFn::LegalDescription => "decode_legal_description",
            TransformFn::Unmapped(name) => name.as_str(),
        }
    }
}

impl From<String> for TransformFn {
    fn from(s: String) -> Self {
        match s.as_str() {
            "blob_to_hex" => TransformFn::BlobToHex,
            "excel_date" => TransformFn::ExcelDate,
            "delimited_array_with_nulls" => TransformFn::DelimitedArray(ElementDecoder::Scalar),
            "delimited_array_of_excel_dates" => TransformFn::DelimitedArray(ElementDecoder::ExcelDate),
            "delimited_array_of_hex" => TransformFn::DelimitedArray(ElementDecoder::Hex),
            "delimited_array_of_repaired_text" => {
                TransformFn::DelimitedArray(ElementDecoder::RepairedText)
            },
            "decode_f64_array" => TransformFn::F64Array,
            "decode_depth_registration" => TransformFn::DepthRegistration,
            "decode_raster_calibration" => TransformFn::RasterCalibration,
            "decode_curve_values" => TransformFn::CurveValues,
            "decode_recoveries" => TransformFn::Recoveries,
            "decode_treatments" => TransformFn::Treatments,
            "decode_legal_description" => TransformFn::LegalDescription,
            _ => TransformFn::Unmapped(s),
        }
    }
}

impl From<TransformFn> for String {
    fn from(f: TransformFn) -> Self {
        f.name().to_string()
    }
}

/// Per-column transform directive from the asset definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformDirective {
    /// No function means plain scalar coercion
    #[serde(rename = "xform", default, skip_serializing_if = "Option::is_none")]
    pub function: Option<TransformFn>,
    #[serde(rename = "ts_type")]
    pub scalar_type: ScalarType,
}

impl TransformDirective {
    pub fn scalar(scalar_type: ScalarType) -> Self {
        Self {
            function: None,
            scalar_type,
        }
    }

    pub fn with_function(function: TransformFn, scalar_type: ScalarType) -> Self {
        Self {
            function: Some(function),
            scalar_type,
        }
    }
}

/// Delimiter and null-sentinel tokens of the chunk being decoded
#[derive(Debug, Clone, Copy, Default)]
pub struct Tokens<'a> {
    pub delimiter: Option<&'a str>,
    pub null: Option<&'a str>,
}

/// Decode one raw column value according to `directive`
pub fn transform(value: &SourceValue, directive: &TransformDirective, tokens: Tokens<'_>) -> WorkerResult<Decoded> {
    if value.is_null() {
        return Ok(Decoded::Value(Value::Null));
    }

    let Some(function) = &directive.function else {
        return Ok(ensure_type(&directive.scalar_type, value));
    };

    let decoded = match function {
        TransformFn::BlobToHex => match value {
            SourceValue::Bytes(b) => Decoded::Value(Value::String(hex::encode(b))),
            SourceValue::Text(s) => Decoded::Value(Value::String(hex::encode(s.as_bytes()))),
            other => not_binary(function, other),
        },
        TransformFn::ExcelDate => Decoded::Value(excel_date(value)),
        TransformFn::DelimitedArray(element) => {
            delimited_array(value, *element, &directive.scalar_type, tokens, function)?
        },
        TransformFn::F64Array => with_bytes(value, function, |b| {
            Decoded::from_records(records::decode_f64_array(b), function.name())
        }),
        TransformFn::CurveValues => with_bytes(value, function, |b| {
            Decoded::from_records(records::decode_curve_values(b), function.name())
        }),
        TransformFn::DepthRegistration => with_bytes(value, function, |b| {
            Decoded::from_records(records::decode_strided(b, &records::DEPTH_REGISTRATION), function.name())
        }),
        TransformFn::RasterCalibration => with_bytes(value, function, |b| {
            Decoded::from_records(records::decode_strided(b, &records::RASTER_CALIBRATION), function.name())
        }),
        TransformFn::Recoveries => with_bytes(value, function, |b| {
            Decoded::from_records(records::decode_strided(b, &records::RECOVERIES), function.name())
        }),
        TransformFn::Treatments => with_bytes(value, function, |b| {
            Decoded::from_records(records::decode_strided(b, &records::TREATMENTS), function.name())
        }),
        TransformFn::LegalDescription => with_bytes(value, function, |b| {
            match records::decode_legal_description(b) {
                (value, false) => Decoded::Value(value),
                (value, true) => Decoded::Degraded {
                    value,
                    diagnostic: format!("{}: record shorter than layout ({} bytes)", function.name(), b.len()),
                },
            }
        }),
        TransformFn::Unmapped(name) => match ensure_type(&directive.scalar_type, value) {
            Decoded::Value(value) => Decoded::Degraded {
                value,
                diagnostic: format!("unmapped transform '{}', used scalar coercion", name),
            },
            degraded => degraded,
        },
    };

    Ok(decoded)
}

fn with_bytes(value: &SourceValue, function: &TransformFn, decode: impl FnOnce(&[u8]) -> Decoded) -> Decoded {
    match value {
        SourceValue::Bytes(b) => decode(b),
        other => not_binary(function, other),
    }
}

fn not_binary(function: &TransformFn, value: &SourceValue) -> Decoded {
    Decoded::Degraded {
        value: Value::Null,
        diagnostic: format!(
            "{} expects a binary value, got {}",
            function.name(),
            match value {
                SourceValue::Null => "null",
                SourceValue::Bool(_) => "bool",
                SourceValue::Int(_) => "int",
                SourceValue::Float(_) => "float",
                SourceValue::Text(_) => "text",
                SourceValue::Bytes(_) => "bytes",
            }
        ),
    }
}

fn delimited_array(
    value: &SourceValue,
    element: ElementDecoder,
    scalar_type: &ScalarType,
    tokens: Tokens<'_>,
    function: &TransformFn,
) -> WorkerResult<Decoded> {
    let delimiter = tokens.delimiter.filter(|d| !d.is_empty()).ok_or_else(|| {
        WorkerError::config(format!("{} requires a delimiter token", function.name()))
    })?;

    let text = scalar::as_text(value);
    let mut diagnostic = None;
    let items = text
        .split(delimiter)
        .map(|raw| {
            if tokens.null == Some(raw) {
                return Value::Null;
            }
            let decoded = match element {
                ElementDecoder::Scalar => ensure_type(scalar_type, &SourceValue::Text(raw.to_string())),
                ElementDecoder::ExcelDate => Decoded::Value(excel_date(&SourceValue::Text(raw.to_string()))),
                ElementDecoder::Hex => Decoded::Value(Value::String(hex::encode(raw.as_bytes()))),
                ElementDecoder::RepairedText => Decoded::Value(Value::String(repair_text(raw))),
            };
            if let Decoded::Degraded { diagnostic: d, .. } = &decoded {
                diagnostic.get_or_insert_with(|| d.clone());
            }
            decoded.into_value()
        })
        .collect();

    let value = Value::Array(items);
    Ok(match diagnostic {
        Some(diagnostic) => Decoded::Degraded { value, diagnostic },
        None => Decoded::Value(value),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOKENS: Tokens<'static> = Tokens {
        delimiter: Some("||"),
        null: Some("~NULL~"),
    };

    fn directive(function: &str, ts_type: &str) -> TransformDirective {
        serde_json::from_value(json!({"xform": function, "ts_type": ts_type})).unwrap()
    }

    #[test]
    fn test_delimited_numbers_with_null_token() {
        let d = directive("delimited_array_with_nulls", "number");
        let out = transform(&SourceValue::Text("5||~NULL~||7".into()), &d, TOKENS).unwrap();
        assert_eq!(out, Decoded::Value(json!([5.0, null, 7.0])));
    }

    #[test]
    fn test_delimited_excel_dates() {
        let d = directive("delimited_array_of_excel_dates", "date");
        let out = transform(&SourceValue::Text("25569||1E30||~NULL~".into()), &d, TOKENS).unwrap();
        assert_eq!(out.into_value(), json!(["1970-01-01T00:00:00", null, null]));
    }

    #[test]
    fn test_delimited_hex_and_repaired_text() {
        let hex = directive("delimited_array_of_hex", "string");
        let out = transform(&SourceValue::Text("AB||~NULL~".into()), &hex, TOKENS).unwrap();
        assert_eq!(out.into_value(), json!(["4142", null]));

        let text = directive("delimited_array_of_repaired_text", "string");
        let out = transform(&SourceValue::Text("CafÃ©||ok".into()), &text, TOKENS).unwrap();
        assert_eq!(out.into_value(), json!(["Café", "ok"]));
    }

    #[test]
    fn test_delimited_without_delimiter_is_fatal() {
        let d = directive("delimited_array_with_nulls", "number");
        let err = transform(&SourceValue::Text("1,2".into()), &d, Tokens::default()).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }

    #[test]
    fn test_null_short_circuits_before_dispatch() {
        // would be fatal if dispatched: no delimiter configured
        let d = directive("delimited_array_with_nulls", "number");
        let out = transform(&SourceValue::Null, &d, Tokens::default()).unwrap();
        assert_eq!(out, Decoded::Value(Value::Null));
    }

    #[test]
    fn test_blob_to_hex() {
        let d = directive("blob_to_hex", "string");
        let out = transform(&SourceValue::Bytes(vec![0xde, 0xad, 0x01]), &d, TOKENS).unwrap();
        assert_eq!(out, Decoded::Value(json!("dead01")));
    }

    #[test]
    fn test_unmapped_function_falls_back_to_scalar() {
        let d = directive("decode_mystery", "number");
        assert_eq!(d.function, Some(TransformFn::Unmapped("decode_mystery".into())));

        let out = transform(&SourceValue::Text("12".into()), &d, TOKENS).unwrap();
        assert!(out.diagnostic().unwrap().contains("decode_mystery"));
        assert_eq!(out.into_value(), json!(12.0));
    }

    #[test]
    fn test_binary_decoder_on_text_degrades() {
        let d = directive("decode_f64_array", "object");
        let out = transform(&SourceValue::Text("nope".into()), &d, TOKENS).unwrap();
        assert!(out.diagnostic().is_some());
        assert_eq!(out.into_value(), Value::Null);
    }

    #[test]
    fn test_directive_without_function_coerces() {
        let d: TransformDirective = serde_json::from_value(json!({"ts_type": "string"})).unwrap();
        assert_eq!(d.function, None);
        let out = transform(&SourceValue::Text("a\u{7}b".into()), &d, TOKENS).unwrap();
        assert_eq!(out.into_value(), json!("ab"));
    }

    #[test]
    fn test_directive_names_round_trip() {
        for name in [
            "blob_to_hex",
            "excel_date",
            "delimited_array_with_nulls",
            "delimited_array_of_excel_dates",
            "delimited_array_of_hex",
            "delimited_array_of_repaired_text",
            "decode_f64_array",
            "decode_depth_registration",
            "decode_raster_calibration",
            "decode_curve_values",
            "decode_recoveries",
            "decode_treatments",
            "decode_legal_description",
        ] {
            let f = TransformFn::from(name.to_string());
            assert!(!matches!(f, TransformFn::Unmapped(_)), "{} should be known", name);
            assert_eq!(f.name(), name);
        }
    }
}
