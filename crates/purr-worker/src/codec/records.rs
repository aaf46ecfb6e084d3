//! Fixed-width binary record decoders
//!
//! Legacy stores pack repeating structures into blob columns. Each layout is a
//! table of named fields at byte offsets inside one record; numbers are
//! little-endian, text is fixed-length and null-terminated.

use serde_json::{Map, Number, Value};

use super::scalar::excel_days_to_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    F64,
    F32,
    I32,
    I16,
    /// f64 spreadsheet day number rendered as an ISO datetime
    ExcelDate,
    Text(usize),
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            FieldKind::F64 | FieldKind::ExcelDate => 8,
            FieldKind::F32 | FieldKind::I32 => 4,
            FieldKind::I16 => 2,
            FieldKind::Text(len) => len,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    offset: usize,
    kind: FieldKind,
}

const fn field(name: &'static str, offset: usize, kind: FieldKind) -> Field {
    Field { name, offset, kind }
}

/// A repeating record layout inside one buffer
#[derive(Debug, Clone, Copy)]
pub struct StrideLayout {
    start: usize,
    stride: usize,
    fields: &'static [Field],
}

pub const DEPTH_REGISTRATION: StrideLayout = StrideLayout {
    start: 12,
    stride: 28,
    fields: &[field("depth", 0, FieldKind::F64), field("pixel", 12, FieldKind::I32)],
};

pub const RASTER_CALIBRATION: StrideLayout = StrideLayout {
    start: 4,
    stride: 28,
    fields: &[field("depth", 0, FieldKind::F64), field("pixel", 12, FieldKind::I32)],
};

pub const RECOVERIES: StrideLayout = StrideLayout {
    start: 0,
    stride: 36,
    fields: &[
        field("amount", 0, FieldKind::F64),
        field("units", 8, FieldKind::Text(8)),
        field("description", 16, FieldKind::Text(20)),
    ],
};

pub const TREATMENTS: StrideLayout = StrideLayout {
    start: 0,
    stride: 110,
    fields: &[
        field("treat_type", 0, FieldKind::Text(16)),
        field("top", 16, FieldKind::F64),
        field("base", 24, FieldKind::F64),
        field("date", 32, FieldKind::ExcelDate),
        field("fluid", 40, FieldKind::Text(16)),
        field("fluid_amount", 56, FieldKind::F64),
        field("fluid_units", 64, FieldKind::Text(8)),
        field("prop", 72, FieldKind::Text(16)),
        field("prop_amount", 88, FieldKind::F64),
        field("prop_units", 96, FieldKind::Text(4)),
        field("rate", 100, FieldKind::F32),
        field("breakdown", 104, FieldKind::I32),
        field("stages", 108, FieldKind::I16),
    ],
};

const LEGAL_DESCRIPTION: &[Field] = &[
    field("township", 0, FieldKind::I32),
    field("township_dir", 4, FieldKind::Text(2)),
    field("range", 6, FieldKind::I32),
    field("range_dir", 10, FieldKind::Text(2)),
    field("section", 12, FieldKind::I32),
    field("meridian", 16, FieldKind::Text(4)),
    field("spot", 20, FieldKind::Text(12)),
    field("ns_footage", 32, FieldKind::F64),
    field("ns_ref", 40, FieldKind::Text(4)),
    field("ew_footage", 44, FieldKind::F64),
    field("ew_ref", 52, FieldKind::Text(4)),
    field("lot", 56, FieldKind::Text(8)),
    field("block", 64, FieldKind::Text(16)),
    field("survey", 80, FieldKind::Text(40)),
];

/// Decoded records plus the count of records cut short by the buffer end
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    pub records: Vec<Value>,
    pub truncated: usize,
}

fn read<const N: usize>(buf: &[u8], at: usize) -> Option<[u8; N]> {
    buf.get(at..at + N).and_then(|s| s.try_into().ok())
}

fn number(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Fixed-length text: cut at the first null byte, then trim
fn fixed_text(bytes: &[u8], strip_quotes: bool) -> Value {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let text = String::from_utf8_lossy(&bytes[..end]);
    let trimmed = text.trim();
    let trimmed = if strip_quotes {
        trimmed.trim_matches(['"', '\'']).trim()
    } else {
        trimmed
    };
    Value::String(trimmed.to_string())
}

fn decode_field(buf: &[u8], base: usize, f: &Field, strip_quotes: bool) -> Option<Value> {
    let at = base + f.offset;
    let value = match f.kind {
        FieldKind::F64 => number(f64::from_le_bytes(read::<8>(buf, at)?)),
        FieldKind::ExcelDate => excel_days_to_iso(f64::from_le_bytes(read::<8>(buf, at)?))
            .map(Value::String)
            .unwrap_or(Value::Null),
        FieldKind::F32 => number(f32::from_le_bytes(read::<4>(buf, at)?) as f64),
        FieldKind::I32 => Value::from(i32::from_le_bytes(read::<4>(buf, at)?)),
        FieldKind::I16 => Value::from(i16::from_le_bytes(read::<2>(buf, at)?)),
        FieldKind::Text(len) => fixed_text(buf.get(at..at + len)?, strip_quotes),
    };
    Some(value)
}

/// Decode one record at `base`. Returns the record and whether any field ran
/// past the end of the buffer.
fn decode_record(buf: &[u8], base: usize, fields: &[Field], strip_quotes: bool) -> (Map<String, Value>, bool) {
    let mut record = Map::with_capacity(fields.len());
    let mut short = false;
    for f in fields {
        let value = decode_field(buf, base, f, strip_quotes).unwrap_or_else(|| {
            short = true;
            Value::Null
        });
        record.insert(f.name.to_string(), value);
    }
    (record, short)
}

/// Walk `buf` in `layout.stride` steps starting at `layout.start`.
///
/// A record that only partially fits is kept (missing fields null) as long as
/// its first field fits; anything shorter is dropped.
pub fn decode_strided(buf: &[u8], layout: &StrideLayout) -> RecordSet {
    let mut set = RecordSet {
        records: Vec::new(),
        truncated: 0,
    };
    let first_width = layout.fields.first().map_or(0, |f| f.offset + f.kind.width());

    let mut base = layout.start;
    while base < buf.len() {
        if base + first_width > buf.len() {
            set.truncated += 1;
            break;
        }
        let (record, short) = decode_record(buf, base, layout.fields, false);
        if short {
            set.truncated += 1;
        }
        set.records.push(Value::Object(record));
        base += layout.stride;
    }
    set
}

/// Little-endian f64 array, 8-byte stride from offset 0
pub fn decode_f64_array(buf: &[u8]) -> RecordSet {
    decode_scalars(buf, 0, 8, |chunk| {
        read::<8>(chunk, 0).map(|b| number(f64::from_le_bytes(b)))
    })
}

/// Little-endian f32 array, 4-byte stride from offset 2
pub fn decode_curve_values(buf: &[u8]) -> RecordSet {
    decode_scalars(buf, 2, 4, |chunk| {
        read::<4>(chunk, 0).map(|b| number(f32::from_le_bytes(b) as f64))
    })
}

fn decode_scalars(buf: &[u8], start: usize, width: usize, f: impl Fn(&[u8]) -> Option<Value>) -> RecordSet {
    let body = buf.get(start..).unwrap_or_default();
    let chunks = body.chunks(width);
    let mut set = RecordSet {
        records: Vec::with_capacity(body.len() / width),
        truncated: 0,
    };
    for chunk in chunks {
        match f(chunk) {
            Some(v) => set.records.push(v),
            None => set.truncated += 1,
        }
    }
    set
}

/// Single legal-description record; quote characters around text are removed
pub fn decode_legal_description(buf: &[u8]) -> (Value, bool) {
    let (record, short) = decode_record(buf, 0, LEGAL_DESCRIPTION, true);
    (Value::Object(record), short)
}
