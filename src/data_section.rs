//! Data section encoding and decoding.
//!
//! Implements the MaxMind DB self-describing value encoding: a control byte
//! carrying a 3-bit type tag and a 5-bit size field, followed by the payload.
//! Values may reference other values through pointers into the same section;
//! the decoder resolves those transparently.
//!
//! # Supported Types
//!
//! - **String**: UTF-8 text data
//! - **Double**: 64-bit floating point (IEEE 754)
//! - **Bytes**: raw byte arrays
//! - **Uint16/Uint32/Uint64/Uint128**: unsigned integers, variable width
//! - **Int32**: signed 32-bit integer
//! - **Map**: key-value pairs (string keys), encounter order preserved
//! - **Array**: ordered lists of values
//! - **Bool**: boolean, value carried in the size field
//! - **Float**: 32-bit floating point (IEEE 754)
//!
//! Pointers are an encoding artifact, not a value type: decoding a pointer
//! yields the pointee's value, with the cursor advanced only past the
//! pointer's own bytes so sibling data resumes correctly.
//!
//! See: https://maxmind.github.io/MaxMind-DB/

use crate::error::{MmdbError, Result};
use std::collections::HashMap;

/// Maximum combined pointer-dereference and container-nesting depth.
///
/// A corrupt buffer can express pointer cycles or arbitrarily deep nesting;
/// decoding fails with `InvalidDatabase` once this bound is hit.
const MAX_DECODE_DEPTH: usize = 512;

/// A decoded value from the data section
///
/// Maps preserve the pair order found in the database and duplicate keys are
/// kept as-is; [`DataValue::get`] returns the first occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// UTF-8 string
    String(String),
    /// IEEE 754 double precision float
    Double(f64),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Unsigned 16-bit integer
    Uint16(u16),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Key-value map, encounter order preserved
    Map(Vec<(String, DataValue)>),
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 64-bit integer
    Uint64(u64),
    /// Unsigned 128-bit integer
    Uint128(u128),
    /// Array of values
    Array(Vec<DataValue>),
    /// Boolean value
    Bool(bool),
    /// IEEE 754 single precision float
    Float(f32),
}

impl DataValue {
    /// Look up a key in a map value, returning the first occurrence.
    ///
    /// Returns `None` for non-map values.
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataValue::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// View a string value as `&str`
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any unsigned integer value to `u64`
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DataValue::Uint16(n) => Some(u64::from(*n)),
            DataValue::Uint32(n) => Some(u64::from(*n)),
            DataValue::Uint64(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert to a `serde_json::Value` for display or export.
    ///
    /// Bytes become arrays of numbers, Uint128 values that do not fit a JSON
    /// number become decimal strings, and non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            DataValue::String(s) => Value::String(s.clone()),
            DataValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            DataValue::Float(fl) => serde_json::Number::from_f64(f64::from(*fl))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            DataValue::Bytes(b) => Value::Array(b.iter().map(|&x| Value::from(x)).collect()),
            DataValue::Uint16(n) => Value::from(*n),
            DataValue::Uint32(n) => Value::from(*n),
            DataValue::Uint64(n) => Value::from(*n),
            DataValue::Uint128(n) => {
                if let Ok(small) = u64::try_from(*n) {
                    Value::from(small)
                } else {
                    Value::String(n.to_string())
                }
            }
            DataValue::Int32(n) => Value::from(*n),
            DataValue::Bool(b) => Value::Bool(*b),
            DataValue::Array(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            DataValue::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

/// Data section decoder
///
/// Borrows the section bytes; all pointer offsets are relative to the start
/// of that slice. Decoding never panics on corrupt input: every read is
/// bounds-checked and malformed content yields `InvalidDatabase`.
pub struct Decoder<'a> {
    buffer: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Create a decoder over a data section slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Decode the value starting at `offset`
    pub fn decode(&self, offset: usize) -> Result<DataValue> {
        let mut cursor = offset;
        self.decode_value(&mut cursor, 0)
    }

    /// Decode the value starting at `offset`, returning the value and the
    /// offset of the byte following it.
    ///
    /// The next offset accounts for pointers correctly: dereferencing does
    /// not move the cursor past the pointer's own bytes.
    pub fn decode_at(&self, offset: usize) -> Result<(DataValue, usize)> {
        let mut cursor = offset;
        let value = self.decode_value(&mut cursor, 0)?;
        Ok((value, cursor))
    }

    fn decode_value(&self, cursor: &mut usize, depth: usize) -> Result<DataValue> {
        let start = *cursor;
        if depth >= MAX_DECODE_DEPTH {
            return Err(MmdbError::InvalidDatabase(format!(
                "pointer or nesting depth exceeds {} at offset {}",
                MAX_DECODE_DEPTH, start
            )));
        }

        let ctrl = self.byte_at(*cursor)?;
        *cursor += 1;
        let tag = ctrl >> 5;

        match tag {
            1 => self.decode_pointer(cursor, ctrl, depth),
            0 => {
                // Extended type: the next byte holds the actual type minus 7;
                // the size field of the original control byte still applies.
                let type_byte = self.byte_at(*cursor)?;
                *cursor += 1;
                let actual = u16::from(type_byte) + 7;
                let size = self.decode_size(cursor, ctrl & 0x1F)?;
                match actual {
                    8 => self.decode_int32(cursor, size, start),
                    9 => Ok(DataValue::Uint64(
                        self.decode_uint(cursor, size, 8, start)? as u64,
                    )),
                    10 => Ok(DataValue::Uint128(self.decode_uint(cursor, size, 16, start)?)),
                    11 => self.decode_array(cursor, size, depth),
                    14 => self.decode_bool(size, start),
                    15 => self.decode_float(cursor, size, start),
                    _ => Err(MmdbError::InvalidDatabase(format!(
                        "Unknown type {} at offset {}",
                        actual, start
                    ))),
                }
            }
            _ => {
                let size = self.decode_size(cursor, ctrl & 0x1F)?;
                match tag {
                    2 => self.decode_string(cursor, size, start),
                    3 => self.decode_double(cursor, size, start),
                    4 => Ok(DataValue::Bytes(self.take(cursor, size)?.to_vec())),
                    5 => Ok(DataValue::Uint16(
                        self.decode_uint(cursor, size, 2, start)? as u16,
                    )),
                    6 => Ok(DataValue::Uint32(
                        self.decode_uint(cursor, size, 4, start)? as u32,
                    )),
                    7 => self.decode_map(cursor, size, depth),
                    _ => unreachable!("3-bit tag"),
                }
            }
        }
    }

    /// Decode a pointer and return the pointee's value.
    ///
    /// `cursor` advances only past the pointer bytes; the dereference uses
    /// its own cursor so sibling data resumes correctly afterwards.
    fn decode_pointer(&self, cursor: &mut usize, ctrl: u8, depth: usize) -> Result<DataValue> {
        let start = *cursor - 1;
        let width = (ctrl >> 3) & 0x3;
        let value_bits = u32::from(ctrl & 0x7);

        let target = match width {
            0 => {
                let b = self.take(cursor, 1)?;
                (value_bits << 8) | u32::from(b[0])
            }
            1 => {
                let b = self.take(cursor, 2)?;
                ((value_bits << 16) | (u32::from(b[0]) << 8) | u32::from(b[1])) + 2048
            }
            2 => {
                let b = self.take(cursor, 3)?;
                ((value_bits << 24)
                    | (u32::from(b[0]) << 16)
                    | (u32::from(b[1]) << 8)
                    | u32::from(b[2]))
                    + 526_336
            }
            _ => {
                let b = self.take(cursor, 4)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]])
            }
        };

        let target = target as usize;
        if target >= self.buffer.len() {
            return Err(MmdbError::InvalidDatabase(format!(
                "pointer target {} out of bounds at offset {}",
                target, start
            )));
        }

        let mut deref_cursor = target;
        self.decode_value(&mut deref_cursor, depth + 1)
    }

    fn decode_string(&self, cursor: &mut usize, size: usize, start: usize) -> Result<DataValue> {
        let bytes = self.take(cursor, size)?;
        let s = std::str::from_utf8(bytes).map_err(|_| {
            MmdbError::InvalidDatabase(format!("invalid UTF-8 in string at offset {}", start))
        })?;
        Ok(DataValue::String(s.to_string()))
    }

    fn decode_double(&self, cursor: &mut usize, size: usize, start: usize) -> Result<DataValue> {
        if size != 8 {
            return Err(MmdbError::InvalidDatabase(format!(
                "double with size {} at offset {}",
                size, start
            )));
        }
        let b = self.take(cursor, 8)?;
        Ok(DataValue::Double(f64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])))
    }

    fn decode_float(&self, cursor: &mut usize, size: usize, start: usize) -> Result<DataValue> {
        if size != 4 {
            return Err(MmdbError::InvalidDatabase(format!(
                "float with size {} at offset {}",
                size, start
            )));
        }
        let b = self.take(cursor, 4)?;
        Ok(DataValue::Float(f32::from_be_bytes([b[0], b[1], b[2], b[3]])))
    }

    fn decode_bool(&self, size: usize, start: usize) -> Result<DataValue> {
        // The size field is the value itself; no payload bytes.
        match size {
            0 => Ok(DataValue::Bool(false)),
            1 => Ok(DataValue::Bool(true)),
            _ => Err(MmdbError::InvalidDatabase(format!(
                "boolean with size {} at offset {}",
                size, start
            ))),
        }
    }

    /// Decode a variable-width big-endian unsigned integer.
    ///
    /// The size field gives the byte count; the value is zero-padded on the
    /// left up to the type's full width.
    fn decode_uint(
        &self,
        cursor: &mut usize,
        size: usize,
        max_bytes: usize,
        start: usize,
    ) -> Result<u128> {
        if size > max_bytes {
            return Err(MmdbError::InvalidDatabase(format!(
                "integer of {} bytes exceeds {}-byte type at offset {}",
                size, max_bytes, start
            )));
        }
        let bytes = self.take(cursor, size)?;
        Ok(bytes.iter().fold(0u128, |acc, &b| (acc << 8) | u128::from(b)))
    }

    fn decode_int32(&self, cursor: &mut usize, size: usize, start: usize) -> Result<DataValue> {
        // Fewer than 4 bytes decodes as a zero-padded (hence non-negative)
        // value; a full 4 bytes is two's complement.
        let raw = self.decode_uint(cursor, size, 4, start)? as u32;
        Ok(DataValue::Int32(raw as i32))
    }

    fn decode_map(&self, cursor: &mut usize, count: usize, depth: usize) -> Result<DataValue> {
        let mut entries = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let key_start = *cursor;
            let key = match self.decode_value(cursor, depth + 1)? {
                DataValue::String(s) => s,
                _ => {
                    return Err(MmdbError::InvalidDatabase(format!(
                        "map key is not a string at offset {}",
                        key_start
                    )))
                }
            };
            let value = self.decode_value(cursor, depth + 1)?;
            entries.push((key, value));
        }
        Ok(DataValue::Map(entries))
    }

    fn decode_array(&self, cursor: &mut usize, count: usize, depth: usize) -> Result<DataValue> {
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(self.decode_value(cursor, depth + 1)?);
        }
        Ok(DataValue::Array(items))
    }

    /// Resolve the 5-bit size field, consuming escape bytes as needed
    fn decode_size(&self, cursor: &mut usize, field: u8) -> Result<usize> {
        match field {
            0..=28 => Ok(field as usize),
            29 => {
                let b = self.take(cursor, 1)?;
                Ok(29 + b[0] as usize)
            }
            30 => {
                let b = self.take(cursor, 2)?;
                Ok(285 + u16::from_be_bytes([b[0], b[1]]) as usize)
            }
            _ => {
                let b = self.take(cursor, 3)?;
                Ok(65_821
                    + (((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize)))
            }
        }
    }

    fn byte_at(&self, offset: usize) -> Result<u8> {
        self.buffer.get(offset).copied().ok_or_else(|| {
            MmdbError::InvalidDatabase(format!("unexpected end of data at offset {}", offset))
        })
    }

    fn take(&self, cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
        let end = cursor.checked_add(len).ok_or_else(|| {
            MmdbError::InvalidDatabase(format!("length overflow at offset {}", cursor))
        })?;
        if end > self.buffer.len() {
            return Err(MmdbError::InvalidDatabase(format!(
                "unexpected end of data at offset {}",
                *cursor
            )));
        }
        let slice = &self.buffer[*cursor..end];
        *cursor = end;
        Ok(slice)
    }
}

/// Data section encoder
///
/// Builds a data section byte-compatibly with [`Decoder`]. Identical values
/// are deduplicated: a repeated value returns its existing offset, and
/// values nested inside containers are replaced by pointers to an earlier
/// copy whenever the pointer encoding is strictly shorter than re-encoding
/// the value inline.
pub struct DataEncoder {
    buffer: Vec<u8>,
    /// Pointer-free serialization -> section offset
    dedup: HashMap<Vec<u8>, u32>,
}

impl DataEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dedup: HashMap::new(),
        }
    }

    /// Encode a value and return its offset in the section
    pub fn encode(&mut self, value: &DataValue) -> u32 {
        let plain = plain_bytes(value);
        if let Some(&offset) = self.dedup.get(&plain) {
            return offset;
        }

        let offset = self.buffer.len() as u32;
        let mut out = Vec::with_capacity(plain.len());
        self.write_value(value, &mut out);
        self.buffer.extend_from_slice(&out);
        self.dedup.insert(plain, offset);
        offset
    }

    /// Consume the encoder and return the section bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Current section size in bytes
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Write `value` at the current append position.
    ///
    /// `out` is staged bytes not yet committed to `self.buffer`; absolute
    /// offsets are therefore `buffer.len() + out.len()` at any point.
    fn write_value(&mut self, value: &DataValue, out: &mut Vec<u8>) {
        match value {
            DataValue::Map(entries) => {
                write_control(7, entries.len(), out);
                for (key, val) in entries {
                    self.write_string_child(key, out);
                    self.write_child(val, out);
                }
            }
            DataValue::Array(items) => {
                write_ext_control(11, items.len(), out);
                for item in items {
                    self.write_child(item, out);
                }
            }
            // Scalars have no children to pointer-compress
            _ => write_plain(value, out),
        }
    }

    /// Write a nested value: a pointer to an earlier copy when that is
    /// strictly shorter, otherwise inline (registering its offset for
    /// later reuse).
    fn write_child(&mut self, value: &DataValue, out: &mut Vec<u8>) {
        let plain = plain_bytes(value);
        if let Some(&offset) = self.dedup.get(&plain) {
            if pointer_encoded_len(offset) < plain.len() {
                write_pointer(offset, out);
                return;
            }
        }
        let absolute = (self.buffer.len() + out.len()) as u32;
        self.write_value(value, out);
        self.dedup.entry(plain).or_insert(absolute);
    }

    fn write_string_child(&mut self, s: &str, out: &mut Vec<u8>) {
        let mut plain = Vec::with_capacity(s.len() + 2);
        write_string(s, &mut plain);
        if let Some(&offset) = self.dedup.get(&plain) {
            if pointer_encoded_len(offset) < plain.len() {
                write_pointer(offset, out);
                return;
            }
        }
        let absolute = (self.buffer.len() + out.len()) as u32;
        out.extend_from_slice(&plain);
        self.dedup.entry(plain).or_insert(absolute);
    }
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a value without pointer compression.
///
/// Used both as the deduplication key and as the wire form for contexts
/// that must not contain pointers (the metadata section this engine emits).
pub fn plain_bytes(value: &DataValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_plain(value, &mut out);
    out
}

fn write_plain(value: &DataValue, out: &mut Vec<u8>) {
    match value {
        DataValue::String(s) => write_string(s, out),
        DataValue::Double(d) => {
            write_control(3, 8, out);
            out.extend_from_slice(&d.to_be_bytes());
        }
        DataValue::Bytes(b) => {
            write_control(4, b.len(), out);
            out.extend_from_slice(b);
        }
        DataValue::Uint16(n) => write_uint(5, None, u128::from(*n), out),
        DataValue::Uint32(n) => write_uint(6, None, u128::from(*n), out),
        DataValue::Uint64(n) => write_uint(0, Some(9), u128::from(*n), out),
        DataValue::Uint128(n) => write_uint(0, Some(10), *n, out),
        DataValue::Int32(n) => {
            if *n < 0 {
                write_ext_control(8, 4, out);
                out.extend_from_slice(&n.to_be_bytes());
            } else {
                write_uint(0, Some(8), *n as u128, out);
            }
        }
        DataValue::Bool(b) => write_ext_control(14, usize::from(*b), out),
        DataValue::Float(fl) => {
            write_ext_control(15, 4, out);
            out.extend_from_slice(&fl.to_be_bytes());
        }
        DataValue::Map(entries) => {
            write_control(7, entries.len(), out);
            for (key, val) in entries {
                write_string(key, out);
                write_plain(val, out);
            }
        }
        DataValue::Array(items) => {
            write_ext_control(11, items.len(), out);
            for item in items {
                write_plain(item, out);
            }
        }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    write_control(2, s.len(), out);
    out.extend_from_slice(s.as_bytes());
}

/// Minimal-width big-endian integer: leading zero bytes are dropped, zero
/// encodes with size 0.
fn write_uint(tag: u8, extended: Option<u8>, value: u128, out: &mut Vec<u8>) {
    let width = 16 - value.leading_zeros() as usize / 8;
    match extended {
        Some(actual) => write_ext_control(actual, width, out),
        None => write_control(tag, width, out),
    }
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[16 - width..]);
}

/// Control byte with size field, using the 29/30/31 escapes for large sizes
fn write_control(tag: u8, size: usize, out: &mut Vec<u8>) {
    let type_bits = tag << 5;
    if size < 29 {
        out.push(type_bits | size as u8);
    } else if size < 285 {
        out.push(type_bits | 29);
        out.push((size - 29) as u8);
    } else if size < 65_821 {
        out.push(type_bits | 30);
        out.extend_from_slice(&((size - 285) as u16).to_be_bytes());
    } else {
        out.push(type_bits | 31);
        let adjusted = (size - 65_821) as u32;
        out.extend_from_slice(&adjusted.to_be_bytes()[1..]);
    }
}

/// Extended-type control: size field in the first byte, `actual - 7` in the
/// next, size-escape bytes after the type byte.
fn write_ext_control(actual: u8, size: usize, out: &mut Vec<u8>) {
    let type_byte = actual - 7;
    if size < 29 {
        out.push(size as u8);
        out.push(type_byte);
    } else if size < 285 {
        out.push(29);
        out.push(type_byte);
        out.push((size - 29) as u8);
    } else if size < 65_821 {
        out.push(30);
        out.push(type_byte);
        out.extend_from_slice(&((size - 285) as u16).to_be_bytes());
    } else {
        out.push(31);
        out.push(type_byte);
        let adjusted = (size - 65_821) as u32;
        out.extend_from_slice(&adjusted.to_be_bytes()[1..]);
    }
}

fn pointer_encoded_len(offset: u32) -> usize {
    if offset < 0x800 {
        2
    } else if offset < 0x80800 {
        3
    } else if offset < 0x808_0800 {
        4
    } else {
        5
    }
}

fn write_pointer(offset: u32, out: &mut Vec<u8>) {
    if offset < 0x800 {
        out.push(0x20 | ((offset >> 8) & 0x7) as u8);
        out.push((offset & 0xFF) as u8);
    } else if offset < 0x80800 {
        let v = offset - 2048;
        out.push(0x28 | ((v >> 16) & 0x7) as u8);
        out.push(((v >> 8) & 0xFF) as u8);
        out.push((v & 0xFF) as u8);
    } else if offset < 0x808_0800 {
        let v = offset - 526_336;
        out.push(0x30 | ((v >> 24) & 0x7) as u8);
        out.push(((v >> 16) & 0xFF) as u8);
        out.push(((v >> 8) & 0xFF) as u8);
        out.push((v & 0xFF) as u8);
    } else {
        out.push(0x38);
        out.extend_from_slice(&offset.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &DataValue) -> DataValue {
        let mut encoder = DataEncoder::new();
        let offset = encoder.encode(value);
        let bytes = encoder.into_bytes();
        Decoder::new(&bytes).decode(offset as usize).unwrap()
    }

    #[test]
    fn test_roundtrip_scalars() {
        let values = vec![
            DataValue::String("hello".to_string()),
            DataValue::String(String::new()),
            DataValue::Double(3.14159265359),
            DataValue::Float(2.71828),
            DataValue::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            DataValue::Bytes(Vec::new()),
            DataValue::Uint16(0),
            DataValue::Uint16(12345),
            DataValue::Uint32(0xDEAD_BEEF),
            DataValue::Uint64(0x0123_4567_89AB_CDEF),
            DataValue::Uint128(0x0123_4567_89AB_CDEF_0123_4567_89AB_CDEF),
            DataValue::Int32(-42),
            DataValue::Int32(42),
            DataValue::Int32(i32::MIN),
            DataValue::Bool(true),
            DataValue::Bool(false),
        ];

        for value in &values {
            assert_eq!(&roundtrip(value), value);
        }
    }

    #[test]
    fn test_roundtrip_nested() {
        let value = DataValue::Map(vec![
            (
                "country".to_string(),
                DataValue::Map(vec![
                    ("iso_code".to_string(), DataValue::String("GB".to_string())),
                    ("geoname_id".to_string(), DataValue::Uint32(2_635_167)),
                ]),
            ),
            (
                "subdivisions".to_string(),
                DataValue::Array(vec![
                    DataValue::String("ENG".to_string()),
                    DataValue::String("WLS".to_string()),
                ]),
            ),
            ("is_anycast".to_string(), DataValue::Bool(false)),
            ("accuracy".to_string(), DataValue::Double(0.95)),
        ]);

        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_map_order_and_duplicates_preserved() {
        let value = DataValue::Map(vec![
            ("b".to_string(), DataValue::Uint16(2)),
            ("a".to_string(), DataValue::Uint16(1)),
            ("b".to_string(), DataValue::Uint16(3)),
        ]);

        let decoded = roundtrip(&value);
        assert_eq!(decoded, value);
        // First occurrence wins for keyed access
        assert_eq!(decoded.get("b"), Some(&DataValue::Uint16(2)));
    }

    #[test]
    fn test_dedup_returns_same_offset() {
        let mut encoder = DataEncoder::new();
        let value = DataValue::String("repeated".to_string());
        let first = encoder.encode(&value);
        let second = encoder.encode(&value);
        assert_eq!(first, second);

        let other = encoder.encode(&DataValue::String("different".to_string()));
        assert_ne!(first, other);
    }

    #[test]
    fn test_shared_children_become_pointers() {
        let city = DataValue::Map(vec![(
            "names".to_string(),
            DataValue::Map(vec![(
                "en".to_string(),
                DataValue::String("a reasonably long city name".to_string()),
            )]),
        )]);
        let entry_a = DataValue::Map(vec![("city".to_string(), city.clone())]);
        let entry_b = DataValue::Map(vec![
            ("city".to_string(), city.clone()),
            ("radius".to_string(), DataValue::Uint16(50)),
        ]);

        let mut encoder = DataEncoder::new();
        let off_a = encoder.encode(&entry_a);
        let off_b = encoder.encode(&entry_b);

        // The shared city map is stored once and referenced from entry_b
        let naive = plain_bytes(&entry_a).len() + plain_bytes(&entry_b).len();
        let bytes = encoder.into_bytes();
        assert!(bytes.len() < naive, "expected pointer compression");

        let decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode(off_a as usize).unwrap(), entry_a);
        assert_eq!(decoder.decode(off_b as usize).unwrap(), entry_b);
    }

    #[test]
    fn test_decode_at_sibling_resume() {
        let mut bytes = Vec::new();
        write_plain(&DataValue::Uint16(7), &mut bytes);
        let second_start = bytes.len();
        write_plain(&DataValue::String("next".to_string()), &mut bytes);

        let decoder = Decoder::new(&bytes);
        let (first, next) = decoder.decode_at(0).unwrap();
        assert_eq!(first, DataValue::Uint16(7));
        assert_eq!(next, second_start);

        let (second, end) = decoder.decode_at(next).unwrap();
        assert_eq!(second, DataValue::String("next".to_string()));
        assert_eq!(end, bytes.len());
    }

    #[test]
    fn test_pointer_widths_decode() {
        // Value at offset 0, then four pointer encodings targeting it
        let mut bytes = Vec::new();
        write_plain(&DataValue::Uint16(99), &mut bytes);

        let p11 = bytes.len();
        bytes.extend_from_slice(&[0x20, 0x00]);
        let p19 = bytes.len();
        bytes.extend_from_slice(&[0x28, 0x00, 0x00]); // 0 + 2048 would be oob, keep target 0 via width 0 math
        let p27 = bytes.len();
        bytes.extend_from_slice(&[0x30, 0x00, 0x00, 0x00]);
        let p32 = bytes.len();
        bytes.extend_from_slice(&[0x38, 0x00, 0x00, 0x00, 0x00]);

        let decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode(p11).unwrap(), DataValue::Uint16(99));
        assert_eq!(decoder.decode(p32).unwrap(), DataValue::Uint16(99));
        // Width 1 and 2 carry fixed bases (2048 / 526336); their targets are
        // out of bounds for this small buffer and must error, not panic.
        assert!(matches!(
            decoder.decode(p19),
            Err(MmdbError::InvalidDatabase(_))
        ));
        assert!(matches!(
            decoder.decode(p27),
            Err(MmdbError::InvalidDatabase(_))
        ));
    }

    #[test]
    fn test_pointer_cycle_rejected() {
        // A pointer at offset 0 targeting offset 0: infinite chain
        let bytes = [0x20, 0x00];
        let err = Decoder::new(&bytes).decode(0).unwrap_err();
        match err {
            MmdbError::InvalidDatabase(msg) => assert!(msg.contains("depth")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_message() {
        // Extended marker with type byte 9 -> type 16, which does not exist
        let bytes = [0x00, 0x09];
        let err = Decoder::new(&bytes).decode(0).unwrap_err();
        assert_eq!(err.to_string(), "Unknown type 16 at offset 0");

        // Extended type byte 0 -> "type 7" in extended position is invalid
        let bytes = [0x00, 0x00];
        let err = Decoder::new(&bytes).decode(0).unwrap_err();
        assert_eq!(err.to_string(), "Unknown type 7 at offset 0");
    }

    #[test]
    fn test_truncated_inputs_error() {
        let cases: Vec<&[u8]> = vec![
            &[0x44],             // string of length 4, no payload
            &[0x68],             // double, no payload
            &[0xA2, 0x01],       // u16 of 2 bytes, 1 present
            &[0x5D],             // size escape 29, escape byte missing
            &[0x00],             // extended marker, type byte missing
            &[0x28, 0x00],       // width-1 pointer, payload truncated
            &[0xE1],             // map of 1 pair, nothing follows
        ];
        let empty: &[u8] = &[];

        for case in cases.iter().chain(std::iter::once(&empty)) {
            match Decoder::new(case).decode(0) {
                Err(MmdbError::InvalidDatabase(_)) => {}
                other => panic!("expected InvalidDatabase for {:?}, got {:?}", case, other),
            }
        }
    }

    #[test]
    fn test_variable_width_integers() {
        // u32 stored in 2 bytes: zero-padded on the left
        let bytes = [0xC2, 0x01, 0x00];
        assert_eq!(
            Decoder::new(&bytes).decode(0).unwrap(),
            DataValue::Uint32(256)
        );

        // u64 stored in 0 bytes decodes to zero
        let bytes = [0x00, 0x02];
        assert_eq!(
            Decoder::new(&bytes).decode(0).unwrap(),
            DataValue::Uint64(0)
        );

        // u16 claiming 3 bytes is invalid
        let bytes = [0xA3, 0x01, 0x02, 0x03];
        assert!(Decoder::new(&bytes).decode(0).is_err());
    }

    #[test]
    fn test_large_string_size_escapes() {
        for len in [28usize, 29, 284, 285, 1000, 70_000] {
            let value = DataValue::String("x".repeat(len));
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let bytes = [0x42, 0xFF, 0xFE];
        let err = Decoder::new(&bytes).decode(0).unwrap_err();
        match err {
            MmdbError::InvalidDatabase(msg) => assert!(msg.contains("UTF-8")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_string_map_key_rejected() {
        // Map of 1 pair whose key is a u16
        let bytes = [0xE1, 0xA1, 0x07, 0xA1, 0x08];
        let err = Decoder::new(&bytes).decode(0).unwrap_err();
        match err {
            MmdbError::InvalidDatabase(msg) => assert!(msg.contains("map key")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_pointer_key_resolves() {
        // String at offset 0, then a map whose key is a pointer to it
        let mut bytes = Vec::new();
        write_string("code", &mut bytes);
        let map_start = bytes.len();
        write_control(7, 1, &mut bytes);
        bytes.extend_from_slice(&[0x20, 0x00]); // pointer key -> "code"
        write_plain(&DataValue::Uint16(44), &mut bytes);

        let decoded = Decoder::new(&bytes).decode(map_start).unwrap();
        assert_eq!(decoded.get("code"), Some(&DataValue::Uint16(44)));
    }

    #[test]
    fn test_to_json() {
        let value = DataValue::Map(vec![
            ("name".to_string(), DataValue::String("test".to_string())),
            ("count".to_string(), DataValue::Uint32(3)),
            (
                "tags".to_string(),
                DataValue::Array(vec![DataValue::Bool(true), DataValue::Int32(-1)]),
            ),
        ]);
        let json = value.to_json();
        assert_eq!(json["name"], "test");
        assert_eq!(json["count"], 3);
        assert_eq!(json["tags"][0], true);
        assert_eq!(json["tags"][1], -1);
    }
}
